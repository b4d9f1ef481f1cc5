use std::io;

use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use super::Payload;
use crate::parser;

/// Frames SIP messages on a byte stream.
///
/// The frame boundary comes from [`parser::frame_length`], so the stream
/// side shares the header scanning of the message codec instead of
/// carrying its own.
#[derive(Default)]
pub(crate) struct StreamingDecoder;

impl Decoder for StreamingDecoder {
    type Error = io::Error;
    type Item = Payload;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // A buffer holding nothing but a keep-alive is drained; the
        // packet layer answers the four-byte form.
        if matches!(&src[..], b"\r\n" | b"\r\n\r\n") {
            src.advance(src.len());
            return Ok(None);
        }

        let frame = parser::frame_length(src)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;

        match frame {
            Some(len) if src.len() >= len => Ok(Some(Payload::new(src.split_to(len).freeze()))),
            Some(len) => {
                // The boundary is known but the body is still in flight.
                src.reserve(len - src.len());
                Ok(None)
            }
            None => Ok(None),
        }
    }
}
