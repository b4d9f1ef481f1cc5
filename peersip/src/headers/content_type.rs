use core::fmt;

use crate::error::Result;
use crate::headers::SipHeaderParse;
use crate::parser::ParseCtx;

/// The media type of a message body.
///
/// This stack only produces and interprets SDP and plain-text bodies;
/// anything else is carried opaquely.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum MediaType {
    /// `application/sdp`.
    Sdp,
    /// `text/plain`.
    TextPlain,
    /// Any other media type, kept verbatim.
    Other(String),
}

impl MediaType {
    /// Returns the media type string.
    pub fn as_str(&self) -> &str {
        match self {
            MediaType::Sdp => "application/sdp",
            MediaType::TextPlain => "text/plain",
            MediaType::Other(s) => s,
        }
    }
}

impl std::convert::From<&str> for MediaType {
    fn from(s: &str) -> Self {
        match s {
            "application/sdp" => MediaType::Sdp,
            "text/plain" => MediaType::TextPlain,
            other => MediaType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `Content-Type` SIP header.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ContentType(MediaType);

impl ContentType {
    /// Creates a new `Content-Type` header.
    pub fn new(media_type: MediaType) -> Self {
        Self(media_type)
    }

    /// Returns the media type.
    pub fn media_type(&self) -> &MediaType {
        &self.0
    }

    /// Returns `true` if the body is `application/sdp`.
    pub fn is_sdp(&self) -> bool {
        matches!(self.0, MediaType::Sdp)
    }

    /// Returns `true` if the body is `text/plain`.
    pub fn is_text_plain(&self) -> bool {
        matches!(self.0, MediaType::TextPlain)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", ContentType::NAME, self.0)
    }
}

impl SipHeaderParse for ContentType {
    const NAME: &'static str = "Content-Type";
    const SHORT_NAME: Option<&'static str> = Some("c");

    fn parse(parser: &mut ParseCtx<'_>) -> Result<Self> {
        let value = parser.read_line_value()?;
        // Media type parameters are not interpreted.
        let media_type = value.split(';').next().unwrap_or(value).trim();

        Ok(ContentType(media_type.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let ct = ContentType::from_bytes(b"application/sdp").unwrap();
        assert!(ct.is_sdp());

        let ct = ContentType::from_bytes(b"text/plain;charset=utf-8").unwrap();
        assert!(ct.is_text_plain());
    }
}
