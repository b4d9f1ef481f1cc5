use core::fmt;

use crate::error::{Error, Result};
use crate::headers::SipHeaderParse;
use crate::message::SipMethod;
use crate::parser::ParseCtx;

/// The `CSeq` SIP header.
///
/// Orders transactions within a dialog. The sequence number must fit in
/// 31 bits.
///
/// # Examples
///
/// ```
/// # use peersip::{headers::CSeq, message::SipMethod};
/// let cseq = CSeq::new(1, SipMethod::Options);
///
/// assert_eq!("CSeq: 1 OPTIONS", cseq.to_string());
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct CSeq {
    cseq: u32,
    method: SipMethod,
}

impl CSeq {
    /// Creates a new `CSeq` instance.
    pub fn new(cseq: u32, method: SipMethod) -> Self {
        Self { cseq, method }
    }

    /// Returns the cseq number.
    pub fn cseq(&self) -> u32 {
        self.cseq
    }

    /// Returns the SIP method associated with the cseq.
    pub fn method(&self) -> &SipMethod {
        &self.method
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} {}", CSeq::NAME, self.cseq, self.method)
    }
}

impl SipHeaderParse for CSeq {
    const NAME: &'static str = "CSeq";

    /*
     * CSeq  =  "CSeq" HCOLON 1*DIGIT LWS Method
     */
    fn parse(parser: &mut ParseCtx<'_>) -> Result<CSeq> {
        let cseq = parser.parse_u32()?;
        if cseq >= 1 << 31 {
            return Err(Error::malformed("CSeq number does not fit in 31 bits"));
        }

        parser.take_ws();
        let method = SipMethod::from(parser.read_token()?);

        Ok(CSeq { cseq, method })
    }
}
