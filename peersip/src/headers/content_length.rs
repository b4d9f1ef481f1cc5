use core::fmt;

use crate::error::Result;
use crate::headers::SipHeaderParse;
use crate::parser::ParseCtx;

/// The `Content-Length` SIP header.
///
/// Mandatory over stream transports, where it is the only framing signal.
#[derive(Debug, PartialEq, Eq, Default, Clone, Copy)]
pub struct ContentLength(u32);

impl ContentLength {
    /// Creates a new `Content-Length` header.
    pub fn new(length: u32) -> Self {
        Self(length)
    }

    /// Returns the body length in bytes.
    pub fn len(&self) -> usize {
        self.0 as usize
    }

    /// Returns `true` if the body is empty.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ContentLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", ContentLength::NAME, self.0)
    }
}

impl SipHeaderParse for ContentLength {
    const NAME: &'static str = "Content-Length";
    const SHORT_NAME: Option<&'static str> = Some("l");

    fn parse(parser: &mut ParseCtx<'_>) -> Result<Self> {
        Ok(ContentLength(parser.parse_u32()?))
    }
}
