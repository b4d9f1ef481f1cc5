use core::fmt;

use crate::error::Result;
use crate::headers::SipHeaderParse;
use crate::parser::ParseCtx;

/// The `Expires` SIP header, used on REGISTER requests.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Expires(u32);

impl Expires {
    /// Creates a new `Expires` header.
    pub fn new(seconds: u32) -> Self {
        Self(seconds)
    }

    /// Returns the expiry in seconds.
    pub fn seconds(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Expires {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", Expires::NAME, self.0)
    }
}

impl SipHeaderParse for Expires {
    const NAME: &'static str = "Expires";

    fn parse(parser: &mut ParseCtx<'_>) -> Result<Self> {
        Ok(Expires(parser.parse_u32()?))
    }
}
