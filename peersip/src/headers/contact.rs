use core::fmt;

use crate::error::Result;
use crate::headers::SipHeaderParse;
use crate::message::{NameAddr, SipUri};
use crate::parser::ParseCtx;

/// The `Contact` SIP header.
///
/// The direct URI at which later requests should reach this user agent.
/// Mandatory in INVITE requests and 2xx answers to them.
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct Contact(SipUri);

impl Contact {
    /// Creates a new `Contact` header.
    pub fn new(uri: SipUri) -> Self {
        Self(uri)
    }

    /// Returns the URI.
    pub fn uri(&self) -> &SipUri {
        &self.0
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", Contact::NAME, NameAddr(&self.0))
    }
}

impl SipHeaderParse for Contact {
    const NAME: &'static str = "Contact";
    const SHORT_NAME: Option<&'static str> = Some("m");

    fn parse(parser: &mut ParseCtx<'_>) -> Result<Self> {
        let uri = parser.parse_name_addr()?;
        // Contact parameters (q, expires) are not interpreted.
        parser.parse_params()?;

        Ok(Contact(uri))
    }
}
