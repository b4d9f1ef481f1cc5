use core::fmt;

use crate::error::Result;
use crate::headers::SipHeaderParse;
use crate::parser::ParseCtx;

/// The `Call-ID` SIP header.
///
/// An opaque token grouping every message of a dialog. Locally generated
/// Call-IDs have the form `random16@host`.
#[derive(Debug, PartialEq, Eq, Default, Clone, Hash)]
pub struct CallId(String);

impl CallId {
    /// Creates a new `Call-ID` from the given token.
    pub fn new<T: Into<String>>(id: T) -> Self {
        Self(id.into())
    }

    /// Returns the Call-ID token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", CallId::NAME, self.0)
    }
}

impl SipHeaderParse for CallId {
    const NAME: &'static str = "Call-ID";
    const SHORT_NAME: Option<&'static str> = Some("i");

    /*
     * Call-ID  =  ( "Call-ID" / "i" ) HCOLON callid
     * callid   =  word [ "@" word ]
     */
    fn parse(parser: &mut ParseCtx<'_>) -> Result<Self> {
        let id = parser.read_line_value()?;

        Ok(CallId(id.to_string()))
    }
}
