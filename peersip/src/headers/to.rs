use core::fmt;

use crate::error::Result;
use crate::headers::{SipHeaderParse, TAG_PARAM};
use crate::macros::fmt_name_addr_with_tag;
use crate::message::SipUri;
use crate::parser::ParseCtx;

/// The `To` SIP header.
///
/// Specifies the logical recipient of the request. The `tag` parameter is
/// half of the dialog identity.
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct To {
    uri: SipUri,
    tag: Option<String>,
}

impl To {
    /// Creates a new `To` header without a tag.
    pub fn new(uri: SipUri) -> Self {
        Self { uri, tag: None }
    }

    /// Creates a new `To` header with a tag.
    pub fn with_tag(uri: SipUri, tag: String) -> Self {
        Self { uri, tag: Some(tag) }
    }

    /// Returns the URI.
    pub fn uri(&self) -> &SipUri {
        &self.uri
    }

    /// Returns the tag parameter.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Sets the tag parameter.
    pub fn set_tag<T: Into<String>>(&mut self, tag: T) {
        self.tag = Some(tag.into());
    }
}

impl fmt::Display for To {
    fmt_name_addr_with_tag!();
}

impl SipHeaderParse for To {
    const NAME: &'static str = "To";
    const SHORT_NAME: Option<&'static str> = Some("t");

    /*
     * To        =  ( "To" / "t" ) HCOLON ( name-addr
     *              / addr-spec ) *( SEMI to-param )
     * to-param  =  tag-param / generic-param
     */
    fn parse(parser: &mut ParseCtx<'_>) -> Result<Self> {
        let uri = parser.parse_name_addr()?;
        let tag = parser
            .parse_params()?
            .into_iter()
            .find_map(|(name, value)| (name == TAG_PARAM).then_some(value));

        Ok(To { uri, tag })
    }
}
