use core::fmt;

use crate::error::Result;
use crate::headers::{SipHeaderParse, TAG_PARAM};
use crate::macros::fmt_name_addr_with_tag;
use crate::message::SipUri;
use crate::parser::ParseCtx;

/// The `From` SIP header.
///
/// Identifies the initiator of the request. The `tag` parameter is the
/// other half of the dialog identity.
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct From {
    uri: SipUri,
    tag: Option<String>,
}

impl From {
    /// Creates a new `From` header with a tag.
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
}

impl fmt::Display for From {
    fmt_name_addr_with_tag!();
}

impl SipHeaderParse for From {
    const NAME: &'static str = "From";
    const SHORT_NAME: Option<&'static str> = Some("f");

    /*
     * From       =  ( "From" / "f" ) HCOLON from-spec
     * from-spec  =  ( name-addr / addr-spec ) *( SEMI from-param )
     * from-param =  tag-param / generic-param
     */
    fn parse(parser: &mut ParseCtx<'_>) -> Result<Self> {
        let uri = parser.parse_name_addr()?;
        let tag = parser
            .parse_params()?
            .into_iter()
            .find_map(|(name, value)| (name == TAG_PARAM).then_some(value));

        Ok(From { uri, tag })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Host;

    #[test]
    fn test_parse() {
        let from = From::from_bytes(b"\"Alice\" <sip:alice@atlanta.com>;tag=1928301774").unwrap();

        assert_eq!(from.uri.user.as_deref(), Some("alice"));
        assert_eq!(from.uri.realname.as_deref(), Some("Alice"));
        assert_eq!(from.uri.host_port.host, Host::DomainName("atlanta.com".into()));
        assert_eq!(from.tag(), Some("1928301774"));
    }

    #[test]
    fn test_round_trip() {
        let src = "From: \"Alice\" <sip:alice@atlanta.com>;tag=1928301774";
        let from = From::from_bytes(src["From: ".len()..].as_bytes()).unwrap();

        assert_eq!(from.to_string(), src);
    }
}
