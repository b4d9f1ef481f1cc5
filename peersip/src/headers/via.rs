use core::fmt;
use std::net::IpAddr;

use crate::error::Result;
use crate::headers::SipHeaderParse;
use crate::message::{Host, HostPort, TransportKind};
use crate::parser::{ParseCtx, SIPV2};

const BRANCH_PARAM: &str = "branch";
const RPORT_PARAM: &str = "rport";
const RECEIVED_PARAM: &str = "received";
const MADDR_PARAM: &str = "maddr";

/// The `Via` SIP header.
///
/// Indicates the path taken by the request so far and the path that
/// should be followed in routing responses.
///
/// # Examples
/// ```
/// # use peersip::headers::{SipHeaderParse, Via};
/// let via = Via::from_bytes(b"SIP/2.0/UDP server10.biloxi.com;branch=z9hG4bKnashds8").unwrap();
///
/// assert_eq!(via.branch(), Some("z9hG4bKnashds8"));
/// ```
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct Via {
    transport: TransportKind,
    sent_by: HostPort,
    branch: Option<String>,
    received: Option<IpAddr>,
    /// RFC 3581: clients send a bare `;rport`, the receiving side fills
    /// in the source port of the packet.
    rport: Option<u16>,
    rport_requested: bool,
    /// RFC 3261 multicast address override for responses.
    maddr: Option<Host>,
}

impl Via {
    /// Creates a new `Via` header for this hop.
    pub fn new(transport: TransportKind, sent_by: HostPort, branch: String) -> Self {
        Self {
            transport,
            sent_by,
            branch: Some(branch),
            received: None,
            rport: None,
            rport_requested: false,
            maddr: None,
        }
    }

    /// Returns the `transport`.
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Returns the branch parameter.
    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    /// Returns the sent-by field.
    pub fn sent_by(&self) -> &HostPort {
        &self.sent_by
    }

    /// Set the `received` parameter.
    pub fn set_received(&mut self, received: IpAddr) {
        self.received = Some(received);
    }

    /// Returns the `received` parameter.
    pub fn received(&self) -> Option<IpAddr> {
        self.received
    }

    /// Returns the `rport` value, once a receiver has filled it in.
    pub fn rport(&self) -> Option<u16> {
        self.rport
    }

    /// Returns `true` if the sender asked for RFC 3581 response routing,
    /// whether as a bare `;rport` flag or with a value already present.
    pub fn rport_requested(&self) -> bool {
        self.rport_requested || self.rport.is_some()
    }

    /// Fills in the `rport` value; the receiving side calls this with the
    /// source port of the packet.
    pub fn set_rport(&mut self, rport: u16) {
        self.rport = Some(rport);
    }

    /// Returns the `maddr` parameter.
    pub fn maddr(&self) -> Option<&Host> {
        self.maddr.as_ref()
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}/{} {}", Via::NAME, SIPV2, self.transport, self.sent_by)?;

        match self.rport {
            Some(rport) => write!(f, ";rport={rport}")?,
            None if self.rport_requested => write!(f, ";rport")?,
            None => (),
        }
        if let Some(received) = &self.received {
            write!(f, ";received={received}")?;
        }
        if let Some(maddr) = &self.maddr {
            write!(f, ";maddr={maddr}")?;
        }
        if let Some(branch) = &self.branch {
            write!(f, ";branch={branch}")?;
        }

        Ok(())
    }
}

impl SipHeaderParse for Via {
    const NAME: &'static str = "Via";
    const SHORT_NAME: Option<&'static str> = Some("v");
    /*
     * Via               =  ( "Via" / "v" ) HCOLON via-parm *(COMMA via-parm)
     * via-parm          =  sent-protocol LWS sent-by *( SEMI via-params )
     * via-params        =  via-ttl / via-maddr
     *                      / via-received / via-branch
     *                      / response-port / via-extension
     * response-port     =  "rport" [ EQUAL 1*DIGIT ]
     * sent-protocol     =  protocol-name SLASH protocol-version
     *                      SLASH transport
     * sent-by           =  host [ COLON port ]
     */
    fn parse(parser: &mut ParseCtx<'_>) -> Result<Self> {
        parser.parse_sip_v2()?;
        parser.expect_byte(b'/')?;

        let transport = parser.read_until_either(&[b' ', b'\t']).into();
        parser.take_ws();

        let sent_by = parser.parse_host_port()?;

        let mut branch = None;
        let mut received = None;
        let mut rport = None;
        let mut rport_requested = false;
        let mut maddr = None;

        for (name, value) in parser.parse_params()? {
            match name.as_str() {
                BRANCH_PARAM => branch = Some(value),
                RECEIVED_PARAM => received = value.parse().ok(),
                RPORT_PARAM => {
                    // A bare `;rport` asks the receiver to fill it in.
                    rport_requested = true;
                    rport = value.parse().ok();
                }
                MADDR_PARAM if !value.is_empty() => maddr = value.parse().ok(),
                _ => continue,
            }
        }

        Ok(Via {
            transport,
            sent_by,
            branch,
            received,
            rport,
            rport_requested,
            maddr,
        })
    }
}
