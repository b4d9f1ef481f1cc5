use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use crate::error::{Error, Result};

/// The scheme of a SIP URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scheme {
    #[default]
    /// Plain `sip:`.
    Sip,
    /// TLS secured `sips:`.
    Sips,
    /// Telephone number `tel:`.
    Tel,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
            Scheme::Tel => "tel",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A host: either an IP address literal or a domain name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    IpAddr(IpAddr),
    DomainName(String),
}

impl Default for Host {
    fn default() -> Self {
        Host::DomainName(String::new())
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::IpAddr(ip) => write!(f, "{ip}"),
            Host::DomainName(name) => f.write_str(name),
        }
    }
}

impl FromStr for Host {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.parse::<IpAddr>() {
            Ok(ip) => Ok(Host::IpAddr(ip)),
            Err(_) => Ok(Host::DomainName(s.to_string())),
        }
    }
}

/// A host with an optional port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct HostPort {
    pub host: Host,
    pub port: Option<u16>,
}

impl HostPort {
    pub fn new(host: Host, port: Option<u16>) -> Self {
        Self { host, port }
    }

    /// The port, falling back to the SIP default.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(5060)
    }
}

impl From<SocketAddr> for HostPort {
    fn from(addr: SocketAddr) -> Self {
        HostPort {
            host: Host::IpAddr(addr.ip()),
            port: Some(addr.port()),
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

/// A SIP URI: `scheme:user@host[:port]`, optionally carrying a display
/// name when it came from a To/From/Contact header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SipUri {
    pub scheme: Scheme,
    pub realname: Option<String>,
    pub user: Option<String>,
    pub host_port: HostPort,
}

impl SipUri {
    /// Creates a `sip:` URI for a user at a host.
    pub fn new<U: Into<String>>(user: U, host_port: HostPort) -> Self {
        SipUri {
            scheme: Scheme::Sip,
            realname: None,
            user: Some(user.into()),
            host_port,
        }
    }

    pub fn with_realname<T: Into<String>>(mut self, realname: T) -> Self {
        let realname = realname.into();
        if !realname.is_empty() {
            self.realname = Some(realname);
        }
        self
    }

    /// Writes only the `scheme:user@host` part, without display name or
    /// angle brackets, as used on the request line.
    pub fn fmt_bare(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        write!(f, "{}", self.host_port)
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_bare(f)
    }
}

/// A URI as it appears in To, From and Contact headers:
/// `"realname" <sip:user@host>`.
pub struct NameAddr<'a>(pub &'a SipUri);

impl fmt::Display for NameAddr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(realname) = &self.0.realname {
            write!(f, "\"{realname}\" ")?;
        }
        write!(f, "<")?;
        self.0.fmt_bare(f)?;
        write!(f, ">")
    }
}
