use std::fmt;

const TP_UDP: &str = "UDP";
const TP_TCP: &str = "TCP";
const TP_TLS: &str = "TLS";
const TP_ANY: &str = "ANY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
/// The transport a SIP hop runs over.
///
/// `Tls` is reserved on the wire but not implemented; attempting to open a
/// TLS connection fails with `Error::Unsupported`.
pub enum TransportKind {
    #[default]
    /// `UDP` transport.
    Udp,
    /// `TCP` transport.
    Tcp,
    /// `TLS` transport.
    Tls,
    /// Unconstrained; resolved to a concrete transport when connecting.
    Any,
}

impl TransportKind {
    /// Returns the default port number for this transport.
    #[inline]
    pub const fn default_port(&self) -> u16 {
        match self {
            TransportKind::Tls => 5061,
            _ => 5060,
        }
    }

    /// Returns the transport string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => TP_UDP,
            TransportKind::Tcp => TP_TCP,
            TransportKind::Tls => TP_TLS,
            TransportKind::Any => TP_ANY,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&[u8]> for TransportKind {
    fn from(b: &[u8]) -> Self {
        match b {
            b"UDP" | b"udp" => TransportKind::Udp,
            b"TCP" | b"tcp" => TransportKind::Tcp,
            b"TLS" | b"tls" => TransportKind::Tls,
            _ => TransportKind::Any,
        }
    }
}

impl From<&str> for TransportKind {
    fn from(s: &str) -> Self {
        s.as_bytes().into()
    }
}
