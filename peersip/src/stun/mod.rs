//! STUN binding requests and responses (RFC 5389).
//!
//! Only the binding method is implemented: enough to learn this host's
//! reflexive transport address and to exchange ICE candidate priorities.
//! Serialization is explicit big-endian; the 20-byte header is read first,
//! then TLV attributes until the declared length is exhausted.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time;

use crate::error::{Error, Result};

/// The fixed magic cookie of every RFC 5389 message.
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Bytes of transaction id in a STUN message.
pub const TRANSACTION_ID_SIZE: usize = 12;

const STUN_HEADER_SIZE: usize = 20;

const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_PRIORITY: u16 = 0x0024;
const ATTR_USE_CANDIDATE: u16 = 0x0025;
const ATTR_ICE_CONTROLLED: u16 = 0x8029;
const ATTR_ICE_CONTROLLING: u16 = 0x802A;

const FAMILY_IPV4: u8 = 0x01;

/// A STUN transaction id.
pub type TransactionId = [u8; TRANSACTION_ID_SIZE];

/// The message type on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunKind {
    /// Binding request (0x0001).
    Request,
    /// Binding success response (0x0101).
    Response,
}

impl StunKind {
    fn as_u16(&self) -> u16 {
        match self {
            StunKind::Request => 0x0001,
            StunKind::Response => 0x0101,
        }
    }
}

/// A single STUN attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    /// The reflexive transport address, XOR'd with the magic cookie.
    XorMappedAddress(SocketAddr),
    /// ICE candidate priority.
    Priority(u32),
    /// Nomination flag of the controlling agent.
    UseCandidate,
    /// Agent is in the controlled role.
    IceControlled,
    /// Agent is in the controlling role.
    IceControlling,
}

/// A parsed or to-be-sent STUN message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    /// Request or response.
    pub kind: StunKind,
    /// The 96-bit transaction id.
    pub transaction_id: TransactionId,
    /// The attributes, in wire order.
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// The XOR-MAPPED-ADDRESS carried by this message, if any.
    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// Serializes the message in network byte order.
    pub fn to_bytes(&self) -> Bytes {
        let mut payload = BytesMut::new();
        for attribute in &self.attributes {
            encode_attribute(&mut payload, attribute);
        }

        let mut buf = BytesMut::with_capacity(STUN_HEADER_SIZE + payload.len());
        buf.put_u16(self.kind.as_u16());
        buf.put_u16(payload.len() as u16);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(&self.transaction_id);
        buf.put_slice(&payload);
        buf.freeze()
    }

    /// Parses a message, validating the magic cookie and length field.
    pub fn from_bytes(src: &[u8]) -> Result<Self> {
        if src.len() < STUN_HEADER_SIZE {
            return Err(Error::malformed("STUN message shorter than its header"));
        }
        let mut buf = src;

        let kind = match buf.get_u16() {
            0x0001 => StunKind::Request,
            0x0101 => StunKind::Response,
            other => return Err(Error::malformed(format!("unknown STUN type 0x{other:04x}"))),
        };
        let length = buf.get_u16() as usize;
        let cookie = buf.get_u32();
        if cookie != MAGIC_COOKIE {
            return Err(Error::malformed(format!("bad STUN magic cookie 0x{cookie:08x}")));
        }

        let mut transaction_id = [0u8; TRANSACTION_ID_SIZE];
        buf.copy_to_slice(&mut transaction_id);

        if buf.remaining() < length {
            return Err(Error::malformed("STUN attributes truncated"));
        }

        let mut attributes = Vec::new();
        let mut attr_buf = &buf[..length];
        while attr_buf.remaining() >= 4 {
            let attr_type = attr_buf.get_u16();
            let attr_len = attr_buf.get_u16() as usize;
            let padded = (attr_len + 3) & !3;
            if attr_buf.remaining() < padded {
                return Err(Error::malformed("STUN attribute truncated"));
            }
            let value = &attr_buf[..attr_len];
            if let Some(attribute) = decode_attribute(attr_type, value)? {
                attributes.push(attribute);
            }
            attr_buf.advance(padded);
        }

        Ok(StunMessage {
            kind,
            transaction_id,
            attributes,
        })
    }
}

fn encode_attribute(buf: &mut BytesMut, attribute: &StunAttribute) {
    match attribute {
        StunAttribute::XorMappedAddress(addr) => {
            let IpAddr::V4(ip) = addr.ip() else {
                // Only IPv4 reflexive addresses are produced.
                return;
            };
            buf.put_u16(ATTR_XOR_MAPPED_ADDRESS);
            buf.put_u16(8);
            buf.put_u8(0);
            buf.put_u8(FAMILY_IPV4);
            buf.put_u16(addr.port() ^ (MAGIC_COOKIE >> 16) as u16);
            buf.put_u32(u32::from(ip) ^ MAGIC_COOKIE);
        }
        StunAttribute::Priority(priority) => {
            buf.put_u16(ATTR_PRIORITY);
            buf.put_u16(4);
            buf.put_u32(*priority);
        }
        StunAttribute::UseCandidate => {
            buf.put_u16(ATTR_USE_CANDIDATE);
            buf.put_u16(0);
        }
        StunAttribute::IceControlled => {
            buf.put_u16(ATTR_ICE_CONTROLLED);
            buf.put_u16(0);
        }
        StunAttribute::IceControlling => {
            buf.put_u16(ATTR_ICE_CONTROLLING);
            buf.put_u16(0);
        }
    }
}

fn decode_attribute(attr_type: u16, mut value: &[u8]) -> Result<Option<StunAttribute>> {
    let attribute = match attr_type {
        ATTR_XOR_MAPPED_ADDRESS => {
            if value.len() < 8 {
                return Err(Error::malformed("XOR-MAPPED-ADDRESS too short"));
            }
            value.advance(1); // reserved
            let family = value.get_u8();
            if family != FAMILY_IPV4 {
                return Err(Error::malformed(format!("unsupported address family 0x{family:02x}")));
            }
            let port = value.get_u16() ^ (MAGIC_COOKIE >> 16) as u16;
            let ip = Ipv4Addr::from(value.get_u32() ^ MAGIC_COOKIE);
            Some(StunAttribute::XorMappedAddress(SocketAddr::new(ip.into(), port)))
        }
        ATTR_PRIORITY => {
            if value.len() < 4 {
                return Err(Error::malformed("PRIORITY too short"));
            }
            Some(StunAttribute::Priority(value.get_u32()))
        }
        ATTR_USE_CANDIDATE => Some(StunAttribute::UseCandidate),
        ATTR_ICE_CONTROLLED => Some(StunAttribute::IceControlled),
        ATTR_ICE_CONTROLLING => Some(StunAttribute::IceControlling),
        // Comprehension of other attributes is not required here.
        _ => None,
    };

    Ok(attribute)
}

/// Creates binding requests and validates the responses against them.
///
/// Outstanding requests are keyed by destination; when a response arrives
/// from an address no request was recorded for, the latest request is the
/// fallback.
#[derive(Default)]
pub struct StunFactory {
    expected: Mutex<HashMap<SocketAddr, TransactionId>>,
    latest: Mutex<Option<TransactionId>>,
}

impl StunFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a binding request with a fresh random transaction id and
    /// remembers it as the latest request.
    pub fn binding_request(&self) -> StunMessage {
        let mut transaction_id = [0u8; TRANSACTION_ID_SIZE];
        rand::rng().fill(&mut transaction_id[..]);

        let mut latest = self.latest.lock().expect("Lock failed");
        *latest = Some(transaction_id);

        StunMessage {
            kind: StunKind::Request,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Records that `request` was sent to `destination`, replacing any
    /// earlier entry for that destination.
    pub fn expect_reply_from(&self, request: &StunMessage, destination: SocketAddr) {
        let mut expected = self.expected.lock().expect("Lock failed");
        if expected.insert(destination, request.transaction_id).is_some() {
            log::debug!("Purging old STUN entry for {destination}");
        }
    }

    /// Validates a binding response from `sender` and clears its entry.
    ///
    /// The response must be a well-typed binding response whose
    /// transaction id matches the one recorded for `sender`, or, when no
    /// per-destination entry exists, the latest request.
    pub fn validate_response(&self, response: &StunMessage, sender: SocketAddr) -> bool {
        if response.kind != StunKind::Response {
            return false;
        }

        let recorded = self.expected.lock().expect("Lock failed").remove(&sender);
        match recorded {
            Some(transaction_id) => transaction_id == response.transaction_id,
            None => {
                // No entry was saved for this sender; fall back to the
                // latest request.
                let latest = self.latest.lock().expect("Lock failed");
                *latest == Some(response.transaction_id)
            }
        }
    }
}

/// How long to wait for a binding response.
const BINDING_TIMEOUT: Duration = Duration::from_secs(5);

/// Sends one binding request to `server` from an ephemeral UDP socket and
/// returns the reflexive address from the response.
pub async fn binding_ping(factory: &StunFactory, server: SocketAddr) -> Result<SocketAddr> {
    let bind_addr: SocketAddr = if server.is_ipv4() {
        "0.0.0.0:0".parse().expect("valid literal")
    } else {
        "[::]:0".parse().expect("valid literal")
    };
    let socket = UdpSocket::bind(bind_addr).await?;

    let request = factory.binding_request();
    factory.expect_reply_from(&request, server);
    socket.send_to(&request.to_bytes(), server).await?;

    let mut buf = vec![0u8; 1024];
    let (len, from) = time::timeout(BINDING_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| Error::TimedOut)??;

    let response = StunMessage::from_bytes(&buf[..len])?;
    if !factory.validate_response(&response, from) {
        return Err(Error::malformed("STUN response transaction id mismatch"));
    }

    response
        .xor_mapped_address()
        .ok_or_else(|| Error::malformed("binding response without XOR-MAPPED-ADDRESS"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_mapped_address_vector() {
        // 203.0.113.5:49152 under the fixed cookie.
        let addr: SocketAddr = "203.0.113.5:49152".parse().unwrap();
        let factory = StunFactory::new();
        let request = factory.binding_request();

        let response = StunMessage {
            kind: StunKind::Response,
            transaction_id: request.transaction_id,
            attributes: vec![StunAttribute::XorMappedAddress(addr)],
        };

        let decoded = StunMessage::from_bytes(&response.to_bytes()).unwrap();
        assert_eq!(decoded.xor_mapped_address(), Some(addr));
    }

    #[test]
    fn test_xor_encoding_is_not_identity() {
        let addr: SocketAddr = "203.0.113.5:49152".parse().unwrap();
        let message = StunMessage {
            kind: StunKind::Response,
            transaction_id: [7; 12],
            attributes: vec![StunAttribute::XorMappedAddress(addr)],
        };
        let wire = message.to_bytes();

        // The raw bytes must hold the XOR'd port, not the plain one.
        let raw_port = u16::from_be_bytes([wire[26], wire[27]]);
        assert_eq!(raw_port, 49152 ^ 0x2112);
    }

    #[test]
    fn test_header_round_trip() {
        let factory = StunFactory::new();
        let request = factory.binding_request();
        let decoded = StunMessage::from_bytes(&request.to_bytes()).unwrap();

        assert_eq!(decoded.kind, StunKind::Request);
        assert_eq!(decoded.transaction_id, request.transaction_id);
        assert!(decoded.attributes.is_empty());
    }

    #[test]
    fn test_rejects_bad_cookie() {
        let factory = StunFactory::new();
        let mut wire = BytesMut::from(&factory.binding_request().to_bytes()[..]);
        wire[4] ^= 0xff;

        assert!(StunMessage::from_bytes(&wire).is_err());
    }

    #[test]
    fn test_validate_response_per_destination() {
        let factory = StunFactory::new();
        let server: SocketAddr = "192.0.2.1:3478".parse().unwrap();

        let request = factory.binding_request();
        factory.expect_reply_from(&request, server);

        let response = StunMessage {
            kind: StunKind::Response,
            transaction_id: request.transaction_id,
            attributes: Vec::new(),
        };
        assert!(factory.validate_response(&response, server));

        // Consumed: a replay no longer matches a per-destination entry but
        // still matches the latest request fallback.
        assert!(factory.validate_response(&response, server));
    }

    #[test]
    fn test_validate_response_rejects_wrong_transaction() {
        let factory = StunFactory::new();
        let server: SocketAddr = "192.0.2.1:3478".parse().unwrap();

        let request = factory.binding_request();
        factory.expect_reply_from(&request, server);

        let mut transaction_id = request.transaction_id;
        transaction_id[0] ^= 0xff;
        let response = StunMessage {
            kind: StunKind::Response,
            transaction_id,
            attributes: Vec::new(),
        };
        assert!(!factory.validate_response(&response, server));
    }

    #[test]
    fn test_latest_request_fallback() {
        let factory = StunFactory::new();
        let unexpected: SocketAddr = "198.51.100.7:3478".parse().unwrap();

        let request = factory.binding_request();
        let response = StunMessage {
            kind: StunKind::Response,
            transaction_id: request.transaction_id,
            attributes: Vec::new(),
        };
        assert!(factory.validate_response(&response, unexpected));
    }

    #[test]
    fn test_priority_and_flags_round_trip() {
        let message = StunMessage {
            kind: StunKind::Request,
            transaction_id: [1; 12],
            attributes: vec![
                StunAttribute::Priority(0x6e00_04ff),
                StunAttribute::IceControlling,
                StunAttribute::UseCandidate,
            ],
        };

        let decoded = StunMessage::from_bytes(&message.to_bytes()).unwrap();
        assert_eq!(decoded.attributes, message.attributes);
    }

    #[tokio::test]
    async fn test_binding_ping() {
        // A tiny STUN server on localhost answering with the sender's
        // reflexive address.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let request = StunMessage::from_bytes(&buf[..len]).unwrap();

            let response = StunMessage {
                kind: StunKind::Response,
                transaction_id: request.transaction_id,
                attributes: vec![StunAttribute::XorMappedAddress(from)],
            };
            server.send_to(&response.to_bytes(), from).await.unwrap();
        });

        let factory = StunFactory::new();
        let reflexive = binding_ping(&factory, server_addr).await.unwrap();
        assert_eq!(reflexive.ip(), "127.0.0.1".parse::<IpAddr>().unwrap());
    }
}
