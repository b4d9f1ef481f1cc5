#![warn(missing_docs)]
//! SIP Transport Layer.
//!
//! Transports move framed bytes; everything above them sees typed
//! [`IncomingRequest`]/[`IncomingResponse`] values. TCP connections are
//! pinned to one peer, the UDP socket is shared by every dialog that
//! targets a UDP peer.

use std::{
    borrow::Cow,
    collections::HashMap,
    io::Write,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::{
    endpoint::Endpoint,
    error::{Error, Result},
    headers::{CSeq, CallId, ContentLength, From as FromHdr, Header, SipHeaderParse, To, Via},
    message::{Host, HostPort, Request, Response, SipMsg, StatusCode, TransportKind},
    parser,
    transaction::ServerTsx,
};

mod decoder;
pub mod tcp;
pub mod tls;
pub mod udp;

pub(crate) use decoder::StreamingDecoder;

/// How long a connection attempt may take before it fails.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a stream may stay silent before it is torn down. Transaction
/// timers are far shorter, so they always fire first.
pub(crate) const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// This trait represents an abstraction over a SIP transport implementation.
#[async_trait::async_trait]
pub trait Transport: Sync + Send + 'static {
    /// Sends a buffer to the specified remote socket address.
    ///
    /// Returns the number of bytes sent or an I/O error.
    async fn send(&self, buf: &[u8], addr: &SocketAddr) -> Result<usize>;

    /// Returns the transport kind (UDP, TCP, TLS).
    fn kind(&self) -> TransportKind;

    /// Returns the local socket address bound to this transport.
    fn addr(&self) -> SocketAddr;

    /// Checks if the provided address belongs to the same IP address
    /// family (IPv4 vs IPv6) as the local socket address.
    fn is_same_af(&self, addr: &SocketAddr) -> bool {
        let our_addr = self.addr();

        (addr.is_ipv4() && our_addr.is_ipv4()) || (addr.is_ipv6() && our_addr.is_ipv6())
    }

    /// Returns the local transport name.
    fn local_name(&self) -> Cow<'_, str>;

    /// Returns `true` if the transport is reliable (e.g., TCP or TLS).
    fn reliable(&self) -> bool;

    /// Returns `true` if the transport is secure (e.g., TLS).
    fn secure(&self) -> bool;

    /// Returns the key that uniquely identifies this transport connection.
    fn key(&self) -> TransportKey {
        TransportKey::new(self.addr(), self.kind())
    }
}

/// This type represents a key used to identify a transport connection.
///
/// Connection-oriented transports key on the peer address; the shared UDP
/// socket keys on its local address.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TransportKey {
    addr: SocketAddr,
    kind: TransportKind,
}

impl TransportKey {
    /// Creates a new `TransportKey`.
    pub fn new(addr: SocketAddr, kind: TransportKind) -> Self {
        TransportKey { addr, kind }
    }
}

/// This trait represents a factory for creating SIP transports.
///
/// Used by connection-oriented transports like TCP and TLS.
#[async_trait::async_trait]
pub trait Factory: Sync + Send {
    /// Creates a new transport connected to `addr`. The factory registers
    /// the read half with the given event sender.
    async fn create(&self, addr: SocketAddr, tx: TransportTx) -> Result<Arc<dyn Transport>>;

    /// Returns the transport protocol this factory creates.
    fn protocol(&self) -> TransportKind;
}

/// Represents the raw binary content of a message or data block.
#[derive(Clone)]
pub struct Payload(pub(crate) Bytes);

impl Payload {
    /// Creates a new `Payload`.
    #[inline]
    pub fn new(bytes: Bytes) -> Self {
        Payload(bytes)
    }

    /// Returns the raw byte buffer of this payload.
    pub fn buf(&self) -> &[u8] {
        &self.0
    }
}

/// This type represents a received SIP packet.
#[derive(Clone)]
pub struct Packet {
    /// The packet payload.
    pub payload: Payload,
    /// The address of the sender.
    pub addr: SocketAddr,
    /// The time the packet was received.
    pub time: SystemTime,
}

/// Represents the address of an outbound message.
pub enum OutgoingAddr {
    /// Resolved later from a Via sent-by host.
    HostPort {
        /// The host and port of the address.
        host: HostPort,
        /// The transport protocol used.
        protocol: TransportKind,
    },
    /// A concrete socket address and the transport to use.
    Addr {
        /// The socket address.
        addr: SocketAddr,
        /// The transport to use.
        transport: Arc<dyn Transport>,
    },
}

/// This trait is used to convert a message into its wire bytes.
pub trait ToBytes: Sized {
    /// Converts the type into a byte buffer.
    fn to_bytes(&self) -> Result<Bytes>;
}

fn encode_message(start_line: String, msg_headers: &crate::headers::Headers, body: Option<&Bytes>) -> Result<Bytes> {
    let estimated_message_size = if body.is_none() { 800 } else { 1500 };
    let buf = BytesMut::with_capacity(estimated_message_size);
    let mut buf_writer = buf.writer();

    write!(buf_writer, "{start_line}")?;

    // Headers; Content-Length is always written last from the actual body.
    for header in msg_headers.iter() {
        if matches!(header, Header::ContentLength(_)) {
            continue;
        }
        write!(buf_writer, "{header}\r\n")?;
    }

    let body_len = body.map(|b| b.len()).unwrap_or(0);
    write!(buf_writer, "{}: {body_len}\r\n\r\n", ContentLength::NAME)?;
    if let Some(body) = body {
        buf_writer.write_all(body)?;
    }

    Ok(buf_writer.into_inner().freeze())
}

/// This type represents an outbound SIP request.
pub struct OutgoingRequest {
    /// The SIP request message.
    pub msg: Request,
    /// The address to send the request to.
    pub addr: SocketAddr,
    /// The encoded buffer, filled on first send.
    pub buf: Option<Bytes>,
    /// The transport to use for sending the request.
    pub transport: Arc<dyn Transport>,
}

impl ToBytes for OutgoingRequest {
    fn to_bytes(&self) -> Result<Bytes> {
        encode_message(self.msg.req_line.to_string(), &self.msg.headers, self.msg.body.as_ref())
    }
}

/// This type represents an outgoing SIP response.
pub struct OutgoingResponse {
    /// The SIP response message.
    pub response: Response,
    /// The address to send the response to.
    pub addr: OutgoingAddr,
    /// The encoded buffer, filled on first send.
    pub buf: Option<Bytes>,
}

impl OutgoingResponse {
    /// Returns the message status code.
    pub fn status_code(&self) -> StatusCode {
        self.response.status_line.code
    }

    /// Returns the message reason text.
    pub fn reason(&self) -> &str {
        &self.response.status_line.reason
    }

    /// Returns `true` if this is a provisional response.
    pub fn is_provisional(&self) -> bool {
        self.response.status_line.code.is_provisional()
    }

    /// Set the message body.
    pub fn set_body(&mut self, body: Bytes) {
        self.response.body = Some(body);
    }

    /// Returns a mutable reference to the response headers.
    pub fn headers_mut(&mut self) -> &mut crate::headers::Headers {
        &mut self.response.headers
    }
}

impl ToBytes for OutgoingResponse {
    fn to_bytes(&self) -> Result<Bytes> {
        encode_message(
            self.response.status_line.to_string(),
            &self.response.headers,
            self.response.body.as_ref(),
        )
    }
}

/// The mandatory headers of a message, extracted once on receipt.
#[derive(Clone)]
pub struct RequestHeaders {
    /// The topmost Via header as found in the message.
    pub via: Via,
    /// The From header found in the message.
    pub from: FromHdr,
    /// The CSeq header as found in the message.
    pub cseq: CSeq,
    /// The Call-ID header found in the message.
    pub call_id: CallId,
    /// The To header found in the message.
    pub to: To,
}

/// This type represents a received SIP request.
pub struct IncomingRequest {
    /// The SIP request message.
    pub(crate) request: Request,
    /// The transport used to receive the request.
    pub(crate) transport: Arc<dyn Transport>,
    /// The packet that contains the request.
    pub(crate) packet: Packet,
    /// The server transaction associated with this request, if any.
    pub(crate) transaction: Option<ServerTsx>,
    /// The mandatory headers extracted from the request.
    pub(crate) request_headers: RequestHeaders,
}

impl IncomingRequest {
    /// Returns the `To` header of the request.
    pub fn to(&self) -> &To {
        &self.request_headers.to
    }

    /// Returns the `From` header of the request.
    pub fn from(&self) -> &FromHdr {
        &self.request_headers.from
    }

    /// Returns the `Call-ID` header of the request.
    pub fn call_id(&self) -> &CallId {
        &self.request_headers.call_id
    }

    /// Returns the `CSeq` header of the request.
    pub fn cseq(&self) -> &CSeq {
        &self.request_headers.cseq
    }

    /// Returns `true` if the message method matches the given method.
    #[inline(always)]
    pub fn is_method(&self, method: &crate::message::SipMethod) -> bool {
        self.request.method() == method
    }

    /// Returns the message method.
    pub fn method(&self) -> &crate::message::SipMethod {
        self.request.method()
    }

    /// Returns the request message.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Gets the source socket address of the packet.
    pub fn addr(&self) -> &SocketAddr {
        &self.packet.addr
    }

    #[inline]
    pub(crate) fn set_tsx(&mut self, tsx: ServerTsx) {
        self.transaction = Some(tsx);
    }
}

/// Represents a received SIP response.
pub struct IncomingResponse {
    /// The SIP response message.
    pub(crate) response: Response,
    /// The transport used to receive the response.
    #[allow(dead_code)]
    pub(crate) transport: Arc<dyn Transport>,
    /// The packet that contains the response.
    pub(crate) packet: Packet,
    /// The mandatory headers extracted from the response.
    pub(crate) request_headers: RequestHeaders,
}

impl IncomingResponse {
    /// Returns the response message.
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Returns the response status code.
    pub fn code(&self) -> StatusCode {
        self.response.code()
    }

    /// Returns the `Call-ID` header of the response.
    pub fn call_id(&self) -> &CallId {
        &self.request_headers.call_id
    }

    /// Returns the `CSeq` header of the response.
    pub fn cseq(&self) -> &CSeq {
        &self.request_headers.cseq
    }

    /// Gets the source socket address of the packet.
    pub fn addr(&self) -> &SocketAddr {
        &self.packet.addr
    }
}

/// Events flowing from the transports to the endpoint loop.
pub enum TransportEvent {
    /// A packet was received from the transport layer.
    Packet {
        /// The transport the packet arrived on.
        transport: Arc<dyn Transport>,
        /// The received packet.
        packet: Packet,
    },
    /// A new transport was created.
    Created(Arc<dyn Transport>),
    /// A transport was closed or failed.
    Closed(TransportKey),
    /// A factory was registered.
    Factory(Box<dyn Factory>),
}

pub(crate) type TransportTx = mpsc::Sender<TransportEvent>;
pub(crate) type TransportRx = mpsc::Receiver<TransportEvent>;

/// Transport Layer for SIP messages.
pub struct TransportLayer {
    /// A map of transports indexed by their unique keys.
    transports: Mutex<HashMap<TransportKey, Arc<dyn Transport>>>,
    /// The registered transport factories.
    factories: Mutex<Vec<Arc<dyn Factory>>>,
    /// The sender used to hand events to the transport layer.
    transport_tx: TransportTx,
    /// The receiver side, taken by the endpoint loop.
    transport_rx: Mutex<Option<TransportRx>>,
}

impl Default for TransportLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportLayer {
    pub(crate) fn new() -> Self {
        let (transport_tx, transport_rx) = mpsc::channel(1_000);
        let transport_rx = Mutex::new(Some(transport_rx));

        Self {
            transport_tx,
            transport_rx,
            transports: Default::default(),
            factories: Default::default(),
        }
    }

    pub(crate) fn transport_count(&self) -> usize {
        self.transports.lock().expect("Lock failed").len()
    }

    pub(crate) fn add_transport(&self, transport: Arc<dyn Transport>) {
        self.transports
            .lock()
            .expect("Lock failed")
            .insert(transport.key(), transport);
    }

    pub(crate) fn remove_transport(&self, key: TransportKey) -> Option<Arc<dyn Transport>> {
        self.transports.lock().expect("Lock failed").remove(&key)
    }

    pub(crate) fn add_factory(&self, factory: Arc<dyn Factory>) {
        self.factories.lock().expect("Lock failed").push(factory);
    }

    pub(crate) fn sender(&self) -> &TransportTx {
        &self.transport_tx
    }

    /// Finds a live transport for the given destination and protocol.
    pub fn find(&self, dst: SocketAddr, protocol: TransportKind) -> Option<Arc<dyn Transport>> {
        log::debug!("Finding suitable transport={protocol} for={dst}");

        let transports = self.transports.lock().expect("Lock failed");

        // Connection-oriented transports are keyed by the peer address.
        let key = TransportKey::new(dst, protocol);
        if let Some(transport) = transports.get(&key) {
            return Some(transport.clone());
        }

        // Fall back to any transport of the right protocol and family;
        // this is how the shared UDP socket is picked up.
        transports
            .values()
            .filter(|handle| handle.kind() == protocol && handle.is_same_af(&dst))
            .min_by(|a, b| Arc::strong_count(a).cmp(&Arc::strong_count(b)))
            .cloned()
    }

    /// Returns a transport connected to `remote`, creating one through the
    /// registered factory when none exists.
    ///
    /// Connection establishment is bounded by [`CONNECT_TIMEOUT`].
    pub async fn obtain(&self, protocol: TransportKind, remote: SocketAddr) -> Result<Arc<dyn Transport>> {
        if let Some(transport) = self.find(remote, protocol) {
            return Ok(transport);
        }

        let factory = {
            let factories = self.factories.lock().expect("Lock failed");
            factories
                .iter()
                .find(|factory| factory.protocol() == protocol)
                .cloned()
                .ok_or(Error::Unconnected)?
        };

        let created = factory.create(remote, self.transport_tx.clone());
        let transport = tokio::time::timeout(CONNECT_TIMEOUT, created)
            .await
            .map_err(|_| Error::TimedOut)??;

        self.add_transport(transport.clone());
        Ok(transport)
    }

    pub(crate) async fn handle_events(&self, endpoint: &Endpoint) -> Result<()> {
        let mut rx = self
            .transport_rx
            .lock()
            .expect("Lock failed")
            .take()
            .ok_or(Error::ChannelClosed)?;

        // Loop to receive packets from the transports.
        while let Some(evt) = rx.recv().await {
            match evt {
                TransportEvent::Packet { transport, packet } => {
                    let endpoint = endpoint.clone();
                    tokio::spawn(async move {
                        if let Err(err) = Self::on_received_packet(transport, packet, endpoint).await {
                            log::debug!("Dropped inbound packet: {err}");
                        }
                    });
                }
                TransportEvent::Created(transport) => {
                    self.add_transport(transport);
                }
                TransportEvent::Closed(key) => {
                    self.remove_transport(key);
                    endpoint.on_transport_closed(key).await;
                }
                TransportEvent::Factory(factory) => {
                    self.add_factory(Arc::from(factory));
                }
            }
        }

        Ok(())
    }

    async fn on_received_packet(transport: Arc<dyn Transport>, packet: Packet, endpoint: Endpoint) -> Result<()> {
        let payload = packet.payload.clone();
        let bytes = payload.buf();

        // Keep-alive request packet.
        if bytes == b"\r\n\r\n" {
            transport.send(b"\r\n", &packet.addr).await?;
            return Ok(());
        } else if bytes == b"\r\n" {
            // Keep-alive response packet, nothing to do.
            return Ok(());
        }

        // Parse the packet into a SIP message.
        let msg = match parser::parse_sip_msg(bytes) {
            Ok(parsed_msg) => parsed_msg,
            Err(err) => {
                log::warn!(
                    "Ignoring {} bytes packet from {} {} : {}\n{}-- end of packet.",
                    bytes.len(),
                    transport.kind(),
                    packet.addr,
                    err,
                    String::from_utf8_lossy(bytes)
                );
                return Err(err);
            }
        };

        let request_headers = extract_mandatory_headers(&msg, &packet)?;

        match msg {
            SipMsg::Request(request) => {
                let mut request = Some(IncomingRequest {
                    request,
                    transport,
                    packet,
                    transaction: None,
                    request_headers,
                });
                endpoint.process_request(&mut request).await?;
            }
            SipMsg::Response(response) => {
                let mut response = Some(IncomingResponse {
                    response,
                    transport,
                    packet,
                    request_headers,
                });
                endpoint.process_response(&mut response).await?;
            }
        }

        Ok(())
    }
}

pub(crate) fn extract_mandatory_headers(msg: &SipMsg, packet: &Packet) -> Result<RequestHeaders> {
    let headers = msg.headers();

    let Some(mut via) = headers.top_via().cloned() else {
        return Err(Error::MissingRequiredHeader(Via::NAME));
    };
    let Some(from) = headers.from().cloned() else {
        return Err(Error::MissingRequiredHeader(FromHdr::NAME));
    };
    let Some(to) = headers.to().cloned() else {
        return Err(Error::MissingRequiredHeader(To::NAME));
    };
    let Some(call_id) = headers.call_id().cloned() else {
        return Err(Error::MissingRequiredHeader(CallId::NAME));
    };
    let Some(cseq) = headers.cseq().copied() else {
        return Err(Error::MissingRequiredHeader(CSeq::NAME));
    };

    // RFC 3581 section 4: the receiver records where the packet actually
    // came from, even when it matches the sent-by value. When the sender
    // asked for `rport` the source port is echoed as well, so responses
    // cross the same NAT binding the request came out of.
    via.set_received(packet.addr.ip());
    if via.rport_requested() {
        via.set_rport(packet.addr.port());
    }

    Ok(RequestHeaders {
        via,
        cseq,
        call_id,
        from,
        to,
    })
}

/// Resolves an outbound host to a socket address using the transport
/// default port when none is given.
pub(crate) async fn resolve_host_port(host: &HostPort, protocol: TransportKind) -> Result<SocketAddr> {
    let port = host.port.unwrap_or(protocol.default_port());
    match &host.host {
        Host::IpAddr(ip) => Ok(SocketAddr::new(*ip, port)),
        Host::DomainName(name) => crate::endpoint::resolve(name, port).await,
    }
}

#[async_trait::async_trait]
/// A trait to start a listening transport.
pub(crate) trait TransportStartup: Sync + Send {
    async fn start(&self, layer: &TransportLayer) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::udp::mock::MockUdpTransport;

    #[test]
    fn test_add_transport() {
        let transports = TransportLayer::default();
        let addr = "127.0.0.1:8080".parse().unwrap();
        let kind = TransportKind::Udp;

        transports.add_transport(Arc::new(MockUdpTransport::new()));

        assert!(transports.find(addr, kind).is_some());
        assert!(transports.transport_count() == 1);
    }

    #[test]
    fn test_remove_transport() {
        let transports = TransportLayer::default();
        let udp_tp = Arc::new(MockUdpTransport::new());
        let addr = "127.0.0.1:8080".parse().unwrap();
        let kind = TransportKind::Udp;
        let key = udp_tp.key();

        transports.add_transport(udp_tp);
        assert!(transports.find(addr, kind).is_some());
        assert!(transports.transport_count() == 1);

        transports.remove_transport(key);
        assert!(transports.find(addr, kind).is_none());
        assert!(transports.transport_count() == 0);
    }

    #[test]
    fn test_encode_appends_content_length() {
        let mock = Arc::new(MockUdpTransport::new());
        let request = crate::transaction::mock::outgoing_request(crate::message::SipMethod::Options, mock);
        let bytes = request.to_bytes().unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();

        assert!(text.starts_with("OPTIONS sip:bob@127.0.0.1:5060 SIP/2.0\r\n"));
        assert!(text.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mock = Arc::new(MockUdpTransport::new());
        let request = crate::transaction::mock::outgoing_request(crate::message::SipMethod::Register, mock);
        let bytes = request.to_bytes().unwrap();

        let decoded = parser::parse_sip_msg(&bytes).unwrap();
        let SipMsg::Request(decoded) = decoded else {
            panic!("expected a request");
        };

        assert_eq!(decoded.req_line.method, *request.msg.method());
        assert_eq!(decoded.req_line.uri, request.msg.req_line.uri);
        assert_eq!(
            decoded.headers.top_via().unwrap().branch(),
            request.msg.headers.top_via().unwrap().branch()
        );
        assert_eq!(decoded.headers.cseq(), request.msg.headers.cseq());
        assert_eq!(decoded.headers.call_id(), request.msg.headers.call_id());
        assert_eq!(decoded.headers.from(), request.msg.headers.from());
    }
}
