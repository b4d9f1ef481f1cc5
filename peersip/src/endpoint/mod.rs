#![warn(missing_docs)]
//! SIP Endpoint.
//!
//! The endpoint is the coordinator: it drains transport events, extracts
//! mandatory headers, runs the transaction layer and hands what is left to
//! the registered services.

pub mod builder;

mod resolver;

pub use builder::Builder;
pub(crate) use resolver::resolve;

use std::net::SocketAddr;
use std::time::Duration;
use std::{io, sync::Arc};

use crate::headers::{Header, Headers, Via};
use crate::message::{HostPort, Response, StatusCode, StatusLine};
use crate::transaction::{InvServerTransaction, ServerTransaction, TransactionLayer};
use crate::transport::{
    IncomingRequest, IncomingResponse, OutgoingAddr, OutgoingResponse, ToBytes, TransportKey, TransportLayer,
};
use crate::{Result, SipService};

pub(crate) struct Inner {
    /// The transport layer for the endpoint.
    pub(crate) transport: TransportLayer,
    /// The transaction layer for the endpoint.
    pub(crate) transaction: Option<TransactionLayer>,
    /// The name of the endpoint.
    pub(crate) name: String,
    /// The list of services registered.
    pub(crate) services: Box<[Box<dyn SipService>]>,
}

#[derive(Clone)]
/// The SIP endpoint.
///
/// An endpoint is a logical entity that can send and receive SIP
/// messages, manage transactions, and interact with registered services.
pub struct Endpoint(pub(crate) Arc<Inner>);

impl Endpoint {
    /// Returns a builder to create an `Endpoint`.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Runs the endpoint until the process ends, processing messages from
    /// the transport layer.
    pub async fn run(self) -> Result<()> {
        tokio::spawn(Box::pin(self.receive_message()))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("Task join error: {}", e)))??;

        Ok(())
    }

    /// Runs the endpoint, stopping after `timeout`.
    pub async fn run_with_timeout(self, timeout: Duration) -> Result<()> {
        let _ = tokio::time::timeout(timeout, self.receive_message()).await;

        Ok(())
    }

    async fn receive_message(self) -> Result<()> {
        self.0.transport.handle_events(&self).await
    }

    /// Get the endpoint name.
    pub fn get_name(&self) -> &str {
        &self.0.name
    }

    /// Creates a new User Agent Server (UAS) transaction for a non-INVITE
    /// request.
    pub fn new_uas_tsx(&self, request: &mut IncomingRequest) -> ServerTransaction {
        ServerTransaction::new(self, request)
    }

    /// Creates a new User Agent Server (UAS) INVITE transaction.
    pub fn new_uas_inv_tsx(&self, request: &mut IncomingRequest) -> InvServerTransaction {
        InvServerTransaction::new(self, request)
    }

    /// Responds statelessly to a request.
    ///
    /// The response is composed from the request and sent without creating
    /// a server transaction.
    pub async fn respond(&self, request: &IncomingRequest, status_code: u16, reason_phrase: &str) -> Result<()> {
        // No UAS transaction must be created for this request.
        assert!(request.transaction.is_none(), "Request already has a transaction");

        let mut msg = self.new_response(request, status_code, reason_phrase);

        self.send_response(&mut msg).await
    }

    /// Creates a new SIP response based on an incoming request.
    ///
    /// Copies the `Via` path, `Record-Route` set, `Call-ID`, `From`, `To`
    /// and `CSeq` from the request, and adds a `To` tag on final responses
    /// that lack one.
    pub fn new_response(&self, req: &IncomingRequest, code: u16, reason: &str) -> OutgoingResponse {
        let mut headers = Headers::with_capacity(7);
        let msg_headers = &req.request.headers;

        // `Via` headers: the topmost one (with `received` stamped), then
        // the rest of the chain in order.
        let topmost_via = req.request_headers.via.clone();
        headers.push(Header::Via(topmost_via));
        headers.extend(msg_headers.vias().skip(1).cloned().map(Header::Via));

        // `Call-ID` and `From` are copied untouched.
        headers.push(Header::CallId(req.request_headers.call_id.clone()));
        headers.push(Header::From(req.request_headers.from.clone()));

        // 8.2.6.2 Headers and Tags: the UAS MUST add a tag to the To
        // header in a final response. The Via branch is stable across
        // request retransmissions, so reusing it keeps the tag stable too.
        let mut to = req.request_headers.to.clone();
        if to.tag().is_none() && code > 100 {
            if let Some(branch) = req.request_headers.via.branch() {
                to.set_tag(branch);
            }
        }
        headers.push(Header::To(to));

        headers.push(Header::CSeq(req.request_headers.cseq));

        let addr = self.get_outbound_addr(&req.request_headers.via, &req.transport);
        let status_line = StatusLine::new(StatusCode::from(code), reason);

        OutgoingResponse {
            response: Response {
                status_line,
                headers,
                body: None,
            },
            addr,
            buf: None,
        }
    }

    /// Sends a SIP response to the address derived from its Via path.
    pub async fn send_response(&self, response: &mut OutgoingResponse) -> Result<()> {
        log::debug!("=> Response {} {}", response.status_code().as_u16(), response.reason());
        let encoded_buf = response.to_bytes()?;

        match &response.addr {
            OutgoingAddr::HostPort { host, protocol } => {
                let addr = crate::transport::resolve_host_port(host, *protocol).await?;

                let transport = self.0.transport.find(addr, *protocol).ok_or(crate::error::Error::Unconnected)?;
                transport.send(&encoded_buf, &addr).await?;
                Ok(())
            }
            OutgoingAddr::Addr { addr, transport } => {
                transport.send(&encoded_buf, addr).await?;
                Ok(())
            }
        }
    }

    // https://datatracker.ietf.org/doc/html/rfc3261#section-18.2.2
    // https://datatracker.ietf.org/doc/html/rfc3581
    fn get_outbound_addr(
        &self,
        via: &Via,
        transport: &Arc<dyn crate::transport::Transport>,
    ) -> OutgoingAddr {
        if transport.reliable() {
            // The response goes back on the connection the request came in
            // on.
            return OutgoingAddr::Addr {
                addr: transport.addr(),
                transport: transport.clone(),
            };
        }

        if let Some(maddr) = via.maddr() {
            // A multicast sent-by overrides everything else.
            return OutgoingAddr::HostPort {
                host: HostPort::new(maddr.clone(), Some(via.sent_by().port_or_default())),
                protocol: via.transport(),
            };
        }

        if let Some(rport) = via.rport() {
            let ip = via.received().expect("received is stamped on every inbound Via");
            let addr = SocketAddr::new(ip, rport);

            OutgoingAddr::Addr {
                addr,
                transport: transport.clone(),
            }
        } else if let Some(ip) = via.received() {
            let port = via.sent_by().port_or_default();
            let addr = SocketAddr::new(ip, port);

            OutgoingAddr::Addr {
                addr,
                transport: transport.clone(),
            }
        } else {
            OutgoingAddr::HostPort {
                host: via.sent_by().clone(),
                protocol: via.transport(),
            }
        }
    }

    pub(crate) async fn process_response(&self, msg: &mut Option<IncomingResponse>) -> Result<()> {
        {
            let msg = msg.as_ref().ok_or(crate::error::Error::DialogNotFound)?;
            log::debug!(
                "<= Response ({} {})",
                msg.response.status_line.code.as_u16(),
                msg.response.status_line.reason
            );
        }

        let handled_by_transaction_layer = match self.0.transaction {
            Some(ref tsx_layer) => tsx_layer.handle_response(msg.as_ref().expect("checked above")).await?,
            None => false,
        };

        if handled_by_transaction_layer {
            return Ok(());
        }

        for service in self.0.services.iter() {
            service.on_incoming_response(self, msg).await?;

            if msg.is_none() {
                break;
            }
        }

        if let Some(msg) = msg {
            log::debug!(
                "Response ({} {}) from /{} was unhandled by any service",
                msg.response.status_line.code.as_u16(),
                msg.response.status_line.reason,
                msg.packet.addr
            );
        }

        Ok(())
    }

    pub(crate) async fn process_request(&self, msg: &mut Option<IncomingRequest>) -> Result<()> {
        {
            let msg = msg.as_ref().ok_or(crate::error::Error::DialogNotFound)?;
            log::debug!("<= Request {} from /{}", msg.method(), msg.addr());
        }

        let handled_by_transaction_layer = match self.0.transaction {
            Some(ref tsx_layer) => tsx_layer.handle_request(msg.as_ref().expect("checked above")).await?,
            None => false,
        };

        if handled_by_transaction_layer {
            return Ok(());
        }

        // Not claimed by an existing transaction; offer it to the
        // services.
        for service in self.0.services.iter() {
            service.on_incoming_request(self, msg).await?;
            if msg.is_none() {
                break;
            }
        }

        if let Some(msg) = msg {
            log::debug!(
                "Request ({}, cseq={}) from /{} was unhandled by any service",
                msg.method(),
                msg.cseq().cseq(),
                msg.addr()
            );
        }

        Ok(())
    }

    pub(crate) async fn on_transport_closed(&self, key: TransportKey) {
        for service in self.0.services.iter() {
            service.on_transport_closed(self, key).await;
        }
    }

    pub(crate) fn get_tsx_layer(&self) -> &TransactionLayer {
        self.0.transaction.as_ref().expect("Transaction layer not set")
    }

    /// The transport layer of this endpoint.
    pub fn transport(&self) -> &TransportLayer {
        &self.0.transport
    }
}
