#![warn(missing_docs)]
//! The Transaction User layer: sessions, dialogs and the call API.
//!
//! The [`UserAgent`] owns every dialog, keyed by a monotonically growing
//! session number the application holds instead of references. It plugs
//! into the endpoint as a [`SipService`] and implements the inbound
//! dispatch: transaction layer first (done by the endpoint), then dialog
//! matching by Call-ID and tags, then new-INVITE handling, and a 481 for
//! everything else.

mod dialog;

pub use dialog::{Dialog, DialogId, DialogKind, DialogState};

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::message::{SipMethod, SipUri, TransportKind};
use crate::sdp::{MediaConfig, SdpNegotiation};
use crate::transaction::Role;
use crate::transport::{IncomingRequest, IncomingResponse, TransportKey};
use crate::SipService;

use dialog::DialogSetup;

/// Everything the core reports upward, as one enum the TU matches on.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// A peer wants to talk to us.
    IncomingCall {
        /// The session to accept or reject.
        session: u32,
        /// Who is calling.
        remote: SipUri,
    },
    /// The callee's phone is ringing.
    Ringing {
        /// The session that is ringing.
        session: u32,
    },
    /// The callee accepted the call.
    PeerAccepted {
        /// The accepted session.
        session: u32,
    },
    /// Media negotiation finished; the call can start.
    CallNegotiated {
        /// The negotiated session.
        session: u32,
    },
    /// The peer ended the call.
    EndCall {
        /// The ended session.
        session: u32,
    },
    /// The session failed and is no longer valid.
    Failure {
        /// The failed session.
        session: u32,
        /// A human-readable reason.
        reason: String,
    },
    /// The peer sent a text message inside the call.
    ChatMessage {
        /// The session the message belongs to.
        session: u32,
        /// The message text.
        text: String,
    },
    /// Registration with the server succeeded.
    RegisteredToServer,
    /// Registration with the server failed.
    RegisteringFailed,
}

/// The application above the transaction layer.
#[async_trait::async_trait]
pub trait TransactionUser: Sync + Send + 'static {
    /// Called for every state change the TU should know about.
    async fn on_event(&self, event: CallEvent);
}

/// Someone to call: a username at a network address.
#[derive(Debug, Clone)]
pub struct CallTarget {
    /// The remote username.
    pub username: String,
    /// The remote signalling address.
    pub address: SocketAddr,
    /// The transport to reach them over; `Any` picks TCP.
    pub transport: TransportKind,
}

impl CallTarget {
    /// A target reached over TCP.
    pub fn new<T: Into<String>>(username: T, address: SocketAddr) -> Self {
        Self {
            username: username.into(),
            address,
            transport: TransportKind::Any,
        }
    }

    /// Overrides the transport used to reach this target.
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }
}

pub(crate) struct UaInner {
    endpoint: OnceLock<Endpoint>,
    tu: Arc<dyn TransactionUser>,
    config: MediaConfig,
    /// Sessions in creation order; ids are handed out from 1 up.
    sessions: Mutex<BTreeMap<u32, Dialog>>,
    next_session: AtomicU32,
}

impl UaInner {
    pub(crate) fn remove_session(&self, session_id: u32) {
        self.sessions.lock().expect("Lock failed").remove(&session_id);
    }
}

/// The user agent: the call-level API of the stack.
#[derive(Clone)]
pub struct UserAgent {
    inner: Arc<UaInner>,
}

impl UserAgent {
    /// Creates a user agent reporting to `tu` with the given media
    /// capabilities. Register it on the endpoint with
    /// [`crate::endpoint::Builder::with_service`] and attach the endpoint
    /// afterwards.
    pub fn new(tu: Arc<dyn TransactionUser>, config: MediaConfig) -> Self {
        Self {
            inner: Arc::new(UaInner {
                endpoint: OnceLock::new(),
                tu,
                config,
                sessions: Mutex::new(BTreeMap::new()),
                next_session: AtomicU32::new(1),
            }),
        }
    }

    /// Attaches the endpoint once it is built. Calls before this fail
    /// with `Unconnected`.
    pub fn set_endpoint(&self, endpoint: Endpoint) {
        let _ = self.inner.endpoint.set(endpoint);
    }

    fn endpoint(&self) -> Result<&Endpoint> {
        self.inner.endpoint.get().ok_or(Error::Unconnected)
    }

    /// The number of live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().expect("Lock failed").len()
    }

    fn find_session(&self, session_id: u32) -> Result<Dialog> {
        self.inner
            .sessions
            .lock()
            .expect("Lock failed")
            .get(&session_id)
            .cloned()
            .ok_or(Error::DialogNotFound)
    }

    fn next_session_id(&self) -> u32 {
        self.inner.next_session.fetch_add(1, Ordering::SeqCst)
    }

    fn setup_for(&self, session_id: u32, transport: Arc<dyn crate::transport::Transport>, remote_addr: SocketAddr, kind: DialogKind) -> Result<DialogSetup> {
        Ok(DialogSetup {
            session_id,
            endpoint: self.endpoint()?.clone(),
            ua: Arc::downgrade(&self.inner),
            tu: self.inner.tu.clone(),
            kind,
            negotiation: SdpNegotiation::new(self.inner.config.clone()),
            transport,
            remote_addr,
        })
    }

    /// Starts one outbound call per target and returns the session ids in
    /// the same order. Individual failures surface as `Failure` events on
    /// their session; the other calls proceed.
    pub async fn start_call(&self, targets: Vec<CallTarget>) -> Result<Vec<u32>> {
        let endpoint = self.endpoint()?.clone();
        let mut sessions = Vec::with_capacity(targets.len());

        for target in targets {
            let session_id = self.next_session_id();
            sessions.push(session_id);

            let protocol = match target.transport {
                TransportKind::Any => TransportKind::Tcp,
                other => other,
            };

            let transport = match endpoint.transport().obtain(protocol, target.address).await {
                Ok(transport) => transport,
                Err(err) => {
                    log::warn!("Session {session_id}: connect to {} failed: {err}", target.address);
                    self.inner
                        .tu
                        .on_event(CallEvent::Failure {
                            session: session_id,
                            reason: err.to_string(),
                        })
                        .await;
                    continue;
                }
            };

            let local_uri = SipUri::new(self.inner.config.username.clone(), transport.addr().into());
            let remote_uri = SipUri::new(target.username, target.address.into());

            let setup = self.setup_for(session_id, transport, target.address, DialogKind::Call)?;
            let dialog = Dialog::new_uac(setup, local_uri, remote_uri);

            self.inner
                .sessions
                .lock()
                .expect("Lock failed")
                .insert(session_id, dialog.clone());

            log::debug!("Session {session_id}: calling {}", target.address);

            if let Err(err) = dialog.send_invite().await {
                self.inner.remove_session(session_id);
                self.inner
                    .tu
                    .on_event(CallEvent::Failure {
                        session: session_id,
                        reason: err.to_string(),
                    })
                    .await;
            }
        }

        Ok(sessions)
    }

    /// Accepts a ringing incoming call.
    pub async fn accept_call(&self, session_id: u32) -> Result<()> {
        self.find_session(session_id)?.accept().await
    }

    /// Rejects a ringing incoming call with 486 Busy Here.
    pub async fn reject_call(&self, session_id: u32) -> Result<()> {
        self.find_session(session_id)?.reject().await
    }

    /// Ends a call: BYE when confirmed, CANCEL for an early outbound
    /// call, 486 for an early inbound one.
    pub async fn end_call(&self, session_id: u32) -> Result<()> {
        let dialog = self.find_session(session_id)?;

        match dialog.state() {
            DialogState::Confirmed => dialog.send_bye().await,
            DialogState::Early if dialog.role() == Role::Uac => dialog.send_cancel().await,
            DialogState::Early => dialog.reject().await,
            DialogState::Terminated => {
                self.inner.remove_session(session_id);
                Ok(())
            }
        }
    }

    /// Ends every call, newest first.
    pub async fn end_all_calls(&self) {
        let sessions: Vec<u32> = {
            let sessions = self.inner.sessions.lock().expect("Lock failed");
            sessions.keys().rev().copied().collect()
        };

        for session_id in sessions {
            if let Err(err) = self.end_call(session_id).await {
                log::debug!("Session {session_id}: ending failed: {err}");
            }
        }
    }

    /// Tears everything down without sending further messages; dialogs go
    /// in reverse creation order.
    pub fn shutdown(&self) {
        let sessions: Vec<Dialog> = {
            let mut sessions = self.inner.sessions.lock().expect("Lock failed");
            let drained: Vec<Dialog> = sessions.values().rev().cloned().collect();
            sessions.clear();
            drained
        };

        for dialog in sessions {
            dialog.terminate_silently();
        }

        if let Ok(endpoint) = self.endpoint() {
            endpoint.get_tsx_layer().flush();
        }
    }

    /// Registers `username` with a SIP server. The outcome arrives as
    /// `RegisteredToServer` or `RegisteringFailed`.
    pub async fn register_to_server(&self, server: SocketAddr, username: &str) -> Result<()> {
        let endpoint = self.endpoint()?.clone();
        let session_id = self.next_session_id();

        let transport = endpoint.transport().obtain(TransportKind::Udp, server).await?;

        let local_uri = SipUri::new(username, transport.addr().into());
        let remote_uri = SipUri::new(username, server.into());

        let setup = self.setup_for(session_id, transport, server, DialogKind::Registration)?;
        let dialog = Dialog::new_uac(setup, local_uri, remote_uri);

        self.inner
            .sessions
            .lock()
            .expect("Lock failed")
            .insert(session_id, dialog.clone());

        if let Err(err) = dialog.send_register().await {
            self.inner.remove_session(session_id);
            self.inner.tu.on_event(CallEvent::RegisteringFailed).await;
            return Err(err);
        }

        Ok(())
    }

    fn live_dialogs(&self) -> Vec<Dialog> {
        self.inner.sessions.lock().expect("Lock failed").values().cloned().collect()
    }
}

#[async_trait::async_trait]
impl SipService for UserAgent {
    fn name(&self) -> &str {
        "user-agent"
    }

    async fn on_incoming_request(&self, endpoint: &Endpoint, request: &mut Option<IncomingRequest>) -> Result<()> {
        let Some(incoming) = request.as_mut() else {
            return Ok(());
        };

        let dialogs = self.live_dialogs();

        // A request carrying both our tags belongs to that dialog.
        if let Some(dialog) = dialogs.iter().find(|dialog| dialog.matches_request(incoming)) {
            dialog.on_in_dialog_request(incoming).await?;
            *request = None;
            return Ok(());
        }

        // CANCEL copies the INVITE's To, so it arrives without our tag.
        if incoming.is_method(&SipMethod::Cancel) {
            if let Some(dialog) = dialogs.iter().find(|dialog| dialog.matches_cancel(incoming)) {
                dialog.on_cancel(incoming).await?;
                *request = None;
                return Ok(());
            }
        }

        // A fresh INVITE opens a dialog.
        if incoming.is_method(&SipMethod::Invite) && incoming.to().tag().is_none() {
            let session_id = self.next_session_id();
            let transport = incoming.transport.clone();
            let remote_addr = *incoming.addr();

            let local_uri = SipUri::new(self.inner.config.username.clone(), transport.addr().into());
            let setup = self.setup_for(session_id, transport, remote_addr, DialogKind::Call)?;

            match Dialog::new_uas(setup, incoming, local_uri) {
                Ok(dialog) => {
                    self.inner
                        .sessions
                        .lock()
                        .expect("Lock failed")
                        .insert(session_id, dialog.clone());
                    log::debug!("Session {session_id}: incoming call from /{}", incoming.addr());
                    dialog.on_incoming_invite(incoming).await?;
                }
                Err(err) => {
                    log::warn!("Rejecting INVITE from /{}: {err}", incoming.addr());
                    endpoint.respond(incoming, 400, "Bad Request").await?;
                }
            }
            *request = None;
            return Ok(());
        }

        // An ACK never gets a response, matched or not.
        if incoming.is_method(&SipMethod::Ack) {
            *request = None;
            return Ok(());
        }

        // Out-of-dialog, non-INVITE: nothing to route it to.
        endpoint
            .respond(incoming, 481, "Call/Transaction Does Not Exist")
            .await?;
        *request = None;

        Ok(())
    }

    async fn on_incoming_response(&self, _endpoint: &Endpoint, response: &mut Option<IncomingResponse>) -> Result<()> {
        let Some(incoming) = response.as_ref() else {
            return Ok(());
        };

        // A 2xx retransmitted after its INVITE transaction terminated
        // re-triggers our ACK.
        if incoming.code().is_success() && incoming.cseq().method().is_invite() {
            let dialog = self
                .live_dialogs()
                .into_iter()
                .find(|dialog| dialog.matches_response(incoming));
            if let Some(dialog) = dialog {
                dialog.on_retransmitted_2xx().await?;
                *response = None;
            }
        }

        Ok(())
    }

    async fn on_transport_closed(&self, _endpoint: &Endpoint, key: TransportKey) {
        let failed: Vec<Dialog> = self
            .live_dialogs()
            .into_iter()
            .filter(|dialog| dialog.transport_key() == key)
            .collect();

        for dialog in failed {
            log::warn!("Session {}: transport failed", dialog.session_id());
            self.inner.remove_session(dialog.session_id());
            dialog.on_transport_failed().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use bytes::Bytes;
    use tokio::time::{self, Duration};

    use super::*;
    use crate::endpoint::Builder;
    use crate::message::SipMsg;
    use crate::sdp::{MediaKind, RtpMap};
    use crate::transaction::TransactionLayer;
    use crate::transport::udp::mock::MockUdpTransport;
    use crate::transport::{extract_mandatory_headers, Packet, Payload, Transport};

    #[derive(Default)]
    struct RecordingTu {
        events: Mutex<Vec<CallEvent>>,
    }

    #[async_trait::async_trait]
    impl TransactionUser for RecordingTu {
        async fn on_event(&self, event: CallEvent) {
            self.events.lock().expect("Lock failed").push(event);
        }
    }

    impl RecordingTu {
        fn events(&self) -> Vec<CallEvent> {
            self.events.lock().expect("Lock failed").clone()
        }
    }

    const PEER: &str = "127.0.0.1:5062";

    fn media_config() -> MediaConfig {
        MediaConfig {
            username: "alice".into(),
            local_ip: "127.0.0.1".parse().unwrap(),
            media: vec![(MediaKind::Audio, vec![RtpMap::new(0, "PCMU", 8000)])],
            port_min: 21500,
            port_max: 22000,
        }
    }

    async fn rig() -> (UserAgent, Arc<RecordingTu>, Endpoint, Arc<MockUdpTransport>) {
        let tu = Arc::new(RecordingTu::default());
        let ua = UserAgent::new(tu.clone(), media_config());

        let endpoint = Builder::new()
            .with_transaction_layer(TransactionLayer::default())
            .with_service(ua.clone())
            .build()
            .await;
        ua.set_endpoint(endpoint.clone());

        let transport = Arc::new(MockUdpTransport::new());
        endpoint.transport().add_transport(transport.clone());

        (ua, tu, endpoint, transport)
    }

    /// Feeds raw wire bytes through the parser and dispatch, the way a
    /// transport would.
    async fn inject(endpoint: &Endpoint, transport: &Arc<MockUdpTransport>, raw: &str) {
        let msg = crate::parser::parse_sip_msg(raw.as_bytes()).expect("test message must parse");
        let packet = Packet {
            payload: Payload::new(Bytes::copy_from_slice(raw.as_bytes())),
            addr: PEER.parse().unwrap(),
            time: SystemTime::now(),
        };
        let request_headers = extract_mandatory_headers(&msg, &packet).expect("mandatory headers");
        let transport = transport.clone() as Arc<dyn Transport>;

        match msg {
            SipMsg::Request(request) => {
                let mut request = Some(crate::transport::IncomingRequest {
                    request,
                    transport,
                    packet,
                    transaction: None,
                    request_headers,
                });
                endpoint.process_request(&mut request).await.unwrap();
            }
            SipMsg::Response(response) => {
                let mut response = Some(crate::transport::IncomingResponse {
                    response,
                    transport,
                    packet,
                    request_headers,
                });
                endpoint.process_response(&mut response).await.unwrap();
            }
        }
    }

    fn sent_text(transport: &MockUdpTransport, index: usize) -> String {
        let sent = transport.sent();
        String::from_utf8(sent[index].0.to_vec()).unwrap()
    }

    fn last_sent_text(transport: &MockUdpTransport) -> String {
        let sent = transport.sent();
        String::from_utf8(sent.last().expect("nothing sent").0.to_vec()).unwrap()
    }

    /// The full `Name: value` line of a header in an encoded message.
    fn header_line<'a>(text: &'a str, name: &str) -> &'a str {
        text.lines()
            .find(|line| line.starts_with(name))
            .unwrap_or_else(|| panic!("no {name} header in:\n{text}"))
    }

    fn branch_of(text: &str) -> &str {
        let via = header_line(text, "Via");
        via.split("branch=").nth(1).expect("no branch").trim_end()
    }

    fn tag_of(line: &str) -> &str {
        line.split("tag=").nth(1).expect("no tag").trim_end()
    }

    /// Builds a response from the headers of an encoded request.
    fn response_to(request_text: &str, code: u16, reason: &str, to_tag: Option<&str>, sdp: Option<&str>) -> String {
        let via = header_line(request_text, "Via");
        let from = header_line(request_text, "From");
        let to = header_line(request_text, "To");
        let to = match to_tag {
            Some(tag) => format!("{to};tag={tag}"),
            None => to.to_string(),
        };
        let call_id = header_line(request_text, "Call-ID");
        let cseq = header_line(request_text, "CSeq");

        let content = match sdp {
            Some(body) => format!(
                "Content-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            ),
            None => "Content-Length: 0\r\n\r\n".to_string(),
        };

        format!("SIP/2.0 {code} {reason}\r\n{via}\r\n{from}\r\n{to}\r\n{call_id}\r\n{cseq}\r\n{content}")
    }

    const ANSWER_SDP: &str = "v=0\r\n\
        o=bob 1 1 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        c=IN IP4 127.0.0.1\r\n\
        t=0 0\r\n\
        m=audio 31500 RTP/AVP 0\r\n\
        a=rtpmap:0 PCMU/8000\r\n";

    const OFFER_SDP: &str = "v=0\r\n\
        o=bob 2890844526 2890844526 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        c=IN IP4 127.0.0.1\r\n\
        t=0 0\r\n\
        m=audio 31500 RTP/AVP 0 8\r\n\
        a=rtpmap:0 PCMU/8000\r\n\
        a=rtpmap:8 PCMA/8000\r\n";

    fn incoming_invite(call_id: &str, cseq: u32, sdp: &str) -> String {
        let branch_part = &call_id[..8];
        format!(
            "INVITE sip:alice@127.0.0.1:5060 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5062;branch=z9hG4bK{branch_part}{cseq}\r\n\
             Max-Forwards: 70\r\n\
             From: \"Bob\" <sip:bob@127.0.0.1:5062>;tag=remotetag1\r\n\
             To: <sip:alice@127.0.0.1:5060>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: {cseq} INVITE\r\n\
             Contact: <sip:bob@127.0.0.1:5062>\r\n\
             Content-Type: application/sdp\r\n\
             Content-Length: {}\r\n\r\n{sdp}",
            sdp.len()
        )
    }

    fn in_dialog_request(method: &str, call_id: &str, cseq: u32, to_tag: &str, extra: &str) -> String {
        format!(
            "{method} sip:alice@127.0.0.1:5060 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5062;branch=z9hG4bKuas{method}{cseq}\r\n\
             Max-Forwards: 70\r\n\
             From: \"Bob\" <sip:bob@127.0.0.1:5062>;tag=remotetag1\r\n\
             To: <sip:alice@127.0.0.1:5060>;tag={to_tag}\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: {cseq} {method}\r\n\
             {extra}Content-Length: 0\r\n\r\n"
        )
    }

    #[tokio::test]
    async fn test_happy_call() {
        let (ua, tu, endpoint, transport) = rig().await;
        let target = CallTarget::new("bob", PEER.parse().unwrap()).with_transport(TransportKind::Udp);

        let sessions = ua.start_call(vec![target]).await.unwrap();
        assert_eq!(sessions, vec![1]);

        let invite = sent_text(&transport, 0);
        assert!(invite.starts_with("INVITE sip:bob@127.0.0.1:5062 SIP/2.0\r\n"));
        assert_eq!(header_line(&invite, "CSeq"), "CSeq: 1 INVITE");
        assert!(invite.contains("m=audio"));

        let invite_branch = branch_of(&invite).to_string();
        assert_eq!(invite_branch.len(), 32);
        assert!(invite_branch.starts_with("z9hG4bK"));

        // 100 then 180: the TU only hears about the ringing.
        inject(&endpoint, &transport, &response_to(&invite, 100, "Trying", None, None)).await;
        inject(&endpoint, &transport, &response_to(&invite, 180, "Ringing", Some("bobtag1"), None)).await;
        assert_eq!(tu.events(), vec![CallEvent::Ringing { session: 1 }]);

        // 200 with the SDP answer confirms the dialog.
        inject(
            &endpoint,
            &transport,
            &response_to(&invite, 200, "OK", Some("bobtag1"), Some(ANSWER_SDP)),
        )
        .await;

        assert_eq!(
            tu.events(),
            vec![
                CallEvent::Ringing { session: 1 },
                CallEvent::PeerAccepted { session: 1 },
                CallEvent::CallNegotiated { session: 1 },
            ]
        );

        // The ACK went out on a fresh branch.
        let ack = last_sent_text(&transport);
        assert!(ack.starts_with("ACK sip:bob@127.0.0.1:5062 SIP/2.0\r\n"));
        assert_eq!(header_line(&ack, "CSeq"), "CSeq: 1 ACK");
        assert_ne!(branch_of(&ack), invite_branch);
        assert!(tag_of(header_line(&ack, "To")).starts_with("bobtag1"));

        // Hang up: BYE with the next CSeq, then the 200 settles it.
        ua.end_call(1).await.unwrap();
        let bye = last_sent_text(&transport);
        assert!(bye.starts_with("BYE sip:bob@127.0.0.1:5062 SIP/2.0\r\n"));
        assert_eq!(header_line(&bye, "CSeq"), "CSeq: 2 BYE");

        inject(&endpoint, &transport, &response_to(&bye, 200, "OK", None, None)).await;
        assert_eq!(ua.session_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_call_is_acked_on_same_branch() {
        let (ua, tu, endpoint, transport) = rig().await;
        let target = CallTarget::new("bob", PEER.parse().unwrap()).with_transport(TransportKind::Udp);

        ua.start_call(vec![target]).await.unwrap();
        let invite = sent_text(&transport, 0);
        let invite_branch = branch_of(&invite).to_string();

        inject(
            &endpoint,
            &transport,
            &response_to(&invite, 486, "Busy Here", Some("bobtag2"), None),
        )
        .await;

        assert_eq!(
            tu.events(),
            vec![CallEvent::Failure {
                session: 1,
                reason: "busy".to_string()
            }]
        );
        assert_eq!(ua.session_count(), 0);

        // The ACK to a non-2xx stays inside the INVITE transaction and
        // reuses its branch.
        let ack = last_sent_text(&transport);
        assert!(ack.starts_with("ACK "));
        assert_eq!(header_line(&ack, "CSeq"), "CSeq: 1 ACK");
        assert_eq!(branch_of(&ack), invite_branch);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invite_timeout_over_udp() {
        let (ua, tu, _endpoint, transport) = rig().await;
        let target = CallTarget::new("bob", PEER.parse().unwrap()).with_transport(TransportKind::Udp);

        ua.start_call(vec![target]).await.unwrap();
        assert_eq!(transport.sent_count(), 1);

        // Retransmissions at 500 ms, 1 s, 2 s, 4 s, 8 s, 16 s; timer B at
        // 32 s.
        time::sleep(Duration::from_secs(33)).await;

        assert_eq!(transport.sent_count(), 7);
        assert_eq!(
            tu.events(),
            vec![CallEvent::Failure {
                session: 1,
                reason: "timed out".to_string()
            }]
        );
        assert_eq!(ua.session_count(), 0);
    }

    #[tokio::test]
    async fn test_cross_talk_bye_gets_481() {
        let (ua, tu, endpoint, transport) = rig().await;

        let stray_bye = in_dialog_request("BYE", "nosuchcall@127.0.0.1", 2, "nosuchtag", "");
        inject(&endpoint, &transport, &stray_bye).await;

        let answer = last_sent_text(&transport);
        assert!(answer.starts_with("SIP/2.0 481 Call/Transaction Does Not Exist\r\n"));
        assert_eq!(ua.session_count(), 0);
        assert!(tu.events().is_empty());
    }

    #[tokio::test]
    async fn test_response_follows_rport() {
        let (_ua, _tu, endpoint, transport) = rig().await;

        // The sent-by names the client's private port 9999, but the bare
        // `;rport` flag asks us to answer where the packet came from.
        let stray_bye = "BYE sip:alice@127.0.0.1:5060 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.9:9999;rport;branch=z9hG4bKrport1\r\n\
             Max-Forwards: 70\r\n\
             From: <sip:bob@10.0.0.9>;tag=natted1\r\n\
             To: <sip:alice@127.0.0.1:5060>;tag=nosuchtag\r\n\
             Call-ID: rportcheck@10.0.0.9\r\n\
             CSeq: 2 BYE\r\n\
             Content-Length: 0\r\n\r\n";
        inject(&endpoint, &transport, stray_bye).await;

        let (bytes, addr) = transport.sent().pop().expect("nothing sent");
        let answer = String::from_utf8(bytes.to_vec()).unwrap();

        assert!(answer.starts_with("SIP/2.0 481 "));
        // Sent to the packet source, not to sent-by port 9999.
        assert_eq!(addr, PEER.parse().unwrap());
        // The echoed Via carries the filled-in rport and received values.
        assert!(answer.contains(";rport=5062"));
        assert!(answer.contains(";received=127.0.0.1"));
    }

    #[tokio::test]
    async fn test_response_follows_maddr() {
        let (_ua, _tu, endpoint, transport) = rig().await;

        let stray_bye = "BYE sip:alice@127.0.0.1:5060 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.9:9999;maddr=239.1.2.3;branch=z9hG4bKmaddr1\r\n\
             Max-Forwards: 70\r\n\
             From: <sip:bob@10.0.0.9>;tag=mcast1\r\n\
             To: <sip:alice@127.0.0.1:5060>;tag=nosuchtag\r\n\
             Call-ID: maddrcheck@10.0.0.9\r\n\
             CSeq: 2 BYE\r\n\
             Content-Length: 0\r\n\r\n";
        inject(&endpoint, &transport, stray_bye).await;

        let (_, addr) = transport.sent().pop().expect("nothing sent");

        // The multicast sent-by overrides received-based routing.
        assert_eq!(addr, "239.1.2.3:9999".parse().unwrap());
    }

    #[tokio::test]
    async fn test_incoming_call_accept_and_remote_bye() {
        let (ua, tu, endpoint, transport) = rig().await;
        let call_id = "uas1234567890abc@127.0.0.1";

        inject(&endpoint, &transport, &incoming_invite(call_id, 1, OFFER_SDP)).await;

        let remote = SipUri::new("bob", "127.0.0.1:5062".parse::<SocketAddr>().unwrap().into())
            .with_realname("Bob");
        assert_eq!(
            tu.events(),
            vec![CallEvent::IncomingCall {
                session: 1,
                remote
            }]
        );

        ua.accept_call(1).await.unwrap();

        let ok = last_sent_text(&transport);
        assert!(ok.starts_with("SIP/2.0 200 OK\r\n"));
        // The answer picked exactly one codec.
        assert!(ok.contains("m=audio"));
        assert!(ok.contains("a=rtpmap:0 PCMU/8000"));
        assert!(!ok.contains("PCMA"));

        let local_tag = tag_of(header_line(&ok, "To")).to_string();

        // The ACK confirms the dialog, then the peer hangs up.
        inject(&endpoint, &transport, &in_dialog_request("ACK", call_id, 1, &local_tag, "")).await;
        inject(&endpoint, &transport, &in_dialog_request("BYE", call_id, 2, &local_tag, "")).await;

        let bye_answer = last_sent_text(&transport);
        assert!(bye_answer.starts_with("SIP/2.0 200 OK\r\n"));

        assert_eq!(
            tu.events().last(),
            Some(&CallEvent::EndCall { session: 1 })
        );
        assert_eq!(ua.session_count(), 0);
    }

    #[tokio::test]
    async fn test_incoming_call_rejected_busy() {
        let (ua, tu, endpoint, transport) = rig().await;
        let call_id = "uasreject1234567@127.0.0.1";

        inject(&endpoint, &transport, &incoming_invite(call_id, 1, OFFER_SDP)).await;
        assert_matches!(tu.events()[0], CallEvent::IncomingCall { session: 1, .. });

        ua.reject_call(1).await.unwrap();

        let busy = last_sent_text(&transport);
        assert!(busy.starts_with("SIP/2.0 486 Busy Here\r\n"));
        assert_eq!(ua.session_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_of_pending_invite() {
        let (ua, tu, endpoint, transport) = rig().await;
        let call_id = "uascancel1234567@127.0.0.1";

        inject(&endpoint, &transport, &incoming_invite(call_id, 1, OFFER_SDP)).await;
        assert_eq!(ua.session_count(), 1);

        let cancel = format!(
            "CANCEL sip:alice@127.0.0.1:5060 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5062;branch=z9hG4bKuascance1\r\n\
             Max-Forwards: 70\r\n\
             From: \"Bob\" <sip:bob@127.0.0.1:5062>;tag=remotetag1\r\n\
             To: <sip:alice@127.0.0.1:5060>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 1 CANCEL\r\n\
             Content-Length: 0\r\n\r\n"
        );
        inject(&endpoint, &transport, &cancel).await;

        let sent = transport.sent();
        let texts: Vec<String> = sent.iter().map(|(b, _)| String::from_utf8(b.to_vec()).unwrap()).collect();

        // 200 for the CANCEL, 487 for the INVITE.
        assert!(texts
            .iter()
            .any(|t| t.starts_with("SIP/2.0 200 OK\r\n") && t.contains("CSeq: 1 CANCEL")));
        assert!(texts.iter().any(|t| t.starts_with("SIP/2.0 487 Request Terminated\r\n")));

        assert_eq!(tu.events().last(), Some(&CallEvent::EndCall { session: 1 }));
        assert_eq!(ua.session_count(), 0);
    }

    #[tokio::test]
    async fn test_chat_message_in_dialog() {
        let (ua, tu, endpoint, transport) = rig().await;
        let call_id = "uaschat123456789@127.0.0.1";

        inject(&endpoint, &transport, &incoming_invite(call_id, 1, OFFER_SDP)).await;
        ua.accept_call(1).await.unwrap();
        let local_tag = tag_of(header_line(&last_sent_text(&transport), "To")).to_string();

        let chat = format!(
            "OPTIONS sip:alice@127.0.0.1:5060 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5062;branch=z9hG4bKuaschat2\r\n\
             Max-Forwards: 70\r\n\
             From: \"Bob\" <sip:bob@127.0.0.1:5062>;tag=remotetag1\r\n\
             To: <sip:alice@127.0.0.1:5060>;tag={local_tag}\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 2 OPTIONS\r\n\
             Content-Type: text/plain\r\n\
             Content-Length: 5\r\n\r\nhello"
        );
        inject(&endpoint, &transport, &chat).await;

        assert_eq!(
            tu.events().last(),
            Some(&CallEvent::ChatMessage {
                session: 1,
                text: "hello".to_string()
            })
        );
        assert!(last_sent_text(&transport).starts_with("SIP/2.0 200 OK\r\n"));
    }

    #[tokio::test]
    async fn test_cseq_regression_rejected_with_500() {
        let (ua, _tu, endpoint, transport) = rig().await;
        let call_id = "uascseq123456789@127.0.0.1";

        inject(&endpoint, &transport, &incoming_invite(call_id, 10, OFFER_SDP)).await;
        ua.accept_call(1).await.unwrap();
        let local_tag = tag_of(header_line(&last_sent_text(&transport), "To")).to_string();

        // Below the last-seen CSeq of 10.
        inject(&endpoint, &transport, &in_dialog_request("BYE", call_id, 9, &local_tag, "")).await;
        assert!(last_sent_text(&transport).starts_with("SIP/2.0 500 Server Internal Error\r\n"));
        assert_eq!(ua.session_count(), 1);

        // A gap above it is fine.
        inject(&endpoint, &transport, &in_dialog_request("BYE", call_id, 14, &local_tag, "")).await;
        assert!(last_sent_text(&transport).starts_with("SIP/2.0 200 OK\r\n"));
        assert_eq!(ua.session_count(), 0);
    }

    #[tokio::test]
    async fn test_tag_mismatch_rejected_with_481() {
        let (ua, _tu, endpoint, transport) = rig().await;
        let call_id = "uastags123456789@127.0.0.1";

        inject(&endpoint, &transport, &incoming_invite(call_id, 1, OFFER_SDP)).await;
        ua.accept_call(1).await.unwrap();

        // Right Call-ID, wrong To tag.
        inject(&endpoint, &transport, &in_dialog_request("BYE", call_id, 2, "wrongtag", "")).await;

        assert!(last_sent_text(&transport).starts_with("SIP/2.0 481 Call/Transaction Does Not Exist\r\n"));
        assert_eq!(ua.session_count(), 1);
    }

    #[tokio::test]
    async fn test_register_round_trip() {
        let (ua, tu, endpoint, transport) = rig().await;
        let server: SocketAddr = "127.0.0.1:5070".parse().unwrap();

        ua.register_to_server(server, "alice").await.unwrap();

        let register = last_sent_text(&transport);
        assert!(register.starts_with("REGISTER sip:127.0.0.1:5070 SIP/2.0\r\n"));
        assert!(register.contains("Expires: 3600"));

        inject(&endpoint, &transport, &response_to(&register, 200, "OK", Some("srv1"), None)).await;

        assert_eq!(tu.events(), vec![CallEvent::RegisteredToServer]);
        assert_eq!(ua.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_failure() {
        let (ua, tu, endpoint, transport) = rig().await;
        let server: SocketAddr = "127.0.0.1:5070".parse().unwrap();

        ua.register_to_server(server, "alice").await.unwrap();
        let register = last_sent_text(&transport);

        inject(
            &endpoint,
            &transport,
            &response_to(&register, 404, "Not Found", Some("srv1"), None),
        )
        .await;

        assert_eq!(tu.events(), vec![CallEvent::RegisteringFailed]);
    }

    #[tokio::test]
    async fn test_reinvite_renegotiates() {
        let (ua, tu, endpoint, transport) = rig().await;
        let call_id = "uasreinv12345678@127.0.0.1";

        inject(&endpoint, &transport, &incoming_invite(call_id, 1, OFFER_SDP)).await;
        ua.accept_call(1).await.unwrap();
        let ok = last_sent_text(&transport);
        let local_tag = tag_of(header_line(&ok, "To")).to_string();
        inject(&endpoint, &transport, &in_dialog_request("ACK", call_id, 1, &local_tag, "")).await;

        // The re-INVITE narrows the offer to PCMU only.
        let narrowed = "v=0\r\n\
            o=bob 2890844526 2890844527 IN IP4 127.0.0.1\r\n\
            s=-\r\n\
            c=IN IP4 127.0.0.1\r\n\
            t=0 0\r\n\
            m=audio 31500 RTP/AVP 0\r\n\
            a=rtpmap:0 PCMU/8000\r\n";
        let reinvite = format!(
            "INVITE sip:alice@127.0.0.1:5060 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5062;branch=z9hG4bKuasreinv2\r\n\
             Max-Forwards: 70\r\n\
             From: \"Bob\" <sip:bob@127.0.0.1:5062>;tag=remotetag1\r\n\
             To: <sip:alice@127.0.0.1:5060>;tag={local_tag}\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 2 INVITE\r\n\
             Contact: <sip:bob@127.0.0.1:5062>\r\n\
             Content-Type: application/sdp\r\n\
             Content-Length: {}\r\n\r\n{narrowed}",
            narrowed.len()
        );
        inject(&endpoint, &transport, &reinvite).await;

        let answer = last_sent_text(&transport);
        assert!(answer.starts_with("SIP/2.0 200 OK\r\n"));
        assert!(answer.contains("a=rtpmap:0 PCMU/8000"));

        assert_eq!(tu.events().last(), Some(&CallEvent::CallNegotiated { session: 1 }));
        assert_eq!(ua.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_in_reverse_order() {
        let (ua, _tu, endpoint, transport) = rig().await;

        inject(&endpoint, &transport, &incoming_invite("shutdown1a@127.0.0.1", 1, OFFER_SDP)).await;
        inject(
            &endpoint,
            &transport,
            &incoming_invite("shutdown2b@127.0.0.1", 1, &OFFER_SDP.replace("o=bob 2890844526", "o=bob 2890844527")),
        )
        .await;
        assert_eq!(ua.session_count(), 2);

        let sent_before = transport.sent_count();
        ua.shutdown();

        assert_eq!(ua.session_count(), 0);
        // Silent teardown: nothing else went out.
        assert_eq!(transport.sent_count(), sent_before);
    }
}
