use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::headers::{
    CSeq, CallId, Contact, ContentType, Header, Headers, MaxForwards, MediaType, To,
    Via,
};
use crate::message::{Request, RequestLine, SipMethod, SipUri, StatusCode};
use crate::sdp::{SdpNegotiation, SessionDescription};
use crate::transaction::{ClientTransaction, InvClientTransaction, Role};
use crate::transport::{
    IncomingRequest, IncomingResponse, OutgoingAddr, OutgoingRequest, OutgoingResponse, RequestHeaders, ToBytes,
    Transport,
};
use crate::ua::{CallEvent, TransactionUser, UaInner};

/*
 * Dialog establishment and termination (INVITE):
 *
 * UAC (Caller)                 UAS (Receiver)
 *     |--- INVITE ----------->|    // Request to establish a session
 *     |<--- 180 Ringing ------|    // Early dialog
 *     |<--- 200 OK -----------|    // Accepted, dialog confirmed
 *     |--- ACK -------------->|    // Travels on its own branch
 *     |--- BYE -------------->|    // Terminates the session
 *     |<--- 200 OK -----------|    // Dialog terminated
 */

/// Unique identifier of a SIP dialog (Call-ID + both tags).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    /// The Call-ID shared by every message of the dialog.
    pub call_id: CallId,
    /// The tag this side picked at dialog creation; never changes.
    pub local_tag: String,
    /// The peer's tag, fixed by the first tagged response or request.
    pub remote_tag: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Dialog lifecycle: early until both tags are known, then confirmed,
/// then terminated.
pub enum DialogState {
    /// Created, 2xx not yet exchanged.
    Early,
    /// Both tags known, 2xx exchanged.
    Confirmed,
    /// Finished; kept only until the owner drops it.
    Terminated,
}

/// What a dialog is for. Registrations reuse the dialog machinery for
/// their identifiers and CSeq handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogKind {
    /// An audio/video call.
    Call,
    /// A REGISTER exchange with a server.
    Registration,
}

pub(crate) struct Inner {
    /// The session number the TU knows this dialog by.
    session_id: u32,
    endpoint: Endpoint,
    ua: Weak<UaInner>,
    tu: Arc<dyn TransactionUser>,
    kind: DialogKind,
    role: Role,

    call_id: CallId,
    local_tag: String,
    remote_tag: Mutex<Option<String>>,

    local_uri: SipUri,
    remote_uri: SipUri,
    /// Where in-dialog requests are sent; updated from Contact headers.
    remote_target: Mutex<SipUri>,
    /// Our Contact URI.
    contact: SipUri,

    /// Next CSeq to originate; ACK and CANCEL reuse the INVITE's number.
    local_seq: AtomicU32,
    invite_cseq: AtomicU32,
    /// Highest CSeq seen from the peer; 0 before the first request.
    remote_seq: AtomicU32,

    state: Mutex<DialogState>,
    transport: Arc<dyn Transport>,
    remote_addr: SocketAddr,

    negotiation: Mutex<SdpNegotiation>,
    /// The offer we sent and have not yet seen answered.
    local_offer: Mutex<Option<SessionDescription>>,
    /// The offer the peer sent and the TU has not yet accepted.
    pending_offer: Mutex<Option<SessionDescription>>,
    /// The description both sides agreed on.
    agreed_sdp: Mutex<Option<SessionDescription>>,

    /// The UAC INVITE transaction, kept for CANCEL.
    invite_tsx: Mutex<Option<InvClientTransaction>>,
    /// The UAS INVITE transaction awaiting the TU's verdict.
    server_inv_tsx: Mutex<Option<crate::transaction::InvServerTransaction>>,
    /// The mandatory headers of the INVITE being answered.
    invite_headers: Mutex<Option<RequestHeaders>>,
    /// The encoded ACK, resent when the 2xx is retransmitted.
    last_ack: Mutex<Option<Bytes>>,
}

/// Represents a SIP Dialog.
#[derive(Clone)]
pub struct Dialog {
    inner: Arc<Inner>,
}

pub(crate) struct DialogSetup {
    pub session_id: u32,
    pub endpoint: Endpoint,
    pub ua: Weak<UaInner>,
    pub tu: Arc<dyn TransactionUser>,
    pub kind: DialogKind,
    pub negotiation: SdpNegotiation,
    pub transport: Arc<dyn Transport>,
    pub remote_addr: SocketAddr,
}

impl Dialog {
    /// Creates the caller side of a dialog. The remote tag is learned from
    /// the first tagged response.
    pub(crate) fn new_uac(setup: DialogSetup, local_uri: SipUri, remote_uri: SipUri) -> Dialog {
        let call_id = CallId::new(crate::generate_call_id(&setup.transport.addr().ip().to_string()));
        let contact = local_uri.clone();

        Dialog {
            inner: Arc::new(Inner {
                session_id: setup.session_id,
                endpoint: setup.endpoint,
                ua: setup.ua,
                tu: setup.tu,
                kind: setup.kind,
                role: Role::Uac,
                call_id,
                local_tag: crate::generate_tag(),
                remote_tag: Mutex::new(None),
                remote_target: Mutex::new(remote_uri.clone()),
                local_uri,
                remote_uri,
                contact,
                local_seq: AtomicU32::new(0),
                invite_cseq: AtomicU32::new(0),
                remote_seq: AtomicU32::new(0),
                state: Mutex::new(DialogState::Early),
                transport: setup.transport,
                remote_addr: setup.remote_addr,
                negotiation: Mutex::new(setup.negotiation),
                local_offer: Mutex::new(None),
                pending_offer: Mutex::new(None),
                agreed_sdp: Mutex::new(None),
                invite_tsx: Mutex::new(None),
                server_inv_tsx: Mutex::new(None),
                invite_headers: Mutex::new(None),
                last_ack: Mutex::new(None),
            }),
        }
    }

    /// Creates the callee side from an incoming INVITE. Fails when the
    /// request cannot open a dialog.
    pub(crate) fn new_uas(setup: DialogSetup, request: &IncomingRequest, local_uri: SipUri) -> Result<Dialog> {
        if !request.method().can_establish_a_dialog() {
            return Err(Error::DialogNotFound);
        }
        let Some(remote_tag) = request.from().tag() else {
            return Err(Error::malformed("INVITE without a From tag"));
        };

        let remote_uri = request.from().uri().clone();
        let remote_target = request
            .request
            .headers
            .contact()
            .map(|contact| contact.uri().clone())
            .unwrap_or_else(|| remote_uri.clone());
        let contact = local_uri.clone();

        Ok(Dialog {
            inner: Arc::new(Inner {
                session_id: setup.session_id,
                endpoint: setup.endpoint,
                ua: setup.ua,
                tu: setup.tu,
                kind: setup.kind,
                role: Role::Uas,
                call_id: request.call_id().clone(),
                local_tag: crate::generate_tag(),
                remote_tag: Mutex::new(Some(remote_tag.to_string())),
                remote_target: Mutex::new(remote_target),
                local_uri,
                remote_uri,
                contact,
                local_seq: AtomicU32::new(0),
                invite_cseq: AtomicU32::new(0),
                remote_seq: AtomicU32::new(request.cseq().cseq()),
                state: Mutex::new(DialogState::Early),
                transport: setup.transport,
                remote_addr: setup.remote_addr,
                negotiation: Mutex::new(setup.negotiation),
                local_offer: Mutex::new(None),
                pending_offer: Mutex::new(None),
                agreed_sdp: Mutex::new(None),
                invite_tsx: Mutex::new(None),
                server_inv_tsx: Mutex::new(None),
                invite_headers: Mutex::new(None),
                last_ack: Mutex::new(None),
            }),
        })
    }

    /// The session number the TU knows this dialog by.
    pub fn session_id(&self) -> u32 {
        self.inner.session_id
    }

    pub(crate) fn role(&self) -> Role {
        self.inner.role
    }

    /// A snapshot of the dialog identity.
    pub fn id(&self) -> DialogId {
        DialogId {
            call_id: self.inner.call_id.clone(),
            local_tag: self.inner.local_tag.clone(),
            remote_tag: self.remote_tag(),
        }
    }

    /// The current state.
    pub fn state(&self) -> DialogState {
        *self.inner.state.lock().expect("Lock failed")
    }

    fn set_state(&self, state: DialogState) {
        let mut guard = self.inner.state.lock().expect("Lock failed");
        log::trace!("Dialog {} [{:?} -> {state:?}]", self.inner.session_id, *guard);
        *guard = state;
    }

    /// The remote tag, once known.
    pub fn remote_tag(&self) -> Option<String> {
        self.inner.remote_tag.lock().expect("Lock failed").clone()
    }

    /// The peer's URI.
    pub fn remote_uri(&self) -> &SipUri {
        &self.inner.remote_uri
    }

    pub(crate) fn transport_key(&self) -> crate::transport::TransportKey {
        self.inner.transport.key()
    }

    /// The remote tag is fixed by the first response carrying one; later
    /// values must match or the message is rejected.
    fn learn_remote_tag(&self, tag: &str) {
        let mut guard = self.inner.remote_tag.lock().expect("Lock failed");
        if guard.is_none() {
            *guard = Some(tag.to_string());
        }
    }

    /// Checks whether an in-dialog request carries our tags.
    pub(crate) fn matches_request(&self, request: &IncomingRequest) -> bool {
        if request.call_id() != &self.inner.call_id {
            return false;
        }
        let to_tag_ok = request.to().tag() == Some(self.inner.local_tag.as_str());
        let from_tag_ok = match (request.from().tag(), self.remote_tag()) {
            (Some(from_tag), Some(remote_tag)) => from_tag == remote_tag,
            _ => false,
        };

        to_tag_ok && from_tag_ok
    }

    /// CANCEL copies the INVITE's headers, so it has no To tag yet; it is
    /// matched by Call-ID and From tag alone.
    pub(crate) fn matches_cancel(&self, request: &IncomingRequest) -> bool {
        request.call_id() == &self.inner.call_id
            && request.to().tag().is_none()
            && matches!(
                (request.from().tag(), self.remote_tag()),
                (Some(from_tag), Some(remote_tag)) if from_tag == remote_tag
            )
    }

    /// Checks whether a response belongs to this dialog.
    pub(crate) fn matches_response(&self, response: &IncomingResponse) -> bool {
        response.call_id() == &self.inner.call_id
            && response.request_headers.from.tag() == Some(self.inner.local_tag.as_str())
    }

    async fn emit(&self, event: CallEvent) {
        self.inner.tu.on_event(event).await;
    }

    fn remove_session(&self) {
        if let Some(ua) = self.inner.ua.upgrade() {
            ua.remove_session(self.inner.session_id);
        }
    }

    /// Composes the next request of this dialog: From with our tag, To
    /// with the peer's, fresh branch, Contact, bumped CSeq.
    fn next_request(&self, method: SipMethod) -> OutgoingRequest {
        let cseq_number = if method.reuses_invite_cseq() {
            self.inner.invite_cseq.load(Ordering::SeqCst)
        } else {
            let next = self.inner.local_seq.fetch_add(1, Ordering::SeqCst) + 1;
            if method.is_invite() {
                self.inner.invite_cseq.store(next, Ordering::SeqCst);
            }
            next
        };

        let target = self.inner.remote_target.lock().expect("Lock failed").clone();

        let via = Via::new(
            self.inner.transport.kind(),
            self.inner.transport.addr().into(),
            crate::generate_branch(),
        );

        let to = match self.remote_tag() {
            Some(tag) => To::with_tag(self.inner.remote_uri.clone(), tag),
            None => To::new(self.inner.remote_uri.clone()),
        };

        let mut headers = Headers::with_capacity(7);
        headers.push(Header::Via(via));
        headers.push(Header::MaxForwards(MaxForwards::default()));
        headers.push(Header::From(crate::headers::From::with_tag(
            self.inner.local_uri.clone(),
            self.inner.local_tag.clone(),
        )));
        headers.push(Header::To(to));
        headers.push(Header::CallId(self.inner.call_id.clone()));
        headers.push(Header::CSeq(CSeq::new(cseq_number, method)));
        headers.push(Header::Contact(Contact::new(self.inner.contact.clone())));

        OutgoingRequest {
            msg: Request {
                req_line: RequestLine { method, uri: target },
                headers,
                body: None,
            },
            addr: self.inner.remote_addr,
            buf: None,
            transport: self.inner.transport.clone(),
        }
    }

    /// Sends the dialog-opening INVITE with a fresh SDP offer.
    pub(crate) async fn send_invite(&self) -> Result<()> {
        let offer = self.inner.negotiation.lock().expect("Lock failed").local_offer();

        let mut request = self.next_request(SipMethod::Invite);
        request.msg.headers.push(Header::ContentType(ContentType::new(MediaType::Sdp)));
        request.msg.body = Some(Bytes::from(offer.to_string()));

        *self.inner.local_offer.lock().expect("Lock failed") = Some(offer);

        let tsx = InvClientTransaction::send(request, &self.inner.endpoint).await?;
        tsx.set_dialog(self.clone());
        *self.inner.invite_tsx.lock().expect("Lock failed") = Some(tsx);

        Ok(())
    }

    /// Sends a REGISTER for this registration pseudo-dialog.
    pub(crate) async fn send_register(&self) -> Result<()> {
        let mut request = self.next_request(SipMethod::Register);
        // The Request-URI of a REGISTER names the server, not a user.
        request.msg.req_line.uri.user = None;
        request
            .msg
            .headers
            .push(Header::Expires(crate::headers::Expires::new(3600)));

        let tsx = ClientTransaction::send(request, &self.inner.endpoint).await?;
        tsx.set_dialog(self.clone());

        Ok(())
    }

    /// Ends a confirmed call with a BYE.
    pub(crate) async fn send_bye(&self) -> Result<()> {
        let request = self.next_request(SipMethod::Bye);

        let tsx = ClientTransaction::send(request, &self.inner.endpoint).await?;
        tsx.set_dialog(self.clone());

        Ok(())
    }

    /// Abandons an early outbound call per RFC 3261 section 9.1.
    pub(crate) async fn send_cancel(&self) -> Result<()> {
        let tsx = self.inner.invite_tsx.lock().expect("Lock failed").clone();
        if let Some(tsx) = tsx {
            tsx.cancel().await?;
        }
        Ok(())
    }

    async fn send_ack(&self) -> Result<()> {
        let request = self.next_request(SipMethod::Ack);
        let buf = request.to_bytes()?;

        self.inner.transport.send(&buf, &self.inner.remote_addr).await?;
        *self.inner.last_ack.lock().expect("Lock failed") = Some(buf);

        Ok(())
    }

    /// UAC side: a response to our INVITE, already filtered of
    /// retransmissions by the transaction.
    pub(crate) async fn on_invite_response(&self, response: &IncomingResponse) {
        let code = response.code();

        if code == StatusCode::Ringing {
            self.emit(CallEvent::Ringing {
                session: self.inner.session_id,
            })
            .await;
            return;
        }

        if code.is_provisional() {
            return;
        }

        if code.is_success() {
            if let Err(err) = self.on_invite_accepted(response).await {
                log::warn!("Session {}: dropping call: {err}", self.inner.session_id);
                let _ = self.send_bye().await;
                self.set_state(DialogState::Terminated);
                self.remove_session();
                self.emit(CallEvent::Failure {
                    session: self.inner.session_id,
                    reason: err.to_string(),
                })
                .await;
            }
            return;
        }

        // A final 3xx-6xx. The transaction already ACKed it.
        let rejection = Error::PeerRejected {
            code: code.as_u16(),
            reason: response.response.reason().to_string(),
        };
        log::info!("Session {}: {rejection}", self.inner.session_id);

        self.set_state(DialogState::Terminated);
        self.remove_session();
        self.emit(CallEvent::Failure {
            session: self.inner.session_id,
            reason: failure_reason(code, response.response.reason()),
        })
        .await;
    }

    async fn on_invite_accepted(&self, response: &IncomingResponse) -> Result<()> {
        if let Some(tag) = response.response.headers.to().and_then(|to| to.tag()) {
            self.learn_remote_tag(tag);
        }
        if let Some(contact) = response.response.headers.contact() {
            *self.inner.remote_target.lock().expect("Lock failed") = contact.uri().clone();
        }

        self.set_state(DialogState::Confirmed);

        // The ACK to a 2xx travels on its own branch.
        self.send_ack().await?;
        self.emit(CallEvent::PeerAccepted {
            session: self.inner.session_id,
        })
        .await;

        // Remote-final validation of the answer.
        let answer = parse_sdp_body(&response.response.headers, response.response.body.as_ref())?
            .ok_or_else(|| Error::SdpIncompatible("2xx answer carries no session description".to_string()))?;

        let offer = self.inner.local_offer.lock().expect("Lock failed").take();
        let offer = offer.ok_or_else(|| Error::SdpIncompatible("no outstanding offer".to_string()))?;

        self.inner
            .negotiation
            .lock()
            .expect("Lock failed")
            .accept_answer(&offer, &answer)?;

        *self.inner.agreed_sdp.lock().expect("Lock failed") = Some(answer);
        self.emit(CallEvent::CallNegotiated {
            session: self.inner.session_id,
        })
        .await;

        Ok(())
    }

    /// UAC side: the final answer to a non-INVITE request we sent.
    pub(crate) async fn on_non_invite_response(&self, method: SipMethod, response: &IncomingResponse) {
        match method {
            SipMethod::Register => {
                let event = if response.code().is_success() {
                    CallEvent::RegisteredToServer
                } else {
                    CallEvent::RegisteringFailed
                };
                self.set_state(DialogState::Terminated);
                self.remove_session();
                self.emit(event).await;
            }
            SipMethod::Bye => {
                // We hung up; the 200 just settles the transaction.
                self.set_state(DialogState::Terminated);
                self.remove_session();
            }
            _ => (),
        }
    }

    /// A transaction of ours gave up waiting.
    pub(crate) async fn on_timeout(&self, method: SipMethod) {
        self.set_state(DialogState::Terminated);
        self.remove_session();

        let event = match (self.inner.kind, method) {
            (DialogKind::Registration, _) => CallEvent::RegisteringFailed,
            _ => CallEvent::Failure {
                session: self.inner.session_id,
                reason: "timed out".to_string(),
            },
        };
        self.emit(event).await;
    }

    /// UAS side: the dialog-opening INVITE.
    pub(crate) async fn on_incoming_invite(&self, request: &mut IncomingRequest) -> Result<()> {
        *self.inner.invite_headers.lock().expect("Lock failed") = Some(request.request_headers.clone());

        let offer = match parse_sdp_body(&request.request.headers, request.request.body.as_ref()) {
            Ok(Some(offer)) => offer,
            Ok(None) | Err(_) => {
                // A call without a usable offer cannot be negotiated.
                let tsx = self.inner.endpoint.new_uas_inv_tsx(request);
                let mut response = self.compose_invite_response(StatusCode::NotAcceptableHere);
                tsx.respond(&mut response).await?;
                self.set_state(DialogState::Terminated);
                self.remove_session();
                return Ok(());
            }
        };

        let tsx = self.inner.endpoint.new_uas_inv_tsx(request);
        tsx.set_dialog(self.clone());

        *self.inner.server_inv_tsx.lock().expect("Lock failed") = Some(tsx);
        *self.inner.pending_offer.lock().expect("Lock failed") = Some(offer);

        self.emit(CallEvent::IncomingCall {
            session: self.inner.session_id,
            remote: self.inner.remote_uri.clone(),
        })
        .await;

        Ok(())
    }

    /// Builds a response to the stored INVITE using our dialog tag.
    fn compose_invite_response(&self, code: StatusCode) -> OutgoingResponse {
        let stored = self.inner.invite_headers.lock().expect("Lock failed");

        let mut headers = Headers::with_capacity(6);
        if let Some(invite) = stored.as_ref() {
            headers.push(Header::Via(invite.via.clone()));
            headers.push(Header::From(invite.from.clone()));

            let mut to = invite.to.clone();
            if to.tag().is_none() && code != StatusCode::Trying {
                to.set_tag(self.inner.local_tag.clone());
            }
            headers.push(Header::To(to));
            headers.push(Header::CallId(invite.call_id.clone()));
            headers.push(Header::CSeq(invite.cseq));
        }
        headers.push(Header::Contact(Contact::new(self.inner.contact.clone())));

        let mut response = crate::message::Response::new(crate::message::StatusLine::from_code(code));
        response.headers = headers;

        OutgoingResponse {
            response,
            addr: OutgoingAddr::Addr {
                addr: self.inner.remote_addr,
                transport: self.inner.transport.clone(),
            },
            buf: None,
        }
    }

    /// TU accepted the call: answer 200 with the negotiated description.
    pub(crate) async fn accept(&self) -> Result<()> {
        let tsx = self.inner.server_inv_tsx.lock().expect("Lock failed").take();
        let Some(tsx) = tsx else {
            return Err(Error::DialogNotFound);
        };

        let pending = self.inner.pending_offer.lock().expect("Lock failed").take();
        let Some(offer) = pending else {
            return Err(Error::SdpIncompatible("no offer to answer".to_string()));
        };

        let answer = {
            let mut negotiation = self.inner.negotiation.lock().expect("Lock failed");
            let agreed = self.inner.agreed_sdp.lock().expect("Lock failed");
            match agreed.as_ref() {
                Some(previous) => negotiation.renegotiate(&offer, previous),
                None => negotiation.answer_to(&offer),
            }
        };

        let answer = match answer {
            Ok(answer) => answer,
            Err(err) => {
                let mut response = self.compose_invite_response(StatusCode::NotAcceptableHere);
                tsx.respond(&mut response).await?;
                self.emit(CallEvent::Failure {
                    session: self.inner.session_id,
                    reason: err.to_string(),
                })
                .await;
                self.set_state(DialogState::Terminated);
                self.remove_session();
                return Err(err);
            }
        };

        let mut response = self.compose_invite_response(StatusCode::Ok);
        response
            .headers_mut()
            .push(Header::ContentType(ContentType::new(MediaType::Sdp)));
        response.set_body(Bytes::from(answer.to_string()));

        tsx.respond(&mut response).await?;

        *self.inner.agreed_sdp.lock().expect("Lock failed") = Some(answer);
        self.set_state(DialogState::Confirmed);

        self.emit(CallEvent::CallNegotiated {
            session: self.inner.session_id,
        })
        .await;

        Ok(())
    }

    /// TU rejected the call: answer 486 Busy Here.
    pub(crate) async fn reject(&self) -> Result<()> {
        let tsx = self.inner.server_inv_tsx.lock().expect("Lock failed").take();
        let Some(tsx) = tsx else {
            return Err(Error::DialogNotFound);
        };

        let mut response = self.compose_invite_response(StatusCode::BusyHere);
        tsx.respond(&mut response).await?;

        self.set_state(DialogState::Terminated);
        self.remove_session();

        Ok(())
    }

    /// CANCEL for the unanswered INVITE: 200 to the CANCEL, 487 to the
    /// INVITE, call over.
    pub(crate) async fn on_cancel(&self, request: &mut IncomingRequest) -> Result<()> {
        let tsx = self.inner.endpoint.new_uas_tsx(request);
        let mut ok = self.inner.endpoint.new_response(request, 200, "OK");
        tsx.respond(&mut ok).await?;

        let invite_tsx = self.inner.server_inv_tsx.lock().expect("Lock failed").take();
        if let Some(invite_tsx) = invite_tsx {
            let mut terminated = self.compose_invite_response(StatusCode::RequestTerminated);
            invite_tsx.respond(&mut terminated).await?;
        }

        self.set_state(DialogState::Terminated);
        self.remove_session();
        self.emit(CallEvent::EndCall {
            session: self.inner.session_id,
        })
        .await;

        Ok(())
    }

    /// A request inside the dialog: ACK, BYE, re-INVITE or OPTIONS.
    pub(crate) async fn on_in_dialog_request(&self, request: &mut IncomingRequest) -> Result<()> {
        let method = *request.method();
        let cseq = request.cseq().cseq();

        // Remote CSeq must not move backwards; ACK and CANCEL carry the
        // INVITE's number and are exempt.
        if !method.reuses_invite_cseq() {
            let last_seen = self.inner.remote_seq.load(Ordering::SeqCst);
            if last_seen != 0 && cseq <= last_seen {
                self.inner
                    .endpoint
                    .respond(request, 500, "Server Internal Error")
                    .await?;
                return Ok(());
            }
            self.inner.remote_seq.store(cseq, Ordering::SeqCst);
        }

        match method {
            SipMethod::Ack => {
                // The ACK to our 2xx; the media session is up.
                self.set_state(DialogState::Confirmed);
            }
            SipMethod::Bye => {
                let tsx = self.inner.endpoint.new_uas_tsx(request);
                let mut ok = self.inner.endpoint.new_response(request, 200, "OK");
                tsx.respond(&mut ok).await?;

                self.set_state(DialogState::Terminated);
                self.remove_session();
                self.emit(CallEvent::EndCall {
                    session: self.inner.session_id,
                })
                .await;
            }
            SipMethod::Invite => {
                // Re-INVITE: renegotiate, keeping what did not change.
                self.on_reinvite(request).await?;
            }
            SipMethod::Options => {
                let text = text_plain_body(&request.request.headers, request.request.body.as_ref());
                let tsx = self.inner.endpoint.new_uas_tsx(request);
                let mut ok = self.inner.endpoint.new_response(request, 200, "OK");
                tsx.respond(&mut ok).await?;

                if let Some(text) = text {
                    self.emit(CallEvent::ChatMessage {
                        session: self.inner.session_id,
                        text,
                    })
                    .await;
                }
            }
            SipMethod::Cancel => {
                // In-dialog CANCEL is handled by on_cancel; reaching here
                // means the INVITE was already answered.
                self.inner.endpoint.respond(request, 481, "Call/Transaction Does Not Exist").await?;
            }
            _ => {
                self.inner.endpoint.respond(request, 501, "Not Implemented").await?;
            }
        }

        Ok(())
    }

    async fn on_reinvite(&self, request: &mut IncomingRequest) -> Result<()> {
        let offer = parse_sdp_body(&request.request.headers, request.request.body.as_ref());

        let tsx = self.inner.endpoint.new_uas_inv_tsx(request);
        tsx.set_dialog(self.clone());
        *self.inner.invite_headers.lock().expect("Lock failed") = Some(request.request_headers.clone());

        let Ok(Some(offer)) = offer else {
            // Re-negotiation failures keep the previous session.
            let mut response = self.compose_invite_response(StatusCode::NotAcceptableHere);
            tsx.respond(&mut response).await?;
            return Ok(());
        };

        let answer = {
            let mut negotiation = self.inner.negotiation.lock().expect("Lock failed");
            let agreed = self.inner.agreed_sdp.lock().expect("Lock failed");
            match agreed.as_ref() {
                Some(previous) => negotiation.renegotiate(&offer, previous),
                None => negotiation.answer_to(&offer),
            }
        };

        match answer {
            Ok(answer) => {
                let mut response = self.compose_invite_response(StatusCode::Ok);
                response
                    .headers_mut()
                    .push(Header::ContentType(ContentType::new(MediaType::Sdp)));
                response.set_body(Bytes::from(answer.to_string()));
                tsx.respond(&mut response).await?;

                *self.inner.agreed_sdp.lock().expect("Lock failed") = Some(answer);
                self.emit(CallEvent::CallNegotiated {
                    session: self.inner.session_id,
                })
                .await;
            }
            Err(_) => {
                let mut response = self.compose_invite_response(StatusCode::NotAcceptableHere);
                tsx.respond(&mut response).await?;
            }
        }

        Ok(())
    }

    /// A retransmitted 2xx after the INVITE transaction terminated; the
    /// stored ACK is resent.
    pub(crate) async fn on_retransmitted_2xx(&self) -> Result<()> {
        let ack = self.inner.last_ack.lock().expect("Lock failed").clone();
        if let Some(ack) = ack {
            self.inner.transport.send(&ack, &self.inner.remote_addr).await?;
        }
        Ok(())
    }

    /// The transport under this dialog failed.
    pub(crate) async fn on_transport_failed(&self) {
        self.set_state(DialogState::Terminated);
        self.emit(CallEvent::Failure {
            session: self.inner.session_id,
            reason: "transport failed".to_string(),
        })
        .await;
    }

    /// Flushes the dialog without sending anything; used on shutdown.
    pub(crate) fn terminate_silently(&self) {
        self.set_state(DialogState::Terminated);
        *self.inner.invite_tsx.lock().expect("Lock failed") = None;
        *self.inner.server_inv_tsx.lock().expect("Lock failed") = None;
    }
}

fn failure_reason(code: StatusCode, reason: &str) -> String {
    match code {
        StatusCode::BusyHere => "busy".to_string(),
        StatusCode::Decline => "declined".to_string(),
        StatusCode::RequestTerminated => "request terminated".to_string(),
        StatusCode::RequestTimeout => "timed out".to_string(),
        _ => format!("{} {}", code.as_u16(), reason),
    }
}

fn parse_sdp_body(headers: &Headers, body: Option<&Bytes>) -> Result<Option<SessionDescription>> {
    let is_sdp = headers.content_type().is_some_and(|ct| ct.is_sdp());
    let Some(body) = body else {
        return Ok(None);
    };
    if !is_sdp {
        return Ok(None);
    }

    let text = std::str::from_utf8(body).map_err(|_| Error::malformed("SDP body is not UTF-8"))?;
    SessionDescription::parse(text).map(Some)
}

fn text_plain_body(headers: &Headers, body: Option<&Bytes>) -> Option<String> {
    let is_text = headers.content_type().is_some_and(|ct| ct.is_text_plain());
    let body = body?;
    if !is_text {
        return None;
    }

    String::from_utf8(body.to_vec()).ok()
}
