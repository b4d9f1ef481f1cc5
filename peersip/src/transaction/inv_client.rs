use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
    time::Duration,
};

use futures_util::future::{self, Either};
use tokio::{pin, time};

use crate::{
    headers::{CSeq, CallId, Header, Headers, MaxForwards, Via},
    message::{Request, RequestLine, SipMethod, SipUri},
    transaction::{client::ClientTransaction, State, Transaction, TransactionInner},
    transport::{IncomingResponse, OutgoingRequest},
    Endpoint, Result,
};

/// The headers of the INVITE this transaction was created for, kept for
/// building the ACK and CANCEL that reference it.
struct OriginalRequest {
    uri: SipUri,
    via: Via,
    from: crate::headers::From,
    cseq: CSeq,
    call_id: CallId,
}

/// Represents a client INVITE transaction.
#[derive(Clone)]
pub struct InvClientTransaction {
    transaction: TransactionInner,
    request: Arc<OriginalRequest>,
}

/// How long a terminated-but-unreliable transaction keeps absorbing
/// response retransmissions.
const TIMER_D: Duration = Duration::from_secs(32);

impl InvClientTransaction {
    /// Sends the INVITE and starts timers A (retransmit, unreliable only)
    /// and B (transaction timeout, 64*T1).
    pub async fn send(mut request: OutgoingRequest, endpoint: &Endpoint) -> Result<InvClientTransaction> {
        let tsx_layer = endpoint.get_tsx_layer();
        let method = request.msg.method();

        assert!(
            matches!(method, SipMethod::Invite),
            "Invalid method for client INVITE transaction: expected INVITE, got: {}",
            method
        );

        let transaction = TransactionInner::create_uac_inv(&request, endpoint);
        transaction.tsx_send_request(&mut request).await?;

        let mut via = None;
        let mut cseq = None;
        let mut call_id = None;
        let mut from = None;

        for header in request.msg.headers.iter() {
            match header {
                Header::From(f) => from = Some(f.clone()),
                Header::Via(v) => via = Some(v.clone()),
                Header::CallId(c) => call_id = Some(c.clone()),
                Header::CSeq(c) => cseq = Some(*c),
                _ => continue,
            }
        }

        let request = Arc::new(OriginalRequest {
            uri: request.msg.req_line.uri.clone(),
            via: via.expect("INVITE without Via"),
            cseq: cseq.expect("INVITE without CSeq"),
            call_id: call_id.expect("INVITE without Call-ID"),
            from: from.expect("INVITE without From"),
        });
        let uac_inv = InvClientTransaction { transaction, request };

        tsx_layer.add_client_inv_tsx_to_map(uac_inv.clone());

        tokio::spawn(uac_inv.clone().tsx_retrans_task());

        Ok(uac_inv)
    }

    async fn tsx_retrans_task(self) -> Result<()> {
        pin! {
            let timer_b = time::sleep(64 * Self::T1);
            let timer_a = if !self.reliable() {
                Either::Left(time::sleep(Self::T1))
            } else {
                Either::Right(future::pending::<()>())
            };
        }

        'retrans: loop {
            tokio::select! {
                _ = &mut timer_a => {
                    // The timer observes the state at the moment it fires.
                    if !self.is_calling() {
                        timer_a.set(Either::Right(future::pending::<()>()));
                        continue 'retrans;
                    }
                    match self.retransmit().await {
                        Ok(retrans) => {
                            // Timer A doubles without the T2 cap: 500 ms,
                            // 1 s, 2 s, 4 s, 8 s, 16 s.
                            let interval = Self::T1 * (1 << retrans);
                            let sleep = time::sleep(interval);
                            timer_a.set(Either::Left(sleep));
                        },
                        Err(err) => {
                            log::info!("Failed to retransmit: {}", err);
                        },
                    }
                }
                _ = &mut timer_b => {
                    // Timer B: no final response arrived in time.
                    if matches!(self.get_state(), State::Calling | State::Proceeding) {
                        self.on_terminated();
                        if let Some(dialog) = self.dialog() {
                            dialog.on_timeout(SipMethod::Invite).await;
                        }
                    }
                    break 'retrans Ok(());
                }
            }
        }
    }

    pub(crate) async fn receive(&self, response: &IncomingResponse) -> Result<bool> {
        let code = response.response.code();
        self.set_last_status_code(code);

        match self.get_state() {
            State::Calling if code.is_provisional() => {
                self.change_state_to(State::Proceeding);
                self.notify_dialog(response).await;
            }
            State::Proceeding if code.is_provisional() => {
                self.notify_dialog(response).await;
            }
            State::Calling | State::Proceeding if matches!(code.as_u16(), 300..=699) => {
                self.change_state_to(State::Completed);
                let mut ack = self.create_ack(response);

                self.tsx_send_request(&mut ack).await?;
                self.terminate();
                self.notify_dialog(response).await;
            }
            State::Calling | State::Proceeding if code.is_final() => {
                // A 2xx terminates the transaction at once; the ACK is the
                // TU's job and travels on its own branch.
                self.on_terminated();
                self.notify_dialog(response).await;
            }
            State::Completed => {
                // 17.1.1.2: retransmitted final responses re-trigger the
                // ACK but are not passed up to the TU.
                self.retransmit().await?;

                return Ok(true);
            }
            _ => (),
        }
        Ok(false)
    }

    async fn notify_dialog(&self, response: &IncomingResponse) {
        if let Some(dialog) = self.dialog() {
            dialog.on_invite_response(response).await;
        }
    }

    /// RFC 3261 section 9.1: a CANCEL is only legal once a provisional
    /// response has arrived; anywhere else it is a no-op. It copies the
    /// INVITE's branch and sequence number and runs as its own non-INVITE
    /// transaction.
    pub async fn cancel(&self) -> Result<()> {
        if self.get_state() != State::Proceeding {
            log::debug!("CANCEL skipped: transaction is not in Proceeding");
            return Ok(());
        }

        let headers = &self.request;
        let mut cancel_hdrs = Headers::with_capacity(6);

        cancel_hdrs.push(Header::Via(headers.via.clone()));
        cancel_hdrs.push(Header::From(headers.from.clone()));
        cancel_hdrs.push(Header::To(crate::headers::To::new(headers.uri.clone())));
        cancel_hdrs.push(Header::CallId(headers.call_id.clone()));
        cancel_hdrs.push(Header::CSeq(CSeq::new(headers.cseq.cseq(), SipMethod::Cancel)));
        cancel_hdrs.push(Header::MaxForwards(MaxForwards::default()));

        let cancel = OutgoingRequest {
            msg: Request {
                req_line: RequestLine {
                    method: SipMethod::Cancel,
                    uri: headers.uri.clone(),
                },
                headers: cancel_hdrs,
                body: None,
            },
            addr: self.addr(),
            buf: None,
            transport: self.transport().clone(),
        };

        let endpoint = self.endpoint().clone();
        let tsx = ClientTransaction::send(cancel, &endpoint).await?;
        if let Some(dialog) = self.dialog() {
            tsx.set_dialog(dialog);
        }

        Ok(())
    }

    fn create_ack(&self, response: &IncomingResponse) -> OutgoingRequest {
        let to = response
            .response
            .headers
            .to()
            .cloned()
            .unwrap_or_else(|| crate::headers::To::new(self.request.uri.clone()));

        let cseq = CSeq::new(self.request.cseq.cseq(), SipMethod::Ack);
        let headers = &self.request;
        let mut ack_hdrs = Headers::with_capacity(5);

        ack_hdrs.push(Header::Via(headers.via.clone()));
        ack_hdrs.push(Header::From(headers.from.clone()));
        ack_hdrs.push(Header::To(to));
        ack_hdrs.push(Header::CallId(headers.call_id.clone()));
        ack_hdrs.push(Header::CSeq(cseq));

        OutgoingRequest {
            msg: Request {
                req_line: RequestLine {
                    method: SipMethod::Ack,
                    uri: self.request.uri.clone(),
                },
                headers: ack_hdrs,
                body: None,
            },
            addr: self.addr(),
            buf: None,
            transport: self.transport().clone(),
        }
    }
}

impl Transaction for InvClientTransaction {
    fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            // Start timer D.
            self.schedule_termination(TIMER_D);
        }
    }
}

impl DerefMut for InvClientTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.transaction
    }
}

impl Deref for InvClientTransaction {
    type Target = TransactionInner;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::StatusCode,
        transaction::{mock, ClientTsx, TsxKey},
    };
    use tokio::time::{self, Duration};

    #[tokio::test]
    async fn test_state_calling() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(SipMethod::Invite, mock::mock_transport());

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();

        assert_eq!(uac_inv.get_state(), State::Calling);
    }

    #[tokio::test]
    async fn test_state_proceeding() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(SipMethod::Invite, mock::mock_transport());
        let response = mock::incoming_response(StatusCode::Trying);

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();

        uac_inv.receive(&response).await.unwrap();

        assert_eq!(uac_inv.get_state(), State::Proceeding);
    }

    #[tokio::test]
    async fn test_state_completed_sends_ack() {
        let endpoint = mock::default_endpoint().await;
        let transport = mock::mock_transport();
        let request = mock::outgoing_request(SipMethod::Invite, transport.clone());
        let response = mock::incoming_response(StatusCode::BusyHere);

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();
        uac_inv.receive(&response).await.unwrap();

        assert_eq!(uac_inv.last_status_code(), Some(StatusCode::BusyHere));
        assert_eq!(uac_inv.get_state(), State::Completed);

        // INVITE then the automatic ACK.
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].0.starts_with(b"ACK sip:bob@127.0.0.1:5060 SIP/2.0\r\n"));
    }

    #[tokio::test]
    async fn test_2xx_terminates_without_ack() {
        let endpoint = mock::default_endpoint().await;
        let transport = mock::mock_transport();
        let request = mock::outgoing_request(SipMethod::Invite, transport.clone());
        let response = mock::incoming_response(StatusCode::Ok);

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();
        uac_inv.receive(&response).await.unwrap();

        assert_eq!(uac_inv.get_state(), State::Terminated);
        // Only the INVITE went out; the ACK to a 2xx is the TU's job.
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_a() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(SipMethod::Invite, mock::mock_transport());

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();

        assert!(uac_inv.retrans_count() == 0);
        assert_eq!(uac_inv.get_state(), State::Calling);

        // Timer A doubles: 500 ms, 1 s, 2 s, 4 s, 8 s, 16 s.
        time::sleep(Duration::from_millis(500 + 1)).await;
        assert!(uac_inv.retrans_count() == 1);

        time::sleep(Duration::from_secs(1) + Duration::from_millis(1)).await;
        assert!(uac_inv.retrans_count() == 2);

        time::sleep(Duration::from_secs(2) + Duration::from_millis(1)).await;
        assert!(uac_inv.retrans_count() == 3);

        time::sleep(Duration::from_secs(4) + Duration::from_millis(1)).await;
        assert!(uac_inv.retrans_count() == 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_b() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(SipMethod::Invite, mock::mock_transport());

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();

        assert_eq!(uac_inv.get_state(), State::Calling);

        time::sleep(InvClientTransaction::T1 * 64 + Duration::from_millis(1)).await;

        assert!(uac_inv.get_state() == State::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_d() {
        let endpoint = mock::default_endpoint().await;
        let request = mock::outgoing_request(SipMethod::Invite, mock::mock_transport());
        let response = mock::incoming_response(StatusCode::BusyHere);

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();

        uac_inv.receive(&response).await.unwrap();

        assert_eq!(uac_inv.get_state(), State::Completed);

        time::sleep(TIMER_D + Duration::from_millis(1)).await;

        assert!(uac_inv.get_state() == State::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retransmission_over_reliable_transport() {
        let endpoint = mock::default_endpoint().await;
        let transport = Arc::new(crate::transport::udp::mock::MockReliableTransport::new());
        let request = mock::outgoing_request(SipMethod::Invite, transport.clone());

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();

        // Timer A never arms on a reliable transport.
        time::sleep(Duration::from_secs(10)).await;

        assert_eq!(uac_inv.retrans_count(), 0);
        assert_eq!(transport.0.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_only_in_proceeding() {
        let endpoint = mock::default_endpoint().await;
        let transport = mock::mock_transport();
        let request = mock::outgoing_request(SipMethod::Invite, transport.clone());

        let uac_inv = InvClientTransaction::send(request, &endpoint).await.unwrap();

        // Still Calling: the CANCEL must be suppressed.
        uac_inv.cancel().await.unwrap();
        assert_eq!(transport.sent_count(), 1);

        let response = mock::incoming_response(StatusCode::Ringing);
        uac_inv.receive(&response).await.unwrap();
        assert_eq!(uac_inv.get_state(), State::Proceeding);

        uac_inv.cancel().await.unwrap();
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].0.starts_with(b"CANCEL sip:bob@127.0.0.1:5060 SIP/2.0\r\n"));

        // The CANCEL runs as its own client transaction under the same branch.
        let key = TsxKey::create_client_with(&SipMethod::Cancel, "z9hG4bK3060200");
        assert!(matches!(
            endpoint.get_tsx_layer().find_client_tsx(&key),
            Some(ClientTsx::NonInvite(_))
        ));
    }
}
