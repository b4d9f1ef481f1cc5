use std::{cmp, ops::Deref, sync::Arc, time::Duration};

use tokio::sync::Notify;
use tokio::time;

use crate::{
    endpoint::Endpoint,
    message::SipMethod,
    transaction::{ServerTsx, State, Transaction, TransactionInner},
    transport::{IncomingRequest, OutgoingResponse},
    Result,
};

/// If the TU has not produced any response this long after the INVITE
/// arrived, the transaction answers 100 Trying on its own.
const AUTO_TRYING_DELAY: Duration = Duration::from_millis(200);

/// Represents a server INVITE transaction.
///
/// The INVITE side of the UAS is the only transaction that has to chase
/// an acknowledgement: a negative final response is repeated until the
/// peer's ACK arrives, and a 2xx ends the transaction on the spot because
/// its retransmission is the TU's business.
#[derive(Clone)]
pub struct InvServerTransaction {
    transaction: TransactionInner,
    /// Signalled when the ACK for a negative final response arrives.
    ack_seen: Arc<Notify>,
}

impl InvServerTransaction {
    pub(crate) fn new(endpoint: &Endpoint, request: &mut IncomingRequest) -> Self {
        let method = request.method();
        assert!(
            method.is_invite(),
            "server INVITE transaction built for a {method} request"
        );

        let uas_inv = InvServerTransaction {
            transaction: TransactionInner::create_uas_inv(request, endpoint),
            ack_seen: Arc::new(Notify::new()),
        };

        endpoint.get_tsx_layer().add_server_inv_tsx_to_map(uas_inv.clone());
        request.set_tsx(ServerTsx::Invite(uas_inv.clone()));

        uas_inv.spawn_auto_trying(endpoint.new_response(request, 100, "Trying"));

        uas_inv
    }

    /// Answers 100 Trying after [`AUTO_TRYING_DELAY`] unless the TU got
    /// a response out first.
    fn spawn_auto_trying(&self, mut trying: OutgoingResponse) {
        let tsx = self.clone();

        tokio::spawn(async move {
            time::sleep(AUTO_TRYING_DELAY).await;

            let still_unanswered = tsx.last_status_code().is_none() && tsx.get_state() == State::Initial;
            if !still_unanswered {
                return;
            }
            if let Err(err) = tsx.respond(&mut trying).await {
                log::debug!("Could not send the automatic 100 Trying: {err}");
            }
        });
    }

    /// Sends a response from the TU and advances the state machine.
    pub async fn respond(&self, response: &mut OutgoingResponse) -> Result<()> {
        self.tsx_send_response(response).await?;

        let code = response.status_code();

        if code.is_provisional() {
            self.change_state_to(State::Proceeding);
            return Ok(());
        }

        if code.is_success() {
            // The 2xx special rule: the transaction ends at once and 2xx
            // retransmissions are the TU's concern.
            self.on_terminated();
            return Ok(());
        }

        // A negative final response must be acknowledged; repeat it until
        // the ACK shows up or timer H gives up.
        self.change_state_to(State::Completed);
        self.spawn_ack_wait();

        Ok(())
    }

    /// Called when the ACK for a non-2xx final response arrives.
    pub(crate) fn on_ack_received(&self) {
        self.change_state_to(State::Confirmed);
        self.ack_seen.notify_one();
        // Timer I absorbs straggling ACK retransmissions.
        self.terminate();
    }

    /// The wait for the peer's ACK: timer H bounds the whole exchange at
    /// 64*T1, and on unreliable transports timer G repeats the stored
    /// final response with the usual doubling capped at T2.
    fn spawn_ack_wait(&self) {
        let tsx = self.clone();
        let ack_seen = self.ack_seen.clone();
        let unreliable = !self.reliable();

        tokio::spawn(async move {
            let give_up_at = time::Instant::now() + 64 * InvServerTransaction::T1;
            let mut interval = InvServerTransaction::T1;

            loop {
                tokio::select! {
                    _ = ack_seen.notified() => return,
                    _ = time::sleep_until(give_up_at) => {
                        // Timer H: the state is checked now, not when the
                        // timer was armed.
                        if tsx.get_state() == State::Completed {
                            tsx.on_terminated();
                            if let Some(dialog) = tsx.dialog() {
                                dialog.on_timeout(SipMethod::Invite).await;
                            }
                        }
                        return;
                    }
                    _ = time::sleep(interval), if unreliable => {
                        if tsx.get_state() != State::Completed {
                            return;
                        }
                        if let Err(err) = tsx.retransmit().await {
                            log::info!("Could not repeat the final response: {err}");
                        }
                        interval = cmp::min(interval * 2, InvServerTransaction::T2);
                    }
                }
            }
        });
    }
}

impl Transaction for InvServerTransaction {
    fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            // Timer I.
            self.schedule_termination(Self::T4);
        }
    }
}

impl Deref for InvServerTransaction {
    type Target = TransactionInner;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}
