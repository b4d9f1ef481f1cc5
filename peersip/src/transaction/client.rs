use std::cmp;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use futures_util::future::{self, Either};
use tokio::pin;
use tokio::sync::oneshot;
use tokio::time;

use crate::message::SipMethod;
use crate::transaction::{State, Transaction, TransactionInner};
use crate::transport::{IncomingResponse, OutgoingRequest};
use crate::{Endpoint, Result};

type TxCompleted = Arc<Mutex<Option<oneshot::Sender<()>>>>;
type RxCompleted = oneshot::Receiver<()>;

/// Represents a client non-INVITE transaction (BYE, REGISTER, OPTIONS,
/// CANCEL).
#[derive(Clone)]
pub struct ClientTransaction {
    transaction: TransactionInner,
    tx_completed: TxCompleted,
}

impl ClientTransaction {
    /// Sends the request and starts timers E (retransmit, unreliable only)
    /// and F (transaction timeout, 64*T1).
    pub(crate) async fn send(mut request: OutgoingRequest, endpoint: &Endpoint) -> Result<Self> {
        let transactions = endpoint.get_tsx_layer();
        let method = request.msg.method();

        assert!(
            !matches!(method, SipMethod::Invite | SipMethod::Ack),
            "Invalid method for non-INVITE client transaction: expected non-INVITE/non-ACK, got: {}",
            method
        );
        let method = *method;

        let transaction = TransactionInner::create_uac(&request, endpoint);
        let (tx, rx) = oneshot::channel();

        let tx_completed = Arc::new(Mutex::new(Some(tx)));

        let uac = Self {
            transaction,
            tx_completed,
        };

        uac.tsx_send_request(&mut request).await?;

        uac.retrans_loop(method, rx);

        transactions.add_client_tsx_to_map(uac.clone());

        Ok(uac)
    }

    fn retrans_loop(&self, method: SipMethod, mut rx_completed: RxCompleted) {
        let unreliable = !self.reliable();
        let uac = self.clone();

        tokio::spawn(async move {
            pin! {
                let timer_f = time::sleep(64 * ClientTransaction::T1);
                let timer_e = if unreliable {
                    Either::Left(time::sleep(ClientTransaction::T1))
                } else {
                    Either::Right(future::pending::<()>())
                };
            }

            'retrans: loop {
                tokio::select! {
                    _ = &mut timer_e => {
                        let state = uac.get_state();
                        if !matches!(state, State::Trying | State::Proceeding) {
                            timer_e.set(Either::Right(future::pending::<()>()));
                            continue 'retrans;
                        }
                        match uac.retransmit().await {
                            Ok(retrans) => {
                                let interval = if state == State::Trying {
                                    let retrans = ClientTransaction::T1 * (1 << retrans);
                                    cmp::min(retrans, ClientTransaction::T2)
                                } else {
                                    ClientTransaction::T2
                                };
                                let sleep = time::sleep(interval);
                                timer_e.set(Either::Left(sleep));
                            },
                            Err(err) => {
                                log::info!("Failed to retransmit: {}", err);
                            },
                        }
                    }
                    _ = &mut timer_f => {
                        // Timer F: no final response arrived in time.
                        if matches!(uac.get_state(), State::Trying | State::Proceeding) {
                            uac.on_terminated();
                            if let Some(dialog) = uac.dialog() {
                                dialog.on_timeout(method).await;
                            }
                        }
                        break 'retrans;
                    }
                    _ = &mut rx_completed => {
                        // Got the completed state, timers are done.
                        break 'retrans;
                    }
                }
            }
        });
    }

    pub(crate) async fn receive(&self, response: &IncomingResponse) -> Result<bool> {
        let code = response.response.code();
        self.set_last_status_code(code);

        match self.get_state() {
            State::Trying if code.is_provisional() => {
                self.change_state_to(State::Proceeding);
            }
            State::Trying | State::Proceeding if code.is_final() => {
                self.change_state_to(State::Completed);

                let tx = self.tx_completed.lock().expect("Lock failed").take();
                if let Some(tx) = tx {
                    let _ = tx.send(());
                }
                self.terminate();

                if let Some(dialog) = self.dialog() {
                    dialog
                        .on_non_invite_response(*response.request_headers.cseq.method(), response)
                        .await;
                }
            }
            State::Completed => {
                // Response retransmissions are absorbed here.
                return Ok(true);
            }
            _ => (),
        }

        Ok(false)
    }
}

impl Transaction for ClientTransaction {
    fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            // Start timer K.
            self.schedule_termination(Self::T4);
        }
    }
}

impl DerefMut for ClientTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.transaction
    }
}

impl Deref for ClientTransaction {
    type Target = TransactionInner;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}
