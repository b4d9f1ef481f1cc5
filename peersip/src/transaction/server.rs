use std::ops::{Deref, DerefMut};

use crate::{
    endpoint::Endpoint,
    message::SipMethod,
    transaction::{ServerTsx, State, Transaction, TransactionInner},
    transport::{IncomingRequest, OutgoingResponse},
    Result,
};

/// Represents a server non-INVITE transaction.
#[derive(Clone)]
pub struct ServerTransaction {
    transaction: TransactionInner,
}

impl ServerTransaction {
    pub(crate) fn new(endpoint: &Endpoint, request: &mut IncomingRequest) -> Self {
        assert!(
            !matches!(request.method(), SipMethod::Ack | SipMethod::Invite),
            "Request method cannot be ACK or INVITE",
        );
        let tsx_layer = endpoint.get_tsx_layer();
        let transaction = TransactionInner::create_uas(request, endpoint);
        let server_tsx = ServerTransaction { transaction };

        request.set_tsx(ServerTsx::NonInvite(server_tsx.clone()));
        tsx_layer.add_server_tsx_to_map(server_tsx.clone());

        server_tsx
    }

    /// Sends a response and advances the state machine; the final response
    /// is retransmitted on request retransmits until timer J fires.
    pub async fn respond(&self, msg: &mut OutgoingResponse) -> Result<()> {
        self.tsx_send_response(msg).await?;

        match self.get_state() {
            State::Trying if msg.is_provisional() => {
                self.change_state_to(State::Proceeding);
            }
            State::Trying | State::Proceeding => {
                self.change_state_to(State::Completed);
                self.terminate();
            }
            _ => (),
        }

        Ok(())
    }
}

impl Transaction for ServerTransaction {
    fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            // Timer J.
            self.schedule_termination(Self::T1 * 64);
        }
    }
}

impl DerefMut for ServerTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.transaction
    }
}

impl Deref for ServerTransaction {
    type Target = TransactionInner;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::{self, Duration};

    use super::*;
    use crate::{
        message::StatusCode,
        transaction::{mock, TsxKey},
    };

    #[tokio::test]
    async fn test_receives_100_trying() {
        let mut request = mock::request(SipMethod::Options);
        let endpoint = mock::default_endpoint().await;
        let tsx = ServerTransaction::new(&endpoint, &mut request);
        let response = &mut mock::response(StatusCode::Trying);

        tsx.respond(response).await.unwrap();

        assert!(tsx.last_status_code().unwrap().as_u16() == 100);
        assert!(tsx.get_state() == State::Proceeding);
    }

    #[tokio::test]
    async fn test_receives_200_ok() {
        let mut request = mock::request(SipMethod::Options);
        let endpoint = mock::default_endpoint().await;
        let tsx = ServerTransaction::new(&endpoint, &mut request);
        let response = &mut mock::response(StatusCode::Ok);

        tsx.respond(response).await.unwrap();

        assert!(tsx.last_status_code().unwrap().as_u16() == 200);
        assert!(tsx.get_state() == State::Completed);
    }

    #[tokio::test]
    async fn test_retransmit_proceeding() {
        let mut request = mock::request(SipMethod::Options);
        let endpoint = mock::default_endpoint().await;
        let tsx = ServerTransaction::new(&endpoint, &mut request);
        let response = &mut mock::response(StatusCode::Trying);

        tsx.respond(response).await.unwrap();

        let key = TsxKey::create_server(&request);
        let layer = endpoint.get_tsx_layer();
        assert!(layer.handle_request(&request).await.unwrap());

        assert!(tsx.retrans_count() == 1);
        assert!(tsx.last_status_code().unwrap().as_u16() == 100);
        assert!(tsx.get_state() == State::Proceeding);
        assert!(layer.find_server_tsx(&key).is_some());
    }

    #[tokio::test]
    async fn test_retransmit_completed() {
        let mut request = mock::request(SipMethod::Options);
        let endpoint = mock::default_endpoint().await;
        let tsx = ServerTransaction::new(&endpoint, &mut request);
        let response = &mut mock::response(StatusCode::Ok);

        tsx.respond(response).await.unwrap();
        endpoint.get_tsx_layer().handle_request(&request).await.unwrap();

        assert!(tsx.retrans_count() == 1);
        assert!(tsx.last_status_code().unwrap().as_u16() == 200);
        assert!(tsx.get_state() == State::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminated_timer_j() {
        let mut request = mock::request(SipMethod::Options);
        let endpoint = mock::default_endpoint().await;
        let tsx = ServerTransaction::new(&endpoint, &mut request);
        let response = &mut mock::response(StatusCode::Ok);

        tsx.respond(response).await.unwrap();

        time::sleep(ServerTransaction::T1 * 64 + Duration::from_millis(1)).await;

        assert!(tsx.last_status_code().unwrap().as_u16() == 200);
        assert!(tsx.get_state() == State::Terminated);
    }
}
