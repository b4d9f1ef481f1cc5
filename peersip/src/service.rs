use crate::{
    transport::{IncomingRequest, IncomingResponse, TransportKey},
    Endpoint, Result,
};

/// A trait which provides a way to extend the SIP endpoint
/// functionalities.
///
/// Services see every message the transaction layer did not claim, in
/// registration order; a service takes a message by setting the option to
/// `None`.
#[async_trait::async_trait]
#[allow(unused_variables)]
pub trait SipService: Sync + Send + 'static {
    /// Returns the service name.
    fn name(&self) -> &str;

    /// Called when an inbound SIP request is received.
    async fn on_incoming_request(&self, endpoint: &Endpoint, request: &mut Option<IncomingRequest>) -> Result<()> {
        Ok(())
    }

    /// Called when an inbound SIP response is received.
    async fn on_incoming_response(&self, endpoint: &Endpoint, response: &mut Option<IncomingResponse>) -> Result<()> {
        Ok(())
    }

    /// Called when a transport closed or failed.
    async fn on_transport_closed(&self, endpoint: &Endpoint, key: TransportKey) {}
}
