//! TLS transport placeholder.
//!
//! The wire schema reserves TLS (`TransportKind::Tls`, `sips:`), but no
//! TLS stack is wired up. The factory exists so callers asking for TLS get
//! a clean `Unsupported` error instead of a missing-factory lookup.

use std::net::SocketAddr;
use std::sync::Arc;

use super::{Factory, Transport, TransportTx};
use crate::error::{Error, Result};
use crate::message::TransportKind;

#[derive(Clone, Copy, Default)]
/// Factory stub for TLS connections.
pub struct TlsFactory;

#[async_trait::async_trait]
impl Factory for TlsFactory {
    async fn create(&self, _addr: SocketAddr, _tx: TransportTx) -> Result<Arc<dyn Transport>> {
        Err(Error::Unsupported("TLS"))
    }

    fn protocol(&self) -> TransportKind {
        TransportKind::Tls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tls_is_unsupported() {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let addr = "127.0.0.1:5061".parse().unwrap();

        assert!(matches!(
            TlsFactory.create(addr, tx).await,
            Err(Error::Unsupported("TLS"))
        ));
    }
}
