//! # peersip
//!
//! The SIP signalling core of a peer-to-peer conferencing client: RFC 3261
//! transactions with their timers, SIP and SDP wire codecs, TCP/UDP
//! transport multiplexing, dialog bookkeeping, SDP offer/answer and a STUN
//! binding facility for candidate discovery.
//!
//! The application implements [`TransactionUser`] and drives calls through
//! a [`ua::UserAgent`] registered on an [`Endpoint`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use peersip::{endpoint, sdp::MediaConfig, transaction::TransactionLayer};
//! use peersip::ua::{CallEvent, TransactionUser, UserAgent};
//!
//! struct App;
//!
//! #[async_trait::async_trait]
//! impl TransactionUser for App {
//!     async fn on_event(&self, event: CallEvent) {
//!         println!("{event:?}");
//!     }
//! }
//!
//! # async fn run() -> peersip::Result<()> {
//! let config = MediaConfig::new("alice", "192.0.2.1".parse().unwrap());
//! let ua = UserAgent::new(Arc::new(App), config);
//!
//! let endpoint = endpoint::Builder::new()
//!     .with_name("peersip")
//!     .with_udp("0.0.0.0:5060".parse().unwrap())
//!     .with_tcp("0.0.0.0:5060".parse().unwrap())
//!     .with_transaction_layer(TransactionLayer::default())
//!     .with_service(ua.clone())
//!     .build()
//!     .await;
//!
//! ua.set_endpoint(endpoint.clone());
//! endpoint.run().await
//! # }
//! ```

pub mod endpoint;
pub mod headers;
pub mod message;
pub mod parser;
pub mod sdp;
pub mod service;
pub mod stun;
pub mod transaction;
pub mod transport;
pub mod ua;

pub(crate) mod error;
pub(crate) mod macros;

pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use service::SipService;
pub use ua::TransactionUser;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

use std::net::SocketAddr;

use rand::{distr::Alphanumeric, Rng};

/// Length of the random part of a Via branch; the magic cookie prefix
/// brings the total to 32.
const BRANCH_TOKEN_LENGTH: usize = 25;

/// Length of locally generated dialog tags.
const TAG_LENGTH: usize = 16;

/// Length of the random part of a Call-ID (before `@host`).
const CALL_ID_LENGTH: usize = 16;

pub(crate) fn generate_token(length: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// A fresh Via branch: the RFC 3261 magic cookie plus 25 random
/// characters.
pub(crate) fn generate_branch() -> String {
    format!(
        "{}{}",
        crate::transaction::key::BRANCH_MAGIC_COOKIE,
        generate_token(BRANCH_TOKEN_LENGTH)
    )
}

/// A fresh dialog tag.
pub(crate) fn generate_tag() -> String {
    generate_token(TAG_LENGTH)
}

/// A fresh Call-ID in the `random@host` form.
pub(crate) fn generate_call_id(host: &str) -> String {
    format!("{}@{}", generate_token(CALL_ID_LENGTH), host)
}

pub(crate) fn get_local_name(addr: &SocketAddr) -> String {
    let ip = local_ip_address::local_ip().unwrap_or(addr.ip());

    format!("{}:{}", ip, addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_shape() {
        let branch = generate_branch();

        assert_eq!(branch.len(), 32);
        assert!(branch.starts_with("z9hG4bK"));
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(generate_tag(), generate_tag());
        assert_ne!(generate_branch(), generate_branch());
    }

    #[test]
    fn test_call_id_shape() {
        let call_id = generate_call_id("192.0.2.1");
        let (token, host) = call_id.split_once('@').unwrap();

        assert_eq!(token.len(), 16);
        assert_eq!(host, "192.0.2.1");
    }
}
