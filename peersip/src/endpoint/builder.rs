#![warn(missing_docs)]
//! SIP Endpoint Builder.

use std::net::SocketAddr;
use std::sync::Arc;

use itertools::Itertools;

use crate::endpoint::{Endpoint, Inner};
use crate::transaction::TransactionLayer;
use crate::transport::tcp::TcpStartup;
use crate::transport::tls::TlsFactory;
use crate::transport::udp::UdpStartup;
use crate::transport::{TransportLayer, TransportStartup};
use crate::SipService;

/// Builder for creating a new SIP `Endpoint`.
pub struct Builder {
    name: String,
    transport: TransportLayer,
    transaction: Option<TransactionLayer>,
    services: Vec<Box<dyn SipService>>,
    transport_start: Vec<Box<dyn TransportStartup>>,
}

impl Builder {
    /// Creates a new default instance of `Builder` to construct an
    /// `Endpoint`.
    pub fn new() -> Self {
        Builder {
            transport: TransportLayer::new(),
            name: String::new(),
            services: vec![],
            transaction: None,
            transport_start: vec![],
        }
    }

    /// Sets the endpoint name.
    pub fn with_name<T: AsRef<str>>(mut self, s: T) -> Self {
        self.name = s.as_ref().to_string();

        self
    }

    /// Listens for UDP on the specified address.
    pub fn with_udp(mut self, addr: SocketAddr) -> Self {
        self.transport_start.push(Box::new(UdpStartup::new(addr)));
        self
    }

    /// Listens for TCP on the specified address and registers the outbound
    /// TCP factory.
    pub fn with_tcp(mut self, addr: SocketAddr) -> Self {
        self.transport_start.push(Box::new(TcpStartup::new(addr)));
        self
    }

    /// Adds a service to the endpoint.
    ///
    /// This function can be called multiple times to add additional
    /// services. If a service with the same name already exists, the new
    /// service will not be added.
    pub fn with_service(mut self, service: impl SipService) -> Self {
        if self.service_exists(service.name()) {
            return self;
        }
        self.services.push(Box::new(service));

        self
    }

    fn service_exists(&self, name: &str) -> bool {
        let exists = self.services.iter().any(|s| s.name() == name);
        if exists {
            log::warn!("Service with name '{}' already exists", name);
        }
        exists
    }

    /// Sets the transaction layer.
    pub fn with_transaction_layer(mut self, tsx_layer: TransactionLayer) -> Self {
        self.transaction = Some(tsx_layer);

        self
    }

    /// Finalize the builder into an `Endpoint` and start its transports.
    pub async fn build(self) -> Endpoint {
        log::trace!("Creating endpoint...");
        log::debug!(
            "Services registered {}",
            format_args!("({})", self.services.iter().map(|s| s.name()).join(", "))
        );

        // TLS is reserved on the wire; asking for it yields Unsupported.
        self.transport.add_factory(Arc::new(TlsFactory));

        let transport_start = self.transport_start;
        let endpoint = Endpoint(Arc::new(Inner {
            transaction: self.transaction,
            transport: self.transport,
            name: self.name,
            services: self.services.into_boxed_slice(),
        }));

        for tp_start in transport_start {
            if let Err(err) = tp_start.start(endpoint.transport()).await {
                log::error!("Failed to start transport: {err}");
            }
        }

        endpoint
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
