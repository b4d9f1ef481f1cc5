use std::net::SocketAddr;

use tokio::net::lookup_host;

use crate::error::{Error, Result};

/// Resolves a host name to the first usable socket address.
pub(crate) async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = lookup_host((host, port)).await?;

    addrs
        .next()
        .ok_or_else(|| Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no address found for {host}"),
        )))
}
