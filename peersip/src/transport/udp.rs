//! SIP UDP Transport.
//!
//! One datagram is one message. The socket is shared by every dialog that
//! targets a UDP peer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::net::{ToSocketAddrs, UdpSocket};

use super::{Packet, Payload, Transport, TransportEvent, TransportStartup, TransportTx};
use crate::error::Result;
use crate::message::TransportKind;

/// The datagram size RFC 3261 section 18.1.1 considers safe once headers
/// are accounted for.
const MAX_SAFE_DATAGRAM: usize = 1300;

#[derive(Debug)]
struct Inner {
    sock: UdpSocket,
    addr: SocketAddr,
    local_name: String,
}

#[derive(Debug, Clone)]
/// UDP transport implementation.
pub struct UdpTransport(Arc<Inner>);

impl UdpTransport {
    /// Binds a UDP transport to the specified address.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let sock = UdpSocket::bind(addr).await?;

        let addr = sock.local_addr()?;
        let local_name = crate::get_local_name(&addr);

        Ok(Self(Arc::new(Inner {
            sock,
            addr,
            local_name,
        })))
    }

    /// One datagram is one packet; the receive loop runs until the socket
    /// or the endpoint goes away.
    async fn receive_loop(self: Arc<Self>, sender: TransportTx) -> Result<()> {
        let mut buf = vec![0u8; 4000];

        loop {
            let (len, addr) = self.0.sock.recv_from(&mut buf).await?;

            let event = TransportEvent::Packet {
                transport: self.clone(),
                packet: Packet {
                    payload: Payload::new(bytes::Bytes::copy_from_slice(&buf[..len])),
                    addr,
                    time: SystemTime::now(),
                },
            };
            sender.send(event).await?;
        }
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn send(&self, buf: &[u8], addr: &SocketAddr) -> Result<usize> {
        if buf.len() > MAX_SAFE_DATAGRAM {
            // Sent anyway; the peer may still reassemble the fragments.
            log::warn!(
                "UDP datagram of {} bytes to {} exceeds the {} byte limit",
                buf.len(),
                addr,
                MAX_SAFE_DATAGRAM
            );
        }
        Ok(self.0.sock.send_to(buf, addr).await?)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn reliable(&self) -> bool {
        false
    }

    fn secure(&self) -> bool {
        false
    }

    fn addr(&self) -> SocketAddr {
        self.0.addr
    }

    fn local_name(&self) -> std::borrow::Cow<'_, str> {
        std::borrow::Cow::Borrowed(&self.0.local_name)
    }
}

pub(crate) struct UdpStartup {
    addr: SocketAddr,
}

impl UdpStartup {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait::async_trait]
impl TransportStartup for UdpStartup {
    async fn start(&self, layer: &crate::transport::TransportLayer) -> Result<()> {
        let udp = UdpTransport::bind(self.addr).await?;

        log::debug!(
            "SIP {} transport started, listening on {}",
            TransportKind::Udp,
            udp.local_name()
        );

        let udp = Arc::new(udp);

        layer.add_transport(udp.clone());

        tokio::spawn(udp.receive_loop(layer.sender().clone()));

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    const MSG_TEST: &[u8] = b"REGISTER sip:registrar.biloxi.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP bobspc.biloxi.com:5060;branch=z9hG4bKnashds7\r\n\
        Max-Forwards: 70\r\n\
        To: Bob <sip:bob@biloxi.com>\r\n\
        From: Bob <sip:bob@biloxi.com>;tag=456248\r\n\
        Call-ID: 843817637684230@998sdasdh09\r\n\
        CSeq: 1826 REGISTER\r\n\
        Contact: <sip:bob@192.0.2.4>\r\n\
        Expires: 7200\r\n\
        Content-Length: 0\r\n\r\n";

    #[tokio::test]
    async fn test_recv_msg() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (tx, mut rx) = mpsc::channel(1);

        let udp = UdpTransport::bind(addr).await.unwrap();
        let client = UdpSocket::bind(addr).await.unwrap();

        tokio::spawn(Arc::new(udp.clone()).receive_loop(tx));

        client.send_to(MSG_TEST, udp.addr()).await.unwrap();

        let TransportEvent::Packet { transport: _, packet } = rx.recv().await.unwrap() else {
            unreachable!();
        };

        assert_eq!(packet.payload.buf(), MSG_TEST);

        let client_addr = client.local_addr().unwrap();
        assert_eq!(packet.addr, client_addr);
    }

    #[tokio::test]
    async fn test_send_msg() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let udp = UdpTransport::bind(addr).await.unwrap();
        let client = UdpSocket::bind(addr).await.unwrap();

        let client_addr = client.local_addr().unwrap();

        udp.send(MSG_TEST, &client_addr).await.unwrap();

        let mut buf = [0; MSG_TEST.len()];
        let len = client.recv(&mut buf).await.unwrap();

        assert!(len == MSG_TEST.len());
        assert_eq!(&buf[..len], MSG_TEST);
    }
}
