//! SIP TCP Transport.
//!
//! Each connection is pinned to one peer, whichever side dialed. The
//! write half lives in the [`TcpTransport`] handle; the read half runs in
//! its own task, cutting frames with the shared Content-Length framing
//! and reporting packets and closure through the transport event channel.
//! Reads that stay idle past the transaction timers close the stream.

use std::{borrow::Cow, net::SocketAddr, sync::Arc, time::SystemTime};

use tokio::{
    io::{split, AsyncWriteExt, ReadHalf, WriteHalf},
    net::{TcpListener, TcpStream},
    sync::Mutex,
    time,
};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

use super::{
    Factory, Packet, StreamingDecoder, Transport, TransportEvent, TransportKey, TransportStartup, TransportTx,
    READ_IDLE_TIMEOUT,
};
use crate::error::Result;
use crate::message::TransportKind;

type SipFrames = FramedRead<ReadHalf<TcpStream>, StreamingDecoder>;

#[derive(Clone)]
/// TCP transport implementation: the write half of one connection.
pub struct TcpTransport {
    local_addr: SocketAddr,
    /// The peer this connection is pinned to.
    peer: SocketAddr,
    writer: Arc<Mutex<WriteHalf<TcpStream>>>,
}

impl TcpTransport {
    /// Wraps a connected stream: keeps the write half, spawns the reader
    /// task, and returns the transport handle.
    fn from_stream(stream: TcpStream, tx: TransportTx) -> Result<Arc<dyn Transport>> {
        let local_addr = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = split(stream);

        let transport: Arc<dyn Transport> = Arc::new(TcpTransport {
            local_addr,
            peer,
            writer: Arc::new(Mutex::new(write_half)),
        });

        let frames = FramedRead::new(read_half, StreamingDecoder);
        tokio::spawn(read_loop(frames, peer, transport.clone(), tx));

        Ok(transport)
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, buf: &[u8], _: &SocketAddr) -> Result<usize> {
        let mut writer = self.writer.lock().await;

        writer.write_all(buf).await?;
        writer.flush().await?;

        Ok(buf.len())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn key(&self) -> TransportKey {
        // A TCP connection is addressed by its peer.
        TransportKey::new(self.peer, TransportKind::Tcp)
    }

    fn local_name(&self) -> Cow<'_, str> {
        Cow::Owned(self.local_addr.to_string())
    }

    fn reliable(&self) -> bool {
        true
    }

    fn secure(&self) -> bool {
        false
    }
}

/// Drains one connection until the peer hangs up, an I/O error hits, or
/// the stream stays idle too long. Always announces the closure so the
/// dialogs bound to this peer get failed.
async fn read_loop(mut frames: SipFrames, peer: SocketAddr, transport: Arc<dyn Transport>, tx: TransportTx) {
    let key = transport.key();

    loop {
        match time::timeout(READ_IDLE_TIMEOUT, frames.next()).await {
            Ok(Some(Ok(payload))) => {
                let packet = Packet {
                    payload,
                    addr: peer,
                    time: SystemTime::now(),
                };
                let event = TransportEvent::Packet {
                    transport: transport.clone(),
                    packet,
                };
                if tx.send(event).await.is_err() {
                    // The endpoint is gone; nobody cares about closure.
                    return;
                }
            }
            Ok(Some(Err(err))) => {
                log::warn!("TCP stream to {peer} failed: {err:#}");
                break;
            }
            Ok(None) => {
                log::debug!("TCP peer {peer} closed the stream");
                break;
            }
            Err(_) => {
                log::debug!("TCP stream to {peer} idle for {READ_IDLE_TIMEOUT:?}, closing");
                break;
            }
        }
    }

    let _ = tx.send(TransportEvent::Closed(key)).await;
}

/// Accepts connections forever, registering each as a transport.
async fn accept_loop(listener: TcpListener, tx: TransportTx) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                log::error!("Failed to accept connection: {:#}", err);
                continue;
            }
        };

        log::debug!("Accepted TCP connection from {peer}");

        match TcpTransport::from_stream(stream, tx.clone()) {
            Ok(transport) => {
                if tx.send(TransportEvent::Created(transport)).await.is_err() {
                    return;
                }
            }
            Err(err) => log::warn!("Dropping TCP connection from {peer}: {err}"),
        }
    }
}

#[derive(Clone, Copy, Default)]
/// Factory for outbound TCP connections.
pub struct TcpFactory;

#[async_trait::async_trait]
impl Factory for TcpFactory {
    async fn create(&self, addr: SocketAddr, tx: TransportTx) -> Result<Arc<dyn Transport>> {
        let stream = TcpStream::connect(addr).await?;

        TcpTransport::from_stream(stream, tx)
    }

    fn protocol(&self) -> TransportKind {
        TransportKind::Tcp
    }
}

pub(crate) struct TcpStartup {
    addr: SocketAddr,
}

impl TcpStartup {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait::async_trait]
impl TransportStartup for TcpStartup {
    async fn start(&self, layer: &crate::transport::TransportLayer) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;

        log::debug!(
            "SIP {} transport ready for incoming connections at {}",
            TransportKind::Tcp,
            crate::get_local_name(&listener.local_addr()?)
        );

        layer.add_factory(Arc::new(TcpFactory));

        tokio::spawn(accept_loop(listener, layer.sender().clone()));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpSocket;

    use super::*;

    const MSG_TEST: &[u8] = b"REGISTER sip:registrar.biloxi.com SIP/2.0\r\n\
        Via: SIP/2.0/TCP bobspc.biloxi.com:5060;branch=z9hG4bKnashds7\r\n\
        Max-Forwards: 70\r\n\
        To: Bob <sip:bob@biloxi.com>\r\n\
        From: Bob <sip:bob@biloxi.com>;tag=456248\r\n\
        Call-ID: 843817637684230@998sdasdh09\r\n\
        CSeq: 1826 REGISTER\r\n\
        Contact: <sip:bob@192.0.2.4>\r\n\
        Content-Length: 0\r\n\r\n";

    #[tokio::test]
    async fn test_accepted_connection_delivers_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);

        tokio::spawn(accept_loop(listener, tx));

        let socket = TcpSocket::new_v4().unwrap();
        let mut client = socket.connect(server_addr).await.unwrap();
        client.write_all(MSG_TEST).await.unwrap();
        client.flush().await.unwrap();

        // Created and Packet may arrive in either order.
        let mut got_created = false;
        let mut got_packet = false;
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                TransportEvent::Created(transport) => {
                    assert_eq!(transport.key(), TransportKey::new(client.local_addr().unwrap(), TransportKind::Tcp));
                    got_created = true;
                }
                TransportEvent::Packet { packet, .. } => {
                    assert_eq!(packet.payload.buf(), MSG_TEST);
                    got_packet = true;
                }
                _ => panic!("unexpected event"),
            }
        }
        assert!(got_created && got_packet);
    }

    #[tokio::test]
    async fn test_closed_stream_is_announced() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);

        tokio::spawn(accept_loop(listener, tx));

        let client = TcpStream::connect(server_addr).await.unwrap();
        let client_addr = client.local_addr().unwrap();
        drop(client);

        let mut saw_closed = false;
        for _ in 0..2 {
            match rx.recv().await {
                Some(TransportEvent::Closed(key)) => {
                    assert_eq!(key, TransportKey::new(client_addr, TransportKind::Tcp));
                    saw_closed = true;
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }
        assert!(saw_closed);
    }

    #[tokio::test]
    async fn test_factory_dials_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let (tx, _rx) = tokio::sync::mpsc::channel(8);

        tokio::spawn(async move {
            let _ = listener.accept().await;
            time::sleep(std::time::Duration::from_secs(1)).await;
        });

        let transport = TcpFactory.create(server_addr, tx).await.unwrap();

        assert!(transport.reliable());
        assert_eq!(transport.kind(), TransportKind::Tcp);
        assert_eq!(transport.key(), TransportKey::new(server_addr, TransportKind::Tcp));
    }
}
