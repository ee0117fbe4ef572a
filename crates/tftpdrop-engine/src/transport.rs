//! Per-session packet I/O.
//!
//! A session always sends with `send_to` on a socket it may share, and
//! receives either from a socket it owns (filtering out strangers) or from a
//! channel the server's accept loop feeds (single-port mode).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::error::TransferError;
use crate::logging::{SessionLog, TransferEvent};
use crate::protocol::{ErrorCode, MAX_PACKET, Packet};

/// Sending half, bound to the session's peer.
#[derive(Clone)]
pub(crate) struct PacketSink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl PacketSink {
    pub(crate) fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) async fn send(&self, packet: &Packet) -> io::Result<()> {
        self.socket.send_to(&packet.encode(), self.peer).await?;
        Ok(())
    }

    pub(crate) async fn send_raw(&self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send_to(datagram, self.peer).await?;
        Ok(())
    }

    /// Sends an ERROR packet, logging rather than failing if the send does.
    pub(crate) async fn send_error(&self, code: ErrorCode, message: &str, log: &SessionLog) {
        let packet = Packet::Error {
            code,
            message: message.to_string(),
        };
        if let Err(e) = self.send(&packet).await {
            debug!("Cannot send error to {}: {}", self.peer, e);
        }
        log.emit(TransferEvent::ErrorSent {
            code,
            message: message.to_string(),
        });
    }
}

/// Receiving half.
pub(crate) enum PacketSource {
    /// Session-owned socket. Datagrams from other addresses are answered
    /// with `UnknownTransferId` and skipped.
    Socket {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        buf: Vec<u8>,
    },
    /// Datagrams routed by the accept loop of a single-port server.
    Routed(mpsc::Receiver<Bytes>),
}

impl PacketSource {
    pub(crate) fn socket(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self::Socket {
            socket,
            peer,
            buf: vec![0u8; MAX_PACKET + 1],
        }
    }

    /// Waits up to `timeout` for the next well-formed packet from the peer.
    ///
    /// Returns `Ok(None)` on timeout. Malformed datagrams are dropped.
    pub(crate) async fn recv(
        &mut self,
        timeout: Duration,
        log: &SessionLog,
    ) -> Result<Option<Packet>, TransferError> {
        let deadline = Instant::now() + timeout;
        loop {
            let datagram = match self {
                Self::Socket { socket, peer, buf } => {
                    let received =
                        match tokio::time::timeout_at(deadline, socket.recv_from(buf)).await {
                            Ok(result) => result,
                            Err(_) => return Ok(None),
                        };
                    let (len, src) = match received {
                        Ok(r) => r,
                        // ICMP port unreachable from an earlier send
                        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                        Err(e) => return Err(e.into()),
                    };
                    if src != *peer {
                        log.emit(TransferEvent::UnknownTransferId { from: src });
                        reject_stranger(&**socket, src).await;
                        continue;
                    }
                    Bytes::copy_from_slice(&buf[..len])
                }
                Self::Routed(rx) => match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(datagram)) => datagram,
                    Ok(None) => {
                        return Err(TransferError::Io(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "server stopped routing packets to this session",
                        )));
                    }
                    Err(_) => return Ok(None),
                },
            };

            match Packet::decode(datagram) {
                Ok(packet) => return Ok(Some(packet)),
                Err(e) => debug!("Dropping malformed packet: {}", e),
            }
        }
    }
}

/// Tells a stray sender it is not part of this transfer (RFC 1350 §4).
pub(crate) async fn reject_stranger(socket: &UdpSocket, src: SocketAddr) {
    let packet = Packet::Error {
        code: ErrorCode::UnknownTransferId,
        message: "unknown transfer id".into(),
    };
    if let Err(e) = socket.send_to(&packet.encode(), src).await {
        debug!("Cannot reject {}: {}", src, e);
    }
}
