//! Receiving side: the accept loop and per-session dispatch.
//!
//! ```text
//! listen socket ──recv──> accept loop ──WRQ──> spawn WriteSession
//!                              │
//!                              ├─ single-port: route datagrams by peer
//!                              └─ ephemeral:   session owns a port-0 socket
//! ```

use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::SockRef;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::logging::{SessionLog, TransferEvent};
use crate::options::negotiate;
use crate::protocol::{ErrorCode, MAX_PACKET, Packet, Request};
use crate::request::WriteHandler;
use crate::session::WriteSession;
use crate::transport::{PacketSink, PacketSource, reject_stranger};

/// Kernel buffer size requested for the listen socket.
const SOCKET_BUFFER: usize = 4 * 1024 * 1024;

/// Extra room in a routed session's queue beyond one window.
const ROUTE_SLACK: usize = 8;

/// Live sessions by peer address. `Some` routes datagrams to a single-port
/// session; `None` marks a peer whose session owns its own socket.
type Routes = Arc<Mutex<HashMap<SocketAddr, Option<mpsc::Sender<Bytes>>>>>;

/// A bound TFTP server that accepts write requests.
pub struct ServerSession {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    config: ServerConfig,
    handler: Option<Arc<dyn WriteHandler>>,
}

impl ServerSession {
    /// Binds the listen socket. `listen_addr` is any `host:port` form
    /// accepted by the resolver.
    pub async fn bind(listen_addr: &str, config: ServerConfig) -> Result<Self, ServerError> {
        let bind_error = |source: io::Error| ServerError::Bind {
            addr: listen_addr.to_string(),
            source,
        };

        let addr = tokio::net::lookup_host(listen_addr)
            .await
            .map_err(bind_error)?
            .next()
            .ok_or_else(|| {
                bind_error(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "address did not resolve",
                ))
            })?;

        let socket = UdpSocket::bind(addr).await.map_err(bind_error)?;
        let sock = SockRef::from(&socket);
        if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUFFER) {
            warn!("Cannot enlarge receive buffer on {}: {}", addr, e);
        }
        if let Err(e) = sock.set_send_buffer_size(SOCKET_BUFFER) {
            warn!("Cannot enlarge send buffer on {}: {}", addr, e);
        }
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            config,
            handler: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sets the callback invoked for every accepted write. A later call
    /// replaces the earlier handler.
    pub fn register_write_handler<H: WriteHandler>(&mut self, handler: H) {
        self.handler = Some(Arc::new(handler));
    }

    /// Runs the accept loop. Only returns on a fatal socket error.
    pub async fn run(self) -> Result<Infallible, ServerError> {
        info!(
            "TFTP server listening on {} ({} mode)",
            self.local_addr,
            if self.config.single_port { "single-port" } else { "ephemeral-port" }
        );

        let routes: Routes = Arc::default();
        let mut buf = vec![0u8; MAX_PACKET + 1];

        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(ServerError::Io(e)),
            };
            let datagram = Bytes::copy_from_slice(&buf[..len]);

            let route = routes.lock().get(&src).cloned();
            match route {
                Some(Some(tx)) => {
                    if tx.try_send(datagram).is_err() {
                        debug!("Session queue for {} is full, dropping datagram", src);
                    }
                    continue;
                }
                Some(None) => {
                    // Usually a retransmitted WRQ; the session answers from its own port
                    debug!("Ignoring datagram from {} on listen port during its session", src);
                    continue;
                }
                None => {}
            }

            let packet = match Packet::decode(datagram) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("Dropping malformed packet from {}: {}", src, e);
                    continue;
                }
            };

            match packet {
                Packet::WriteRequest(request) => self.accept_write(request, src, &routes).await,
                Packet::ReadRequest(request) => {
                    debug!("Refusing read of {:?} from {}", request.filename, src);
                    self.reply_error(
                        src,
                        ErrorCode::IllegalOperation,
                        "read requests are not supported",
                    )
                    .await;
                }
                _ => reject_stranger(&self.socket, src).await,
            }
        }
    }

    async fn accept_write(&self, request: Request, peer: SocketAddr, routes: &Routes) {
        let log = SessionLog::new(self.config.logger.clone(), "server", peer);

        let Some(handler) = self.handler.clone() else {
            self.reply_error(peer, ErrorCode::AccessViolation, "writes are not accepted")
                .await;
            return;
        };

        let mode = request.mode.to_ascii_lowercase();
        if mode != "octet" && mode != "netascii" {
            self.reply_error(
                peer,
                ErrorCode::IllegalOperation,
                &format!("unsupported transfer mode {:?}", request.mode),
            )
            .await;
            return;
        }

        log.emit(TransferEvent::SessionStarted {
            filename: request.filename.clone(),
            single_port: self.config.single_port,
        });

        let negotiated = negotiate(
            &request.options,
            self.config.max_block_size,
            self.config.default_timeout,
        );

        let (sink, source, route) = if self.config.single_port {
            let capacity = negotiated.options.window_size as usize + ROUTE_SLACK;
            let (tx, rx) = mpsc::channel(capacity);
            (
                PacketSink::new(self.socket.clone(), peer),
                PacketSource::Routed(rx),
                Some(tx),
            )
        } else {
            let socket = match UdpSocket::bind(SocketAddr::new(self.local_addr.ip(), 0)).await {
                Ok(socket) => Arc::new(socket),
                Err(e) => {
                    log.emit(TransferEvent::Error {
                        message: format!("cannot allocate transfer port: {}", e),
                    });
                    self.reply_error(peer, ErrorCode::NotDefined, "cannot allocate transfer port")
                        .await;
                    return;
                }
            };
            (
                PacketSink::new(socket.clone(), peer),
                PacketSource::socket(socket, peer),
                None,
            )
        };

        routes.lock().insert(peer, route);
        let guard = RouteGuard {
            routes: routes.clone(),
            peer,
        };

        let session = WriteSession {
            filename: request.filename,
            negotiated,
            retransmit: self.config.retransmit,
            sink,
            source,
            handler,
            log,
        };

        tokio::spawn(async move {
            let _guard = guard;
            session.run().await;
        });
    }

    async fn reply_error(&self, peer: SocketAddr, code: ErrorCode, message: &str) {
        let packet = Packet::Error {
            code,
            message: message.to_string(),
        };
        if let Err(e) = self.socket.send_to(&packet.encode(), peer).await {
            debug!("Cannot send error to {}: {}", peer, e);
        }
    }
}

/// Removes a session's route when its task ends, including on panic.
struct RouteGuard {
    routes: Routes,
    peer: SocketAddr,
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        self.routes.lock().remove(&self.peer);
    }
}
