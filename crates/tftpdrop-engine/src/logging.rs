/// Transfer logging trait for structured per-session logs.
///
/// Client and server sessions report protocol events through a
/// [`TransferLogger`] so callers decide where they go.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::protocol::ErrorCode;

/// Structured log entry for one transfer session.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub peer: SocketAddr,
    pub event: TransferEvent,
}

/// Transfer events that can be logged.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Write request sent (client) or accepted (server)
    SessionStarted {
        filename: String,
        single_port: bool,
    },
    /// Options in effect after negotiation
    OptionsNegotiated {
        block_size: u16,
        window_size: u16,
        timeout_secs: u64,
    },
    /// Packets resent after a timeout or a resync ACK
    Retransmit {
        block: u16,
        packets: usize,
        attempt: u32,
    },
    /// Gave up after too many consecutive timeouts
    Timeout {
        retries: u32,
    },
    /// Datagram from an address that is not this session's peer
    UnknownTransferId {
        from: SocketAddr,
    },
    /// Peer sent an ERROR packet
    PeerError {
        code: ErrorCode,
        message: String,
    },
    /// We sent an ERROR packet
    ErrorSent {
        code: ErrorCode,
        message: String,
    },
    /// Transfer complete
    TransferComplete {
        bytes: u64,
        blocks: u64,
        duration_ms: u64,
        retransmits: u64,
    },
    /// Error occurred
    Error {
        message: String,
    },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionStarted { filename, single_port } => {
                write!(f, "session_started file={:?} single_port={}", filename, single_port)
            }
            Self::OptionsNegotiated { block_size, window_size, timeout_secs } => {
                write!(f, "options blksize={} windowsize={} timeout={}s", block_size, window_size, timeout_secs)
            }
            Self::Retransmit { block, packets, attempt } => {
                write!(f, "retransmit from_block={} packets={} attempt={}", block, packets, attempt)
            }
            Self::Timeout { retries } => {
                write!(f, "timeout retries={}", retries)
            }
            Self::UnknownTransferId { from } => {
                write!(f, "unknown_transfer_id from={}", from)
            }
            Self::PeerError { code, message } => {
                write!(f, "peer_error code={} message={:?}", code.code(), message)
            }
            Self::ErrorSent { code, message } => {
                write!(f, "error_sent code={} message={:?}", code.code(), message)
            }
            Self::TransferComplete { bytes, blocks, duration_ms, retransmits } => {
                write!(f, "transfer_complete bytes={} blocks={} duration_ms={} retransmits={}", bytes, blocks, duration_ms, retransmits)
            }
            Self::Error { message } => {
                write!(f, "error: {}", message)
            }
        }
    }
}

/// Trait for transfer logging. Implementations can write to tracing or
/// discard entries.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        // Lifecycle events at info, per-packet noise at debug
        match &entry.event {
            TransferEvent::SessionStarted { .. }
            | TransferEvent::TransferComplete { .. }
            | TransferEvent::Timeout { .. }
            | TransferEvent::PeerError { .. }
            | TransferEvent::ErrorSent { .. }
            | TransferEvent::Error { .. } => {
                tracing::info!(
                    component = entry.component,
                    peer = %entry.peer,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::debug!(
                    component = entry.component,
                    peer = %entry.peer,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}

/// Logger handle bound to one session's component and peer.
#[derive(Clone)]
pub(crate) struct SessionLog {
    logger: Option<Arc<dyn TransferLogger>>,
    component: &'static str,
    peer: SocketAddr,
}

impl SessionLog {
    pub(crate) fn new(
        logger: Option<Arc<dyn TransferLogger>>,
        component: &'static str,
        peer: SocketAddr,
    ) -> Self {
        Self {
            logger,
            component,
            peer,
        }
    }

    /// Re-targets the handle once the peer's transfer id is known.
    pub(crate) fn with_peer(&self, peer: SocketAddr) -> Self {
        Self {
            peer,
            ..self.clone()
        }
    }

    pub(crate) fn emit(&self, event: TransferEvent) {
        if let Some(ref logger) = self.logger {
            logger.log(TransferLog {
                component: self.component,
                peer: self.peer,
                event,
            });
        }
    }
}
