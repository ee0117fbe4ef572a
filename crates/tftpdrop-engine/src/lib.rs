/// tftpdrop engine: the write path of TFTP over tokio UDP sockets.
///
/// Provides:
/// - RFC 1350 packet codec with RFC 2347 option extensions
/// - `blksize`, `timeout` and `windowsize` negotiation
/// - An uploading client with a sliding send window
/// - A receiving server, in ephemeral-port or single-port mode, that hands
///   each inbound write to a registered [`WriteHandler`]
/// - Structured per-session transfer logging

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod options;
pub mod protocol;
pub mod request;
pub mod server;

mod session;
mod transport;

// Re-export key types for convenience.
pub use client::{ClientSession, UploadSummary};
pub use config::{ClientConfig, ServerConfig};
pub use error::{ConfigError, PacketError, ServerError, TransferError};
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use options::TransferOptions;
pub use protocol::{ErrorCode, Packet};
pub use request::{WriteHandler, WriteRequest};
pub use server::ServerSession;
