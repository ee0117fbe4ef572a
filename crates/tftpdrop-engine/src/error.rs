//! Error types for the transfer engine.

use std::io;

use crate::protocol::ErrorCode;

/// A datagram that does not parse as a TFTP packet.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("packet truncated")]
    Truncated,

    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),

    #[error("string field is not NUL-terminated")]
    Unterminated,

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("option {0:?} has no value")]
    DanglingOption(String),
}

/// A transfer option outside its declared domain.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("block size {0} out of range [8, 65464]")]
    BlockSize(u32),

    #[error("window size {0} out of range [1, 65535]")]
    WindowSize(u32),

    #[error("timeout {0}s out of range [1, 255]")]
    Timeout(u64),

    #[error("resuming at block offset {0} is not supported")]
    ResumeUnsupported(u64),
}

/// Errors produced by a client upload or a server-side write session.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("cannot resolve {0}")]
    Resolve(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("timed out after {retries} retransmissions")]
    Timeout { retries: u32 },

    #[error("peer reported {code}: {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("option negotiation failed: {0}")]
    OptionRejected(String),
}

impl From<PacketError> for TransferError {
    fn from(e: PacketError) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl TransferError {
    /// Converts into an I/O error for delivery through a request's byte stream.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Self::Io(e) => e,
            Self::Timeout { .. } => io::Error::new(io::ErrorKind::TimedOut, self),
            other => io::Error::new(io::ErrorKind::ConnectionAborted, other),
        }
    }
}

/// Fatal server errors: the accept loop cannot start or cannot continue.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
