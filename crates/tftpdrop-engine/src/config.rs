//! Session configuration for both sides of a transfer.

use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;
use crate::logging::TransferLogger;
use crate::options::TransferOptions;
use crate::protocol::{MAX_BLOCK_SIZE, MAX_TIMEOUT_SECS, MIN_BLOCK_SIZE};

/// Default client block size; keeps DATA packets under a 1500-byte MTU.
pub const DEFAULT_CLIENT_BLOCK_SIZE: u32 = 1408;

/// Default client window size.
pub const DEFAULT_CLIENT_WINDOW_SIZE: u32 = 64;

/// Default number of consecutive retransmissions before giving up.
pub const DEFAULT_CLIENT_RETRANSMIT: u32 = 3;

/// Default per-packet timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 1;

/// Default number of consecutive timeouts a server session tolerates.
pub const DEFAULT_SERVER_RETRANSMIT: u32 = 5;

/// Configuration for an uploading client.
#[derive(Clone)]
pub struct ClientConfig {
    pub block_size: u32,
    pub window_size: u32,
    pub retransmit: u32,
    pub timeout_secs: u64,
    /// Local UDP port to send from. 0 picks an ephemeral port.
    pub local_port: u16,
    pub logger: Option<Arc<dyn TransferLogger>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_CLIENT_BLOCK_SIZE,
            window_size: DEFAULT_CLIENT_WINDOW_SIZE,
            retransmit: DEFAULT_CLIENT_RETRANSMIT,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            local_port: 0,
            logger: None,
        }
    }
}

impl ClientConfig {
    /// Checks every option against its declared domain and returns the
    /// options the client will request.
    pub fn validate(&self) -> Result<TransferOptions, ConfigError> {
        if !(MIN_BLOCK_SIZE as u32..=MAX_BLOCK_SIZE as u32).contains(&self.block_size) {
            return Err(ConfigError::BlockSize(self.block_size));
        }
        if !(1..=u16::MAX as u32).contains(&self.window_size) {
            return Err(ConfigError::WindowSize(self.window_size));
        }
        if !(1..=MAX_TIMEOUT_SECS).contains(&self.timeout_secs) {
            return Err(ConfigError::Timeout(self.timeout_secs));
        }
        Ok(TransferOptions {
            block_size: self.block_size as u16,
            window_size: self.window_size as u16,
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }
}

/// Configuration for a receiving server.
#[derive(Clone)]
pub struct ServerConfig {
    /// Serve every session from the listen socket instead of a fresh
    /// ephemeral port per session.
    pub single_port: bool,
    /// Consecutive timeouts a session tolerates before aborting.
    pub retransmit: u32,
    /// Per-packet timeout when the client does not negotiate one.
    pub default_timeout: Duration,
    /// Largest `blksize` the server will acknowledge.
    pub max_block_size: u16,
    pub logger: Option<Arc<dyn TransferLogger>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            single_port: false,
            retransmit: DEFAULT_SERVER_RETRANSMIT,
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_block_size: MAX_BLOCK_SIZE,
            logger: None,
        }
    }
}
