//! Bootstraps and the write-completion pipeline behind `tftp-client` and
//! `tftp-server`.
//!
//! The transfer engine moves blocks; this crate decides where uploaded bytes
//! land on disk and how the two binaries are configured and started.

pub mod error;
pub mod paths;
pub mod pipeline;
pub mod serve;
pub mod source;
pub mod upload;

pub use error::ServeError;
pub use pipeline::{Stage, WriteCompletion, WriteOutcome};
pub use serve::{ServeConfig, serve};
pub use source::{ByteSource, resolve};
pub use upload::upload;
