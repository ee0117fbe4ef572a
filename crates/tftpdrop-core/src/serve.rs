//! Server bootstrap: bind, register the pipeline, accept forever.

use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use tokio::fs;
use tracing::info;

use tftpdrop_engine::{ServerConfig, ServerSession, TracingLogger};

use crate::error::ServeError;
use crate::pipeline::WriteCompletion;

/// Receiver settings exposed on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeConfig {
    /// Run every session on the listen port.
    pub single_port: bool,
    pub port: u16,
}

/// Creates `output_root`, binds the listen socket and registers the
/// write-completion pipeline. The returned server has not started accepting.
pub async fn bind(
    config: ServeConfig,
    output_root: &Path,
    atomic: bool,
) -> Result<ServerSession, ServeError> {
    fs::create_dir_all(output_root)
        .await
        .map_err(|source| ServeError::OutputRoot {
            path: output_root.to_path_buf(),
            source,
        })?;

    let listen = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let mut server = ServerSession::bind(
        &listen.to_string(),
        ServerConfig {
            single_port: config.single_port,
            logger: Some(Arc::new(TracingLogger)),
            ..Default::default()
        },
    )
    .await?;
    server.register_write_handler(WriteCompletion::new(output_root, atomic));

    info!(
        "Saving uploads to {} ({})",
        output_root.display(),
        if atomic { "atomic" } else { "direct" }
    );
    Ok(server)
}

/// Runs the receiver until a fatal error.
pub async fn serve(
    config: ServeConfig,
    output_root: &Path,
    atomic: bool,
) -> Result<Infallible, ServeError> {
    let server = bind(config, output_root, atomic).await?;
    Ok(server.run().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_missing_output_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().join("nested/output");

        let server = bind(
            ServeConfig {
                single_port: false,
                port: 0,
            },
            &root,
            false,
        )
        .await
        .unwrap();

        assert!(root.is_dir());
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn output_root_under_a_file_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("plain-file");
        std::fs::write(&file, b"x").unwrap();

        let err = bind(
            ServeConfig {
                single_port: false,
                port: 0,
            },
            &file.join("output"),
            true,
        )
        .await
        .err()
        .unwrap();

        assert!(matches!(err, ServeError::OutputRoot { .. }));
    }
}
