//! Client bootstrap: one upload, no retries.

use tokio::io::AsyncRead;
use tracing::info;

use tftpdrop_engine::{ClientConfig, ClientSession, TransferError};

/// Builds a client session from `config` and uploads all of `source` to
/// `address` (`tftp://host[:port]/target_name`), starting at block 0.
///
/// Out-of-range options fail before any packet is sent.
pub async fn upload<R>(address: &str, config: ClientConfig, source: &mut R) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let session = ClientSession::new(config)?;
    let summary = session.upload(address, source, 0).await?;
    info!(
        "Uploaded {} bytes in {} blocks to {} in {:.2?} ({} retransmitted)",
        summary.bytes, summary.blocks, address, summary.elapsed, summary.retransmits
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tftpdrop_engine::ConfigError;

    #[tokio::test]
    async fn invalid_config_fails_before_sending() {
        let config = ClientConfig {
            block_size: 0,
            ..Default::default()
        };
        let mut source: &[u8] = b"abc";
        let err = upload("tftp://127.0.0.1:1/x", config, &mut source)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Config(ConfigError::BlockSize(0))));
        // Source untouched
        assert_eq!(source, b"abc");
    }

    #[tokio::test]
    async fn malformed_address_is_rejected() {
        let mut source: &[u8] = b"abc";
        let err = upload("127.0.0.1/x", ClientConfig::default(), &mut source)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidAddress { .. }));
    }
}
