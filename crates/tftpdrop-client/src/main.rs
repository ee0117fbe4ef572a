use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use clap::error::ErrorKind;
use tracing::error;

use tftpdrop_engine::config::{
    DEFAULT_CLIENT_BLOCK_SIZE, DEFAULT_CLIENT_RETRANSMIT, DEFAULT_CLIENT_WINDOW_SIZE,
    DEFAULT_TIMEOUT_SECS,
};
use tftpdrop_engine::{ClientConfig, TracingLogger};

#[derive(Parser, Debug)]
#[command(name = "tftp-client")]
#[command(about = "Upload a file (or standard input) to a TFTP server")]
struct Cli {
    /// File to upload; empty reads standard input
    #[arg(long, env = "TFTP_FILE", default_value = "")]
    file: String,

    /// Blocks in flight before an acknowledgement
    #[arg(long, env = "TFTP_WINDOWSIZE", default_value_t = DEFAULT_CLIENT_WINDOW_SIZE)]
    windowsize: u32,

    /// Payload bytes per DATA packet
    #[arg(long, env = "TFTP_BLOCKSIZE", default_value_t = DEFAULT_CLIENT_BLOCK_SIZE)]
    blocksize: u32,

    /// Consecutive timeouts tolerated before giving up
    #[arg(long, env = "TFTP_RETRANSMIT", default_value_t = DEFAULT_CLIENT_RETRANSMIT)]
    retransmit: u32,

    /// Per-packet timeout in seconds
    #[arg(long, env = "TFTP_TIMEOUT", default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Local UDP port to send from; 0 picks an ephemeral port
    #[arg(long = "single-port", env = "TFTP_SINGLE_PORT", default_value_t = 0)]
    single_port: u16,

    /// Server and target name
    #[arg(value_name = "tftp://host[:port]/target_name")]
    address: String,
}

impl Cli {
    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            block_size: self.blocksize,
            window_size: self.windowsize,
            retransmit: self.retransmit,
            timeout_secs: self.timeout,
            local_port: self.single_port,
            logger: Some(Arc::new(TracingLogger)),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tftpdrop_client=info,tftpdrop_core=info,tftpdrop_engine=info".into()),
        )
        .init();

    // clap exits with 2 on usage errors; this tool reports them as 1
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut source = tftpdrop_core::resolve(Some(cli.file.as_str()))
        .await
        .with_context(|| format!("cannot open {:?}", cli.file))?;

    tftpdrop_core::upload(&cli.address, cli.client_config(), &mut source)
        .await
        .with_context(|| format!("upload to {} failed", cli.address))?;
    Ok(())
}
