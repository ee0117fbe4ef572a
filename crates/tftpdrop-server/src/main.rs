use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use clap::error::ErrorKind;
use tracing::{error, info, warn};

use tftpdrop_core::ServeConfig;

#[derive(Parser, Debug)]
#[command(name = "tftp-server")]
#[command(about = "Receive TFTP uploads into a folder")]
struct Cli {
    /// Serve every transfer on the listen port instead of a fresh port per transfer
    #[arg(
        long = "single-port",
        env = "TFTP_SINGLE_PORT",
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    single_port: bool,

    /// Folder uploads are saved to; created if missing
    #[arg(long = "output-folder", env = "TFTP_OUTPUT_FOLDER", default_value = "output")]
    output_folder: PathBuf,

    /// UDP port to listen on
    #[arg(long, env = "TFTP_PORT", default_value_t = 69)]
    port: u16,

    /// Write to a hidden staging file and rename it into place when complete
    #[arg(
        long = "atomic-save",
        env = "TFTP_ATOMIC_SAVE",
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    atomic_save: bool,
}

impl Cli {
    fn serve_config(&self) -> ServeConfig {
        ServeConfig {
            single_port: self.single_port,
            port: self.port,
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
                .unwrap_or_else(|_| "tftpdrop_server=info,tftpdrop_core=info,tftpdrop_engine=info".into()),
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
    tokio::select! {
        result = tftpdrop_core::serve(cli.serve_config(), &cli.output_folder, cli.atomic_save) => {
            match result {
                Ok(never) => match never {},
                Err(e) => Err(e.into()),
            }
        }
        _ = shutdown_signal() => Ok(()),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("Cannot install SIGTERM handler: {}", e);
                let _ = ctrl_c.await;
                info!("Received Ctrl+C, shutting down...");
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received Ctrl+C, shutting down...");
    }
}
