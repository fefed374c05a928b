use anyhow::Context;
use clap::{Parser, Subcommand};
use dcc_transfer::{
    config::Settings,
    network::protocol::{AcceptAction, PeerAddress},
    service::TransferDaemon,
};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "dcc-transfer")]
#[command(about = "Direct peer-to-peer file transfer")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Override the listening port from the configuration
    #[arg(short, long)]
    port: Option<u16>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wait for offers from peers
    Listen {
        /// Accept every offer with this action (open, save or play)
        #[arg(long, value_parser = parse_action)]
        auto_accept: Option<AcceptAction>,
    },
    /// Offer a file to a peer and stream it once accepted
    Send {
        /// Peer address as HOST:PORT
        #[arg(value_parser = parse_peer)]
        peer: PeerAddress,
        file: PathBuf,
    },
}

fn parse_action(s: &str) -> Result<AcceptAction, String> {
    s.parse().map_err(|e: dcc_transfer::DccError| e.to_string())
}

fn parse_peer(s: &str) -> Result<PeerAddress, String> {
    s.parse().map_err(|e: dcc_transfer::DccError| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("dcc_transfer={}", log_level).into()),
        )
        .init();

    info!("Starting dcc-transfer v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    if let Some(port) = cli.port {
        settings.network.port = port;
    }

    let daemon = TransferDaemon::new(settings)
        .await
        .context("Failed to start transfer session")?;

    let run = async {
        match cli.command {
            Command::Listen { auto_accept } => daemon.listen(auto_accept).await,
            Command::Send { peer, file } => daemon.send_file(peer, &file).await,
        }
    };

    tokio::select! {
        result = run => {
            if let Err(e) = result {
                error!("Transfer error: {}", e);
                return Err(e.into());
            }
        }
        result = setup_shutdown_handler() => {
            result.context("Failed to install signal handlers")?;
            info!("Shutdown signal received, stopping...");
        }
    }

    info!("dcc-transfer stopped");
    Ok(())
}

async fn setup_shutdown_handler() -> std::io::Result<()> {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await?;
    }

    Ok(())
}
