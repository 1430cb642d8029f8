//! image-proxy binary.
//!
//! Serves the image proxy protocol on an inherited socket, or spawns itself
//! as a proxy to inspect or copy an image. Logs go to stderr; stdout
//! carries command output only.

use clap::Parser;
use image_proxy::cli::{
    commands::Commands,
    handlers::{handle_copy, handle_inspect, handle_proxy},
};
use tracing::{debug, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logging = cli.command.logging();
    let level = logging.get_effective_level();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.parse().unwrap_or(Level::WARN).into())
                .parse_lossy(logging.log_filter.as_deref().unwrap_or("")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    debug!(pid = std::process::id(), "image-proxy starting");

    match &cli.command {
        Commands::Proxy(cmd) => handle_proxy(cmd).await?,
        Commands::Inspect(cmd) => handle_inspect(cmd).await?,
        Commands::Copy(cmd) => handle_copy(cmd).await?,
    }

    Ok(())
}
