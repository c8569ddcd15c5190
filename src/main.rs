//! oprelay CLI entrypoint

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use oprelay::cli::Cli;
use oprelay::config::RelayConfig;

// Operations run cooperatively on one thread so chained calls always
// precede the runs they spawn.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = RelayConfig::load()?;

    // Initialize tracing; stdout is reserved for payloads
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&config.log_level))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    // Parse and execute CLI
    let cli = Cli::parse();
    cli.execute(config).await
}
