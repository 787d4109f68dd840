use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use market_maker::{
    initialize_logging, shutdown_signal, Ledger, MarketMakerConfig, MarketMakerService, RpcLedger,
};

#[derive(Parser, Debug)]
#[command(name = "market-maker")]
#[command(about = "Keeps laddered limit orders around a reference price")]
struct Args {
    /// Configuration file (TOML or JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Read from the node but log transactions instead of broadcasting
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = MarketMakerConfig::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
    initialize_logging(&config.logging)?;

    info!("Starting Market Maker v{}", env!("CARGO_PKG_VERSION"));

    if args.dry_run {
        warn!("Dry run: transactions are logged and not broadcast");
    }
    let ledger: Arc<dyn Ledger> = Arc::new(
        RpcLedger::new(&config.node.url, &config.node.wallet_url, config.request_timeout())
            .context("Failed to create ledger client")?
            .with_dry_run(args.dry_run),
    );

    let mut service = MarketMakerService::new(config, ledger)?;
    let running = service.start().await.context("Failed to start market maker service")?;
    if running == 0 {
        bail!("No market maker could be started");
    }

    info!("Market maker is running. Press Ctrl+C to shutdown gracefully.");
    shutdown_signal().await;

    info!("Shutdown signal received");
    service.stop().await;

    info!("Market maker shutdown complete");
    Ok(())
}
