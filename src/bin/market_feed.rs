use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use trade_controller::feed::MarketDataFeed;
use trade_controller::persistence::SymbolListStore;
use trade_controller::{RedisBus, Settings, ShutdownSignal};

#[derive(Parser, Debug)]
#[command(author, version, about = "Streams exchange trades onto the bus as ticks")]
struct Args {
    /// Settings file (TOML); defaults to controller.toml if present
    #[arg(long)]
    config: Option<PathBuf>,

    /// Symbols to stream (comma separated) instead of the symbol list
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,

    /// Log every trade as it arrives
    #[arg(long)]
    echo: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    trade_controller::setup_logging();

    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref()).context("Failed to load settings")?;

    let symbols = if args.symbols.is_empty() {
        let store = SymbolListStore::new(settings.symbol_list_path());
        store
            .load()?
            .with_context(|| format!("Symbol list not found at {}", store.path().display()))?
    } else {
        args.symbols
    };

    if symbols.is_empty() {
        anyhow::bail!("No symbols to stream");
    }

    let bus = Arc::new(
        RedisBus::new(&settings.redis_url)
            .await
            .context("Failed to connect to Redis")?,
    );

    let feed = MarketDataFeed::new(symbols, bus, settings.feed.clone());
    tracing::info!("Streaming {}", feed.symbols().join(", "));
    if args.echo {
        feed.subscribe(|symbol, price| tracing::info!("{}: {}", symbol, price));
    }

    let mut signal = ShutdownSignal::install().context("Failed to install signal handlers")?;
    let cancel = CancellationToken::new();
    let handle = feed.start(cancel.clone());

    let name = signal.recv().await?;
    tracing::info!("{} received, stopping feed...", name);
    cancel.cancel();
    handle.await?;

    Ok(())
}
