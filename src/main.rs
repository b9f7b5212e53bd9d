use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use trade_controller::api::KrakenClient;
use trade_controller::{Controller, RedisBus, Settings, ShutdownSignal};

#[derive(Parser, Debug)]
#[command(author, version, about = "Runs per-symbol trading strategies and answers bus commands")]
struct Args {
    /// Settings file (TOML); defaults to controller.toml if present
    #[arg(long)]
    config: Option<PathBuf>,

    /// Controller identity, overrides the settings file
    #[arg(long)]
    controller_id: Option<String>,

    /// Skip relaunching the instances that were running at last shutdown
    #[arg(long)]
    no_recover: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    trade_controller::setup_logging();

    let args = Args::parse();
    let mut settings = Settings::load(args.config.as_deref()).context("Failed to load settings")?;
    if let Some(id) = args.controller_id {
        settings.controller_id = id;
    }

    tracing::info!("🚀 Trade controller {} starting", settings.controller_id);
    tracing::info!("  Data dir: {}", settings.data_dir.display());
    tracing::info!("  Redis: {}", settings.redis_url);

    let bus = Arc::new(
        RedisBus::new(&settings.redis_url)
            .await
            .context("Failed to connect to Redis")?,
    );
    let reference = Arc::new(KrakenClient::new(&settings.reference)?);
    let controller = Arc::new(Controller::new(settings, bus, reference));

    // before recovery relaunches anything, so an early SIGTERM still snapshots
    let mut signal = ShutdownSignal::install().context("Failed to install signal handlers")?;

    if args.no_recover {
        tracing::info!("Skipping instance recovery");
    } else {
        let recovered = controller.startup().await?;
        tracing::info!("Recovered {} instance(s)", recovered);
    }

    let shutdown = controller.shutdown_token();
    let mut dispatch = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.run().await })
    };

    let outcome = tokio::select! {
        outcome = &mut dispatch => outcome,
        received = signal.recv() => {
            match received {
                Ok(name) => tracing::info!("{} received, shutting down", name),
                Err(e) => tracing::error!("Signal handler failed ({}), shutting down", e),
            }
            shutdown.cancel();
            dispatch.await
        }
    };

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Dispatch loop failed: {}", e),
        Err(e) => tracing::error!("Dispatch task panicked: {}", e),
    }

    // snapshot first: stopping empties the registry
    controller.save_active_set()?;

    let report = controller.stop_all().await;
    if !report.still_running.is_empty() {
        tracing::warn!("Workers still running at exit: {:?}", report.still_running);
    }

    tracing::info!("👋 Trade controller stopped");
    Ok(())
}
