use std::{str::FromStr, sync::Arc};

use anyhow::Context;
use jemallocator::Jemalloc;
use log::{info, LevelFilter};
use simple_logger::SimpleLogger;

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use pricewire::{HttpOracle, PriceEngine, Settings, WatchList};

#[tokio::main()]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let settings = Arc::new(
        Settings::new()
            .context("Failed to load config.yaml. Please ensure it exists and is valid")?,
    );
    settings.validate().context("Invalid configuration")?;

    let level = LevelFilter::from_str(&settings.log_level).unwrap_or(LevelFilter::Info);
    SimpleLogger::new()
        .with_level(level)
        .init()
        .context("Failed to initialize logger")?;

    let oracle = Arc::new(
        HttpOracle::new(&settings.oracle).context("Failed to create price oracle client")?,
    );
    let universe = Arc::new(WatchList::new(&settings.scheduler.default_tokens));

    let engine = PriceEngine::new(settings.clone(), oracle, universe);
    engine.start()?;

    info!(
        "Tracking {} default tokens every {}s",
        settings.scheduler.default_tokens.len(),
        settings.scheduler.collection_interval_secs
    );

    #[cfg(unix)]
    let mut sigterm_stream = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?
    };

    info!("Price engine running. Press Ctrl+C to stop.");

    #[cfg(unix)]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal (Ctrl+C), exiting gracefully...");
            },
            _ = sigterm_stream.recv() => {
                info!("Received SIGTERM, exiting gracefully...");
            },
        };
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal (Ctrl+C), exiting gracefully...");
            },
        };
    }

    info!("Finishing all tasks...");
    engine.stop().await;

    let stats = engine.get_cache_stats();
    info!(
        "Final cache: {} tokens, {} candles, {} subscribers",
        stats.token_count, stats.total_candles, stats.subscriber_count
    );
    Ok(())
}
