//! Composition root wiring cache, hub, fetcher and schedulers together.

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use log::{error, info, warn};
use parking_lot::Mutex;
use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::{CacheConfig, CacheEntry, CacheStats, PriceCache, PriceReading},
    candles::Candle,
    config::Settings,
    cron::{
        CollectionScheduler, CollectionStats, CronScheduler, CronSettings, SchedulerState,
        TokenUniverse,
    },
    error::PriceError,
    fetcher::{BatchFetcher, PriceOracle, Quote},
    hub::{ChartUpdate, PriceUpdate, StreamEvent, Subscription, SubscriptionHub},
    utils::{normalize_address, Clock, SystemClock},
};

/// How long `stop()` waits for each background task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Running background tasks, present between `start()` and `stop()`.
struct Lifecycle {
    cancellation_token: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

/// Price engine instance.
///
/// Owns every component; nothing is process-global. Callers subscribe, request
/// one-off prices and trigger collections through this type.
pub struct PriceEngine {
    settings: Arc<Settings>,
    cache: Arc<PriceCache>,
    fetcher: BatchFetcher,
    collector: Arc<CollectionScheduler>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

impl PriceEngine {
    pub fn new(
        settings: Arc<Settings>,
        oracle: Arc<dyn PriceOracle>,
        universe: Arc<dyn TokenUniverse>,
    ) -> Self {
        Self::with_clock(settings, oracle, universe, Arc::new(SystemClock))
    }

    pub fn with_clock(
        settings: Arc<Settings>,
        oracle: Arc<dyn PriceOracle>,
        universe: Arc<dyn TokenUniverse>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        // Subscribers may register from threads outside the runtime
        let hub = Arc::new(match Handle::try_current() {
            Ok(runtime) => SubscriptionHub::with_runtime(runtime),
            Err(_) => SubscriptionHub::new(),
        });

        let cache = Arc::new(PriceCache::new(
            CacheConfig {
                bucket_width: settings.candles.bucket_width,
                max_candles: settings.candles.max_candles,
                retention: settings.candles.retention(),
                stale_after: settings.scheduler.collection_interval(),
            },
            hub,
            clock.clone(),
        ));

        let fetcher = BatchFetcher::new(
            oracle,
            cache.clone(),
            clock.clone(),
            settings.fetcher.clone(),
        );

        let collector = Arc::new(CollectionScheduler::new(
            fetcher.clone(),
            universe,
            clock,
            settings.scheduler.collection_interval(),
        ));

        Self {
            settings,
            cache,
            fetcher,
            collector,
            lifecycle: Mutex::new(None),
        }
    }

    /// Spawns the collection scheduler and the cache sweep job.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.is_some() {
            bail!("Price engine is already running");
        }

        let cancellation_token = CancellationToken::new();

        let collector = self.collector.clone();
        let collector_token = cancellation_token.child_token();
        let collector_handle = tokio::spawn(async move {
            if let Err(e) = collector.run(collector_token).await {
                error!("Collection scheduler failed: {:#}", e);
            }
        });

        let cron_scheduler = CronScheduler::new(
            self.cache.clone(),
            CronSettings {
                sweep_interval_secs: self.settings.candles.sweep_interval_secs,
            },
        );
        let cron_token = cancellation_token.child_token();
        let cron_handle = tokio::spawn(async move {
            if let Err(e) = cron_scheduler.run(cron_token).await {
                error!("Cron scheduler failed: {:#}", e);
            }
        });

        *lifecycle = Some(Lifecycle {
            cancellation_token,
            handles: vec![("collector", collector_handle), ("cron", cron_handle)],
        });

        info!(
            "Price engine started ({} candles, max {}, retention {}s)",
            self.settings.candles.bucket_width,
            self.settings.candles.max_candles,
            self.settings.candles.retention_secs
        );
        Ok(())
    }

    /// Cancels background tasks and waits for them to finish. No-op when not running.
    pub async fn stop(&self) {
        let Some(lifecycle) = self.lifecycle.lock().take() else {
            return;
        };

        lifecycle.cancellation_token.cancel();

        for (name, handle) in lifecycle.handles {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(_) => info!("{} task stopped", name),
                Err(_) => warn!("{} task did not stop within {:?}", name, SHUTDOWN_TIMEOUT),
            }
        }

        info!("Price engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().is_some()
    }

    /// Subscribes to price updates for `token`.
    ///
    /// If a price is cached, `on_update` is called once before this returns.
    pub fn subscribe_price<F>(&self, token: &str, on_update: F) -> Result<Subscription, PriceError>
    where
        F: Fn(StreamEvent<PriceUpdate>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let token = normalize_address(token)?;
        Ok(self.cache.subscribe_price(&token, Arc::new(on_update)))
    }

    /// Subscribes to candle history updates for `token`.
    ///
    /// If candles are cached, `on_update` is called once before this returns.
    pub fn subscribe_chart<F>(&self, token: &str, on_update: F) -> Result<Subscription, PriceError>
    where
        F: Fn(StreamEvent<ChartUpdate>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let token = normalize_address(token)?;
        Ok(self.cache.subscribe_chart(&token, Arc::new(on_update)))
    }

    pub async fn request_price(&self, token: &str) -> Result<Quote, PriceError> {
        self.fetcher.request_price(token).await
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Collects `tokens` now, independent of the schedule.
    pub async fn collect_now(&self, tokens: &[String]) -> CollectionStats {
        self.collector.collect_now(tokens).await
    }

    pub fn read(&self, token: &str) -> Option<CacheEntry> {
        let token = normalize_address(token).ok()?;
        self.cache.read(&token)
    }

    pub fn latest_price(&self, token: &str) -> Option<PriceReading> {
        let token = normalize_address(token).ok()?;
        self.cache.latest_price(&token)
    }

    pub fn candles(&self, token: &str) -> Option<Vec<Candle>> {
        let token = normalize_address(token).ok()?;
        self.cache.candles(&token)
    }

    pub fn last_collection(&self) -> Option<CollectionStats> {
        self.collector.last_collection()
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.collector.state()
    }

    pub fn upstream_calls(&self) -> u64 {
        self.fetcher.upstream_calls()
    }
}
