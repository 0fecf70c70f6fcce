//! Cron scheduler for periodic cache maintenance.
//!
//! Runs jobs like:
//! - Sweeping idle tokens out of the price cache

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use log::info;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;

use crate::cache::PriceCache;

use super::jobs;

/// Cron scheduler that manages periodic background jobs.
pub struct CronScheduler {
    cache: Arc<PriceCache>,
    settings: Arc<CronSettings>,
}

/// Configuration for cron job intervals
#[derive(Debug, Clone)]
pub struct CronSettings {
    /// Interval for sweeping the price cache - default 5 minutes
    pub sweep_interval_secs: u64,
}

impl Default for CronSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300, // 5 minutes
        }
    }
}

impl CronScheduler {
    pub fn new(cache: Arc<PriceCache>, settings: CronSettings) -> Self {
        Self {
            cache,
            settings: Arc::new(settings),
        }
    }

    /// Starts the cron scheduler and runs until cancellation.
    pub async fn run(&self, cancellation_token: CancellationToken) -> Result<()> {
        let mut scheduler = JobScheduler::new().await?;

        self.register_sweep_cache_job(&scheduler).await?;

        scheduler.start().await?;
        info!("Cron scheduler started");

        cancellation_token.cancelled().await;
        info!("Cron scheduler shutting down...");

        scheduler.shutdown().await?;
        Ok(())
    }

    async fn register_sweep_cache_job(&self, scheduler: &JobScheduler) -> Result<()> {
        let cache = self.cache.clone();
        let interval = self.settings.sweep_interval_secs;

        let job = Job::new_repeated_async(Duration::from_secs(interval), move |_uuid, _lock| {
            let cache = cache.clone();
            Box::pin(async move {
                jobs::sweep_cache::run(&cache);
            })
        })?;

        scheduler.add(job).await?;
        info!("Registered sweep_cache job (every {}s)", interval);
        Ok(())
    }
}
