//! Wall-clock aligned collection scheduler.
//!
//! `Idle -> Armed -> Collecting -> Idle`, one timer at a time. The next
//! boundary is recomputed from the clock after every cycle rather than by
//! adding the interval to the previous one, so drift never accumulates.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{
    jobs::{self, collect_prices::CollectionStats},
    TokenUniverse,
};
use crate::{
    error::PriceError,
    fetcher::BatchFetcher,
    utils::{next_boundary, Clock},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Armed { fires_at: DateTime<Utc> },
    Collecting { boundary: DateTime<Utc> },
}

pub struct CollectionScheduler {
    fetcher: BatchFetcher,
    universe: Arc<dyn TokenUniverse>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    state: Mutex<SchedulerState>,
    /// Scheduled plus manual cycles currently running
    active_cycles: AtomicUsize,
    /// Boundary most recently fired; re-arming never lands on or before it
    last_boundary: Mutex<Option<DateTime<Utc>>>,
    last_stats: Mutex<Option<CollectionStats>>,
}

/// Decrements the active cycle count when a cycle ends, however it ends.
struct CycleGuard<'a>(&'a AtomicUsize);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl CollectionScheduler {
    pub fn new(
        fetcher: BatchFetcher,
        universe: Arc<dyn TokenUniverse>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            fetcher,
            universe,
            clock,
            interval,
            state: Mutex::new(SchedulerState::Idle),
            active_cycles: AtomicUsize::new(0),
            last_boundary: Mutex::new(None),
            last_stats: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    pub fn last_collection(&self) -> Option<CollectionStats> {
        self.last_stats.lock().clone()
    }

    /// Runs scheduled cycles until cancelled.
    pub async fn run(&self, cancellation_token: CancellationToken) -> Result<()> {
        info!(
            "Collection scheduler started (every {:?}, aligned to wall-clock boundaries)",
            self.interval
        );

        loop {
            let (boundary, delay) = self.arm();

            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {},
            }

            self.fire(boundary).await;
        }

        *self.state.lock() = SchedulerState::Idle;
        info!("Collection scheduler shutting down...");
        Ok(())
    }

    /// `Idle -> Armed`: picks the next boundary after now and returns it with
    /// the delay until it.
    ///
    /// The timer runs on the monotonic clock, so the wall clock may still read
    /// slightly before the boundary that just fired. That boundary is the floor.
    pub fn arm(&self) -> (DateTime<Utc>, Duration) {
        let now = self.clock.now();
        let from = match *self.last_boundary.lock() {
            Some(fired) if fired > now => fired,
            _ => now,
        };
        let fires_at = next_boundary(from, self.interval);
        let delay = (fires_at - now).to_std().unwrap_or_default();

        *self.state.lock() = SchedulerState::Armed { fires_at };
        info!("Next price collection at {} (in {:?})", fires_at, delay);

        (fires_at, delay)
    }

    /// `Armed -> Collecting -> Idle`. Skips the cycle if another one is still
    /// running.
    pub async fn fire(&self, boundary: DateTime<Utc>) -> Option<CollectionStats> {
        {
            let mut last = self.last_boundary.lock();
            if last.map_or(true, |fired| boundary > fired) {
                *last = Some(boundary);
            }
        }

        if self
            .active_cycles
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("{}", PriceError::SchedulerOverrun { boundary });
            *self.state.lock() = SchedulerState::Idle;
            return None;
        }
        let _guard = CycleGuard(&self.active_cycles);

        *self.state.lock() = SchedulerState::Collecting { boundary };

        let tokens = match self.universe.tokens().await {
            Ok(tokens) => tokens,
            Err(e) => {
                error!("Failed to load token universe for {}: {:#}", boundary, e);
                Vec::new()
            },
        };

        let stats = self.record(&tokens).await;

        let next = next_boundary(boundary, self.interval);
        if stats.finished_at > next {
            warn!(
                "{} (collection for {} finished at {})",
                PriceError::SchedulerOverrun { boundary: next },
                boundary,
                stats.finished_at
            );
        }

        *self.state.lock() = SchedulerState::Idle;
        Some(stats)
    }

    /// Runs a cycle outside the schedule. The armed boundary is left alone.
    pub async fn collect_now(&self, tokens: &[String]) -> CollectionStats {
        self.active_cycles.fetch_add(1, Ordering::AcqRel);
        let _guard = CycleGuard(&self.active_cycles);
        self.record(tokens).await
    }

    async fn record(&self, tokens: &[String]) -> CollectionStats {
        let stats = jobs::collect_prices::run(&self.fetcher, self.clock.as_ref(), tokens).await;
        *self.last_stats.lock() = Some(stats.clone());
        stats
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bigdecimal::BigDecimal;

    use super::*;
    use crate::{
        cache::{CacheConfig, PriceCache},
        candles::CandleInterval,
        config::FetcherSettings,
        cron::WatchList,
        fetcher::mock::MockOracle,
        hub::SubscriptionHub,
        utils::{ManualClock, TokioClock},
    };

    const USDC: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";
    const DAI: &str = "0x6b175474e89094c44da98b954eedeac495271d0f";
    const QUARTER: Duration = Duration::from_secs(900);

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn scheduler(
        oracle: Arc<MockOracle>,
        clock: Arc<dyn Clock>,
        tokens: &[&str],
    ) -> (CollectionScheduler, Arc<PriceCache>) {
        let cache = Arc::new(PriceCache::new(
            CacheConfig {
                bucket_width: CandleInterval::Minute15,
                max_candles: 48,
                retention: Duration::from_secs(86_400),
                stale_after: QUARTER,
            },
            Arc::new(SubscriptionHub::new()),
            clock.clone(),
        ));
        let fetcher = BatchFetcher::new(
            oracle,
            cache.clone(),
            clock.clone(),
            FetcherSettings::default(),
        );
        let defaults: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
        let universe = Arc::new(WatchList::new(&defaults));
        (
            CollectionScheduler::new(fetcher, universe, clock, QUARTER),
            cache,
        )
    }

    #[test]
    fn test_arm_aligns_to_next_quarter_hour() {
        let clock = Arc::new(ManualClock::at("2026-03-01T14:58:00Z"));
        let (scheduler, _) = scheduler(Arc::new(MockOracle::default()), clock, &[]);

        let (fires_at, delay) = scheduler.arm();
        assert_eq!(fires_at, ts("2026-03-01T15:00:00Z"));
        assert_eq!(delay, Duration::from_secs(120));
        assert_eq!(scheduler.state(), SchedulerState::Armed { fires_at });
    }

    #[test]
    fn test_rearm_after_late_finish_skips_to_following_boundary() {
        let clock = Arc::new(ManualClock::at("2026-03-01T15:00:00Z"));
        let (scheduler, _) = scheduler(Arc::new(MockOracle::default()), clock.clone(), &[]);

        clock.set(ts("2026-03-01T15:16:30Z"));
        let (fires_at, _) = scheduler.arm();
        assert_eq!(fires_at, ts("2026-03-01T15:30:00Z"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_records_partial_failures() {
        let oracle = Arc::new(MockOracle::with_prices(&[(USDC, "1.0002")]));
        let clock = Arc::new(TokioClock::at("2026-03-01T15:00:00Z"));
        let (scheduler, cache) = scheduler(oracle.clone(), clock, &[USDC, DAI]);

        let stats = scheduler.fire(ts("2026-03-01T15:00:00Z")).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.failed_tokens, vec![DAI.to_string()]);
        // At least one coalescing window passed on the injected clock
        assert!(stats.duration_ms >= 200, "{}", stats.duration_ms);
        assert!(stats.finished_at >= ts("2026-03-01T15:00:00.200Z"));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(scheduler.last_collection(), Some(stats));
        assert_eq!(
            cache.read(USDC).unwrap().latest_price,
            BigDecimal::from_str("1.0002").unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_now_counts_invalid_and_duplicate_tokens() {
        let oracle = Arc::new(MockOracle::with_prices(&[(USDC, "1")]));
        let clock = Arc::new(TokioClock::at("2026-03-01T15:03:00Z"));
        let (scheduler, _) = scheduler(oracle.clone(), clock, &[]);

        let stats = scheduler
            .collect_now(&[
                USDC.to_string(),
                USDC.to_uppercase().replacen("0X", "0x", 1),
                "not-an-address".to_string(),
            ])
            .await;

        assert_eq!(stats.total, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(oracle.calls(), 1);
        // Manual runs leave the schedule untouched
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_boundary_skipped_while_cycle_running() {
        let oracle = Arc::new(MockOracle::with_prices(&[(USDC, "1")]));
        oracle.set_latency(Duration::from_secs(5));
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::at("2026-03-01T14:59:58Z"));
        let (scheduler, _) = scheduler(oracle.clone(), clock, &[USDC]);
        let scheduler = Arc::new(scheduler);

        let manual = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.collect_now(&[USDC.to_string()]).await })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(scheduler.fire(ts("2026-03-01T15:00:00Z")).await, None);
        assert_eq!(manual.await.unwrap().succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_fires_on_boundary_then_rearms() {
        let oracle = Arc::new(MockOracle::with_prices(&[(USDC, "1")]));
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::at("2026-03-01T14:58:00Z"));
        let (scheduler, _) = scheduler(oracle.clone(), clock, &[USDC]);
        let scheduler = Arc::new(scheduler);

        let token = CancellationToken::new();
        let handle = {
            let scheduler = scheduler.clone();
            let token = token.clone();
            tokio::spawn(async move { scheduler.run(token).await })
        };

        tokio::time::sleep(Duration::from_secs(119)).await;
        assert!(scheduler.last_collection().is_none());

        tokio::time::sleep(Duration::from_secs(5)).await;
        let stats = scheduler.last_collection().expect("collected at 15:00");
        assert!(stats.finished_at >= ts("2026-03-01T15:00:00Z"));
        assert!(stats.finished_at < ts("2026-03-01T15:01:00Z"));
        assert_eq!(
            scheduler.state(),
            SchedulerState::Armed {
                fires_at: ts("2026-03-01T15:15:00Z")
            }
        );

        token.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn test_rearm_never_repeats_fired_boundary_when_clock_lags() {
        let clock = Arc::new(ManualClock::at("2026-03-01T14:59:59.990Z"));
        let (scheduler, _) = scheduler(Arc::new(MockOracle::default()), clock.clone(), &[]);

        let (first, delay) = scheduler.arm();
        assert_eq!(first, ts("2026-03-01T15:00:00Z"));
        assert_eq!(delay, Duration::from_millis(10));

        // Monotonic timer fired, wall clock still reads 14:59:59.990
        let stats = scheduler.fire(first).await.unwrap();
        assert_eq!(stats.total, 0);

        let (second, delay) = scheduler.arm();
        assert_eq!(second, ts("2026-03-01T15:15:00Z"));
        assert_eq!(delay, Duration::from_millis(900_010));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_cycle_refetches_after_recent_manual_collection() {
        let oracle = Arc::new(MockOracle::with_prices(&[(USDC, "1")]));
        let clock = Arc::new(TokioClock::at("2026-03-01T14:59:50Z"));
        let (scheduler, cache) = scheduler(oracle.clone(), clock, &[USDC]);

        let manual = scheduler.collect_now(&[USDC.to_string()]).await;
        assert_eq!(manual.succeeded, 1);
        assert_eq!(oracle.calls(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        oracle.set_price(USDC, "2");

        let stats = scheduler.fire(ts("2026-03-01T15:00:00Z")).await.unwrap();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(oracle.calls(), 2);

        let entry = cache.read(USDC).unwrap();
        assert_eq!(entry.latest_price, BigDecimal::from(2));
        let candles = entry.series.snapshot();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].bucket_start, ts("2026-03-01T15:00:00Z"));
        assert_eq!(candles[1].open, BigDecimal::from(2));
    }
}
