//! Cache & Eviction Manager.
//!
//! Owns every [`CacheEntry`]. Writes to one token are serialized by that
//! token's mutex; the outer map lock is only taken to find, insert or remove
//! an entry and is never held across an await.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::{
    candles::{Candle, CandleInterval, CandleSeries, FoldOutcome},
    error::PriceError,
    hub::{Callback, ChartUpdate, PriceUpdate, Subscription, SubscriptionHub},
    utils::Clock,
};

/// Latest price and candle history for one token.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub token_address: String,
    pub latest_price: BigDecimal,
    pub latest_price_at: DateTime<Utc>,
    pub series: CandleSeries,
    pub last_touched: DateTime<Utc>,
}

impl CacheEntry {
    fn price_update(&self) -> PriceUpdate {
        PriceUpdate {
            token_address: self.token_address.clone(),
            price: self.latest_price.clone(),
            observed_at: self.latest_price_at,
        }
    }

    fn chart_update(&self) -> ChartUpdate {
        ChartUpdate {
            token_address: self.token_address.clone(),
            candles: self.series.snapshot(),
        }
    }
}

/// Entry plus a tombstone flag so a writer that raced a sweep can tell its
/// entry was detached from the map.
struct Slot {
    entry: Option<CacheEntry>,
    evicted: bool,
}

type SlotRef = Arc<Mutex<Slot>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    pub token_count: usize,
    pub total_candles: usize,
    pub subscriber_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub evicted_tokens: usize,
    pub closed_subscriptions: usize,
    pub truncated_candles: usize,
}

/// A cached price annotated with its freshness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceReading {
    pub token_address: String,
    pub price: BigDecimal,
    pub observed_at: DateTime<Utc>,
    /// Older than one collection interval
    pub stale: bool,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub bucket_width: CandleInterval,
    pub max_candles: usize,
    pub retention: Duration,
    /// Age after which a reading is reported stale
    pub stale_after: Duration,
}

pub struct PriceCache {
    entries: RwLock<FxHashMap<String, SlotRef>>,
    hub: Arc<SubscriptionHub>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    /// Current history cap; starts at `config.max_candles`
    max_candles: AtomicUsize,
}

impl PriceCache {
    pub fn new(config: CacheConfig, hub: Arc<SubscriptionHub>, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            hub,
            clock,
            max_candles: AtomicUsize::new(config.max_candles.max(1)),
            config,
        }
    }

    pub fn max_candles(&self) -> usize {
        self.max_candles.load(Ordering::Relaxed)
    }

    /// Changes the candle history cap. New series use it immediately; existing
    /// series are trimmed by the next sweep.
    pub fn set_max_candles(&self, max_candles: usize) {
        let max_candles = max_candles.max(1);
        self.max_candles.store(max_candles, Ordering::Relaxed);
        info!("Candle history cap set to {}", max_candles);
    }

    /// Records a price observation and notifies subscribers once it is committed.
    ///
    /// `token` must already be normalized.
    pub fn write(&self, token: &str, price: &BigDecimal, observed_at: DateTime<Utc>) -> FoldOutcome {
        loop {
            let slot = self.slot_or_insert(token);
            let mut guard = slot.lock();
            if guard.evicted {
                // Swept between lookup and lock, retry against a fresh slot
                continue;
            }

            let now = self.clock.now();
            let entry = guard.entry.get_or_insert_with(|| CacheEntry {
                token_address: token.to_string(),
                latest_price: price.clone(),
                latest_price_at: observed_at,
                series: CandleSeries::new(
                    token.to_string(),
                    self.config.bucket_width,
                    self.max_candles(),
                ),
                last_touched: now,
            });

            let outcome = entry.series.fold(price, observed_at);
            let price_moved = observed_at >= entry.latest_price_at;
            if price_moved {
                entry.latest_price = price.clone();
                entry.latest_price_at = observed_at;
            }
            entry.last_touched = now;

            // Enqueue while still holding the token lock so per-token ordering
            // of notifications matches write order.
            if price_moved {
                self.hub.notify_price_changed(&entry.price_update());
            }
            if outcome.changed() {
                self.hub.notify_chart_changed(&entry.chart_update());
            }

            return outcome;
        }
    }

    fn slot_or_insert(&self, token: &str) -> SlotRef {
        if let Some(slot) = self.entries.read().get(token) {
            return Arc::clone(slot);
        }

        let mut entries = self.entries.write();
        Arc::clone(entries.entry(token.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(Slot {
                entry: None,
                evicted: false,
            }))
        }))
    }

    pub fn read(&self, token: &str) -> Option<CacheEntry> {
        let slot = self.entries.read().get(token).cloned()?;
        let guard = slot.lock();
        guard.entry.clone()
    }

    /// Latest price with a staleness flag. Stale reads are served, not refused.
    pub fn latest_price(&self, token: &str) -> Option<PriceReading> {
        let entry = self.read(token)?;
        let age = self.clock.now() - entry.latest_price_at;
        let stale = age.to_std().map(|a| a > self.config.stale_after).unwrap_or(false);

        if stale {
            debug!(
                "{}",
                PriceError::StaleCacheServed {
                    token: token.to_string(),
                    age_secs: age.num_seconds(),
                }
            );
        }

        Some(PriceReading {
            token_address: entry.token_address,
            price: entry.latest_price,
            observed_at: entry.latest_price_at,
            stale,
        })
    }

    /// Subscribes to price pushes, delivering the current price synchronously
    /// if one is cached.
    pub fn subscribe_price(&self, token: &str, callback: Callback<PriceUpdate>) -> Subscription {
        let (registration, snapshot) = {
            let entries = self.entries.read();
            match entries.get(token) {
                Some(slot) => {
                    let guard = slot.lock();
                    let registration = self.hub.register_price(token);
                    (registration, guard.entry.as_ref().map(CacheEntry::price_update))
                },
                None => (self.hub.register_price(token), None),
            }
        };
        registration.activate(snapshot, callback)
    }

    /// Subscribes to chart pushes, delivering the current series synchronously
    /// if one is cached.
    pub fn subscribe_chart(&self, token: &str, callback: Callback<ChartUpdate>) -> Subscription {
        let (registration, snapshot) = {
            let entries = self.entries.read();
            match entries.get(token) {
                Some(slot) => {
                    let guard = slot.lock();
                    let registration = self.hub.register_chart(token);
                    (registration, guard.entry.as_ref().map(CacheEntry::chart_update))
                },
                None => (self.hub.register_chart(token), None),
            }
        };
        registration.activate(snapshot, callback)
    }

    /// Evicts entries idle past the retention window and re-applies the
    /// candle cap to the rest.
    ///
    /// Subscribers of an evicted token receive `Ended` before its data is dropped.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let max_candles = self.max_candles();
        let mut report = SweepReport::default();
        let mut entries = self.entries.write();

        entries.retain(|token, slot| {
            let mut guard = slot.lock();
            let idle = match &guard.entry {
                Some(entry) => (now - entry.last_touched)
                    .to_std()
                    .map(|idle| idle > self.config.retention)
                    .unwrap_or(false),
                // Placeholder left by a writer that has not committed yet
                None => false,
            };

            if idle {
                report.closed_subscriptions += self.hub.end_stream(token);
                guard.evicted = true;
                guard.entry = None;
                report.evicted_tokens += 1;
                return false;
            }

            if let Some(entry) = guard.entry.as_mut() {
                entry.series.set_max_candles(max_candles);
                report.truncated_candles += entry.series.enforce_cap();
            }
            true
        });

        if report.evicted_tokens > 0 || report.truncated_candles > 0 {
            info!(
                "Cache sweep evicted {} token(s), closed {} subscription(s), truncated {} candle(s)",
                report.evicted_tokens, report.closed_subscriptions, report.truncated_candles
            );
        }

        report
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.read();
        let mut stats = CacheStats {
            subscriber_count: self.hub.subscriber_count(),
            ..CacheStats::default()
        };

        for slot in entries.values() {
            if let Some(entry) = &slot.lock().entry {
                stats.token_count += 1;
                stats.total_candles += entry.series.len();
            }
        }

        stats
    }

    pub fn candles(&self, token: &str) -> Option<Vec<Candle>> {
        self.read(token).map(|entry| entry.series.snapshot())
    }

    pub fn hub(&self) -> &Arc<SubscriptionHub> {
        &self.hub
    }
}
