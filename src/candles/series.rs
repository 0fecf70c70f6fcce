use std::collections::VecDeque;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use log::warn;

use super::{Candle, CandleInterval};
use crate::utils::bucket_start;

/// What folding a sample did to the series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    BucketCreated,
    BucketUpdated,
    /// The sample's bucket is older than anything still held; nothing changed.
    Discarded,
}

impl FoldOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, FoldOutcome::Discarded)
    }
}

/// Time-ordered, bounded sequence of candles for a single token.
///
/// Candles are ascending by `bucket_start` with at most one candle per
/// bucket. Appending past `max_candles` drops the oldest candle.
#[derive(Debug, Clone)]
pub struct CandleSeries {
    token_address: String,
    width: CandleInterval,
    max_candles: usize,
    candles: VecDeque<Candle>,
}

impl CandleSeries {
    pub fn new(token_address: String, width: CandleInterval, max_candles: usize) -> Self {
        Self {
            token_address,
            width,
            max_candles: max_candles.max(1),
            candles: VecDeque::with_capacity(max_candles.max(1)),
        }
    }

    pub fn fold(&mut self, price: &BigDecimal, observed_at: DateTime<Utc>) -> FoldOutcome {
        let start = bucket_start(observed_at, self.width.duration());

        let last_start = match self.candles.back() {
            Some(last) => last.bucket_start,
            None => {
                self.push(start, price, observed_at);
                return FoldOutcome::BucketCreated;
            },
        };

        if start == last_start {
            if let Some(last) = self.candles.back_mut() {
                debug_assert!(last.contains(observed_at));
                last.update(price, observed_at);
            }
            return FoldOutcome::BucketUpdated;
        }

        if start > last_start {
            self.push(start, price, observed_at);
            return FoldOutcome::BucketCreated;
        }

        // Late sample: only its own bucket may absorb it
        match self
            .candles
            .binary_search_by(|c| c.bucket_start.cmp(&start))
        {
            Ok(idx) => {
                debug_assert!(self.candles[idx].contains(observed_at));
                self.candles[idx].update(price, observed_at);
                FoldOutcome::BucketUpdated
            },
            Err(_) => {
                warn!(
                    "Discarding late sample for {} at {} (bucket {} no longer held, oldest {})",
                    self.token_address,
                    observed_at,
                    start,
                    self.candles
                        .front()
                        .map(|c| c.bucket_start.to_rfc3339())
                        .unwrap_or_default()
                );
                FoldOutcome::Discarded
            },
        }
    }

    fn push(&mut self, start: DateTime<Utc>, price: &BigDecimal, observed_at: DateTime<Utc>) {
        self.candles.push_back(Candle::new(
            self.token_address.clone(),
            start,
            self.width,
            price.clone(),
            observed_at,
        ));
        self.enforce_cap();
    }

    /// Drops the oldest candles beyond `max_candles`, returning how many went.
    pub fn enforce_cap(&mut self) -> usize {
        let excess = self.candles.len().saturating_sub(self.max_candles);
        self.candles.drain(..excess);
        excess
    }

    /// Sets the cap without trimming; call [`CandleSeries::enforce_cap`] to apply it.
    pub fn set_max_candles(&mut self, max_candles: usize) {
        self.max_candles = max_candles.max(1);
    }

    /// Owned copy of the series, oldest first.
    pub fn snapshot(&self) -> Vec<Candle> {
        self.candles.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn width(&self) -> CandleInterval {
        self.width
    }

    pub fn max_candles(&self) -> usize {
        self.max_candles
    }
}
