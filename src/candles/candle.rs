use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CandleInterval;

/// OHLC summary of one token over one wall-clock aligned bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub token_address: String,
    pub bucket_start: DateTime<Utc>,
    pub bucket_width: CandleInterval,
    pub open: BigDecimal,
    pub high: BigDecimal,
    pub low: BigDecimal,
    pub close: BigDecimal,
    pub sample_count: u32,
    /// Observation time of the sample that set `open`
    pub first_sample_at: DateTime<Utc>,
    /// Observation time of the sample that set `close`
    pub last_sample_at: DateTime<Utc>,
}

impl Candle {
    /// Create a new bucket from its first sample
    pub fn new(
        token_address: String,
        bucket_start: DateTime<Utc>,
        bucket_width: CandleInterval,
        price: BigDecimal,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            token_address,
            bucket_start,
            bucket_width,
            open: price.clone(),
            high: price.clone(),
            low: price.clone(),
            close: price,
            sample_count: 1,
            first_sample_at: observed_at,
            last_sample_at: observed_at,
        }
    }

    /// Fold another sample belonging to this bucket.
    ///
    /// Samples arriving out of order only move `open`/`close` when they are
    /// earlier/later than the samples currently holding those slots.
    pub fn update(&mut self, price: &BigDecimal, observed_at: DateTime<Utc>) {
        if price > &self.high {
            self.high = price.clone();
        }
        if price < &self.low {
            self.low = price.clone();
        }
        if observed_at >= self.last_sample_at {
            self.close = price.clone();
            self.last_sample_at = observed_at;
        }
        if observed_at < self.first_sample_at {
            self.open = price.clone();
            self.first_sample_at = observed_at;
        }
        self.sample_count += 1;
    }

    pub fn bucket_end(&self) -> DateTime<Utc> {
        self.bucket_start + chrono::Duration::seconds(self.bucket_width.duration_secs() as i64)
    }

    /// Whether `ts` falls in `[bucket_start, bucket_end)`.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.bucket_start && ts < self.bucket_end()
    }
}
