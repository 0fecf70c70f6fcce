use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failures and notices surfaced by the price pipeline.
///
/// Values are `Clone` because one upstream failure fans out to every waiter
/// of the affected sub-batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PriceError {
    /// Network or HTTP failure talking to the oracle, after all retries.
    #[error("upstream oracle unavailable after {attempts} attempt(s): {reason}")]
    UpstreamUnavailable { attempts: u32, reason: String },

    /// The oracle answered but had no usable price for this token.
    #[error("oracle returned no price for token {0}")]
    TokenNotFound(String),

    #[error("invalid token address {0:?}")]
    InvalidAddress(String),

    /// Informational: a read returned data older than one collection interval.
    #[error("served cached price for {token} observed {age_secs}s ago")]
    StaleCacheServed { token: String, age_secs: i64 },

    /// A collection cycle was still active when the next boundary fired.
    #[error("collection still running at boundary {boundary}, cycle skipped")]
    SchedulerOverrun { boundary: DateTime<Utc> },

    #[error("price fetcher dropped the request before it resolved")]
    Shutdown,
}

impl PriceError {
    /// Whether retrying the same request later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PriceError::UpstreamUnavailable { .. } | PriceError::Shutdown)
    }
}
