use std::time::Duration;

use anyhow::{bail, Result};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::candles::CandleInterval;

/// Upstream price oracle endpoint.
///
/// The oracle accepts a batch of token addresses in a single call and answers
/// with an `{address: price}` map.
#[derive(Debug, Deserialize, Clone)]
pub struct OracleSettings {
    pub url: String,
    /// Sent as `x-api-key` when present
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Candle aggregation and cache retention.
#[derive(Debug, Deserialize, Clone)]
pub struct CandleSettings {
    #[serde(default)]
    pub bucket_width: CandleInterval,
    #[serde(default = "default_max_candles")]
    pub max_candles: usize,
    /// Entries untouched for longer than this are evicted by the sweep
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_max_candles() -> usize {
    48 // 12h of 15m candles
}

fn default_retention_secs() -> u64 {
    86_400
}

fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for CandleSettings {
    fn default() -> Self {
        Self {
            bucket_width: CandleInterval::default(),
            max_candles: default_max_candles(),
            retention_secs: default_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CandleSettings {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Request coalescing and upstream retry policy.
///
/// The numeric defaults are tuning values for a rate-limited oracle, not
/// protocol constants.
#[derive(Debug, Deserialize, Clone)]
pub struct FetcherSettings {
    #[serde(default = "default_coalescing_window_ms")]
    pub coalescing_window_ms: u64,
    #[serde(default = "default_sub_batch_size")]
    pub sub_batch_size: usize,
    #[serde(default = "default_inter_batch_delay_ms")]
    pub inter_batch_delay_ms: u64,
    /// Total attempts per sub-batch, including the first one
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_price_ttl_secs")]
    pub price_ttl_secs: u64,
    #[serde(default = "default_not_found_ttl_secs")]
    pub not_found_ttl_secs: u64,
}

fn default_coalescing_window_ms() -> u64 {
    200
}

fn default_sub_batch_size() -> usize {
    5
}

fn default_inter_batch_delay_ms() -> u64 {
    200
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_price_ttl_secs() -> u64 {
    30
}

fn default_not_found_ttl_secs() -> u64 {
    300
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            coalescing_window_ms: default_coalescing_window_ms(),
            sub_batch_size: default_sub_batch_size(),
            inter_batch_delay_ms: default_inter_batch_delay_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            price_ttl_secs: default_price_ttl_secs(),
            not_found_ttl_secs: default_not_found_ttl_secs(),
        }
    }
}

impl FetcherSettings {
    pub fn coalescing_window(&self) -> Duration {
        Duration::from_millis(self.coalescing_window_ms)
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms * attempt as u64)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Wall-clock aligned collection job.
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerSettings {
    #[serde(default = "default_collection_interval_secs")]
    pub collection_interval_secs: u64,
    /// Tokens collected on every cycle regardless of runtime registrations
    #[serde(default)]
    pub default_tokens: Vec<String>,
}

fn default_collection_interval_secs() -> u64 {
    900
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            collection_interval_secs: default_collection_interval_secs(),
            default_tokens: Vec::new(),
        }
    }
}

impl SchedulerSettings {
    pub fn collection_interval(&self) -> Duration {
        Duration::from_secs(self.collection_interval_secs)
    }
}

/// Root application configuration.
///
/// Loaded from an optional `config.yaml` at startup, then overridden by
/// `PRICEWIRE__SECTION__KEY` environment variables.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub oracle: OracleSettings,
    #[serde(default)]
    pub candles: CandleSettings,
    #[serde(default)]
    pub fetcher: FetcherSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_file("config")
    }

    pub fn from_file(name: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(name).required(false))
            .add_source(
                Environment::with_prefix("PRICEWIRE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("scheduler.default_tokens")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = s.try_deserialize()?;

        Ok(settings)
    }

    /// Rejects values that would stall the pipeline (zero-sized batches, zero intervals).
    pub fn validate(&self) -> Result<()> {
        if self.candles.max_candles == 0 {
            bail!("candles.max_candles must be at least 1");
        }
        if self.fetcher.sub_batch_size == 0 {
            bail!("fetcher.sub_batch_size must be at least 1");
        }
        if self.fetcher.max_retries == 0 {
            bail!("fetcher.max_retries must be at least 1");
        }
        if self.fetcher.request_timeout_ms == 0 {
            bail!("fetcher.request_timeout_ms must be positive");
        }
        if self.scheduler.collection_interval_secs == 0 {
            bail!("scheduler.collection_interval_secs must be positive");
        }
        if self.candles.sweep_interval_secs == 0 {
            bail!("candles.sweep_interval_secs must be positive");
        }
        Ok(())
    }
}
