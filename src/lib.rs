pub mod cache;
pub mod candles;
pub mod config;
pub mod cron;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod hub;
pub mod utils;

pub use cache::{CacheStats, PriceCache};
pub use config::Settings;
pub use cron::{CollectionScheduler, CronScheduler, CronSettings, TokenUniverse, WatchList};
pub use engine::PriceEngine;
pub use error::PriceError;
pub use fetcher::{BatchFetcher, HttpOracle, PriceOracle, Quote};
pub use hub::{StreamEvent, Subscription};
