#[allow(clippy::module_inception)]
mod config;

pub use config::{CandleSettings, FetcherSettings, OracleSettings, SchedulerSettings, Settings};
