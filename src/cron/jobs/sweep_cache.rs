//! Job to evict idle tokens from the price cache.
//!
//! Tokens untouched for longer than the retention window lose their latest
//! price and candle history; live subscribers are told the stream ended first.

use log::debug;

use crate::cache::{PriceCache, SweepReport};

pub fn run(cache: &PriceCache) -> SweepReport {
    debug!("Starting sweep_cache job...");

    let start = std::time::Instant::now();
    let report = cache.sweep();
    let stats = cache.stats();

    debug!(
        "Completed sweep_cache job in {:?} ({} tokens, {} candles, {} subscribers remain)",
        start.elapsed(),
        stats.token_count,
        stats.total_candles,
        stats.subscriber_count
    );
    report
}
