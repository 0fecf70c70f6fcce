pub mod collect_prices;
pub mod sweep_cache;
