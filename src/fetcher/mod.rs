pub mod batcher;
#[cfg(test)]
pub(crate) mod mock;
pub mod oracle;

pub use batcher::{BatchFetcher, Quote};
pub use oracle::{HttpOracle, PriceOracle};
