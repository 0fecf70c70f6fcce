//! Candle Store: per-token bounded OHLC series.

mod candle;
mod interval;
mod series;

pub use candle::Candle;
pub use interval::CandleInterval;
pub use series::{CandleSeries, FoldOutcome};
