use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Candle bucket width.
///
/// The 15 minute mode matches the collection cadence; the 1 minute mode is
/// used when prices are pushed more often than the scheduler collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CandleInterval {
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "5m")]
    Minute5,
    #[default]
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "1h")]
    Hour1,
}

impl CandleInterval {
    pub const fn duration_secs(&self) -> u64 {
        match self {
            CandleInterval::Minute1 => 60,
            CandleInterval::Minute5 => 300,
            CandleInterval::Minute15 => 900,
            CandleInterval::Hour1 => 3600,
        }
    }

    pub const fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs())
    }

    pub const fn suffix(&self) -> &'static str {
        match self {
            CandleInterval::Minute1 => "1m",
            CandleInterval::Minute5 => "5m",
            CandleInterval::Minute15 => "15m",
            CandleInterval::Hour1 => "1h",
        }
    }
}

impl std::fmt::Display for CandleInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.suffix())
    }
}
