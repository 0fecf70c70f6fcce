//! Utility functions for the pricewire engine.
//!
//! This module is organized into focused submodules:
//!
//! - [`time`] - Wall-clock bucketing and boundary alignment
//! - [`clock`] - Injectable time source
//! - [`validation`] - Address normalization and price sanity checks

mod clock;
mod time;
mod validation;

// ============================================
// Re-exports
// ============================================

// Time source
#[cfg(test)]
pub use clock::{ManualClock, TokioClock};
pub use clock::{Clock, SystemClock};

// Bucketing and scheduling math
pub use time::{bucket_start, next_boundary};

// Validation utilities
pub use validation::{normalize_address, parse_price, validate_usd_price, MAX_TOKEN_USD_PRICE};
