//! Address normalization and price sanity checks.
//!
//! Oracle answers are untrusted. A price of zero, a negative price or a price
//! beyond any plausible token value almost always means a decimals or unit
//! error upstream, and folding it into a candle would poison `high`/`low` for
//! the whole bucket.

use std::str::FromStr;

use bigdecimal::BigDecimal;
use num_traits::Zero;

use crate::error::PriceError;

// ============================================
// Price Validation Constants
// ============================================

/// Maximum reasonable token price in USD.
/// No legitimate token costs more than $1 million per unit.
pub const MAX_TOKEN_USD_PRICE: i64 = 1_000_000;

/// Longest address accepted. EVM addresses are 42 chars, base58 keys ~44.
const MAX_ADDRESS_LEN: usize = 64;

// ============================================
// Helpers
// ============================================

/// Validate a USD price is within reasonable bounds.
/// Returns Some(price) if valid, None if invalid.
pub fn validate_usd_price(price: &BigDecimal) -> Option<BigDecimal> {
    if price > &BigDecimal::zero() && price <= &BigDecimal::from(MAX_TOKEN_USD_PRICE) {
        Some(price.clone())
    } else {
        None
    }
}

/// Canonical form of a token address used as the cache and coalescing key.
///
/// Hex (`0x`-prefixed) addresses are lowercased so checksummed and plain
/// spellings share one entry; other encodings (e.g. base58) are case-sensitive
/// and kept as-is.
pub fn normalize_address(raw: &str) -> Result<String, PriceError> {
    let addr = raw.trim();

    if addr.is_empty()
        || addr.len() > MAX_ADDRESS_LEN
        || !addr.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(PriceError::InvalidAddress(raw.to_string()));
    }

    if let Some(hex) = addr.strip_prefix("0x").or_else(|| addr.strip_prefix("0X")) {
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PriceError::InvalidAddress(raw.to_string()));
        }
        return Ok(format!("0x{}", hex.to_lowercase()));
    }

    Ok(addr.to_string())
}

/// Parses an oracle price given either as a JSON number or a decimal string.
pub fn parse_price(value: &serde_json::Value) -> Option<BigDecimal> {
    match value {
        serde_json::Value::Number(n) => BigDecimal::from_str(&n.to_string()).ok(),
        serde_json::Value::String(s) => BigDecimal::from_str(s.trim()).ok(),
        _ => None,
    }
}
