//! Upstream price oracle boundary.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use log::warn;
use rustc_hash::FxHashMap;
use url::Url;

use crate::{
    config::OracleSettings,
    utils::{normalize_address, parse_price},
};

/// Batch price source.
///
/// One call prices a whole sub-batch. Tokens absent from the returned map have
/// no price available; that is not a failure of the call.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn fetch_prices(&self, addresses: &[String]) -> Result<FxHashMap<String, BigDecimal>>;
}

/// HTTP oracle answering `GET {url}?addresses=a,b,c` with `{"address": price}`.
pub struct HttpOracle {
    client: reqwest::Client,
    url: Url,
    api_key: Option<String>,
}

/// Connection-level ceiling; the fetcher applies its own per-attempt timeout.
const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

impl HttpOracle {
    pub fn new(settings: &OracleSettings) -> Result<Self> {
        let url = Url::parse(&settings.url)
            .with_context(|| format!("Invalid oracle URL {:?}", settings.url))?;

        let client = reqwest::Client::builder()
            .timeout(HTTP_CLIENT_TIMEOUT)
            .build()
            .context("Failed to build oracle HTTP client")?;

        Ok(Self {
            client,
            url,
            api_key: settings.api_key.clone(),
        })
    }
}

#[async_trait]
impl PriceOracle for HttpOracle {
    async fn fetch_prices(&self, addresses: &[String]) -> Result<FxHashMap<String, BigDecimal>> {
        let mut request = self
            .client
            .get(self.url.clone())
            .query(&[("addresses", addresses.join(","))]);

        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let body: serde_json::Map<String, serde_json::Value> = request
            .send()
            .await
            .context("Oracle request failed")?
            .error_for_status()
            .context("Oracle returned an error status")?
            .json()
            .await
            .context("Oracle response is not a JSON object")?;

        Ok(parse_price_map(body))
    }
}

/// Keys are normalized so a checksummed answer matches a lowercased request.
fn parse_price_map(
    body: serde_json::Map<String, serde_json::Value>,
) -> FxHashMap<String, BigDecimal> {
    let mut prices = FxHashMap::default();

    for (raw, value) in body {
        let Ok(address) = normalize_address(&raw) else {
            warn!("Oracle returned unparseable address {:?}", raw);
            continue;
        };
        match parse_price(&value) {
            Some(price) => {
                prices.insert(address, price);
            },
            // null means "no price", anything else is a malformed answer
            None if value.is_null() => {},
            None => warn!("Oracle returned unparseable price {} for {}", value, address),
        }
    }

    prices
}
