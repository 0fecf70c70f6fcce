//! Scripted in-memory oracle for tests.

use std::{
    str::FromStr,
    sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use super::PriceOracle;

#[derive(Default)]
pub struct MockOracle {
    prices: Mutex<FxHashMap<String, BigDecimal>>,
    calls: AtomicUsize,
    fail_next: AtomicU32,
    always_fail: Mutex<FxHashSet<String>>,
    latency: Mutex<Option<Duration>>,
    requests: Mutex<Vec<Vec<String>>>,
    call_times: Mutex<Vec<tokio::time::Instant>>,
    panicking: AtomicBool,
}

impl MockOracle {
    pub fn with_prices(prices: &[(&str, &str)]) -> Self {
        let oracle = Self::default();
        for (token, price) in prices {
            oracle.set_price(token, price);
        }
        oracle
    }

    pub fn set_price(&self, token: &str, price: &str) {
        self.prices
            .lock()
            .insert(token.to_string(), BigDecimal::from_str(price).unwrap());
    }

    /// Fail the next `n` calls regardless of content.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every call that includes `token`.
    pub fn always_fail(&self, token: &str) {
        self.always_fail.lock().insert(token.to_string());
    }

    /// Make every call panic, simulating a buggy oracle implementation.
    pub fn set_panicking(&self, panicking: bool) {
        self.panicking.store(panicking, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Vec<String>> {
        self.requests.lock().clone()
    }

    /// Tokio instant at which each call started.
    pub fn call_times(&self) -> Vec<tokio::time::Instant> {
        self.call_times.lock().clone()
    }
}

#[async_trait]
impl PriceOracle for MockOracle {
    async fn fetch_prices(&self, addresses: &[String]) -> Result<FxHashMap<String, BigDecimal>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(addresses.to_vec());
        self.call_times.lock().push(tokio::time::Instant::now());

        if self.panicking.load(Ordering::SeqCst) {
            panic!("oracle bug");
        }

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let scripted = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted {
            bail!("HTTP 503 Service Unavailable");
        }
        if addresses
            .iter()
            .any(|a| self.always_fail.lock().contains(a))
        {
            bail!("HTTP 502 Bad Gateway");
        }

        let prices = self.prices.lock();
        Ok(addresses
            .iter()
            .filter_map(|a| prices.get(a).map(|p| (a.clone(), p.clone())))
            .collect())
    }
}
