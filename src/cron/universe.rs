use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::{error::PriceError, utils::normalize_address};

/// The set of tokens a collection cycle covers. May change between cycles.
#[async_trait]
pub trait TokenUniverse: Send + Sync {
    async fn tokens(&self) -> Result<Vec<String>>;
}

/// Configured default tokens plus tokens registered at runtime.
///
/// Registrations are reference counted: a token registered by several callers
/// stays watched until the last one lets go.
pub struct WatchList {
    defaults: Vec<String>,
    watched: RwLock<FxHashMap<String, usize>>,
}

impl WatchList {
    /// Invalid default addresses are dropped with a log line.
    pub fn new(defaults: &[String]) -> Self {
        let defaults = defaults
            .iter()
            .filter_map(|raw| match normalize_address(raw) {
                Ok(token) => Some(token),
                Err(e) => {
                    log::warn!("Ignoring default token: {}", e);
                    None
                },
            })
            .collect();

        Self {
            defaults,
            watched: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn watch(&self, token: &str) -> Result<String, PriceError> {
        let token = normalize_address(token)?;
        *self.watched.write().entry(token.clone()).or_insert(0) += 1;
        debug!("Watching {}", token);
        Ok(token)
    }

    /// Returns true when the last reference to `token` was released.
    pub fn unwatch(&self, token: &str) -> bool {
        let Ok(token) = normalize_address(token) else {
            return false;
        };

        let mut watched = self.watched.write();
        match watched.get_mut(&token) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            },
            Some(_) => {
                watched.remove(&token);
                true
            },
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.defaults.clone();
        tokens.extend(self.watched.read().keys().cloned());
        tokens.sort();
        tokens.dedup();
        tokens
    }
}

#[async_trait]
impl TokenUniverse for WatchList {
    async fn tokens(&self) -> Result<Vec<String>> {
        Ok(self.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WETH: &str = "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2";
    const USDC: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";

    #[tokio::test]
    async fn test_defaults_and_registrations_merge() {
        let list = WatchList::new(&[WETH.to_string(), "garbage address".to_string()]);
        list.watch(&USDC.to_uppercase().replacen("0X", "0x", 1)).unwrap();
        list.watch(WETH).unwrap();

        assert_eq!(list.tokens().await.unwrap(), vec![USDC.to_string(), WETH.to_string()]);
    }

    #[test]
    fn test_unwatch_is_reference_counted() {
        let list = WatchList::new(&[]);
        list.watch(USDC).unwrap();
        list.watch(USDC).unwrap();

        assert!(!list.unwatch(USDC));
        assert_eq!(list.snapshot(), vec![USDC.to_string()]);
        assert!(list.unwatch(USDC));
        assert!(list.snapshot().is_empty());
        assert!(!list.unwatch(USDC));
    }
}
