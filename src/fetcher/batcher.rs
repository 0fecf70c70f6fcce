use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use log::{debug, error, info, warn};
use moka::future::Cache;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::oneshot;

use super::PriceOracle;
use crate::{
    cache::PriceCache,
    config::FetcherSettings,
    error::PriceError,
    utils::{normalize_address, validate_usd_price, Clock},
};

/// A resolved price for one token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub token_address: String,
    pub price: BigDecimal,
    pub observed_at: DateTime<Utc>,
}

type Waiter = oneshot::Sender<Result<Quote, PriceError>>;

/// Requests gathered during one coalescing window.
struct PendingBatch {
    tokens: FxHashMap<String, Vec<Waiter>>,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct BatchState {
    /// Window currently accepting requests, if any
    accepting: Option<PendingBatch>,
    /// Tokens whose sub-batch has been dispatched but not resolved
    in_flight: FxHashMap<String, Vec<Waiter>>,
}

/// Coalescing price fetcher.
///
/// Every request arriving within one window shares a single upstream round
/// trip per token. The window is split into sub-batches that are launched a
/// short delay apart and retried independently, so one failing sub-batch
/// never fails the waiters of another.
#[derive(Clone)]
pub struct BatchFetcher {
    inner: Arc<Inner>,
}

struct Inner {
    oracle: Arc<dyn PriceOracle>,
    cache: Arc<PriceCache>,
    clock: Arc<dyn Clock>,
    settings: FetcherSettings,
    state: Mutex<BatchState>,
    /// Recently resolved quotes, served without an upstream call
    recent: Cache<String, Quote>,
    /// Tokens the oracle had no price for. TTL lets them be retried later
    not_found: Cache<String, ()>,
    upstream_calls: AtomicU64,
}

impl BatchFetcher {
    pub fn new(
        oracle: Arc<dyn PriceOracle>,
        cache: Arc<PriceCache>,
        clock: Arc<dyn Clock>,
        settings: FetcherSettings,
    ) -> Self {
        let recent = Cache::builder()
            .max_capacity(50_000)
            .time_to_live(Duration::from_secs(settings.price_ttl_secs.max(1)))
            .build();

        let not_found = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(settings.not_found_ttl_secs.max(1)))
            .build();

        Self {
            inner: Arc::new(Inner {
                oracle,
                cache,
                clock,
                settings,
                state: Mutex::new(BatchState::default()),
                recent,
                not_found,
                upstream_calls: AtomicU64::new(0),
            }),
        }
    }

    /// Resolves the current price of `token`.
    ///
    /// Never hangs: the result arrives after at most
    /// `max_retries * request_timeout` plus backoff.
    pub async fn request_price(&self, token: &str) -> Result<Quote, PriceError> {
        let token = normalize_address(token)?;

        if let Some(quote) = self.inner.recent.get(&token).await {
            return Ok(quote);
        }
        if self.inner.not_found.contains_key(&token) {
            return Err(PriceError::TokenNotFound(token));
        }

        self.wait_for(token).await
    }

    /// Resolves a price observed now, bypassing the recent-quote and
    /// not-found caches.
    ///
    /// Still coalesces with concurrent requests and joins a fetch already in
    /// flight. Scheduled collections use this so every cycle folds a sample.
    pub async fn fetch_fresh(&self, token: &str) -> Result<Quote, PriceError> {
        let token = normalize_address(token)?;
        self.wait_for(token).await
    }

    async fn wait_for(&self, token: String) -> Result<Quote, PriceError> {
        let rx = self.enqueue(token);
        rx.await.unwrap_or(Err(PriceError::Shutdown))
    }

    /// Number of upstream oracle calls made so far, retries included.
    pub fn upstream_calls(&self) -> u64 {
        self.inner.upstream_calls.load(Ordering::Relaxed)
    }

    fn enqueue(&self, token: String) -> oneshot::Receiver<Result<Quote, PriceError>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.state.lock();

        if let Some(waiters) = state.in_flight.get_mut(&token) {
            waiters.push(tx);
            return rx;
        }

        match state.accepting.as_mut() {
            Some(batch) => batch.tokens.entry(token).or_default().push(tx),
            None => {
                let mut tokens = FxHashMap::default();
                tokens.insert(token, vec![tx]);
                state.accepting = Some(PendingBatch {
                    tokens,
                    created_at: self.inner.clock.now(),
                });

                let fetcher = self.clone();
                let window = self.inner.settings.coalescing_window();
                tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    fetcher.close_window().await;
                });
            },
        }

        rx
    }

    /// Stops accepting into the current window and dispatches its sub-batches.
    async fn close_window(&self) {
        let (mut tokens, created_at) = {
            let mut state = self.inner.state.lock();
            let Some(batch) = state.accepting.take() else {
                return;
            };

            let mut tokens = Vec::with_capacity(batch.tokens.len());
            for (token, waiters) in batch.tokens {
                tokens.push(token.clone());
                state.in_flight.entry(token).or_default().extend(waiters);
            }
            (tokens, batch.created_at)
        };
        tokens.sort();

        let size = self.inner.settings.sub_batch_size.max(1);
        let sub_batches: Vec<Vec<String>> = tokens.chunks(size).map(|c| c.to_vec()).collect();

        debug!(
            "Dispatching {} token(s) in {} sub-batch(es), window opened at {}",
            tokens.len(),
            sub_batches.len(),
            created_at
        );

        for (i, chunk) in sub_batches.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.inner.settings.inter_batch_delay()).await;
            }
            let fetcher = self.clone();
            tokio::spawn(async move {
                let outcome = AssertUnwindSafe(fetcher.run_sub_batch(chunk.clone()))
                    .catch_unwind()
                    .await;
                if outcome.is_err() {
                    // Waiters of a dead task would otherwise hang forever
                    error!("Sub-batch [{}] panicked", chunk.join(", "));
                    let err = PriceError::UpstreamUnavailable {
                        attempts: 0,
                        reason: "sub-batch task panicked".to_string(),
                    };
                    for token in &chunk {
                        fetcher.resolve(token, Err(err.clone()));
                    }
                }
            });
        }
    }

    async fn run_sub_batch(&self, tokens: Vec<String>) {
        let prices = match self.fetch_with_retry(&tokens).await {
            Ok(prices) => prices,
            Err(e) => {
                for token in &tokens {
                    self.resolve(token, Err(e.clone()));
                }
                return;
            },
        };

        let observed_at = self.inner.clock.now();
        for token in tokens {
            let result = match prices.get(&token).and_then(validate_usd_price) {
                Some(price) => {
                    // Written through before waking waiters so they can read candles
                    self.inner.cache.write(&token, &price, observed_at);
                    let quote = Quote {
                        token_address: token.clone(),
                        price,
                        observed_at,
                    };
                    self.inner.recent.insert(token.clone(), quote.clone()).await;
                    Ok(quote)
                },
                None => {
                    debug!("No usable price for {}", token);
                    self.inner.not_found.insert(token.clone(), ()).await;
                    Err(PriceError::TokenNotFound(token.clone()))
                },
            };
            self.resolve(&token, result);
        }
    }

    async fn fetch_with_retry(
        &self,
        tokens: &[String],
    ) -> Result<FxHashMap<String, BigDecimal>, PriceError> {
        let max_attempts = self.inner.settings.max_retries.max(1);
        let timeout = self.inner.settings.request_timeout();
        let mut reason = String::new();

        for attempt in 1..=max_attempts {
            self.inner.upstream_calls.fetch_add(1, Ordering::Relaxed);

            let call = AssertUnwindSafe(self.inner.oracle.fetch_prices(tokens)).catch_unwind();
            match tokio::time::timeout(timeout, call).await {
                Ok(Ok(Ok(prices))) => return Ok(prices),
                Ok(Ok(Err(e))) => reason = format!("{:#}", e),
                Ok(Err(_)) => reason = "oracle panicked".to_string(),
                Err(_) => reason = format!("timed out after {:?}", timeout),
            }

            if attempt < max_attempts {
                let delay = self.inner.settings.retry_delay(attempt);
                warn!(
                    "Oracle sub-batch of {} token(s) failed (attempt {}/{}), retrying in {:?}: {}",
                    tokens.len(),
                    attempt,
                    max_attempts,
                    delay,
                    reason
                );
                tokio::time::sleep(delay).await;
            }
        }

        error!(
            "Oracle sub-batch [{}] failed after {} attempts: {}",
            tokens.join(", "),
            max_attempts,
            reason
        );
        Err(PriceError::UpstreamUnavailable {
            attempts: max_attempts,
            reason,
        })
    }

    fn resolve(&self, token: &str, result: Result<Quote, PriceError>) {
        let waiters = self.inner.state.lock().in_flight.remove(token);
        let Some(waiters) = waiters else {
            return;
        };

        for waiter in waiters {
            // Receiver gone means the caller stopped waiting; nothing to do
            let _ = waiter.send(result.clone());
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let calls = self.upstream_calls.load(Ordering::Relaxed);
        if calls > 0 {
            info!("Batch fetcher shut down after {} upstream call(s)", calls);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::time::Duration;

    use super::*;
    use crate::cache::CacheConfig;
    use crate::candles::CandleInterval;
    use crate::fetcher::mock::MockOracle;
    use crate::hub::SubscriptionHub;
    use crate::utils::SystemClock;

    const USDC: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";
    const USDT: &str = "0xdac17f958d2ee523a2206206994597c13d831ec7";
    const DAI: &str = "0x6b175474e89094c44da98b954eedeac495271d0f";

    fn fetcher(oracle: Arc<MockOracle>, settings: FetcherSettings) -> (BatchFetcher, Arc<PriceCache>) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cache = Arc::new(PriceCache::new(
            CacheConfig {
                bucket_width: CandleInterval::Minute15,
                max_candles: 48,
                retention: Duration::from_secs(86_400),
                stale_after: Duration::from_secs(900),
            },
            Arc::new(SubscriptionHub::new()),
            clock.clone(),
        ));
        (
            BatchFetcher::new(oracle, cache.clone(), clock, settings),
            cache,
        )
    }

    fn d(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_coalesce_into_one_call() {
        let oracle = Arc::new(MockOracle::with_prices(&[(USDC, "1.0001")]));
        let (fetcher, _) = fetcher(oracle.clone(), FetcherSettings::default());

        let requests = (0..10).map(|_| fetcher.request_price(USDC));
        let results = futures::future::join_all(requests).await;

        assert!(results.iter().all(|r| r.as_ref().map(|q| q.price == d("1.0001")).unwrap_or(false)));
        assert_eq!(oracle.calls(), 1);
        assert_eq!(fetcher.upstream_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_splits_into_sub_batches() {
        let oracle = Arc::new(MockOracle::with_prices(&[(USDC, "1"), (USDT, "1"), (DAI, "1")]));
        let settings = FetcherSettings {
            sub_batch_size: 2,
            ..FetcherSettings::default()
        };
        let (fetcher, _) = fetcher(oracle.clone(), settings);

        let results = futures::future::join_all([
            fetcher.request_price(USDC),
            fetcher.request_price(USDT),
            fetcher.request_price(DAI),
        ])
        .await;

        assert!(results.iter().all(|r| r.is_ok()));
        let batches = oracle.requests();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() <= 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_twice_then_succeed() {
        let oracle = Arc::new(MockOracle::with_prices(&[(USDC, "0.9999")]));
        oracle.fail_next(2);
        let (fetcher, cache) = fetcher(oracle.clone(), FetcherSettings::default());

        let results =
            futures::future::join_all([fetcher.request_price(USDC), fetcher.request_price(USDC)])
                .await;

        for result in results {
            assert_eq!(result.unwrap().price, d("0.9999"));
        }
        assert_eq!(oracle.calls(), 3);
        // Written through before the waiter woke
        assert_eq!(cache.read(USDC).unwrap().latest_price, d("0.9999"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_sub_batch_fails_in_isolation() {
        let oracle = Arc::new(MockOracle::with_prices(&[(USDC, "1"), (USDT, "1")]));
        oracle.always_fail(USDT);
        let settings = FetcherSettings {
            sub_batch_size: 1,
            ..FetcherSettings::default()
        };
        let (fetcher, _) = fetcher(oracle.clone(), settings);

        let (usdc, usdt) = tokio::join!(fetcher.request_price(USDC), fetcher.request_price(USDT));

        assert_eq!(usdc.unwrap().price, d("1"));
        match usdt {
            Err(PriceError::UpstreamUnavailable { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected upstream failure, got {:?}", other),
        }
        // 1 call for USDC, 3 attempts for USDT
        assert_eq!(oracle.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failed_attempt() {
        let oracle = Arc::new(MockOracle::with_prices(&[(USDC, "1")]));
        oracle.set_latency(Duration::from_secs(60));
        let (fetcher, _) = fetcher(oracle.clone(), FetcherSettings::default());

        match fetcher.request_price(USDC).await {
            Err(PriceError::UpstreamUnavailable { attempts, reason }) => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("timed out"), "{}", reason);
            },
            other => panic!("expected timeout failure, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_token_is_not_found_and_remembered() {
        let oracle = Arc::new(MockOracle::with_prices(&[(USDC, "1")]));
        let (fetcher, _) = fetcher(oracle.clone(), FetcherSettings::default());

        let (usdc, dai) = tokio::join!(fetcher.request_price(USDC), fetcher.request_price(DAI));
        assert!(usdc.is_ok());
        assert_eq!(dai, Err(PriceError::TokenNotFound(DAI.to_string())));
        assert_eq!(oracle.calls(), 1);

        // Served from the negative cache
        assert_eq!(
            fetcher.request_price(DAI).await,
            Err(PriceError::TokenNotFound(DAI.to_string()))
        );
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_joins_in_flight_fetch() {
        let oracle = Arc::new(MockOracle::with_prices(&[(USDC, "1")]));
        oracle.set_latency(Duration::from_secs(2));
        let (fetcher, _) = fetcher(oracle.clone(), FetcherSettings::default());

        let first = {
            let fetcher = fetcher.clone();
            tokio::spawn(async move { fetcher.request_price(USDC).await })
        };
        // Window has closed and the oracle call is in progress
        tokio::time::sleep(Duration::from_millis(500)).await;
        let second = fetcher.request_price(USDC).await;

        assert!(first.await.unwrap().is_ok());
        assert!(second.is_ok());
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_address_rejected_without_upstream() {
        let oracle = Arc::new(MockOracle::with_prices(&[]));
        let (fetcher, _) = fetcher(oracle.clone(), FetcherSettings::default());

        assert!(matches!(
            fetcher.request_price("0xnothex").await,
            Err(PriceError::InvalidAddress(_))
        ));
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_batches_launch_inter_batch_delay_apart() {
        let oracle = Arc::new(MockOracle::with_prices(&[(USDC, "1"), (USDT, "1"), (DAI, "1")]));
        let settings = FetcherSettings {
            sub_batch_size: 1,
            ..FetcherSettings::default()
        };
        let window = settings.coalescing_window();
        let delay = settings.inter_batch_delay();
        let (fetcher, _) = fetcher(oracle.clone(), settings);

        let started = tokio::time::Instant::now();
        let results = futures::future::join_all([
            fetcher.request_price(USDC),
            fetcher.request_price(USDT),
            fetcher.request_price(DAI),
        ])
        .await;
        assert!(results.iter().all(|r| r.is_ok()));

        let times = oracle.call_times();
        assert_eq!(times.len(), 3);
        // Timer wheel granularity is 1ms
        let slack = Duration::from_millis(2);
        let first = times[0] - started;
        assert!(first >= window && first <= window + slack, "{:?}", first);
        for pair in times.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= delay && gap <= delay + slack, "{:?}", gap);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_oracle_fails_waiters_instead_of_hanging() {
        let oracle = Arc::new(MockOracle::with_prices(&[(USDC, "1")]));
        oracle.set_panicking(true);
        let (fetcher, _) = fetcher(oracle.clone(), FetcherSettings::default());

        let first = tokio::time::timeout(Duration::from_secs(3_600), fetcher.request_price(USDC))
            .await
            .expect("first request resolved");
        match first {
            Err(PriceError::UpstreamUnavailable { attempts, reason }) => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("panicked"), "{}", reason);
            },
            other => panic!("expected upstream failure, got {:?}", other),
        }

        // No stale in-flight entry is left for later requests to join
        let second = tokio::time::timeout(Duration::from_secs(3_600), fetcher.request_price(USDC))
            .await
            .expect("second request resolved");
        assert!(matches!(second, Err(PriceError::UpstreamUnavailable { .. })));

        oracle.set_panicking(false);
        assert_eq!(fetcher.request_price(USDC).await.unwrap().price, d("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_fresh_bypasses_quote_caches() {
        let oracle = Arc::new(MockOracle::with_prices(&[(USDC, "1")]));
        let (fetcher, cache) = fetcher(oracle.clone(), FetcherSettings::default());

        assert_eq!(fetcher.request_price(USDC).await.unwrap().price, d("1"));
        oracle.set_price(USDC, "2");

        // Within the quote TTL a plain request is served from memory
        assert_eq!(fetcher.request_price(USDC).await.unwrap().price, d("1"));
        assert_eq!(oracle.calls(), 1);

        assert_eq!(fetcher.fetch_fresh(USDC).await.unwrap().price, d("2"));
        assert_eq!(oracle.calls(), 2);
        assert_eq!(cache.read(USDC).unwrap().latest_price, d("2"));

        // Missing tokens are asked for again too
        assert!(fetcher.request_price(DAI).await.is_err());
        oracle.set_price(DAI, "0.9997");
        assert!(fetcher.request_price(DAI).await.is_err());
        assert_eq!(fetcher.fetch_fresh(DAI).await.unwrap().price, d("0.9997"));
    }
}
