//! Job to collect current prices for a set of tokens.
//!
//! Issues one fresh fetch per distinct token through the batch fetcher, which
//! coalesces them into sub-batches. Quote caches are bypassed so every cycle
//! folds a current sample. Individual failures are counted, never
//! propagated: the cycle always completes with a success/failure breakdown.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{info, warn};
use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::{
    fetcher::BatchFetcher,
    utils::{normalize_address, Clock},
};

/// Outcome of one collection cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Retried on the next scheduled cycle, not within this one
    pub failed_tokens: Vec<String>,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

pub async fn run(fetcher: &BatchFetcher, clock: &dyn Clock, tokens: &[String]) -> CollectionStats {
    info!("Starting collect_prices job for {} token(s)...", tokens.len());

    let started_at = clock.now();
    let mut failed_tokens = Vec::new();
    let mut invalid = 0;

    // Normalize first so checksummed and lowercased duplicates count once
    let mut seen = FxHashSet::default();
    let mut unique = Vec::with_capacity(tokens.len());
    for raw in tokens {
        match normalize_address(raw) {
            Ok(token) => {
                if seen.insert(token.clone()) {
                    unique.push(token);
                }
            },
            Err(e) => {
                warn!("Skipping token in collection: {}", e);
                failed_tokens.push(raw.clone());
                invalid += 1;
            },
        }
    }

    let results = join_all(unique.iter().map(|token| fetcher.fetch_fresh(token))).await;

    let mut succeeded = 0;
    let mut not_found = 0;
    for (token, result) in unique.iter().zip(results) {
        match result {
            Ok(_) => succeeded += 1,
            Err(e) => {
                if e.is_retryable() {
                    warn!("Failed to collect price for {}: {}", token, e);
                } else {
                    not_found += 1;
                }
                failed_tokens.push(token.clone());
            },
        }
    }

    let finished_at = clock.now();
    let stats = CollectionStats {
        total: unique.len() + invalid,
        succeeded,
        failed: failed_tokens.len(),
        failed_tokens,
        duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        finished_at,
    };

    info!(
        "Completed collect_prices job in {}ms ({} ok, {} failed, {} without price)",
        stats.duration_ms,
        stats.succeeded,
        stats.failed,
        not_found
    );
    stats
}
