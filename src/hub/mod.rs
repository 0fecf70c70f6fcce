//! Subscription Hub: per-token fan-out of price and chart updates.
//!
//! Each subscriber owns a bounded mailbox drained by its own tokio task, so a
//! slow or failing callback only delays itself. Publishing holds the registry
//! read lock just long enough to enqueue.

mod mailbox;

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::runtime::Handle;

use self::mailbox::{Mailbox, SUBSCRIBER_QUEUE_CAPACITY};
use crate::candles::Candle;

/// Latest price pushed to `price` subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceUpdate {
    pub token_address: String,
    pub price: BigDecimal,
    pub observed_at: DateTime<Utc>,
}

/// Full candle history pushed to `chart` subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChartUpdate {
    pub token_address: String,
    pub candles: Vec<Candle>,
}

/// What a subscriber callback receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent<T> {
    Update(T),
    /// The token was evicted; no further events follow.
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Price,
    Chart,
}

pub type Callback<T> = Arc<dyn Fn(StreamEvent<T>) -> anyhow::Result<()> + Send + Sync>;

struct Subscriber<T> {
    id: u64,
    mailbox: Arc<Mailbox<T>>,
}

impl<T> Drop for Subscriber<T> {
    fn drop(&mut self) {
        self.mailbox.disconnect();
    }
}

#[derive(Default)]
struct TokenSubscribers {
    price: Vec<Subscriber<PriceUpdate>>,
    chart: Vec<Subscriber<ChartUpdate>>,
}

impl TokenSubscribers {
    fn is_empty(&self) -> bool {
        self.price.is_empty() && self.chart.is_empty()
    }
}

/// Registry of live subscriptions keyed by token address.
///
/// The hub holds no price data; snapshots are supplied by the cache, which
/// registers subscribers under the token's write lock so no update can slip
/// between a snapshot and the first queued event.
#[derive(Default)]
pub struct SubscriptionHub {
    tokens: RwLock<FxHashMap<String, TokenSubscribers>>,
    next_id: AtomicU64,
    /// Runtime delivery tasks are spawned on, so subscribing works from
    /// threads outside any Tokio context
    runtime: Option<Handle>,
}

/// Pending registration, activated once the caller has released its locks.
pub(crate) struct Registration<T> {
    subscription: Subscription,
    mailbox: Arc<Mailbox<T>>,
    runtime: Option<Handle>,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hub whose delivery tasks always run on `runtime`.
    pub fn with_runtime(runtime: Handle) -> Self {
        Self {
            runtime: Some(runtime),
            ..Self::default()
        }
    }

    pub(crate) fn register_price(self: &Arc<Self>, token: &str) -> Registration<PriceUpdate> {
        let (id, mailbox) = self.mailbox();
        self.tokens
            .write()
            .entry(token.to_string())
            .or_default()
            .price
            .push(Subscriber {
                id,
                mailbox: Arc::clone(&mailbox),
            });
        self.registration(token, SubscriptionKind::Price, id, mailbox)
    }

    pub(crate) fn register_chart(self: &Arc<Self>, token: &str) -> Registration<ChartUpdate> {
        let (id, mailbox) = self.mailbox();
        self.tokens
            .write()
            .entry(token.to_string())
            .or_default()
            .chart
            .push(Subscriber {
                id,
                mailbox: Arc::clone(&mailbox),
            });
        self.registration(token, SubscriptionKind::Chart, id, mailbox)
    }

    fn mailbox<T>(&self) -> (u64, Arc<Mailbox<T>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        (id, Arc::new(Mailbox::new(SUBSCRIBER_QUEUE_CAPACITY)))
    }

    fn registration<T>(
        self: &Arc<Self>,
        token: &str,
        kind: SubscriptionKind,
        id: u64,
        mailbox: Arc<Mailbox<T>>,
    ) -> Registration<T> {
        debug!("Subscriber {} registered for {:?} on {}", id, kind, token);
        Registration {
            subscription: Subscription {
                hub: Arc::clone(self),
                token_address: token.to_string(),
                kind,
                id,
                active: Arc::new(AtomicBool::new(true)),
            },
            mailbox,
            runtime: self.runtime.clone().or_else(|| Handle::try_current().ok()),
        }
    }

    /// Pushes a price update to every price subscriber of `update.token_address`.
    pub fn notify_price_changed(&self, update: &PriceUpdate) {
        let closed = {
            let tokens = self.tokens.read();
            match tokens.get(&update.token_address) {
                Some(subs) => broadcast(&subs.price, update),
                None => return,
            }
        };
        if !closed.is_empty() {
            self.prune(&update.token_address, SubscriptionKind::Price, &closed);
        }
    }

    /// Pushes the candle history to every chart subscriber of `update.token_address`.
    pub fn notify_chart_changed(&self, update: &ChartUpdate) {
        let closed = {
            let tokens = self.tokens.read();
            match tokens.get(&update.token_address) {
                Some(subs) => broadcast(&subs.chart, update),
                None => return,
            }
        };
        if !closed.is_empty() {
            self.prune(&update.token_address, SubscriptionKind::Chart, &closed);
        }
    }

    /// Sends `Ended` to every subscriber of `token` and forgets them.
    ///
    /// Returns the number of subscriptions closed.
    pub fn end_stream(&self, token: &str) -> usize {
        let Some(subs) = self.tokens.write().remove(token) else {
            return 0;
        };

        for s in &subs.price {
            s.mailbox.push(StreamEvent::Ended);
        }
        for s in &subs.chart {
            s.mailbox.push(StreamEvent::Ended);
        }

        let closed = subs.price.len() + subs.chart.len();
        debug!("Ended {} subscription(s) for {}", closed, token);
        closed
    }

    pub fn has_subscribers(&self, token: &str) -> bool {
        self.tokens
            .read()
            .get(token)
            .map(|subs| !subs.is_empty())
            .unwrap_or(false)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tokens
            .read()
            .values()
            .map(|subs| subs.price.len() + subs.chart.len())
            .sum()
    }

    fn remove(&self, token: &str, kind: SubscriptionKind, id: u64) {
        self.prune(token, kind, &[id]);
    }

    fn prune(&self, token: &str, kind: SubscriptionKind, ids: &[u64]) {
        let mut tokens = self.tokens.write();
        let Some(subs) = tokens.get_mut(token) else {
            return;
        };

        match kind {
            SubscriptionKind::Price => subs.price.retain(|s| !ids.contains(&s.id)),
            SubscriptionKind::Chart => subs.chart.retain(|s| !ids.contains(&s.id)),
        }

        if subs.is_empty() {
            tokens.remove(token);
        }
    }
}

/// Enqueues `event` for each subscriber, returning ids whose receiver is gone.
fn broadcast<T: Clone>(subs: &[Subscriber<T>], event: &T) -> Vec<u64> {
    subs.iter()
        .filter(|s| !s.mailbox.push(StreamEvent::Update(event.clone())))
        .map(|s| s.id)
        .collect()
}

/// Closes the mailbox when the delivery task ends, however it ends.
struct CloseOnDrop<T>(Arc<Mailbox<T>>);

impl<T> Drop for CloseOnDrop<T> {
    fn drop(&mut self) {
        self.0.close();
    }
}

impl<T: Send + 'static> Registration<T> {
    /// Delivers the optional snapshot synchronously, then spawns the task
    /// that drains queued updates into `callback`.
    ///
    /// Must be called without holding cache locks. Without a runtime to
    /// deliver on, only the snapshot is delivered and the subscription is
    /// returned inactive.
    pub(crate) fn activate(self, snapshot: Option<T>, callback: Callback<T>) -> Subscription {
        let Registration {
            subscription,
            mailbox,
            runtime,
        } = self;

        if let Some(snapshot) = snapshot {
            deliver(&callback, subscription.id, StreamEvent::Update(snapshot));
        }

        let Some(runtime) = runtime else {
            error!(
                "No Tokio runtime available to deliver updates to subscriber {}",
                subscription.id
            );
            mailbox.close();
            subscription.unsubscribe();
            return subscription;
        };

        let id = subscription.id;
        let active = Arc::clone(&subscription.active);
        runtime.spawn(async move {
            let _close = CloseOnDrop(Arc::clone(&mailbox));
            while let Some(event) = mailbox.recv().await {
                if !active.load(Ordering::Acquire) {
                    break;
                }

                let dropped = mailbox.take_dropped();
                if dropped > 0 {
                    warn!("Subscriber {} fell behind, dropped {} update(s)", id, dropped);
                }

                let ended = matches!(event, StreamEvent::Ended);
                deliver(&callback, id, event);
                if ended {
                    active.store(false, Ordering::Release);
                    break;
                }
            }
        });

        subscription
    }
}

fn deliver<T>(callback: &Callback<T>, id: u64, event: StreamEvent<T>) {
    match catch_unwind(AssertUnwindSafe(|| callback(event))) {
        Ok(Ok(())) => {},
        Ok(Err(e)) => warn!("Subscriber {} callback failed: {:#}", id, e),
        Err(_) => warn!("Subscriber {} callback panicked", id),
    }
}

/// Handle returned to subscribers.
///
/// Dropping it does not unsubscribe; call [`Subscription::unsubscribe`].
pub struct Subscription {
    hub: Arc<SubscriptionHub>,
    token_address: String,
    kind: SubscriptionKind,
    id: u64,
    active: Arc<AtomicBool>,
}

impl Subscription {
    /// Stops delivery. Idempotent, and safe to call from inside the callback.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.hub.remove(&self.token_address, self.kind, self.id);
            debug!(
                "Subscriber {} unsubscribed from {:?} on {}",
                self.id, self.kind, self.token_address
            );
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token_address(&self) -> &str {
        &self.token_address
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("token_address", &self.token_address)
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
