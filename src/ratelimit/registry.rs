//! Per-key registry of token buckets with idle eviction.

use std::borrow::Borrow;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::bucket::{Quota, TokenBucket};
use super::sweeper::{Sweep, Sweeper};
use crate::config::LimiterConfig;
use crate::error::{Result, TollgateError};

/// State tracked for one client key.
#[derive(Debug)]
struct Visitor {
    bucket: Mutex<TokenBucket>,
    last_seen: Mutex<Instant>,
}

impl Visitor {
    fn new(quota: Quota, now: Instant) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new_at(quota, now)),
            last_seen: Mutex::new(now),
        }
    }

    /// Record activity at `now`. Never moves `last_seen` backwards.
    fn touch(&self, now: Instant) {
        let mut last_seen = self.last_seen.lock();
        if now > *last_seen {
            *last_seen = now;
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_seen.lock())
    }
}

struct Inner<K> {
    /// Visitors indexed by client key
    visitors: DashMap<K, Arc<Visitor>>,
    /// Normalized configuration, fixed at construction
    config: LimiterConfig,
    quota: Quota,
    /// Running sweeper, `None` after shutdown
    sweeper: Mutex<Option<Sweeper>>,
}

impl<K> Inner<K>
where
    K: Eq + Hash,
{
    fn sweep_at(&self, now: Instant) -> usize {
        let threshold = self.config.idle_threshold();
        let mut evicted = 0;

        // `retain` holds each shard's write lock while evaluating, and
        // `check` refreshes `last_seen` under the same shard lock, so an
        // entry touched by an in-flight check is never evicted here.
        self.visitors.retain(|_, visitor| {
            let keep = visitor.idle_for(now) < threshold;
            if !keep {
                evicted += 1;
            }
            keep
        });

        evicted
    }
}

impl<K> Sweep for Inner<K>
where
    K: Eq + Hash + Send + Sync + 'static,
{
    fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }
}

/// A concurrent map from client keys to independent token buckets.
///
/// Buckets are created lazily on the first check for a key and evicted by a
/// background sweeper once the key has been idle for
/// [`LimiterConfig::idle_threshold`]. The handle is cheap to clone; all clones
/// share the same state. The sweeper stops on [`LimiterRegistry::shutdown`] or
/// once every handle has been dropped.
///
/// After shutdown the registry keeps admitting and rejecting as before, it
/// just no longer evicts idle keys on its own. [`LimiterRegistry::sweep`] can
/// still be called manually.
pub struct LimiterRegistry<K = String> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for LimiterRegistry<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> LimiterRegistry<K>
where
    K: Eq + Hash + Send + Sync + 'static,
{
    /// Create a registry and start its sweeper on the current Tokio runtime.
    ///
    /// Invalid configuration values are replaced with defaults (see
    /// [`LimiterConfig::normalize`]). Fails only when called outside a Tokio
    /// runtime.
    pub fn new(config: LimiterConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            TollgateError::Runtime(format!("LimiterRegistry needs a Tokio runtime: {}", e))
        })?;

        let config = config.normalized();
        let quota = Quota::try_from(&config)?;

        let inner = Arc::new(Inner {
            visitors: DashMap::new(),
            config,
            quota,
            sweeper: Mutex::new(None),
        });

        let sweeper = Sweeper::spawn(&runtime, Arc::downgrade(&inner), inner.config.sweep_interval());
        *inner.sweeper.lock() = Some(sweeper);

        info!(
            rate = inner.config.rate,
            capacity = inner.config.capacity,
            sweep_interval_secs = inner.config.sweep_interval_secs,
            idle_threshold_secs = inner.config.idle_threshold_secs,
            "Rate limiter registry initialized"
        );

        Ok(Self { inner })
    }

    /// Decide whether one unit of work for `key` may proceed.
    pub fn check<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + Debug + ?Sized,
    {
        self.check_at(key, Instant::now())
    }

    /// Like [`LimiterRegistry::check`], evaluated at `now`.
    pub fn check_at<Q>(&self, key: &Q, now: Instant) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + Debug + ?Sized,
    {
        // Only the shard lock guards lookup, creation and the `last_seen`
        // update. The bucket has its own lock so unrelated keys never wait
        // on each other's arithmetic.
        let visitor = match self.inner.visitors.get(key) {
            Some(entry) => {
                entry.touch(now);
                Arc::clone(entry.value())
            }
            None => {
                let entry = self
                    .inner
                    .visitors
                    .entry(key.to_owned())
                    .or_insert_with(|| {
                        debug!(key = ?key, "Creating new visitor bucket");
                        Arc::new(Visitor::new(self.inner.quota, now))
                    });
                entry.touch(now);
                Arc::clone(entry.value())
            }
        };

        let admitted = visitor.bucket.lock().try_consume_at(now);

        trace!(key = ?key, admitted, "Checked rate limit");
        if !admitted {
            debug!(key = ?key, "Rate limit exceeded");
        }

        admitted
    }

    /// Evict every key idle for at least the configured threshold.
    ///
    /// Returns the number of evicted keys.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Like [`LimiterRegistry::sweep`], evaluated at `now`.
    pub fn sweep_at(&self, now: Instant) -> usize {
        self.inner.sweep_at(now)
    }

    /// Stop the background sweeper and wait for it to exit.
    ///
    /// Calling this more than once is a no-op.
    pub async fn shutdown(&self) {
        let sweeper = self.inner.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            info!("Shutting down rate limiter registry sweeper");
            sweeper.stop().await;
        }
    }

    /// Whether the background sweeper is still running.
    pub fn is_sweeping(&self) -> bool {
        self.inner
            .sweeper
            .lock()
            .as_ref()
            .is_some_and(|s| !s.is_finished())
    }

    /// Whether a bucket currently exists for `key`.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.visitors.contains_key(key)
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.inner.visitors.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.visitors.is_empty()
    }

    /// The normalized configuration in effect.
    pub fn config(&self) -> &LimiterConfig {
        &self.inner.config
    }
}
