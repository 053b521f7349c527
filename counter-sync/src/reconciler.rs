//! Delivery of observed increments to an unreliable `PersistSink`.
//!
//! Every key owns a pending amount and an in-flight marker, guarded together by a per-key mutex.
//! The two are only ever touched through three short critical sections:
//!
//!   - `enqueue_increment` adds to pending and, when no flush is outstanding, takes the whole
//!     pending amount as the next batch (snapshot-and-zero) and marks the key in flight;
//!   - a successful flush clears the marker and immediately takes the next batch if anything
//!     arrived while it was outstanding;
//!   - a failed flush adds its batch back to pending (fold-back) and clears the marker.
//!
//! No lock is held while the sink call is outstanding: the in-flight marker alone keeps a second
//! flush for the same key from starting. Because a batch is removed from pending before dispatch
//! and re-added only on failure, batches partition the increment stream and no increment can be
//! counted twice or dropped.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time;

use dashmap::DashMap;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::key::Key;
use crate::metrics_consts::{
    AUTO_DRAINED, FLUSHES_STARTED, FLUSH_ATTEMPT, FLUSH_BATCH_SIZE, FLUSH_TIME, FOLDED_BACK,
    INCREMENTS_ENQUEUED, PENDING, RETRIES_SCHEDULED, RETRIES_SUPERSEDED, RETRIGGERED,
};
use crate::retry::RetryMode;
use crate::sink::PersistSink;

#[derive(Debug, Default)]
struct KeyState {
    /// Sum of every amount ever enqueued.
    observed: u64,
    /// Enqueued but not part of any outstanding or successful flush.
    pending: u64,
    /// Sum of every batch the sink accepted.
    confirmed: u64,
    in_flight: bool,
    consecutive_failures: u32,
}

impl KeyState {
    /// Take the whole pending amount as a batch and mark the key in flight. Returns `None` when
    /// a flush is already outstanding or there is nothing to deliver.
    fn begin_flush(&mut self) -> Option<u64> {
        if self.in_flight || self.pending == 0 {
            return None;
        }
        self.in_flight = true;
        Some(std::mem::take(&mut self.pending))
    }

    /// Record an accepted batch, then take the next one if increments arrived in the meantime.
    fn complete_flush(&mut self, batch: u64) -> Option<u64> {
        self.in_flight = false;
        self.confirmed = self.confirmed.saturating_add(batch);
        self.consecutive_failures = 0;
        self.begin_flush()
    }

    /// Add a rejected batch back on top of whatever accumulated while it was outstanding.
    /// Returns the number of failures in a row for this key.
    fn fold_back(&mut self, batch: u64) -> u32 {
        self.in_flight = false;
        self.pending = self.pending.saturating_add(batch);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }
}

type KeySlot = Arc<Mutex<KeyState>>;

// Critical sections never panic, but recover the state anyway rather than wedge a key forever.
fn lock(slot: &KeySlot) -> MutexGuard<'_, KeyState> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Point-in-time view of the delivery state of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeySyncState<K> {
    pub key: K,
    pub observed: u64,
    pub confirmed: u64,
    pub pending: u64,
    pub in_flight: bool,
}

struct Inner<K: Key, S> {
    keys: DashMap<K, KeySlot>,
    sink: S,
    retry_mode: RetryMode,
    runtime: Handle,
}

/// Accumulates increments per key and delivers them to a `PersistSink`, folding failed batches
/// back in for a later attempt. Cloning is cheap and every clone shares the same state.
///
/// Flushes run as tasks on the Tokio runtime the reconciler was created on, so increments may be
/// enqueued from any thread, including plain OS threads outside the runtime.
pub struct Reconciler<K: Key, S> {
    inner: Arc<Inner<K, S>>,
}

impl<K: Key, S> Clone for Reconciler<K, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Key, S: PersistSink<K>> Reconciler<K, S> {
    /// Create a reconciler bound to the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime. Use `with_runtime` to bind one explicitly.
    pub fn new(sink: S, retry_mode: RetryMode) -> Self {
        Self::with_runtime(sink, retry_mode, Handle::current())
    }

    pub fn with_runtime(sink: S, retry_mode: RetryMode, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                keys: DashMap::new(),
                sink,
                retry_mode,
                runtime,
            }),
        }
    }

    pub fn retry_mode(&self) -> RetryMode {
        self.inner.retry_mode
    }

    /// Record `amount` as observed for `key` and start a flush unless one is already outstanding.
    /// Never blocks on the sink and never fails: delivery happens in the background.
    pub fn enqueue_increment(&self, key: K, amount: u64) {
        if amount == 0 {
            return;
        }

        let slot = self.slot(&key);
        let batch = {
            let mut state = lock(&slot);
            // Totals past u64::MAX are not representable, clamp them.
            state.observed = state.observed.saturating_add(amount);
            state.pending = state.pending.saturating_add(amount);
            state.begin_flush()
        };

        metrics::counter!(INCREMENTS_ENQUEUED).increment(amount);

        if let Some(batch) = batch {
            self.spawn_flush(key, slot, batch);
        }
    }

    /// Start a flush for every key that has something pending and nothing in flight. Under
    /// `RetryMode::AwaitNextTrigger` this is the only way to deliver folded-back amounts for a
    /// key that stopped receiving events. Returns the number of flushes started.
    pub fn retrigger_idle(&self) -> usize {
        let slots: Vec<(K, KeySlot)> = self
            .inner
            .keys
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut started = 0;
        for (key, slot) in slots {
            let batch = lock(&slot).begin_flush();
            if let Some(batch) = batch {
                info!(key = %key, amount = batch, "retriggering idle key");
                metrics::counter!(RETRIGGERED).increment(1);
                self.spawn_flush(key, slot, batch);
                started += 1;
            }
        }
        started
    }

    pub fn key_snapshot(&self, key: &K) -> Option<KeySyncState<K>> {
        let slot = self.inner.keys.get(key).map(|slot| Arc::clone(slot.value()))?;
        let state = lock(&slot);
        Some(KeySyncState {
            key: key.clone(),
            observed: state.observed,
            confirmed: state.confirmed,
            pending: state.pending,
            in_flight: state.in_flight,
        })
    }

    /// Every key seen so far, sorted by key.
    pub fn snapshot(&self) -> Vec<KeySyncState<K>> {
        let keys: Vec<K> = self
            .inner
            .keys
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut states: Vec<KeySyncState<K>> = keys
            .iter()
            .filter_map(|key| self.key_snapshot(key))
            .collect();
        states.sort_unstable_by(|a, b| a.key.cmp(&b.key));
        states
    }

    /// True when no key has anything pending or in flight.
    pub fn is_quiescent(&self) -> bool {
        self.inner.keys.iter().all(|entry| {
            let state = lock(entry.value());
            state.pending == 0 && !state.in_flight
        })
    }

    /// Poll until the reconciler is quiescent or `timeout` elapses. Returns whether it quiesced.
    pub async fn wait_for_quiescence(
        &self,
        poll_interval: time::Duration,
        timeout: time::Duration,
    ) -> bool {
        let start = tokio::time::Instant::now();
        loop {
            if self.is_quiescent() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    fn slot(&self, key: &K) -> KeySlot {
        if let Some(slot) = self.inner.keys.get(key) {
            return Arc::clone(slot.value());
        }
        Arc::clone(self.inner.keys.entry(key.clone()).or_default().value())
    }

    fn spawn_flush(&self, key: K, slot: KeySlot, batch: u64) {
        metrics::counter!(FLUSHES_STARTED).increment(1);
        let inner = Arc::clone(&self.inner);
        let runtime = inner.runtime.clone();
        runtime.spawn(async move { flush(inner, key, slot, batch).await });
    }
}

/// Deliver `batch` for `key`, then keep going for as long as there is something to deliver and
/// no other flush claimed the key. The key must already be marked in flight for `batch`.
async fn flush<K: Key, S: PersistSink<K>>(
    inner: Arc<Inner<K, S>>,
    key: K,
    slot: KeySlot,
    mut batch: u64,
) {
    loop {
        let labels = [("key", key.to_string())];
        metrics::histogram!(FLUSH_BATCH_SIZE, &labels).record(batch as f64);

        let start = tokio::time::Instant::now();
        let result = inner.sink.add_to_persisted_total(&key, batch).await;
        metrics::histogram!(FLUSH_TIME, &labels).record(start.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(()) => {
                let (next, pending) = {
                    let mut state = lock(&slot);
                    let next = state.complete_flush(batch);
                    (next, state.pending)
                };
                metrics::counter!(FLUSH_ATTEMPT, &[("result", "success")]).increment(1);
                metrics::gauge!(PENDING, &labels).set(pending as f64);
                debug!(key = %key, amount = batch, "flush confirmed");

                match next {
                    Some(next) => {
                        metrics::counter!(AUTO_DRAINED).increment(1);
                        batch = next;
                    }
                    None => return,
                }
            }
            Err(error) => {
                let (failures, pending) = {
                    let mut state = lock(&slot);
                    let failures = state.fold_back(batch);
                    (failures, state.pending)
                };
                metrics::counter!(FLUSH_ATTEMPT, &[("result", "failed")]).increment(1);
                metrics::counter!(FOLDED_BACK).increment(batch);
                metrics::gauge!(PENDING, &labels).set(pending as f64);
                warn!(
                    key = %key,
                    amount = batch,
                    pending,
                    failures,
                    "flush failed, folded back into pending: {}",
                    error
                );

                let policy = match inner.retry_mode {
                    RetryMode::AwaitNextTrigger => return,
                    RetryMode::Backoff(policy) => policy,
                };

                metrics::counter!(RETRIES_SCHEDULED).increment(1);
                tokio::time::sleep(policy.time_until_next_retry(failures - 1)).await;

                // Another increment may have started a flush while we slept, in which case that
                // flush now owns the key.
                let next = lock(&slot).begin_flush();
                match next {
                    Some(next) => batch = next,
                    None => {
                        metrics::counter!(RETRIES_SUPERSEDED).increment(1);
                        return;
                    }
                }
            }
        }
    }
}
