use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use tracing::debug;

use crate::error::{SyncError, TransientPersistError};
use crate::key::Key;
use crate::metrics_consts::{SINK_CALLS, SINK_LATENCY};

/// A slow and unreliable store holding the persisted total of every key.
///
/// Amounts are added to the stored total, never written over it, so a retried amount that was
/// in fact applied would be counted twice. Callers must only retry amounts they know failed.
#[async_trait]
pub trait PersistSink<K: Key>: Send + Sync + 'static {
    async fn add_to_persisted_total(
        &self,
        key: &K,
        amount: u64,
    ) -> Result<(), TransientPersistError>;
}

#[async_trait]
impl<K: Key, T: PersistSink<K>> PersistSink<K> for Arc<T> {
    async fn add_to_persisted_total(
        &self,
        key: &K,
        amount: u64,
    ) -> Result<(), TransientPersistError> {
        (**self).add_to_persisted_total(key, amount).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedSinkConfig {
    pub min_latency: time::Duration,
    pub max_latency: time::Duration,
    /// Probability in `[0, 1]` that any single call fails.
    pub failure_rate: f64,
}

impl SimulatedSinkConfig {
    pub fn validate(&self) -> Result<(), SyncError> {
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(SyncError::SinkConfigError(format!(
                "failure rate {} is outside [0, 1]",
                self.failure_rate
            )));
        }
        if self.min_latency > self.max_latency {
            return Err(SyncError::SinkConfigError(format!(
                "minimum latency {:?} exceeds maximum latency {:?}",
                self.min_latency, self.max_latency
            )));
        }
        Ok(())
    }
}

impl Default for SimulatedSinkConfig {
    fn default() -> Self {
        Self {
            min_latency: time::Duration::from_millis(10),
            max_latency: time::Duration::from_millis(200),
            failure_rate: 0.3,
        }
    }
}

/// In-process stand-in for a remote counter store: every call sleeps for a random latency and
/// fails with the configured probability. Successful calls add to an internal per-key total.
pub struct SimulatedSink<K: Key> {
    config: SimulatedSinkConfig,
    totals: DashMap<K, u64>,
    calls: AtomicU64,
    failures: AtomicU64,
}

impl<K: Key> SimulatedSink<K> {
    pub fn new(config: SimulatedSinkConfig) -> Result<Self, SyncError> {
        config.validate()?;

        Ok(Self {
            config,
            totals: DashMap::new(),
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    /// The total the store holds for `key`, zero if it never received anything.
    pub fn persisted_total(&self, key: &K) -> u64 {
        self.totals.get(key).map(|total| *total).unwrap_or(0)
    }

    pub fn totals(&self) -> Vec<(K, u64)> {
        let mut totals: Vec<(K, u64)> = self
            .totals
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        totals.sort_unstable();
        totals
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn roll(&self) -> (time::Duration, bool) {
        let mut rng = rand::thread_rng();
        let spread = self.config.max_latency - self.config.min_latency;
        let latency = self.config.min_latency + spread.mul_f64(rng.gen::<f64>());
        (latency, rng.gen_bool(self.config.failure_rate))
    }
}

#[async_trait]
impl<K: Key> PersistSink<K> for SimulatedSink<K> {
    async fn add_to_persisted_total(
        &self,
        key: &K,
        amount: u64,
    ) -> Result<(), TransientPersistError> {
        // The rng is not Send, so roll the dice before suspending.
        let (latency, fail) = self.roll();
        tokio::time::sleep(latency).await;

        self.calls.fetch_add(1, Ordering::Relaxed);
        metrics::histogram!(SINK_LATENCY).record(latency.as_secs_f64() * 1000.0);

        if fail {
            self.failures.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(SINK_CALLS, &[("result", "failed")]).increment(1);
            debug!(key = %key, amount, "simulated store rejected update");
            return Err(TransientPersistError::Unavailable(
                "simulated outage".to_owned(),
            ));
        }

        *self.totals.entry(key.clone()).or_insert(0) += amount;
        metrics::counter!(SINK_CALLS, &[("result", "success")]).increment(1);

        Ok(())
    }
}
