use std::collections::BTreeMap;
use std::sync::Arc;
use std::time;

use serde::Serialize;
use tracing::debug;

use crate::key::Key;
use crate::metrics_consts::{CONFIRMED, DRIFT, LOCAL, PENDING};
use crate::reconciler::Reconciler;
use crate::sink::PersistSink;
use crate::stats::ReportingSurface;
use crate::store::CounterStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftEntry<K> {
    pub key: K,
    /// Events counted locally.
    pub local: u64,
    /// Increments the sink is known to have accepted.
    pub confirmed: u64,
    /// Increments waiting for a flush, including folded-back failures.
    pub pending: u64,
    pub in_flight: bool,
    /// `local - confirmed`: pending plus whatever an outstanding flush is carrying.
    pub drift: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftReport<K> {
    pub entries: Vec<DriftEntry<K>>,
}

impl<K> DriftReport<K> {
    pub fn total_local(&self) -> u64 {
        self.entries.iter().map(|entry| entry.local).sum()
    }

    pub fn total_confirmed(&self) -> u64 {
        self.entries.iter().map(|entry| entry.confirmed).sum()
    }

    pub fn total_pending(&self) -> u64 {
        self.entries.iter().map(|entry| entry.pending).sum()
    }

    pub fn total_drift(&self) -> u64 {
        self.entries.iter().map(|entry| entry.drift).sum()
    }

    pub fn in_flight_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.in_flight).count()
    }
}

/// Compares local counts against what the sink has confirmed. Read-only and diagnostic: a
/// sink that keeps failing shows up here as drift that keeps growing.
pub struct DriftReporter<K: Key, S> {
    store: Arc<CounterStore<K>>,
    reconciler: Reconciler<K, S>,
}

impl<K: Key, S> Clone for DriftReporter<K, S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            reconciler: self.reconciler.clone(),
        }
    }
}

impl<K: Key, S: PersistSink<K>> DriftReporter<K, S> {
    pub fn new(store: Arc<CounterStore<K>>, reconciler: Reconciler<K, S>) -> Self {
        Self { store, reconciler }
    }

    pub fn report(&self) -> DriftReport<K> {
        // Delivery state first: an event is counted locally before it is enqueued, so reading in
        // this order never shows more confirmed than local.
        let synced = self.reconciler.snapshot();
        let local = self.store.snapshot();

        let mut entries: BTreeMap<K, DriftEntry<K>> = BTreeMap::new();
        for state in synced {
            entries.insert(
                state.key.clone(),
                DriftEntry {
                    key: state.key,
                    local: 0,
                    confirmed: state.confirmed,
                    pending: state.pending,
                    in_flight: state.in_flight,
                    drift: 0,
                },
            );
        }
        for (key, count) in local {
            entries
                .entry(key.clone())
                .or_insert_with(|| DriftEntry {
                    key,
                    local: 0,
                    confirmed: 0,
                    pending: 0,
                    in_flight: false,
                    drift: 0,
                })
                .local = count;
        }

        let entries = entries
            .into_values()
            .map(|mut entry| {
                entry.drift = entry.local.saturating_sub(entry.confirmed);
                entry
            })
            .collect();

        DriftReport { entries }
    }

    /// Publish a report to the metrics recorder and `surface` every `interval`, forever.
    /// Needs to be spawned in a separate task.
    pub async fn run(&self, interval: time::Duration, surface: Arc<dyn ReportingSurface<K>>) {
        let mut interval = tokio::time::interval(interval);
        loop {
            interval.tick().await;
            let report = self.report();
            publish_gauges(&report);
            debug!(
                drift = report.total_drift(),
                pending = report.total_pending(),
                "drift report"
            );
            surface.show_stats(&report);
        }
    }
}

fn publish_gauges<K: Key>(report: &DriftReport<K>) {
    for entry in &report.entries {
        let labels = [("key", entry.key.to_string())];
        metrics::gauge!(LOCAL, &labels).set(entry.local as f64);
        metrics::gauge!(CONFIRMED, &labels).set(entry.confirmed as f64);
        metrics::gauge!(PENDING, &labels).set(entry.pending as f64);
        metrics::gauge!(DRIFT, &labels).set(entry.drift as f64);
    }
}
