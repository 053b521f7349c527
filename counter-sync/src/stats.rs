use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::info;

use crate::drift::DriftReport;
use crate::key::Key;

/// Where local counts and drift reports are displayed. Purely observational: nothing a surface
/// does feeds back into counting or delivery.
pub trait ReportingSurface<K: Key>: Send + Sync {
    /// Push the latest local count for `key`.
    fn set_stats(&self, key: &K, value: u64);

    /// Display a periodic comparison between local and persisted totals.
    fn show_stats(&self, report: &DriftReport<K>);
}

/// Discards everything it is given.
pub struct NoopSurface;

impl<K: Key> ReportingSurface<K> for NoopSurface {
    fn set_stats(&self, _key: &K, _value: u64) {}

    fn show_stats(&self, _report: &DriftReport<K>) {}
}

/// Keeps the latest local count per key and logs every drift report as a table.
pub struct StatsBoard<K: Key> {
    local: DashMap<K, u64>,
    reports_shown: AtomicU64,
}

impl<K: Key> Default for StatsBoard<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> StatsBoard<K> {
    pub fn new() -> Self {
        Self {
            local: DashMap::new(),
            reports_shown: AtomicU64::new(0),
        }
    }

    pub fn get_stats(&self, key: &K) -> u64 {
        self.local.get(key).map(|value| *value).unwrap_or(0)
    }
}

impl<K: Key> ReportingSurface<K> for StatsBoard<K> {
    fn set_stats(&self, key: &K, value: u64) {
        // Concurrent recorders can push out of order, keep the displayed count monotonic.
        let mut current = self.local.entry(key.clone()).or_insert(0);
        if value > *current {
            *current = value;
        }
    }

    fn show_stats(&self, report: &DriftReport<K>) {
        let shown = self.reports_shown.fetch_add(1, Ordering::Relaxed) + 1;
        info!(report = shown, "sync stats\n{}", render_table(report));
    }
}

/// Render a report as a fixed-width table with a totals row.
pub fn render_table<K: Key>(report: &DriftReport<K>) -> String {
    let mut rows = vec![format_row("key", "local", "confirmed", "pending", "in_flight", "drift")];

    for entry in &report.entries {
        rows.push(format_row(
            entry.key.to_string(),
            entry.local,
            entry.confirmed,
            entry.pending,
            if entry.in_flight { "yes" } else { "no" },
            entry.drift,
        ));
    }

    rows.push(format_row(
        "total",
        report.total_local(),
        report.total_confirmed(),
        report.total_pending(),
        report.in_flight_count(),
        report.total_drift(),
    ));
    rows.join("\n")
}

fn format_row(
    key: impl Display,
    local: impl Display,
    confirmed: impl Display,
    pending: impl Display,
    in_flight: impl Display,
    drift: impl Display,
) -> String {
    format!("{key:<12} {local:>10} {confirmed:>10} {pending:>10} {in_flight:>9} {drift:>10}")
}
