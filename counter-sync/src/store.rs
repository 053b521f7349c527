use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::key::Key;
use crate::metrics_consts::EVENTS_OBSERVED;
use crate::stats::ReportingSurface;

/// In-memory count of observed events per key. Counts only ever go up, by exactly one per event,
/// and every new value is pushed to the reporting surface straight away so the displayed local
/// count never waits on persistence.
pub struct CounterStore<K: Key> {
    counts: DashMap<K, AtomicU64>,
    surface: Arc<dyn ReportingSurface<K>>,
}

impl<K: Key> CounterStore<K> {
    pub fn new(surface: Arc<dyn ReportingSurface<K>>) -> Self {
        Self {
            counts: DashMap::new(),
            surface,
        }
    }

    /// Count one event for `key` and return the new local value.
    pub fn record(&self, key: &K) -> u64 {
        let value = match self.counts.get(key) {
            Some(count) => count.fetch_add(1, Ordering::Relaxed) + 1,
            None => {
                self.counts
                    .entry(key.clone())
                    .or_default()
                    .fetch_add(1, Ordering::Relaxed)
                    + 1
            }
        };

        metrics::counter!(EVENTS_OBSERVED, &[("key", key.to_string())]).increment(1);
        self.surface.set_stats(key, value);
        value
    }

    pub fn read(&self, key: &K) -> u64 {
        self.counts
            .get(key)
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Every key seen so far with its count, sorted by key.
    pub fn snapshot(&self) -> Vec<(K, u64)> {
        let mut counts: Vec<(K, u64)> = self
            .counts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        counts.sort_unstable();
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{NoopSurface, StatsBoard};

    #[test]
    fn record_counts_each_event_once() {
        let store = CounterStore::<&str>::new(Arc::new(NoopSurface));

        assert_eq!(store.read(&"A"), 0);
        assert_eq!(store.record(&"A"), 1);
        assert_eq!(store.record(&"A"), 2);
        assert_eq!(store.record(&"B"), 1);

        assert_eq!(store.read(&"A"), 2);
        assert_eq!(store.snapshot(), vec![("A", 2), ("B", 1)]);
    }

    #[test]
    fn record_pushes_new_values_to_the_surface() {
        let board = Arc::new(StatsBoard::<&str>::new());
        let store = CounterStore::new(board.clone());

        store.record(&"A");
        store.record(&"A");

        assert_eq!(board.get_stats(&"A"), 2);
        assert_eq!(board.get_stats(&"B"), 0);
    }

    #[test]
    fn concurrent_records_are_not_lost() {
        let store = Arc::new(CounterStore::<&str>::new(Arc::new(NoopSurface)));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        store.record(&"A");
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(store.read(&"A"), 4000);
    }
}
