use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time;

use dashmap::DashMap;

use crate::key::Key;

/// Callback invoked with the key of every event emitted for a subscription.
pub type Callback<K> = Arc<dyn Fn(&K) + Send + Sync>;

/// Handle returned by `subscribe`, needed to unsubscribe again. Closures cannot be compared, so
/// this stands in for the callback itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Minimal publish/subscribe dispatcher. Callbacks run synchronously on the emitting thread,
/// outside of any registry lock, so a callback may itself subscribe or emit.
pub struct EventEmitter<K: Key> {
    next_id: AtomicU64,
    subscribers: DashMap<K, Vec<(SubscriptionId, Callback<K>)>>,
}

impl<K: Key> Default for EventEmitter<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> EventEmitter<K> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            subscribers: DashMap::new(),
        }
    }

    pub fn subscribe(&self, key: K, callback: Callback<K>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .entry(key)
            .or_default()
            .push((id, callback));
        id
    }

    /// Returns false if `id` was not subscribed to `key`.
    pub fn unsubscribe(&self, key: &K, id: SubscriptionId) -> bool {
        match self.subscribers.get_mut(key) {
            Some(mut callbacks) => {
                let before = callbacks.len();
                callbacks.retain(|(subscription, _)| *subscription != id);
                callbacks.len() != before
            }
            None => false,
        }
    }

    /// Deliver one event for `key` to every subscriber, returning how many were called.
    pub fn emit(&self, key: &K) -> usize {
        let callbacks: Vec<Callback<K>> = self
            .subscribers
            .get(key)
            .map(|callbacks| {
                callbacks
                    .iter()
                    .map(|(_, callback)| Arc::clone(callback))
                    .collect()
            })
            .unwrap_or_default();

        for callback in &callbacks {
            callback(key);
        }
        callbacks.len()
    }
}

/// Emit `count` events for `key`, each after a random pause of up to `max_delay`.
pub async fn trigger_randomly<K: Key>(
    emitter: Arc<EventEmitter<K>>,
    key: K,
    count: u64,
    max_delay: time::Duration,
) {
    for _ in 0..count {
        let delay = max_delay.mul_f64(rand::random::<f64>());
        tokio::time::sleep(delay).await;
        emitter.emit(&key);
    }
}
