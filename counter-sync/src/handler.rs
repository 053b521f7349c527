use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use crate::emitter::{EventEmitter, SubscriptionId};
use crate::key::Key;
use crate::reconciler::Reconciler;
use crate::sink::PersistSink;
use crate::store::CounterStore;

/// Turns every event into a local count plus an increment handed to the reconciler. Whether that
/// increment is persisted is none of its business.
pub struct EventHandler<K: Key, S> {
    store: Arc<CounterStore<K>>,
    reconciler: Reconciler<K, S>,
    subscriptions: Mutex<Vec<(K, SubscriptionId)>>,
}

impl<K: Key, S: PersistSink<K>> EventHandler<K, S> {
    pub fn new(store: Arc<CounterStore<K>>, reconciler: Reconciler<K, S>) -> Self {
        Self {
            store,
            reconciler,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn on_event(&self, key: &K) {
        self.store.record(key);
        self.reconciler.enqueue_increment(key.clone(), 1);
    }

    /// Subscribe to `emitter` for each of `keys`.
    pub fn attach(self: &Arc<Self>, emitter: &EventEmitter<K>, keys: impl IntoIterator<Item = K>) {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        for key in keys {
            let handler = Arc::clone(self);
            let id = emitter.subscribe(key.clone(), Arc::new(move |key: &K| handler.on_event(key)));
            info!(key = %key, "subscribed to events");
            subscriptions.push((key, id));
        }
    }

    /// Drop every subscription made through `attach`. Returns how many were removed.
    pub fn detach(&self, emitter: &EventEmitter<K>) -> usize {
        let subscriptions: Vec<(K, SubscriptionId)> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        subscriptions
            .into_iter()
            .filter(|(key, id)| emitter.unsubscribe(key, *id))
            .count()
    }
}
