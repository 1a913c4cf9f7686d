//! In-memory external value source
//!
//! [`MemorySource`] is the simplest useful [`ExternalValueSource`]: a keyed
//! value store living in process memory, with synchronous change callbacks.
//! Hosts use it to feed externally-produced state (configuration, device
//! readings, bridge data) into cells without teaching the engine anything
//! about where the values come from.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use weft_core::{ExternalSourceCell, ExternalValueSource, SourceError, SourceSubscription};

struct Subscriber {
    key: String,
    on_change: Arc<dyn Fn() + Send + Sync>,
}

/// An in-memory keyed value store with change callbacks.
pub struct MemorySource<T> {
    values: DashMap<String, T>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_token: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> MemorySource<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(MemorySource {
            values: DashMap::new(),
            subscribers: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        })
    }

    /// Store `value` under `key` and run the key's change callbacks.
    pub fn put(&self, key: impl Into<String>, value: T) {
        let key = key.into();
        self.values.insert(key.clone(), value);
        self.notify(&key);
    }

    /// Remove `key` without notifying. Reading a missing key is a
    /// programmer error, so waking observers here would send them straight
    /// into one; callers that need observers to see an ending must `put` a
    /// tombstone value instead.
    pub fn remove(&self, key: &str) -> Option<T> {
        self.values.remove(key).map(|(_, value)| value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Project `key` into a cell. The cell holds this source weakly until
    /// observed, per the external-cell retain contract.
    pub fn binding(self: &Arc<Self>, key: impl Into<String>) -> ExternalSourceCell<T> {
        let source: Arc<dyn ExternalValueSource<T>> = self.clone();
        ExternalSourceCell::new(&source, key)
    }

    fn notify(&self, key: &str) {
        let matching: Vec<Arc<dyn Fn() + Send + Sync>> = self
            .subscribers
            .lock()
            .values()
            .filter(|subscriber| subscriber.key == key)
            .map(|subscriber| subscriber.on_change.clone())
            .collect();
        // Callbacks run outside the registry lock: they may subscribe or
        // unsubscribe.
        for on_change in matching {
            on_change();
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ExternalValueSource<T> for MemorySource<T> {
    fn read(&self, key: &str) -> T {
        match self.values.get(key) {
            Some(value) => value.clone(),
            None => panic!("MemorySource: no value stored under key {key:?}"),
        }
    }

    fn subscribe(&self, key: &str, on_change: Box<dyn Fn() + Send + Sync>) -> SourceSubscription {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(key, token, "memory source subscription registered");
        self.subscribers.lock().insert(
            token,
            Subscriber {
                key: key.to_string(),
                on_change: Arc::from(on_change),
            },
        );
        SourceSubscription(token)
    }

    fn unsubscribe(&self, subscription: SourceSubscription) -> Result<(), SourceError> {
        match self.subscribers.lock().remove(&subscription.0) {
            Some(_) => Ok(()),
            None => Err(SourceError::UnknownSubscription(subscription.0)),
        }
    }
}

impl<T: Clone + Send + Sync + std::fmt::Debug + 'static> std::fmt::Debug for MemorySource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySource")
            .field("keys", &self.values.len())
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use weft_core::prelude::*;

    #[test]
    fn test_bound_cell_follows_puts() {
        let source = MemorySource::new();
        source.put("volume", 3);

        let volume = source.binding("volume");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _lt = volume.observe(move |value| {
            s.lock().push(value);
        });

        source.put("volume", 7);
        assert_eq!(*seen.lock(), vec![3, 7]);
    }

    #[test]
    fn test_unobserved_binding_reads_fresh() {
        let source = MemorySource::new();
        source.put("k", 1);
        let cell = source.binding("k");

        assert_eq!(cell.get(), 1);
        source.put("k", 2);
        assert_eq!(cell.get(), 2);
    }

    #[test]
    fn test_unrelated_keys_do_not_cross_talk() {
        let source = MemorySource::new();
        source.put("a", 1);
        source.put("b", 2);

        let a = source.binding("a");
        let hits = Arc::new(Mutex::new(0u32));
        let h = hits.clone();
        let _lt = a.when_changed(move || {
            *h.lock() += 1;
        });

        source.put("b", 3);
        assert_eq!(*hits.lock(), 0);

        source.put("a", 4);
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn test_double_unsubscribe_is_an_error() {
        let source: Arc<MemorySource<i32>> = MemorySource::new();
        let token = ExternalValueSource::subscribe(&*source, "k", Box::new(|| {}));

        assert!(source.unsubscribe(token).is_ok());
        assert!(matches!(
            source.unsubscribe(token),
            Err(SourceError::UnknownSubscription(_))
        ));
    }

    #[test]
    fn test_subscriptions_release_with_observation() {
        let source = MemorySource::new();
        source.put("k", 1);
        let cell = source.binding("k");

        let lt = cell.when_changed(|| {});
        assert_eq!(source.subscribers.lock().len(), 1);

        lt.done();
        assert!(source.subscribers.lock().is_empty());
    }
}
