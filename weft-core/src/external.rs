//! External source cells
//!
//! An [`ExternalSourceCell`] looks like a computed cell whose value comes
//! from outside the engine: an [`ExternalValueSource`] addressed by an
//! opaque key. While nobody observes the cell it holds the source *weakly*
//! and treats every read as stale, so pull-based consumers always see fresh
//! data. The first observer upgrades to a strong retain and registers a
//! change callback with the source; when the last observer releases, the
//! callback is deregistered and the retain dropped.
//!
//! Some sources fail when deregistration is skipped or repeated; a failed
//! deregistration is logged and never escapes the releasing lifetime.

use crate::cell::{Cell, CellCore, ObserverHost};
use crate::context;
use crate::lifetime::Lifetime;
use crate::notify::{Changeable, Notifiable, SourceId};
use crate::stored::StoredCell;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Errors surfaced by an external value source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The key is not present in the source.
    #[error("unknown key: {0}")]
    UnknownKey(String),

    /// The subscription token is not registered (already deregistered, or
    /// never issued by this source).
    #[error("subscription {0} is not registered")]
    UnknownSubscription(u64),

    /// The source's backend failed.
    #[error("source backend failure: {0}")]
    Backend(String),
}

/// Token identifying one change-callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceSubscription(pub u64);

/// The only interface the engine needs from a host key-value world.
pub trait ExternalValueSource<T>: Send + Sync {
    /// Current value for `key`.
    fn read(&self, key: &str) -> T;

    /// Register `on_change` to run whenever `key`'s value changes.
    fn subscribe(&self, key: &str, on_change: Box<dyn Fn() + Send + Sync>) -> SourceSubscription;

    /// Deregister a previously issued subscription.
    fn unsubscribe(&self, subscription: SourceSubscription) -> Result<(), SourceError>;
}

/// Held only while the cell has observers.
struct SourceLink<T> {
    retained: Arc<dyn ExternalValueSource<T>>,
    subscription: SourceSubscription,
}

struct ExternalInner<T> {
    this: Weak<ExternalInner<T>>,
    core: CellCore<T>,
    key: String,
    source: Weak<dyn ExternalValueSource<T>>,
    link: Mutex<Option<SourceLink<T>>>,
}

/// A cell backed by an [`ExternalValueSource`].
///
/// Cloning the handle shares the same cell.
pub struct ExternalSourceCell<T> {
    inner: Arc<ExternalInner<T>>,
}

impl<T> Clone for ExternalSourceCell<T> {
    fn clone(&self) -> Self {
        ExternalSourceCell {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> ExternalSourceCell<T> {
    pub fn new(source: &Arc<dyn ExternalValueSource<T>>, key: impl Into<String>) -> Self {
        ExternalSourceCell {
            inner: Arc::new_cyclic(|this| ExternalInner {
                this: this.clone(),
                core: CellCore::new(None),
                key: key.into(),
                source: Arc::downgrade(source),
                link: Mutex::new(None),
            }),
        }
    }

    /// The key this cell reads.
    pub fn key(&self) -> &str {
        &self.inner.key
    }
}

impl<T: Clone + Send + 'static> ExternalInner<T> {
    fn current_source(&self) -> Option<Arc<dyn ExternalValueSource<T>>> {
        if let Some(link) = self.link.lock().as_ref() {
            return Some(link.retained.clone());
        }
        self.source.upgrade()
    }
}

impl<T: Clone + Send + 'static> Notifiable for ExternalInner<T> {
    fn mark_as_changed(&self) {
        self.core.mark_as_changed();
    }
}

impl<T: Clone + Send + 'static> Changeable for ExternalInner<T> {
    fn source_id(&self) -> SourceId {
        self.core.id
    }

    fn subscribe_weak(&self, target: Weak<dyn Notifiable>) -> Lifetime {
        let host: Weak<dyn ObserverHost> = self.this.clone();
        self.core.attach_observer(host, target)
    }
}

impl<T: Clone + Send + 'static> ObserverHost for ExternalInner<T> {
    fn on_first_observer(&self) {
        let mut link = self.link.lock();
        if link.is_some() {
            // A concurrent subscriber got here first.
            return;
        }
        let Some(retained) = self.source.upgrade() else {
            tracing::warn!(key = %self.key, "external source already dropped; cell stays unbound");
            return;
        };

        let this = self.this.clone();
        let subscription = retained.subscribe(
            &self.key,
            Box::new(move || {
                if let Some(inner) = this.upgrade() {
                    inner.core.mark_as_changed();
                }
            }),
        );
        *link = Some(SourceLink {
            retained,
            subscription,
        });
    }

    fn after_observer_removed(&self) {
        if !self.core.release_check() {
            return;
        }
        let link = self.link.lock().take();
        if let Some(link) = link {
            if let Err(error) = link.retained.unsubscribe(link.subscription) {
                tracing::warn!(key = %self.key, %error, "external source deregistration failed");
            }
            // Dropping `link` releases the strong retain on the source.
        }
    }
}

impl<T: Clone + Send + 'static> Cell<T> for ExternalSourceCell<T> {
    fn get(&self) -> T {
        let dep: Arc<dyn Changeable> = self.inner.clone();
        context::register_dependency(dep);

        // The cache is only trustworthy while the change callback is
        // registered; unobserved reads always pull through.
        let observed = self.inner.link.lock().is_some();
        if observed {
            if let Some(value) = self.inner.core.cached() {
                return value;
            }
        }

        match self.inner.current_source() {
            Some(source) => {
                let value = source.read(&self.inner.key);
                self.inner.core.store(value.clone());
                value
            }
            None => self
                .inner
                .core
                .cached()
                .expect("external source dropped before this cell was ever read"),
        }
    }

    fn refresh(&self) -> T {
        let _ = self.inner.core.invalidate();
        self.get()
    }

    fn mark_as_changed(&self) {
        self.inner.core.mark_as_changed();
    }

    fn subscribe(&self, target: Weak<dyn Notifiable>) -> Lifetime {
        self.inner.subscribe_weak(target)
    }

    fn is_bound(&self) -> StoredCell<bool> {
        self.inner.core.gauge()
    }

    fn source_id(&self) -> SourceId {
        self.inner.core.id
    }
}

impl<T> std::fmt::Debug for ExternalSourceCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalSourceCell")
            .field("id", &self.inner.core.id)
            .field("key", &self.inner.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellExt;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    /// Minimal in-test source: one value per key, synchronous callbacks.
    struct TestSource {
        values: Mutex<HashMap<String, i64>>,
        callbacks: Mutex<HashMap<u64, (String, Arc<dyn Fn() + Send + Sync>)>>,
        next_token: AtomicU64,
        reads: AtomicU32,
    }

    impl TestSource {
        fn new() -> Arc<Self> {
            Arc::new(TestSource {
                values: Mutex::new(HashMap::new()),
                callbacks: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
                reads: AtomicU32::new(0),
            })
        }

        fn put(&self, key: &str, value: i64) {
            self.values.lock().insert(key.to_string(), value);
            let matching: Vec<Arc<dyn Fn() + Send + Sync>> = self
                .callbacks
                .lock()
                .values()
                .filter(|(registered_key, _)| registered_key == key)
                .map(|(_, callback)| callback.clone())
                .collect();
            // Invoke outside the lock so callbacks can (un)subscribe.
            for callback in matching {
                callback();
            }
        }
    }

    impl ExternalValueSource<i64> for TestSource {
        fn read(&self, key: &str) -> i64 {
            self.reads.fetch_add(1, Ordering::SeqCst);
            *self.values.lock().get(key).expect("key present in test source")
        }

        fn subscribe(
            &self,
            key: &str,
            on_change: Box<dyn Fn() + Send + Sync>,
        ) -> SourceSubscription {
            let token = self.next_token.fetch_add(1, Ordering::SeqCst);
            self.callbacks
                .lock()
                .insert(token, (key.to_string(), Arc::from(on_change)));
            SourceSubscription(token)
        }

        fn unsubscribe(&self, subscription: SourceSubscription) -> Result<(), SourceError> {
            match self.callbacks.lock().remove(&subscription.0) {
                Some(_) => Ok(()),
                None => Err(SourceError::UnknownSubscription(subscription.0)),
            }
        }
    }

    fn cell_for(source: &Arc<TestSource>, key: &str) -> ExternalSourceCell<i64> {
        let dynamic: Arc<dyn ExternalValueSource<i64>> = source.clone();
        ExternalSourceCell::new(&dynamic, key)
    }

    #[test]
    fn test_unobserved_reads_pull_through() {
        let source = TestSource::new();
        source.put("answer", 41);
        let cell = cell_for(&source, "answer");

        assert_eq!(cell.get(), 41);
        source.values.lock().insert("answer".to_string(), 42);

        // No observer, no callback: the read must not trust the cache.
        assert_eq!(cell.get(), 42);
    }

    #[test]
    fn test_observed_cell_caches_between_changes() {
        let source = TestSource::new();
        source.put("k", 1);
        let cell = cell_for(&source, "k");
        let _lt = cell.when_changed(|| {});

        let _ = cell.get();
        let reads_after_first = source.reads.load(Ordering::SeqCst);
        let _ = cell.get();
        assert_eq!(source.reads.load(Ordering::SeqCst), reads_after_first);

        source.put("k", 2);
        assert_eq!(cell.get(), 2);
    }

    #[test]
    fn test_change_callback_notifies_observers() {
        let source = TestSource::new();
        source.put("k", 1);
        let cell = cell_for(&source, "k");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _lt = cell.observe(move |value| {
            s.lock().push(value);
        });

        source.put("k", 5);
        assert_eq!(*seen.lock(), vec![1, 5]);
    }

    #[test]
    fn test_callback_registration_follows_observation() {
        let source = TestSource::new();
        source.put("k", 1);
        let cell = cell_for(&source, "k");

        assert!(source.callbacks.lock().is_empty());

        let lt = cell.when_changed(|| {});
        assert_eq!(source.callbacks.lock().len(), 1);

        lt.done();
        assert!(source.callbacks.lock().is_empty());
    }

    #[test]
    fn test_source_retained_only_while_observed() {
        let source = TestSource::new();
        source.put("k", 7);
        let cell = cell_for(&source, "k");
        let weak = Arc::downgrade(&source);

        let lt = cell.when_changed(|| {});
        assert_eq!(cell.get(), 7);
        drop(source);

        // The observing cell keeps the source alive.
        assert!(weak.upgrade().is_some());
        assert_eq!(cell.get(), 7);

        lt.done();
        assert!(weak.upgrade().is_none());
    }
}
