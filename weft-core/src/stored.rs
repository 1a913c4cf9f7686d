//! Stored cells
//!
//! A [`StoredCell`] holds a value supplied from outside the engine. Writes
//! are gated by a change-detection policy fixed at construction: structural
//! equality, reference identity, or always-notify. The policy is a tagged
//! variant, not a type hierarchy.

use crate::cell::{Cell, CellCore, ObserverHost, WritableCell};
use crate::context;
use crate::lifetime::Lifetime;
use crate::notify::{Changeable, Notifiable, SourceId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// How a write decides whether observers must hear about it.
enum ChangeDetection<T> {
    /// `comparator(old, new)` returns true when the values are equal, i.e.
    /// the write is silent.
    Comparator(Box<dyn Fn(&T, &T) -> bool + Send + Sync>),
    /// Every write notifies. For opaque values with no usable comparison.
    Always,
}

struct StoredInner<T> {
    this: Weak<StoredInner<T>>,
    core: CellCore<T>,
    policy: ChangeDetection<T>,
    /// A forced notification has fanned out and no read or write has
    /// happened since. Keeps `mark_as_changed` idempotent without touching
    /// the cache, which always holds a value here.
    forced_dirty: AtomicBool,
}

/// A cell whose value is written from outside.
///
/// Cloning the handle shares the same cell.
pub struct StoredCell<T> {
    inner: Arc<StoredInner<T>>,
}

impl<T> Clone for StoredCell<T> {
    fn clone(&self) -> Self {
        StoredCell {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> StoredCell<T> {
    fn with_policy(value: T, policy: ChangeDetection<T>) -> Self {
        StoredCell {
            inner: Arc::new_cyclic(|this| StoredInner {
                this: this.clone(),
                core: CellCore::new(Some(value)),
                policy,
                forced_dirty: AtomicBool::new(false),
            }),
        }
    }

    /// Structural-equality policy: a write of an equal value is silent.
    pub fn new(value: T) -> Self
    where
        T: PartialEq,
    {
        Self::with_comparator(value, |old: &T, new: &T| old == new)
    }

    /// Custom comparator policy. `comparator(old, new)` returning true
    /// means "unchanged, do not notify".
    pub fn with_comparator(
        value: T,
        comparator: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::with_policy(value, ChangeDetection::Comparator(Box::new(comparator)))
    }

    /// Always-notify policy, for values with no meaningful comparison.
    pub fn always_changed(value: T) -> Self {
        Self::with_policy(value, ChangeDetection::Always)
    }

    /// Store `value`. Observers are notified only when the policy says the
    /// value changed.
    pub fn set(&self, value: T) {
        // The comparator is caller-supplied; run it against a clone so no
        // lock is held across user code.
        let changed = match &self.inner.policy {
            ChangeDetection::Comparator(equal) => self
                .inner
                .core
                .cached()
                .map_or(true, |old| !equal(&old, &value)),
            ChangeDetection::Always => true,
        };
        self.inner.core.store(value);
        self.inner.forced_dirty.store(false, Ordering::SeqCst);
        if changed {
            self.inner.core.fire();
        }
    }
}

impl<U: Send + Sync + 'static> StoredCell<Arc<U>> {
    /// Reference-identity policy: a write of the same allocation is silent.
    pub fn by_identity(value: Arc<U>) -> Self {
        Self::with_comparator(value, |old: &Arc<U>, new: &Arc<U>| Arc::ptr_eq(old, new))
    }
}

impl<T: Clone + Send + 'static> Changeable for StoredInner<T> {
    fn source_id(&self) -> SourceId {
        self.core.id
    }

    fn subscribe_weak(&self, target: Weak<dyn Notifiable>) -> Lifetime {
        let host: Weak<dyn ObserverHost> = self.this.clone();
        self.core.attach_observer(host, target)
    }
}

impl<T: Clone + Send + 'static> ObserverHost for StoredInner<T> {
    fn after_observer_removed(&self) {
        self.core.release_check();
    }
}

impl<T: Clone + Send + 'static> Cell<T> for StoredCell<T> {
    fn get(&self) -> T {
        let dep: Arc<dyn Changeable> = self.inner.clone();
        context::register_dependency(dep);
        // A read re-arms forced notifications.
        self.inner.forced_dirty.store(false, Ordering::SeqCst);
        self.inner
            .core
            .cached()
            .expect("stored cell always holds a value")
    }

    fn refresh(&self) -> T {
        // Nothing to recompute; the stored value is the value.
        self.get()
    }

    fn mark_as_changed(&self) {
        // A stored cell has no compute path to refill a dropped cache, so
        // the forced notification keeps the value. The flag stands in for
        // the dirty bit: the first call fans out, repeats coalesce until
        // the next read or write.
        if self.inner.forced_dirty.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.core.fire();
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

impl<T: Clone + Send + 'static> WritableCell<T> for StoredCell<T> {
    fn set(&self, value: T) {
        StoredCell::set(self, value);
    }
}

impl<T: Clone + Send + std::fmt::Debug + 'static> std::fmt::Debug for StoredCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredCell")
            .field("id", &self.inner.core.id)
            .field("value", &self.inner.core.cached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellExt;
    use parking_lot::Mutex;

    #[test]
    fn test_write_then_read() {
        let cell = StoredCell::new(1);
        assert_eq!(cell.get(), 1);

        cell.set(2);
        assert_eq!(cell.get(), 2);
    }

    #[test]
    fn test_equality_policy_suppresses_equal_write() {
        let cell = StoredCell::new(5);
        let hits = Arc::new(Mutex::new(0u32));
        let h = hits.clone();
        let _lt = cell.when_changed(move || {
            *h.lock() += 1;
        });

        cell.set(5);
        assert_eq!(*hits.lock(), 0);

        cell.set(6);
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn test_always_policy_notifies_every_write() {
        let cell = StoredCell::always_changed(5);
        let hits = Arc::new(Mutex::new(0u32));
        let h = hits.clone();
        let _lt = cell.when_changed(move || {
            *h.lock() += 1;
        });

        cell.set(5);
        cell.set(5);
        assert_eq!(*hits.lock(), 2);
    }

    #[test]
    fn test_identity_policy_compares_allocations() {
        let first = Arc::new("payload".to_string());
        let cell = StoredCell::by_identity(first.clone());
        let hits = Arc::new(Mutex::new(0u32));
        let h = hits.clone();
        let _lt = cell.when_changed(move || {
            *h.lock() += 1;
        });

        // Same allocation: silent, even though the contents are equal.
        cell.set(first.clone());
        assert_eq!(*hits.lock(), 0);

        // Different allocation with equal contents: notifies.
        cell.set(Arc::new("payload".to_string()));
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn test_mark_as_changed_forces_notification() {
        let cell = StoredCell::new(1);
        let hits = Arc::new(Mutex::new(0u32));
        let h = hits.clone();
        let _lt = cell.when_changed(move || {
            *h.lock() += 1;
        });

        cell.mark_as_changed();
        assert_eq!(*hits.lock(), 1);
        assert_eq!(cell.get(), 1);
    }

    #[test]
    fn test_mark_as_changed_is_idempotent_until_read() {
        let cell = StoredCell::new(1);
        let hits = Arc::new(Mutex::new(0u32));
        let h = hits.clone();
        let _lt = cell.when_changed(move || {
            *h.lock() += 1;
        });

        cell.mark_as_changed();
        cell.mark_as_changed();
        cell.mark_as_changed();
        assert_eq!(*hits.lock(), 1);

        // A read re-arms the forced notification.
        let _ = cell.get();
        cell.mark_as_changed();
        assert_eq!(*hits.lock(), 2);

        // So does a write (which fans out itself).
        cell.set(2);
        assert_eq!(*hits.lock(), 3);
        cell.mark_as_changed();
        cell.mark_as_changed();
        assert_eq!(*hits.lock(), 4);
    }
}
