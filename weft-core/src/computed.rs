//! Computed cells
//!
//! A [`ComputedCell`] derives its value from a pure function of other
//! cells. Dependencies are discovered implicitly: the function runs inside
//! a fresh capture frame and every cell it reads registers itself there.
//! Dependency sets tend to stabilise, so after each run the observed set is
//! diffed against the previous one and subscriptions are rewired only when
//! they differ.
//!
//! Releasing the stale subscription set happens *after* the frame's observed
//! list is reset: the release can run observer-count transitions that read
//! cells, and those reads must not leak into this cell's dependency set.

use crate::cell::{Cell, CellCore, ObserverHost};
use crate::context::{self, DepSet};
use crate::lifetime::Lifetime;
use crate::metrics::EngineMetrics;
use crate::notify::{Changeable, Notifiable, SourceId};
use crate::stored::StoredCell;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

struct ComputedInner<T> {
    this: Weak<ComputedInner<T>>,
    core: CellCore<T>,
    compute: Box<dyn Fn() -> T + Send + Sync>,
    deps: Mutex<DepSet>,
}

/// A cell computed as a pure function of other cells.
///
/// Cloning the handle shares the same cell.
pub struct ComputedCell<T> {
    inner: Arc<ComputedInner<T>>,
}

impl<T> Clone for ComputedCell<T> {
    fn clone(&self) -> Self {
        ComputedCell {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> ComputedCell<T> {
    pub fn new(compute: impl Fn() -> T + Send + Sync + 'static) -> Self {
        ComputedCell {
            inner: Arc::new_cyclic(|this| ComputedInner {
                this: this.clone(),
                core: CellCore::new(None),
                compute: Box::new(compute),
                deps: Mutex::new(DepSet::new()),
            }),
        }
    }
}

impl<T: Clone + Send + 'static> ComputedInner<T> {
    /// Run the user function in a fresh capture frame and rewire
    /// subscriptions if the observed set changed.
    ///
    /// A panicking function pops the frame, keeps the old subscription set,
    /// leaves the cache dirty, and propagates.
    fn recompute(&self) -> T {
        let expected = self.deps.lock().expected_ids();
        EngineMetrics::global().record_recomputation();

        context::with_frame(expected, || {
            let result = (self.compute)();
            let target: Weak<dyn Notifiable> = self.this.clone();
            context::rewire_if_changed(&self.deps, &target);
            result
        })
    }

    /// Last observer gone: eagerly release upstream subscriptions and drop
    /// the cache. The next resolve rebuilds both.
    fn release_upstream(&self) {
        let _ = self.core.invalidate();
        context::release_dependencies(&self.deps);
    }
}

impl<T: Clone + Send + 'static> Notifiable for ComputedInner<T> {
    fn mark_as_changed(&self) {
        self.core.mark_as_changed();
    }
}

impl<T: Clone + Send + 'static> Changeable for ComputedInner<T> {
    fn source_id(&self) -> SourceId {
        self.core.id
    }

    fn subscribe_weak(&self, target: Weak<dyn Notifiable>) -> Lifetime {
        let host: Weak<dyn ObserverHost> = self.this.clone();
        self.core.attach_observer(host, target)
    }
}

impl<T: Clone + Send + 'static> ObserverHost for ComputedInner<T> {
    fn after_observer_removed(&self) {
        if self.core.release_check() {
            self.release_upstream();
        }
    }
}

impl<T: Clone + Send + 'static> Cell<T> for ComputedCell<T> {
    fn get(&self) -> T {
        let dep: Arc<dyn Changeable> = self.inner.clone();
        context::register_dependency(dep);

        if let Some(value) = self.inner.core.cached() {
            EngineMetrics::global().record_hit();
            return value;
        }
        EngineMetrics::global().record_miss();

        let value = self.inner.recompute();
        self.inner.core.store(value.clone());
        value
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

impl<T> std::fmt::Debug for ComputedCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputedCell")
            .field("id", &self.inner.core.id)
            .finish()
    }
}
