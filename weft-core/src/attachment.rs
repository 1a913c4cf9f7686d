//! Attachment points
//!
//! An [`AttachmentPoint`] is an indirection cell: it reads through to a
//! target cell that can be swapped at runtime. Downstream observers keep
//! their subscription to the attachment itself and follow whichever target
//! is currently attached.
//!
//! [`MutableAttachmentPoint`] additionally forwards writes to its target,
//! which must itself be writable: a stored cell, an array cell, or another
//! mutable attachment. The target's own change-detection policy decides
//! whether a forwarded write notifies; the notification then flows back
//! through the attachment's normal subscription.
//!
//! A target chain that loops back through attachment points would never
//! resolve; `attach_to` treats that as a fatal programming error.

use crate::cell::{Cell, CellCore, ObserverHost, WritableCell};
use crate::context;
use crate::lifetime::Lifetime;
use crate::notify::{Changeable, Notifiable, SourceId};
use crate::stored::StoredCell;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

enum AttachTarget<T> {
    /// Not yet attached: reads yield the construction-time default.
    Constant(T),
    Attached {
        cell: Arc<dyn Cell<T>>,
        _subscription: Lifetime,
    },
}

struct AttachInner<T> {
    this: Weak<AttachInner<T>>,
    core: CellCore<T>,
    target: Mutex<AttachTarget<T>>,
}

/// An indirection cell whose target can be re-bound at runtime.
///
/// Cloning the handle shares the same cell.
pub struct AttachmentPoint<T> {
    inner: Arc<AttachInner<T>>,
}

impl<T> Clone for AttachmentPoint<T> {
    fn clone(&self) -> Self {
        AttachmentPoint {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> AttachmentPoint<T> {
    /// An unattached point that reads `default_value` until a target is
    /// attached.
    pub fn new(default_value: T) -> Self {
        AttachmentPoint {
            inner: Arc::new_cyclic(|this| AttachInner {
                this: this.clone(),
                core: CellCore::new(None),
                target: Mutex::new(AttachTarget::Constant(default_value)),
            }),
        }
    }

    /// Re-bind to `cell`: subscribe to it, install it, release the previous
    /// target's subscription, and invalidate downstream.
    ///
    /// # Panics
    ///
    /// Panics if `cell`'s attachment chain leads back to this point.
    pub fn attach_to(&self, cell: impl Cell<T> + 'static) {
        assert!(
            !cell.reaches_attachment(self.inner.core.id),
            "attachment cycle: target chain leads back to this attachment point"
        );
        tracing::debug!(id = %self.inner.core.id, "re-binding attachment target");

        let target: Weak<dyn Notifiable> = self.inner.this.clone();
        let subscription = cell.subscribe(target);
        let old = {
            let mut slot = self.inner.target.lock();
            std::mem::replace(
                &mut *slot,
                AttachTarget::Attached {
                    cell: Arc::new(cell),
                    _subscription: subscription,
                },
            )
        };
        // The old target's subscription releases on drop.
        drop(old);

        // Unconditional: a subscriber that has never read this point has no
        // cache to invalidate, but still must hear that the target moved.
        let _ = self.inner.core.invalidate();
        self.inner.core.fire();
    }
}

impl<T: Clone + Send + 'static> AttachInner<T> {
    fn read_target(&self) -> T {
        // Clone the handle out so no lock is held while the target
        // evaluates (it may run arbitrary compute functions).
        enum Read<T> {
            Value(T),
            Through(Arc<dyn Cell<T>>),
        }
        let read = {
            let slot = self.target.lock();
            match &*slot {
                AttachTarget::Constant(value) => Read::Value(value.clone()),
                AttachTarget::Attached { cell, .. } => Read::Through(cell.clone()),
            }
        };
        match read {
            Read::Value(value) => value,
            Read::Through(cell) => cell.get(),
        }
    }
}

impl<T: Clone + Send + 'static> Notifiable for AttachInner<T> {
    fn mark_as_changed(&self) {
        self.core.mark_as_changed();
    }
}

impl<T: Clone + Send + 'static> Changeable for AttachInner<T> {
    fn source_id(&self) -> SourceId {
        self.core.id
    }

    fn subscribe_weak(&self, target: Weak<dyn Notifiable>) -> Lifetime {
        let host: Weak<dyn ObserverHost> = self.this.clone();
        self.core.attach_observer(host, target)
    }
}

impl<T: Clone + Send + 'static> ObserverHost for AttachInner<T> {
    fn after_observer_removed(&self) {
        self.core.release_check();
    }
}

impl<T: Clone + Send + 'static> Cell<T> for AttachmentPoint<T> {
    fn get(&self) -> T {
        let dep: Arc<dyn Changeable> = self.inner.clone();
        context::register_dependency(dep);

        if let Some(value) = self.inner.core.cached() {
            return value;
        }
        // Reading through also registers the target itself in the frame.
        let value = self.inner.read_target();
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

    fn reaches_attachment(&self, id: SourceId) -> bool {
        if self.inner.core.id == id {
            return true;
        }
        let target = {
            let slot = self.inner.target.lock();
            match &*slot {
                AttachTarget::Constant(_) => None,
                AttachTarget::Attached { cell, .. } => Some(cell.clone()),
            }
        };
        target.is_some_and(|cell| cell.reaches_attachment(id))
    }
}

struct MutableTarget<T> {
    cell: Arc<dyn WritableCell<T>>,
    _subscription: Lifetime,
}

struct MutableAttachInner<T> {
    this: Weak<MutableAttachInner<T>>,
    core: CellCore<T>,
    target: Mutex<MutableTarget<T>>,
}

/// An attachment point whose target is writable; writes are forwarded to
/// the currently attached target.
///
/// Cloning the handle shares the same cell.
pub struct MutableAttachmentPoint<T> {
    inner: Arc<MutableAttachInner<T>>,
}

impl<T> Clone for MutableAttachmentPoint<T> {
    fn clone(&self) -> Self {
        MutableAttachmentPoint {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> MutableAttachmentPoint<T> {
    /// Attach to `default` immediately; there is no unattached state, since
    /// writes need somewhere to land.
    pub fn new(default: impl WritableCell<T> + 'static) -> Self {
        MutableAttachmentPoint {
            inner: Arc::new_cyclic(|this: &Weak<MutableAttachInner<T>>| {
                let target: Weak<dyn Notifiable> = this.clone();
                let subscription = default.subscribe(target);
                MutableAttachInner {
                    this: this.clone(),
                    core: CellCore::new(None),
                    target: Mutex::new(MutableTarget {
                        cell: Arc::new(default),
                        _subscription: subscription,
                    }),
                }
            }),
        }
    }

    /// Re-bind to a writable target. Same protocol as
    /// [`AttachmentPoint::attach_to`].
    ///
    /// # Panics
    ///
    /// Panics if `cell`'s attachment chain leads back to this point.
    pub fn attach_to(&self, cell: impl WritableCell<T> + 'static) {
        assert!(
            !cell.reaches_attachment(self.inner.core.id),
            "attachment cycle: target chain leads back to this attachment point"
        );
        tracing::debug!(id = %self.inner.core.id, "re-binding mutable attachment target");

        let target: Weak<dyn Notifiable> = self.inner.this.clone();
        let subscription = cell.subscribe(target);
        let old = {
            let mut slot = self.inner.target.lock();
            std::mem::replace(
                &mut *slot,
                MutableTarget {
                    cell: Arc::new(cell),
                    _subscription: subscription,
                },
            )
        };
        drop(old);

        // Unconditional: a subscriber that has never read this point has no
        // cache to invalidate, but still must hear that the target moved.
        let _ = self.inner.core.invalidate();
        self.inner.core.fire();
    }

    /// Write through to the current target. The target's change-detection
    /// policy applies, and its notification reaches this point's observers
    /// through the normal subscription.
    pub fn set(&self, value: T) {
        let cell = self.inner.target.lock().cell.clone();
        cell.set(value);
    }
}

impl<T: Clone + Send + 'static> Notifiable for MutableAttachInner<T> {
    fn mark_as_changed(&self) {
        self.core.mark_as_changed();
    }
}

impl<T: Clone + Send + 'static> Changeable for MutableAttachInner<T> {
    fn source_id(&self) -> SourceId {
        self.core.id
    }

    fn subscribe_weak(&self, target: Weak<dyn Notifiable>) -> Lifetime {
        let host: Weak<dyn ObserverHost> = self.this.clone();
        self.core.attach_observer(host, target)
    }
}

impl<T: Clone + Send + 'static> ObserverHost for MutableAttachInner<T> {
    fn after_observer_removed(&self) {
        self.core.release_check();
    }
}

impl<T: Clone + Send + 'static> Cell<T> for MutableAttachmentPoint<T> {
    fn get(&self) -> T {
        let dep: Arc<dyn Changeable> = self.inner.clone();
        context::register_dependency(dep);

        if let Some(value) = self.inner.core.cached() {
            return value;
        }
        let cell = self.inner.target.lock().cell.clone();
        let value = cell.get();
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

    fn reaches_attachment(&self, id: SourceId) -> bool {
        if self.inner.core.id == id {
            return true;
        }
        let cell = self.inner.target.lock().cell.clone();
        cell.reaches_attachment(id)
    }
}

impl<T: Clone + Send + 'static> WritableCell<T> for MutableAttachmentPoint<T> {
    fn set(&self, value: T) {
        MutableAttachmentPoint::set(self, value);
    }
}
