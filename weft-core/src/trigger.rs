//! Triggers
//!
//! A [`Trigger`] adapts the engine to host code that wants one coarse
//! "something you touched changed, run me again" callback, typically a
//! render loop. The action runs inside a capture frame like a computed
//! cell; afterwards its dependency set is diffed and rewired the same way.
//!
//! Between two invocations, any number of upstream invalidations collapse
//! into a single update-needed fanout: the first one sets the pending flag
//! and notifies, the rest are dropped until [`invoke`](Trigger::invoke)
//! clears the flag again.

use crate::context::{self, DepSet};
use crate::lifetime::Lifetime;
use crate::metrics::EngineMetrics;
use crate::notify::{FnNotifier, Notifiable, NotifierSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

struct TriggerInner {
    this: Weak<TriggerInner>,
    action: Box<dyn Fn() + Send + Sync>,
    deps: Mutex<DepSet>,
    /// An update-needed signal has gone out and no invoke has happened yet.
    pending_update: AtomicBool,
    update_observers: NotifierSet,
}

impl Notifiable for TriggerInner {
    fn mark_as_changed(&self) {
        if self.pending_update.swap(true, Ordering::SeqCst) {
            // Already announced; coalesce the storm.
            EngineMetrics::global().record_coalesced();
            return;
        }
        self.update_observers.fire_all();
    }
}

/// An action whose dependency invalidations are coalesced into a single
/// update-needed signal.
pub struct Trigger {
    inner: Arc<TriggerInner>,
}

impl Clone for Trigger {
    fn clone(&self) -> Self {
        Trigger {
            inner: self.inner.clone(),
        }
    }
}

impl Trigger {
    pub fn new(action: impl Fn() + Send + Sync + 'static) -> Self {
        Trigger {
            inner: Arc::new_cyclic(|this| TriggerInner {
                this: this.clone(),
                action: Box::new(action),
                deps: Mutex::new(DepSet::new()),
                pending_update: AtomicBool::new(false),
                update_observers: NotifierSet::new(),
            }),
        }
    }

    /// Run the action now, re-capturing its dependency set.
    ///
    /// The pending flag is cleared *before* the action runs, so a write
    /// performed during the action schedules a fresh update rather than
    /// being swallowed by the one currently being serviced.
    pub fn invoke(&self) {
        let inner = &self.inner;
        let expected = inner.deps.lock().expected_ids();

        context::with_frame(expected, || {
            inner.pending_update.store(false, Ordering::SeqCst);
            (inner.action)();
            let target: Weak<dyn Notifiable> = inner.this.clone();
            context::rewire_if_changed(&inner.deps, &target);
        });
    }

    /// Subscribe a closure to the update-needed signal.
    pub fn when_changed(&self, callback: impl Fn() + Send + Sync + 'static) -> Lifetime {
        let notifier: Arc<dyn Notifiable> = Arc::new(FnNotifier(callback));
        let entry = self.inner.update_observers.add(Arc::downgrade(&notifier));
        entry.join(Lifetime::holding(notifier))
    }

    /// Weakly subscribe a notifiable to the update-needed signal.
    pub fn subscribe(&self, target: Weak<dyn Notifiable>) -> Lifetime {
        self.inner.update_observers.add(target)
    }

    /// Raise the update-needed signal by hand: fans out once, then
    /// coalesces until the next [`invoke`](Trigger::invoke).
    pub fn mark_as_changed(&self) {
        self.inner.mark_as_changed();
    }
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger")
            .field(
                "pending_update",
                &self.inner.pending_update.load(Ordering::SeqCst),
            )
            .finish()
    }
}

/// Build a trigger and subscribe `on_update` to its update-needed signal in
/// one step. Releasing the returned lifetime stops the updates.
pub fn trigger(
    action: impl Fn() + Send + Sync + 'static,
    on_update: impl Fn() + Send + Sync + 'static,
) -> (Trigger, Lifetime) {
    let trigger = Trigger::new(action);
    let lifetime = trigger.when_changed(on_update);
    (trigger, lifetime)
}
