//! Cell abstraction
//!
//! [`Cell<T>`] is the read surface every cell kind shares: resolve the
//! current value (registering the read in the active capture frame), force a
//! refresh, invalidate, subscribe observers, and expose the `is_bound`
//! gauge. [`CellCore<T>`] is the machinery behind it: cached value, weak
//! observer set, and the lazily created gauge, with first/last-observer
//! transitions routed to the owning cell through [`ObserverHost`].
//!
//! [`CellExt`] layers the closure conveniences on top: `when_changed` wraps
//! a closure in a [`Notifiable`] adapter; `observe` additionally evaluates
//! immediately and converts reentrant self-notification into iteration.

use crate::context;
use crate::lifetime::Lifetime;
use crate::notify::{FnNotifier, Notifiable, NotifierSet, SourceId};
use crate::stored::StoredCell;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// An observable value storage node.
///
/// All methods are callable through `Arc<dyn Cell<T>>`; the closure-based
/// conveniences live in [`CellExt`].
pub trait Cell<T: Clone + Send + 'static>: Send + Sync {
    /// Current value. Registers this cell in the active capture frame, if
    /// any, and recomputes lazily when the cache is dirty.
    fn get(&self) -> T;

    /// Recompute unconditionally and overwrite the cache.
    fn refresh(&self) -> T;

    /// Drop the cache (if present) and notify observers once. Idempotent
    /// while already dirty.
    fn mark_as_changed(&self);

    /// Weakly add `target` to this cell's observers. The returned lifetime
    /// revokes exactly this entry.
    fn subscribe(&self, target: Weak<dyn Notifiable>) -> Lifetime;

    /// Gauge cell that reads true while at least one live observer exists.
    fn is_bound(&self) -> StoredCell<bool>;

    /// Stable identity for dependency diffing.
    fn source_id(&self) -> SourceId;

    #[doc(hidden)]
    fn reaches_attachment(&self, _id: SourceId) -> bool {
        false
    }
}

/// A cell that accepts writes.
pub trait WritableCell<T: Clone + Send + 'static>: Cell<T> {
    /// Store `value`, notifying observers according to the cell's
    /// change-detection policy.
    fn set(&self, value: T);
}

impl<T: Clone + Send + 'static, C: Cell<T> + ?Sized> Cell<T> for Arc<C> {
    fn get(&self) -> T {
        (**self).get()
    }

    fn refresh(&self) -> T {
        (**self).refresh()
    }

    fn mark_as_changed(&self) {
        (**self).mark_as_changed()
    }

    fn subscribe(&self, target: Weak<dyn Notifiable>) -> Lifetime {
        (**self).subscribe(target)
    }

    fn is_bound(&self) -> StoredCell<bool> {
        (**self).is_bound()
    }

    fn source_id(&self) -> SourceId {
        (**self).source_id()
    }

    fn reaches_attachment(&self, id: SourceId) -> bool {
        (**self).reaches_attachment(id)
    }
}

impl<T: Clone + Send + 'static, C: WritableCell<T> + ?Sized> WritableCell<T> for Arc<C> {
    fn set(&self, value: T) {
        (**self).set(value)
    }
}

/// Closure conveniences over [`Cell`].
pub trait CellExt<T: Clone + Send + 'static>: Cell<T> + Clone + Sized + 'static {
    /// Subscribe a closure to change notifications. The closure stays alive
    /// until the returned lifetime is released (or forever, if pinned).
    fn when_changed(&self, callback: impl Fn() + Send + Sync + 'static) -> Lifetime {
        let notifier: Arc<dyn Notifiable> = Arc::new(FnNotifier(callback));
        let entry = self.subscribe(Arc::downgrade(&notifier));
        entry.join(Lifetime::holding(notifier))
    }

    /// Subscribe a closure and evaluate it immediately with the current
    /// value, then once per change.
    ///
    /// If the closure writes a cell it itself depends on, the resulting
    /// self-notification is queued and re-run after the closure returns,
    /// repeatedly until it settles. The stack stays bounded no matter how
    /// many rounds a self-stabilising observer needs.
    fn observe(&self, callback: impl Fn(T) + Send + Sync + 'static) -> Lifetime {
        let adapter = Arc::new(ObserveAdapter {
            cell: self.clone(),
            callback,
            pending: AtomicBool::new(true),
            running: AtomicBool::new(false),
            _value: PhantomData,
        });
        let weak = Arc::downgrade(&adapter);
        let weak: Weak<dyn Notifiable> = weak;
        let entry = self.subscribe(weak);
        adapter.drain();
        entry.join(Lifetime::holding(adapter))
    }
}

impl<T: Clone + Send + 'static, C: Cell<T> + Clone + 'static> CellExt<T> for C {}

/// Observer adapter behind [`CellExt::observe`].
struct ObserveAdapter<T, C, F> {
    cell: C,
    callback: F,
    /// A delivery is owed.
    pending: AtomicBool,
    /// Some invocation (possibly further down this thread's stack) is
    /// draining; it will pick up `pending` before returning.
    running: AtomicBool,
    _value: PhantomData<fn() -> T>,
}

impl<T, C, F> ObserveAdapter<T, C, F>
where
    T: Clone + Send + 'static,
    C: Cell<T>,
    F: Fn(T) + Send + Sync,
{
    fn drain(&self) {
        loop {
            if self.running.swap(true, Ordering::SeqCst) {
                // The drainer below us on the stack (or on another thread)
                // owns the loop; it re-checks `pending` before finishing.
                return;
            }
            while self.pending.swap(false, Ordering::SeqCst) {
                // The adapter's reads are its own evaluation; keep them out
                // of whatever frame the notification interrupted.
                let value = context::untracked(|| self.cell.get());
                (self.callback)(value);
            }
            self.running.store(false, Ordering::SeqCst);
            if !self.pending.load(Ordering::SeqCst) {
                return;
            }
        }
    }
}

impl<T, C, F> Notifiable for ObserveAdapter<T, C, F>
where
    T: Clone + Send + 'static,
    C: Cell<T>,
    F: Fn(T) + Send + Sync,
{
    fn mark_as_changed(&self) {
        self.pending.store(true, Ordering::SeqCst);
        self.drain();
    }
}

/// Hooks a cell receives when its observer count crosses zero.
pub(crate) trait ObserverHost: Send + Sync {
    /// First live observer arrived.
    fn on_first_observer(&self) {}

    /// An observer entry was released; the cell decides whether it just
    /// became unbound.
    fn after_observer_removed(&self);
}

/// State every cell kind shares: cached value, observers, gauge.
pub(crate) struct CellCore<T> {
    pub id: SourceId,
    pub state: Mutex<CoreState<T>>,
    pub observers: NotifierSet,
}

pub(crate) struct CoreState<T> {
    pub cached: Option<T>,
    gauge: Option<StoredCell<bool>>,
}

impl<T: Clone + Send + 'static> CellCore<T> {
    pub fn new(initial: Option<T>) -> Self {
        CellCore {
            id: SourceId::next(),
            state: Mutex::new(CoreState {
                cached: initial,
                gauge: None,
            }),
            observers: NotifierSet::new(),
        }
    }

    pub fn cached(&self) -> Option<T> {
        self.state.lock().cached.clone()
    }

    pub fn store(&self, value: T) {
        self.state.lock().cached = Some(value);
    }

    /// Drop the cache. Returns whether a value was present.
    pub fn invalidate(&self) -> bool {
        self.state.lock().cached.take().is_some()
    }

    pub fn fire(&self) {
        self.observers.fire_all();
    }

    /// Invalidate-and-notify with dirty-bit idempotence: while already
    /// dirty, repeated calls do nothing.
    pub fn mark_as_changed(&self) {
        if self.invalidate() {
            self.fire();
        }
    }

    /// The lazily created `is_bound` gauge.
    pub fn gauge(&self) -> StoredCell<bool> {
        let live = self.observers.any_live();
        let mut state = self.state.lock();
        state
            .gauge
            .get_or_insert_with(|| StoredCell::new(live))
            .clone()
    }

    /// Write the gauge if it exists. Takes the state lock only long enough
    /// to clone the handle: the write itself fans out to user code.
    fn set_gauge(&self, bound: bool) {
        let gauge = self.state.lock().gauge.clone();
        if let Some(gauge) = gauge {
            gauge.set(bound);
        }
    }

    /// Add an observer entry, running the first-observer transition when it
    /// applies and arranging the release-side transition on revocation.
    pub fn attach_observer(
        &self,
        host: Weak<dyn ObserverHost>,
        target: Weak<dyn Notifiable>,
    ) -> Lifetime {
        let had_live = self.observers.any_live();
        let entry = self.observers.add(target);
        if !had_live {
            if let Some(host) = host.upgrade() {
                host.on_first_observer();
            }
            self.set_gauge(true);
        }

        entry.join(Lifetime::new(move || {
            if let Some(host) = host.upgrade() {
                host.after_observer_removed();
            }
        }))
    }

    /// Called from `after_observer_removed` implementations: if no live
    /// observer remains, lower the gauge and report the transition.
    pub fn release_check(&self) -> bool {
        if self.observers.any_live() {
            return false;
        }
        self.set_gauge(false);
        true
    }
}
