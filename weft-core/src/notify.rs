//! Observer wiring
//!
//! Two capability traits connect observers to sources: a [`Changeable`] can
//! tell observers it changed, a [`Notifiable`] accepts that signal. The
//! [`NotifierSet`] is the weakly-held observer collection every source
//! carries: entries are tombstoned on revocation and physically compacted
//! lazily, and fanout iterates a snapshot so observers added mid-fire do not
//! run in the same pass.

use crate::lifetime::Lifetime;
use crate::metrics::EngineMetrics;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Process-unique identity of a change source, used for dependency-set
/// diffing. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

impl SourceId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SourceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Anything that accepts a "something you depend on changed" signal.
pub trait Notifiable: Send + Sync {
    fn mark_as_changed(&self);
}

/// Anything observers can subscribe to.
pub trait Changeable: Send + Sync {
    /// Stable identity for dependency diffing.
    fn source_id(&self) -> SourceId;

    /// Add `target` to this source's observer set, weakly. The returned
    /// [`Lifetime`] revokes exactly this entry.
    fn subscribe_weak(&self, target: Weak<dyn Notifiable>) -> Lifetime;
}

/// Notifiable adapter around a plain closure.
pub(crate) struct FnNotifier<F: Fn() + Send + Sync>(pub F);

impl<F: Fn() + Send + Sync> Notifiable for FnNotifier<F> {
    fn mark_as_changed(&self) {
        (self.0)();
    }
}

struct Entry {
    target: Weak<dyn Notifiable>,
    revoked: Arc<AtomicBool>,
}

impl Entry {
    fn is_live(&self) -> bool {
        !self.revoked.load(Ordering::SeqCst) && self.target.strong_count() > 0
    }
}

/// Weakly-held observer collection with lazy compaction.
#[derive(Clone)]
pub(crate) struct NotifierSet {
    entries: Arc<Mutex<Vec<Entry>>>,
}

impl NotifierSet {
    pub fn new() -> Self {
        NotifierSet {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Add an observer. The returned lifetime tombstones this entry; the
    /// vector slot is reclaimed by a later compaction pass.
    pub fn add(&self, target: Weak<dyn Notifiable>) -> Lifetime {
        let revoked = Arc::new(AtomicBool::new(false));
        self.entries.lock().push(Entry {
            target,
            revoked: revoked.clone(),
        });

        let slot = Arc::downgrade(&self.entries);
        Lifetime::new(move || {
            revoked.store(true, Ordering::SeqCst);
            if let Some(entries) = slot.upgrade() {
                compact(&entries);
            }
        })
    }

    /// Notify every live observer once. Iterates over a snapshot taken
    /// under the lock: observers added during the fire wait for the next
    /// pass, and entries revoked mid-fire are skipped silently.
    pub fn fire_all(&self) {
        let snapshot: Vec<(Arc<dyn Notifiable>, Arc<AtomicBool>)> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|entry| !entry.revoked.load(Ordering::SeqCst))
                .filter_map(|entry| {
                    entry
                        .target
                        .upgrade()
                        .map(|target| (target, entry.revoked.clone()))
                })
                .collect()
        };

        if !snapshot.is_empty() {
            EngineMetrics::global().record_fanout();
        }

        for (target, revoked) in snapshot {
            if revoked.load(Ordering::SeqCst) {
                continue;
            }
            target.mark_as_changed();
        }

        self.compact_if_needed();
    }

    /// Whether at least one observer is alive and not revoked.
    pub fn any_live(&self) -> bool {
        self.entries.lock().iter().any(Entry::is_live)
    }

    /// Drop tombstoned and dead entries once they outnumber the live ones.
    pub fn compact_if_needed(&self) {
        let mut entries = self.entries.lock();
        let dead = entries.iter().filter(|entry| !entry.is_live()).count();
        if dead > 0 && dead * 2 >= entries.len() {
            entries.retain(Entry::is_live);
        }
    }
}

fn compact(entries: &Mutex<Vec<Entry>>) {
    entries.lock().retain(Entry::is_live);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct Counter(AtomicU32);

    impl Counter {
        fn new() -> Arc<Self> {
            Arc::new(Counter(AtomicU32::new(0)))
        }

        fn count(&self) -> u32 {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl Notifiable for Counter {
        fn mark_as_changed(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_fire_reaches_live_observers() {
        let set = NotifierSet::new();
        let counter = Counter::new();
        let _lt = set.add(Arc::downgrade(&counter) as Weak<dyn Notifiable>);

        set.fire_all();
        set.fire_all();

        assert_eq!(counter.count(), 2);
    }

    #[test]
    fn test_revoked_entry_is_skipped() {
        let set = NotifierSet::new();
        let counter = Counter::new();
        let lt = set.add(Arc::downgrade(&counter) as Weak<dyn Notifiable>);

        lt.done();
        set.fire_all();

        assert_eq!(counter.count(), 0);
        assert!(!set.any_live());
    }

    #[test]
    fn test_dead_target_is_skipped() {
        let set = NotifierSet::new();
        let counter = Counter::new();
        let _lt = set.add(Arc::downgrade(&counter) as Weak<dyn Notifiable>);

        drop(counter);
        set.fire_all();
        assert!(!set.any_live());
    }

    #[test]
    fn test_compaction_removes_tombstones() {
        let set = NotifierSet::new();
        let counter = Counter::new();

        let lt1 = set.add(Arc::downgrade(&counter) as Weak<dyn Notifiable>);
        let lt2 = set.add(Arc::downgrade(&counter) as Weak<dyn Notifiable>);
        lt1.done();
        lt2.done();

        assert!(set.entries.lock().is_empty());
    }

    #[test]
    fn test_observer_added_during_fire_waits_for_next_pass() {
        struct Registrar {
            set: NotifierSet,
            inner: Arc<Counter>,
            lifetime: Mutex<Option<Lifetime>>,
        }

        impl Notifiable for Registrar {
            fn mark_as_changed(&self) {
                let weak = Arc::downgrade(&self.inner) as Weak<dyn Notifiable>;
                let mut slot = self.lifetime.lock();
                if slot.is_none() {
                    *slot = Some(self.set.add(weak));
                }
            }
        }

        let set = NotifierSet::new();
        let inner = Counter::new();
        let registrar = Arc::new(Registrar {
            set: set.clone(),
            inner: inner.clone(),
            lifetime: Mutex::new(None),
        });
        let _lt = set.add(Arc::downgrade(&registrar) as Weak<dyn Notifiable>);

        set.fire_all();
        assert_eq!(inner.count(), 0);

        set.fire_all();
        assert_eq!(inner.count(), 1);
    }
}
