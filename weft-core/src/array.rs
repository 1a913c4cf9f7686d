//! Array cells
//!
//! An [`ArrayCell`] wraps an ordered sequence. Whole-value writes behave
//! like a stored cell; in-place range replacements always notify and record
//! a [`Replacement`] descriptor into the lazily created
//! [`last_replacement`](ArrayCell::last_replacement) cell, so observers that
//! care about *what* changed can avoid diffing the whole sequence.
//!
//! Every read registers the array itself as a dependency; scalar reads
//! (`len`, `first`, `last`) therefore see a notification on any write, not
//! only on writes that change the scalar.

use crate::cell::{Cell, CellCore, ObserverHost, WritableCell};
use crate::context;
use crate::lifetime::Lifetime;
use crate::notify::{Changeable, Notifiable, SourceId};
use crate::stored::StoredCell;
use parking_lot::Mutex;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Descriptor of one range replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement<T> {
    /// Indices that were replaced, in the pre-replacement sequence.
    pub range: Range<usize>,
    /// Elements that were removed.
    pub replaced: Vec<T>,
    /// Elements that were spliced in.
    pub inserted: Vec<T>,
}

impl<T> Replacement<T> {
    /// The descriptor an untouched array starts with.
    pub fn none() -> Self {
        Replacement {
            range: 0..0,
            replaced: Vec::new(),
            inserted: Vec::new(),
        }
    }
}

struct ArrayInner<T> {
    this: Weak<ArrayInner<T>>,
    core: CellCore<Vec<T>>,
    last_replacement: Mutex<Option<StoredCell<Replacement<T>>>>,
    /// A forced notification has fanned out and no read or write has
    /// happened since. Keeps `mark_as_changed` idempotent without touching
    /// the storage, which always holds the sequence.
    forced_dirty: AtomicBool,
}

/// A cell wrapping an ordered sequence with range-replace events.
///
/// Cloning the handle shares the same cell.
pub struct ArrayCell<T> {
    inner: Arc<ArrayInner<T>>,
}

impl<T> Clone for ArrayCell<T> {
    fn clone(&self) -> Self {
        ArrayCell {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> ArrayCell<T> {
    pub fn new(elements: Vec<T>) -> Self {
        ArrayCell {
            inner: Arc::new_cyclic(|this| ArrayInner {
                this: this.clone(),
                core: CellCore::new(Some(elements)),
                last_replacement: Mutex::new(None),
                forced_dirty: AtomicBool::new(false),
            }),
        }
    }

    /// Every read path comes through here; reads also re-arm forced
    /// notifications.
    fn register(&self) {
        let dep: Arc<dyn Changeable> = self.inner.clone();
        context::register_dependency(dep);
        self.inner.forced_dirty.store(false, Ordering::SeqCst);
    }

    fn with_elements<R>(&self, read: impl FnOnce(&Vec<T>) -> R) -> R {
        let state = self.inner.core.state.lock();
        read(state.cached.as_ref().expect("array cell always holds a value"))
    }

    /// Replace `range` with `new_elements` in place. Always notifies, and
    /// records the replacement descriptor.
    ///
    /// # Panics
    ///
    /// Panics if `range` is out of bounds.
    pub fn splice(&self, range: Range<usize>, new_elements: Vec<T>) {
        let replacement = {
            let mut state = self.inner.core.state.lock();
            let elements = state.cached.as_mut().expect("array cell always holds a value");
            let replaced: Vec<T> = elements
                .splice(range.clone(), new_elements.iter().cloned())
                .collect();
            Replacement {
                range,
                replaced,
                inserted: new_elements,
            }
        };
        self.inner.forced_dirty.store(false, Ordering::SeqCst);
        self.inner.core.fire();
        self.record_replacement(replacement);
    }

    /// Insert `element` at `index`.
    pub fn insert(&self, index: usize, element: T) {
        self.splice(index..index, vec![element]);
    }

    /// Append `element`.
    pub fn push(&self, element: T) {
        let len = self.with_elements(Vec::len);
        self.splice(len..len, vec![element]);
    }

    /// Remove and return the element at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn remove(&self, index: usize) -> T {
        let replacement = {
            let mut state = self.inner.core.state.lock();
            let elements = state.cached.as_mut().expect("array cell always holds a value");
            let replaced: Vec<T> = elements.splice(index..index + 1, std::iter::empty()).collect();
            Replacement {
                range: index..index + 1,
                replaced,
                inserted: Vec::new(),
            }
        };
        self.inner.forced_dirty.store(false, Ordering::SeqCst);
        self.inner.core.fire();
        let removed = replacement.replaced[0].clone();
        self.record_replacement(replacement);
        removed
    }

    /// Element at `index`, if any.
    pub fn item(&self, index: usize) -> Option<T> {
        self.register();
        self.with_elements(|elements| elements.get(index).cloned())
    }

    /// Copy of the elements in `range`.
    ///
    /// # Panics
    ///
    /// Panics if `range` is out of bounds.
    pub fn slice(&self, range: Range<usize>) -> Vec<T> {
        self.register();
        self.with_elements(|elements| elements[range].to_vec())
    }

    pub fn len(&self) -> usize {
        self.register();
        self.with_elements(Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.register();
        self.with_elements(Vec::is_empty)
    }

    pub fn first(&self) -> Option<T> {
        self.register();
        self.with_elements(|elements| elements.first().cloned())
    }

    pub fn last(&self) -> Option<T> {
        self.register();
        self.with_elements(|elements| elements.last().cloned())
    }

    /// Index of the first element matching `predicate`.
    pub fn position(&self, predicate: impl Fn(&T) -> bool) -> Option<usize> {
        self.register();
        // Snapshot first: the predicate is caller code and must not run
        // under the cell lock.
        let elements = self.with_elements(Vec::clone);
        elements.iter().position(|element| predicate(element))
    }

    /// Cell carrying the most recent [`Replacement`], created lazily.
    /// Always-notify policy: every recorded replacement fires, even if the
    /// descriptor happens to compare equal to the previous one.
    pub fn last_replacement(&self) -> StoredCell<Replacement<T>> {
        let mut slot = self.inner.last_replacement.lock();
        slot.get_or_insert_with(|| StoredCell::always_changed(Replacement::none()))
            .clone()
    }

    fn record_replacement(&self, replacement: Replacement<T>) {
        let cell = self.inner.last_replacement.lock().clone();
        if let Some(cell) = cell {
            cell.set(replacement);
        }
    }
}

impl<T: Clone + Send + PartialEq + 'static> ArrayCell<T> {
    /// Replace the whole sequence, with stored-cell change detection:
    /// an equal sequence is a silent write.
    pub fn set(&self, elements: Vec<T>) {
        // Compare against a snapshot so the element comparisons run outside
        // the cell lock.
        let current = self.with_elements(Vec::clone);
        if current == elements {
            return;
        }
        let replacement = {
            let mut state = self.inner.core.state.lock();
            let slot = state.cached.as_mut().expect("array cell always holds a value");
            let replaced = std::mem::replace(slot, elements.clone());
            Replacement {
                range: 0..replaced.len(),
                replaced,
                inserted: elements,
            }
        };
        self.inner.forced_dirty.store(false, Ordering::SeqCst);
        self.inner.core.fire();
        self.record_replacement(replacement);
    }
}

impl<T: Clone + Send + 'static> Changeable for ArrayInner<T> {
    fn source_id(&self) -> SourceId {
        self.core.id
    }

    fn subscribe_weak(&self, target: Weak<dyn Notifiable>) -> Lifetime {
        let host: Weak<dyn ObserverHost> = self.this.clone();
        self.core.attach_observer(host, target)
    }
}

impl<T: Clone + Send + 'static> ObserverHost for ArrayInner<T> {
    fn after_observer_removed(&self) {
        self.core.release_check();
    }
}

impl<T: Clone + Send + 'static> Cell<Vec<T>> for ArrayCell<T> {
    fn get(&self) -> Vec<T> {
        self.register();
        self.with_elements(Vec::clone)
    }

    fn refresh(&self) -> Vec<T> {
        self.get()
    }

    fn mark_as_changed(&self) {
        // Like a stored cell: the value is kept, and the flag gives the
        // forced notification its dirty-bit idempotence.
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

impl<T: Clone + Send + PartialEq + 'static> WritableCell<Vec<T>> for ArrayCell<T> {
    fn set(&self, elements: Vec<T>) {
        ArrayCell::set(self, elements);
    }
}

impl<T: Clone + Send + std::fmt::Debug + 'static> std::fmt::Debug for ArrayCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayCell")
            .field("id", &self.inner.core.id)
            .field("elements", &self.inner.core.cached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellExt;

    #[test]
    fn test_splice_replaces_in_place() {
        let array = ArrayCell::new(vec![1, 2, 3, 4]);
        array.splice(1..3, vec![9]);
        assert_eq!(array.get(), vec![1, 9, 4]);
    }

    #[test]
    fn test_insert_push_remove() {
        let array = ArrayCell::new(vec![1]);
        array.insert(0, 0);
        array.push(2);
        assert_eq!(array.get(), vec![0, 1, 2]);

        assert_eq!(array.remove(1), 1);
        assert_eq!(array.get(), vec![0, 2]);
    }

    #[test]
    fn test_scalar_reads() {
        let array = ArrayCell::new(vec![3, 1, 4]);
        assert_eq!(array.len(), 3);
        assert_eq!(array.first(), Some(3));
        assert_eq!(array.last(), Some(4));
        assert_eq!(array.item(1), Some(1));
        assert_eq!(array.item(9), None);
        assert_eq!(array.slice(1..3), vec![1, 4]);
        assert_eq!(array.position(|v| *v == 4), Some(2));
        assert_eq!(array.position(|v| *v == 7), None);
    }

    #[test]
    fn test_replacement_descriptor_records_the_change() {
        let array = ArrayCell::new(vec![1]);
        let replacements = array.last_replacement();

        array.insert(0, 0);
        assert_eq!(
            replacements.get(),
            Replacement {
                range: 0..0,
                replaced: vec![],
                inserted: vec![0],
            }
        );

        array.splice(0..2, vec![5]);
        assert_eq!(
            replacements.get(),
            Replacement {
                range: 0..2,
                replaced: vec![0, 1],
                inserted: vec![5],
            }
        );
    }

    #[test]
    fn test_every_splice_notifies() {
        let array = ArrayCell::new(vec![1]);
        let hits = Arc::new(Mutex::new(0u32));
        let h = hits.clone();
        let _lt = array.when_changed(move || {
            *h.lock() += 1;
        });

        // Splices always notify, even when the contents end up equal.
        array.splice(0..1, vec![1]);
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn test_whole_set_uses_stored_change_detection() {
        let array = ArrayCell::new(vec![1, 2]);
        let hits = Arc::new(Mutex::new(0u32));
        let h = hits.clone();
        let _lt = array.when_changed(move || {
            *h.lock() += 1;
        });

        array.set(vec![1, 2]);
        assert_eq!(*hits.lock(), 0);

        array.set(vec![2, 1]);
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn test_mark_as_changed_is_idempotent_until_read() {
        let array = ArrayCell::new(vec![1]);
        let hits = Arc::new(Mutex::new(0u32));
        let h = hits.clone();
        let _lt = array.when_changed(move || {
            *h.lock() += 1;
        });

        array.mark_as_changed();
        array.mark_as_changed();
        array.mark_as_changed();
        assert_eq!(*hits.lock(), 1);

        // Any read re-arms the forced notification.
        let _ = array.len();
        array.mark_as_changed();
        assert_eq!(*hits.lock(), 2);

        // So does a splice (which fans out itself).
        array.push(2);
        assert_eq!(*hits.lock(), 3);
        array.mark_as_changed();
        array.mark_as_changed();
        assert_eq!(*hits.lock(), 4);
    }

    #[test]
    fn test_reads_bind_into_computed() {
        let array = ArrayCell::new(vec![1, 2, 3]);
        let a = array.clone();
        let total = crate::computed(move || a.get().iter().sum::<i32>());
        assert_eq!(total.get(), 6);

        array.push(4);
        assert_eq!(total.get(), 10);
    }
}
