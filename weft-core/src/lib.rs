//! weft: reactive value cells
//!
//! This crate provides the reactive engine behind weft: programs declare
//! *stored cells* (values written from outside) and *computed cells* (pure
//! functions of other cells), and the engine guarantees that anything that
//! read a cell hears about it when that cell changes.
//!
//! # Architecture
//!
//! Dependencies are discovered implicitly. Every evaluation (a computed
//! cell's function, a trigger's action) runs inside a thread-local capture
//! frame; each cell read during the evaluation registers itself there. The
//! observed set is diffed against the previous run's and subscriptions are
//! rewired only when it changed. Dependency sets stabilise quickly, so the
//! common case skips the rewire entirely.
//!
//! Observers are held weakly by their sources; ownership of each
//! subscription lives in a [`Lifetime`] token held by the consumer. This
//! breaks the natural cycle in observer graphs (a cell points at its
//! observers, an observer usually points back): disposal works from either
//! side, and a dropped observer is skipped silently.
//!
//! Invalidation propagates eagerly but idempotently: a cell whose cache is
//! already dirty absorbs further invalidations without re-notifying, which
//! bounds fanout under cyclic observation patterns.
//!
//! # Example
//!
//! ```
//! use weft_core::{computed, stored, Cell};
//!
//! let celsius = stored(20.0_f64);
//! let c = celsius.clone();
//! let fahrenheit = computed(move || c.get() * 9.0 / 5.0 + 32.0);
//!
//! assert_eq!(fahrenheit.get(), 68.0);
//! celsius.set(100.0);
//! assert_eq!(fahrenheit.get(), 212.0);
//! ```
//!
//! # Invariants
//!
//! 1. A cached computed value always equals its function applied to the
//!    dependency values recorded when it was last computed.
//! 2. Within one thread, a write's observers run before the write returns.
//! 3. `mark_as_changed` is idempotent while a cell is already dirty.
//! 4. `is_bound` reads true exactly while a cell has a live observer
//!    (released observers update it synchronously; observers that die
//!    without releasing are discovered lazily).

pub mod array;
pub mod attachment;
pub mod cell;
pub mod computed;
mod context;
pub mod external;
pub mod lifetime;
pub mod metrics;
pub mod notify;
pub mod stored;
pub mod trigger;

pub use array::{ArrayCell, Replacement};
pub use attachment::{AttachmentPoint, MutableAttachmentPoint};
pub use cell::{Cell, CellExt, WritableCell};
pub use computed::ComputedCell;
pub use context::untracked;
pub use external::{ExternalSourceCell, ExternalValueSource, SourceError, SourceSubscription};
pub use lifetime::Lifetime;
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use notify::{Changeable, Notifiable, SourceId};
pub use stored::StoredCell;
pub use trigger::{trigger, Trigger};

/// A stored cell with structural-equality change detection: writing an
/// equal value is silent.
pub fn stored<T: Clone + PartialEq + Send + 'static>(value: T) -> StoredCell<T> {
    StoredCell::new(value)
}

/// A stored cell that notifies on every write, for values with no usable
/// comparison.
pub fn stored_opaque<T: Clone + Send + 'static>(value: T) -> StoredCell<T> {
    StoredCell::always_changed(value)
}

/// An array cell over `elements`.
pub fn array<T: Clone + Send + 'static>(elements: Vec<T>) -> ArrayCell<T> {
    ArrayCell::new(elements)
}

/// A computed cell deriving its value from whatever cells `compute` reads.
pub fn computed<T: Clone + Send + 'static>(
    compute: impl Fn() -> T + Send + Sync + 'static,
) -> ComputedCell<T> {
    ComputedCell::new(compute)
}

/// An attachment point reading `default_value` until a target is attached.
pub fn attachment<T: Clone + Send + 'static>(default_value: T) -> AttachmentPoint<T> {
    AttachmentPoint::new(default_value)
}

/// A mutable attachment point, initially attached to `default`.
pub fn attachment_mutable<T: Clone + Send + 'static>(
    default: impl WritableCell<T> + 'static,
) -> MutableAttachmentPoint<T> {
    MutableAttachmentPoint::new(default)
}

/// Everything most callers need.
pub mod prelude {
    pub use crate::array::{ArrayCell, Replacement};
    pub use crate::attachment::{AttachmentPoint, MutableAttachmentPoint};
    pub use crate::cell::{Cell, CellExt, WritableCell};
    pub use crate::computed::ComputedCell;
    pub use crate::external::{ExternalSourceCell, ExternalValueSource};
    pub use crate::lifetime::Lifetime;
    pub use crate::stored::StoredCell;
    pub use crate::trigger::Trigger;
    pub use crate::{array, attachment, attachment_mutable, computed, stored, trigger, untracked};
}
