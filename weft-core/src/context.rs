//! Dependency-capture context
//!
//! Implicit dependency discovery needs ambient state scoped to a single
//! evaluation: a stack of capture frames, strictly thread-local. A cell read
//! during an evaluation appends itself to the topmost frame (at most once
//! per evaluation); afterwards the frame's observed list is diffed against
//! the previous run's to decide whether subscriptions must be rewired.
//!
//! Frames never cross threads. Popped frames are recycled through a small
//! per-thread spare pool so steady-state evaluation allocates nothing.

use crate::lifetime::Lifetime;
use crate::metrics::EngineMetrics;
use crate::notify::{Changeable, Notifiable, SourceId};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::{Arc, Weak};

/// One observed dependency: identity plus a handle to resubscribe through.
pub(crate) struct TrackedSource {
    pub id: SourceId,
    pub source: Arc<dyn Changeable>,
}

impl Clone for TrackedSource {
    fn clone(&self) -> Self {
        TrackedSource {
            id: self.id,
            source: self.source.clone(),
        }
    }
}

/// Per-evaluation record of observed dependencies.
struct Frame {
    dependencies: Vec<TrackedSource>,
    expected: Option<Vec<SourceId>>,
}

impl Frame {
    fn new() -> Self {
        Frame {
            dependencies: Vec::new(),
            expected: None,
        }
    }
}

const SPARE_LIMIT: usize = 8;

thread_local! {
    static STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
    static SPARE: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// Pops the frame on scope exit, unwinding included, and recycles it.
struct PopGuard;

impl Drop for PopGuard {
    fn drop(&mut self) {
        let frame = STACK.with(|stack| stack.borrow_mut().pop());
        if let Some(mut frame) = frame {
            frame.dependencies.clear();
            frame.expected = None;
            SPARE.with(|spare| {
                let mut spare = spare.borrow_mut();
                if spare.len() < SPARE_LIMIT {
                    spare.push(frame);
                }
            });
        }
    }
}

/// Run `body` inside a fresh capture frame. `expected` is the previous
/// run's dependency set, if any, made available for diffing.
pub(crate) fn with_frame<R>(expected: Option<Vec<SourceId>>, body: impl FnOnce() -> R) -> R {
    let mut frame = SPARE
        .with(|spare| spare.borrow_mut().pop())
        .unwrap_or_else(Frame::new);
    frame.expected = expected;
    STACK.with(|stack| stack.borrow_mut().push(frame));

    let _guard = PopGuard;
    body()
}

/// Evaluate `body` in an isolated frame whose observations are discarded.
///
/// Reads inside `body` register nowhere visible: the enclosing evaluation,
/// if any, does not pick them up as dependencies.
pub fn untracked<R>(body: impl FnOnce() -> R) -> R {
    with_frame(None, body)
}

/// Append `source` to the topmost frame, once per evaluation. No-op when no
/// frame is active.
pub(crate) fn register_dependency(source: Arc<dyn Changeable>) {
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        if let Some(frame) = stack.last_mut() {
            let id = source.source_id();
            if frame.dependencies.iter().all(|dep| dep.id != id) {
                frame.dependencies.push(TrackedSource { id, source });
            }
        }
    });
}

/// Whether the topmost frame's observed set differs from its expected set.
/// True when no expected set was provided (first run). Order-sensitive.
pub(crate) fn dependencies_differ() -> bool {
    STACK.with(|stack| {
        let stack = stack.borrow();
        let Some(frame) = stack.last() else {
            return false;
        };
        match &frame.expected {
            None => true,
            Some(expected) => {
                expected.len() != frame.dependencies.len()
                    || expected
                        .iter()
                        .zip(&frame.dependencies)
                        .any(|(id, dep)| *id != dep.id)
            }
        }
    })
}

/// Snapshot of the topmost frame's observed dependencies.
pub(crate) fn observed_dependencies() -> Vec<TrackedSource> {
    STACK.with(|stack| {
        stack
            .borrow()
            .last()
            .map(|frame| frame.dependencies.clone())
            .unwrap_or_default()
    })
}

/// Empty the topmost frame's observed list. Used before releasing a stale
/// subscription set: the release can run arbitrary reads (gauge updates,
/// observer-count transitions) and those must not bind into the finishing
/// evaluation.
pub(crate) fn reset_dependencies() {
    STACK.with(|stack| {
        if let Some(frame) = stack.borrow_mut().last_mut() {
            frame.dependencies.clear();
        }
    });
}

/// The dependency set a computed cell or trigger carries between runs.
pub(crate) struct DepSet {
    /// Observed sources from the last completed run. `None` = never ran.
    tracked: Option<Vec<TrackedSource>>,
    /// Composite subscription over `tracked`.
    subscription: Option<Lifetime>,
}

impl DepSet {
    pub fn new() -> Self {
        DepSet {
            tracked: None,
            subscription: None,
        }
    }

    pub fn expected_ids(&self) -> Option<Vec<SourceId>> {
        self.tracked
            .as_ref()
            .map(|tracked| tracked.iter().map(|dep| dep.id).collect())
    }
}

/// Diff the topmost frame against its expected set and, if it changed,
/// rewire `slot`'s subscriptions: subscribe `target` to every newly observed
/// source, swap the set in, reset the frame, and only then release the old
/// composite. Must be called inside the frame the evaluation ran in.
pub(crate) fn rewire_if_changed(slot: &Mutex<DepSet>, target: &Weak<dyn Notifiable>) {
    if !dependencies_differ() {
        return;
    }

    let observed = observed_dependencies();
    let mut subscription = Lifetime::empty();
    for dep in &observed {
        subscription = subscription.join(dep.source.subscribe_weak(target.clone()));
    }

    tracing::debug!(dependencies = observed.len(), "rewired dependency set");
    EngineMetrics::global().record_rewire();

    let old = {
        let mut deps = slot.lock();
        let old = deps.subscription.replace(subscription);
        deps.tracked = Some(observed);
        old
    };

    // Releasing the old composite can itself evaluate code that reads
    // cells; clear the frame first so those reads cannot bind here.
    reset_dependencies();
    if let Some(old) = old {
        old.done();
    }
}

/// Release everything `slot` holds: subscriptions and the tracked set.
pub(crate) fn release_dependencies(slot: &Mutex<DepSet>) {
    let old = {
        let mut deps = slot.lock();
        deps.tracked = None;
        deps.subscription.take()
    };
    if let Some(old) = old {
        old.done();
    }
}
