//! End-to-end tests for the reactive engine

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use weft_core::prelude::*;
use weft_core::EngineMetrics;

#[test]
fn test_simple_binding() {
    let cell = stored(1);
    assert_eq!(cell.get(), 1);

    cell.set(2);
    assert_eq!(cell.get(), 2);
}

#[test]
fn test_computed_follows_its_dependency_set() {
    let a = stored(1);
    let b = stored(2);

    let (ca, cb) = (a.clone(), b.clone());
    let c = computed(move || if ca.get() == 0 { cb.get() } else { ca.get() });

    assert_eq!(c.get(), 1);

    a.set(3);
    assert_eq!(c.get(), 3);

    a.set(0);
    assert_eq!(c.get(), 2);

    b.set(4);
    assert_eq!(c.get(), 4);

    a.set(5);
    assert_eq!(c.get(), 5);

    // b left the dependency set when a became non-zero again.
    b.set(6);
    assert_eq!(c.get(), 5);
}

#[test]
fn test_observer_self_stabilises_without_recursion() {
    let cell = stored(1);

    let writer = cell.clone();
    cell.observe(move |value| {
        if value < 5 {
            writer.set(value + 1);
        }
    })
    .forever();

    assert_eq!(cell.get(), 5);

    cell.set(0);
    assert_eq!(cell.get(), 5);
}

#[test]
fn test_trigger_coalesces_updates() {
    let cell = stored(1);
    let read_value = Arc::new(Mutex::new(0));
    let update_count = Arc::new(AtomicU32::new(0));

    let c = cell.clone();
    let r = read_value.clone();
    let u = update_count.clone();
    let (refresh, lifetime) = trigger(
        move || {
            *r.lock() = c.get();
        },
        move || {
            u.fetch_add(1, Ordering::SeqCst);
        },
    );

    // Writes before the first invoke touch nothing: no dependencies yet.
    cell.set(2);
    assert_eq!(update_count.load(Ordering::SeqCst), 0);

    refresh.invoke();
    assert_eq!(*read_value.lock(), 2);
    assert_eq!(update_count.load(Ordering::SeqCst), 0);

    cell.set(3);
    cell.set(4);
    assert_eq!(update_count.load(Ordering::SeqCst), 1);

    refresh.invoke();
    assert_eq!(*read_value.lock(), 4);
    cell.set(5);
    assert_eq!(update_count.load(Ordering::SeqCst), 2);

    lifetime.done();
    cell.set(6);
    assert_eq!(update_count.load(Ordering::SeqCst), 2);
}

#[test]
fn test_array_range_replacement_event() {
    let arr = array(vec![1]);
    let calls = Arc::new(Mutex::new(Vec::new()));

    let c = calls.clone();
    let _lt = arr.last_replacement().observe(move |replacement| {
        c.lock().push(replacement);
    });

    arr.insert(0, 0);
    assert_eq!(arr.get(), vec![0, 1]);

    let calls = calls.lock();
    assert_eq!(calls.len(), 2, "initial delivery plus one change");
    assert_eq!(calls[1].range, 0..0);
    assert_eq!(calls[1].replaced, Vec::<i32>::new());
    assert_eq!(calls[1].inserted, vec![0]);
}

#[test]
fn test_released_computed_leaves_no_residue() {
    let source = stored(1);
    let hits = Arc::new(AtomicU32::new(0));

    {
        let s = source.clone();
        let derived = computed(move || s.get() + 1);

        let h = hits.clone();
        let _lt = derived.when_changed(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(derived.get(), 2);
        source.set(2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // Scope exit drops the subscription and every reference to the
        // computed cell.
    }

    source.set(3);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(!source.is_bound().get());
}

#[test]
fn test_observe_delivery_law() {
    let cell = stored(10);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let s = seen.clone();
    let lt = cell.observe(move |value| {
        s.lock().push(value);
    });

    cell.set(11);
    cell.set(11); // silent under the equality policy
    cell.set(12);
    lt.done();
    cell.set(13);

    assert_eq!(*seen.lock(), vec![10, 11, 12]);
}

#[test]
fn test_mark_as_changed_is_idempotent_while_dirty() {
    let source = stored(1);
    let s = source.clone();
    let derived = computed(move || s.get());
    let _ = derived.get();

    let hits = Arc::new(AtomicU32::new(0));
    let h = hits.clone();
    let _lt = derived.when_changed(move || {
        h.fetch_add(1, Ordering::SeqCst);
    });

    derived.mark_as_changed();
    derived.mark_as_changed();
    derived.mark_as_changed();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // A read refills the cache; the next invalidation notifies again.
    let _ = derived.get();
    derived.mark_as_changed();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[test]
fn test_composite_lifetime_releases_all_members() {
    let a = stored(1);
    let b = stored(2);
    let hits = Arc::new(AtomicU32::new(0));

    let ha = hits.clone();
    let hb = hits.clone();
    let combined = a
        .when_changed(move || {
            ha.fetch_add(1, Ordering::SeqCst);
        })
        .join(b.when_changed(move || {
            hb.fetch_add(1, Ordering::SeqCst);
        }));

    a.set(10);
    b.set(20);
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    combined.done();
    a.set(11);
    b.set(21);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[test]
fn test_attachment_laws() {
    let point = attachment(5);
    assert_eq!(point.get(), 5);

    let cell = stored(7);
    point.attach_to(cell.clone());
    assert_eq!(point.get(), cell.get());

    cell.set(8);
    assert_eq!(point.get(), 8);
}

#[test]
fn test_transitive_invalidation_before_next_read() {
    let source = stored(1);
    let s = source.clone();
    let middle = computed(move || s.get() * 10);
    let m = middle.clone();
    let top = computed(move || m.get() + 1);

    let notified = Arc::new(AtomicU32::new(0));
    let n = notified.clone();
    let _lt = top.when_changed(move || {
        n.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(top.get(), 11);

    // The write reaches the transitive dependent before any read returns a
    // cached value again.
    source.set(2);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(top.get(), 21);
}

#[test]
fn test_computed_metrics_track_cache_traffic() {
    let before = EngineMetrics::global().snapshot();

    let source = stored(1);
    let s = source.clone();
    let derived = computed(move || s.get());

    let _ = derived.get(); // miss + recomputation
    let _ = derived.get(); // hit

    // Tests run concurrently against the global counters, so lower bounds
    // are the strongest safe assertion.
    let after = EngineMetrics::global().snapshot();
    assert!(after.cache_misses >= before.cache_misses + 1);
    assert!(after.recomputations >= before.recomputations + 1);
    assert!(after.cache_hits >= before.cache_hits + 1);
}

#[test]
fn test_concurrent_writers_never_wedge() {
    let cell = stored(0u64);
    let s = cell.clone();
    let doubled = computed(move || s.get() * 2);
    let _lt = doubled.when_changed(|| {});
    let _ = doubled.get();

    let threads: Vec<_> = (0..4u64)
        .map(|worker| {
            let cell = cell.clone();
            std::thread::spawn(move || {
                for i in 0..100u64 {
                    cell.set(worker * 1_000 + i + 1);
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().expect("writer thread panicked");
    }

    let final_value = cell.get();
    assert!(final_value >= 1 && final_value <= 3_100);
    assert_eq!(doubled.get(), final_value * 2);
}
