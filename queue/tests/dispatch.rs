//! Hosted end-to-end tests for the event queue: dispatch timing, periodic
//! repetition, cancellation races, destructors, break semantics, ordering,
//! user-allocated events, and queue chaining.
//!
//! Timing margins follow the same shape as the queue's dispatch rules: a
//! deadline of N is always checked with a dispatch window comfortably past
//! N, never exactly at it.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use tickq::{EventId, HostQueue, UserEvent, event_dtor};

fn nop(_: *mut u8) {}

fn touch(p: *mut u8) {
    // SAFETY: tests pass a pointer to a live AtomicUsize.
    unsafe { (*(p as *const AtomicUsize)).fetch_add(1, Ordering::SeqCst) };
}

fn data(counter: &AtomicUsize) -> *mut u8 {
    counter as *const AtomicUsize as *mut u8
}

/// Destructor/callback for events whose payload holds a counter pointer.
fn touch_indirect(payload: *mut u8) {
    // SAFETY: the payload was written as a single counter pointer.
    unsafe { (**(payload as *const *const AtomicUsize)).fetch_add(1, Ordering::SeqCst) };
}

#[test]
fn immediate_call() {
    let count = AtomicUsize::new(0);
    let q = HostQueue::with_capacity(2048).unwrap();

    assert!(q.call(touch, data(&count)).is_valid());
    q.dispatch(0);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn delayed_call() {
    let count = AtomicUsize::new(0);
    let q = HostQueue::with_capacity(2048).unwrap();

    assert!(q.call_in(10, touch, data(&count)).is_valid());
    q.dispatch(15);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn periodic_call_stays_on_grid() {
    let count = AtomicUsize::new(0);
    let q = HostQueue::with_capacity(2048).unwrap();

    assert!(q.call_every(10, touch, data(&count)).is_valid());
    q.dispatch(55);
    assert_eq!(count.load(Ordering::SeqCst), 5);
}

#[test]
fn cancel_after_post() {
    let count = AtomicUsize::new(0);
    let q = HostQueue::with_capacity(2048).unwrap();

    let id = q.call_in(10, touch, data(&count));
    assert!(id.is_valid());
    assert!(q.cancel(id));

    q.dispatch(20);
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn cancel_in_reverse_post_order() {
    let count = AtomicUsize::new(0);
    let q = HostQueue::with_capacity(2048).unwrap();

    let ids: Vec<EventId> = (0..8).map(|_| q.call(touch, data(&count))).collect();
    assert!(ids.iter().all(|id| id.is_valid()));

    for id in ids.iter().rev() {
        assert!(q.cancel(*id));
    }

    q.dispatch(0);
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn cancel_from_callback_loses_to_same_batch() {
    struct CancelCtx {
        q: *const HostQueue,
        id: Cell<EventId>,
    }

    fn cancel_cb(p: *mut u8) {
        // SAFETY: payload points at the CancelCtx on the test stack.
        let ctx = unsafe { &*(p as *const CancelCtx) };
        // The victim was dequeued in the same batch; the cancel must
        // report failure but still suppress the callback.
        assert!(!unsafe { &*ctx.q }.cancel(ctx.id.get()));
    }

    let count = AtomicUsize::new(0);
    let q = HostQueue::with_capacity(2048).unwrap();

    let ctx = CancelCtx {
        q: &q,
        id: Cell::new(EventId::INVALID),
    };
    assert!(
        q.call(cancel_cb, &ctx as *const CancelCtx as *mut u8)
            .is_valid()
    );
    ctx.id.set(q.call(touch, data(&count)));
    assert!(ctx.id.get().is_valid());

    q.dispatch(0);
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn redundant_cancels_are_harmless() {
    let count = AtomicUsize::new(0);
    let q = HostQueue::with_capacity(2048).unwrap();

    let id = q.call(nop, ptr::null_mut());
    assert!(q.cancel(id));
    for _ in 0..5 {
        assert!(!q.cancel(id));
    }

    let id = q.call(nop, ptr::null_mut());
    q.dispatch(0);
    for _ in 0..5 {
        assert!(!q.cancel(id));
    }

    // The stale id must not disturb an unrelated pending event.
    assert!(q.call(touch, data(&count)).is_valid());
    for _ in 0..5 {
        assert!(!q.cancel(id));
    }
    q.dispatch(0);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn destructors_run_on_dispatch_cancel_and_destroy() {
    let count = AtomicUsize::new(0);
    let q = HostQueue::with_capacity(2048).unwrap();

    let post_with_dtor = |q: &HostQueue| {
        let p = q.alloc(size_of::<*const AtomicUsize>()).unwrap();
        // SAFETY: fresh payload, sized for one pointer.
        unsafe {
            (p.as_ptr() as *mut *const AtomicUsize).write(&count);
            event_dtor(p.as_ptr(), Some(touch_indirect));
            q.post(nop, p.as_ptr())
        }
    };

    // Natural completion.
    for _ in 0..3 {
        assert!(post_with_dtor(&q).is_valid());
    }
    q.dispatch(0);
    assert_eq!(count.load(Ordering::SeqCst), 3);

    // Cancellation.
    count.store(0, Ordering::SeqCst);
    let ids: Vec<EventId> = (0..3).map(|_| post_with_dtor(&q)).collect();
    for id in ids {
        assert!(q.cancel(id));
    }
    q.dispatch(0);
    assert_eq!(count.load(Ordering::SeqCst), 3);

    // Queue teardown: destructors, no callbacks.
    count.store(0, Ordering::SeqCst);
    for _ in 0..3 {
        assert!(post_with_dtor(&q).is_valid());
    }
    drop(q);
    assert_eq!(count.load(Ordering::SeqCst), 3);
}

#[test]
fn break_exits_indefinite_dispatch_without_windup() {
    let count = AtomicUsize::new(0);
    let q = HostQueue::with_capacity(2048).unwrap();

    assert!(q.call_every(0, touch, data(&count)).is_valid());

    // Two breaks collapse into one: the flag is a boolean, not a counter.
    q.break_dispatch();
    q.break_dispatch();
    q.dispatch(-1);
    assert_eq!(count.load(Ordering::SeqCst), 1);

    // The flag was consumed; a later bounded dispatch runs free.
    count.store(0, Ordering::SeqCst);
    q.dispatch(55);
    assert!(count.load(Ordering::SeqCst) > 1);
}

#[test]
fn same_deadline_dispatches_in_post_order() {
    struct OrderCell {
        seq: *const AtomicUsize,
        seen: AtomicUsize,
    }

    fn record(p: *mut u8) {
        // SAFETY: payload points at an OrderCell on the test stack.
        let cell = unsafe { &*(p as *const OrderCell) };
        let n = unsafe { &*cell.seq }.fetch_add(1, Ordering::SeqCst);
        cell.seen.store(n + 1, Ordering::SeqCst);
    }

    let seq = AtomicUsize::new(0);
    let a = OrderCell {
        seq: &seq,
        seen: AtomicUsize::new(0),
    };
    let b = OrderCell {
        seq: &seq,
        seen: AtomicUsize::new(0),
    };

    let q = HostQueue::with_capacity(2048).unwrap();
    assert!(
        q.call_in(10, record, &a as *const OrderCell as *mut u8)
            .is_valid()
    );
    assert!(
        q.call_in(10, record, &b as *const OrderCell as *mut u8)
            .is_valid()
    );

    q.dispatch(20);
    assert_eq!(a.seen.load(Ordering::SeqCst), 1, "first posted runs first");
    assert_eq!(b.seen.load(Ordering::SeqCst), 2);
}

#[test]
fn slow_callback_does_not_drop_later_events() {
    fn sloth(p: *mut u8) {
        thread::sleep(Duration::from_millis(10));
        touch(p);
    }

    let count = AtomicUsize::new(0);
    let q = HostQueue::with_capacity(2048).unwrap();

    assert!(q.call(sloth, data(&count)).is_valid());
    assert!(q.call_in(5, touch, data(&count)).is_valid());
    assert!(q.call_in(15, touch, data(&count)).is_valid());

    q.dispatch(20);
    assert_eq!(count.load(Ordering::SeqCst), 3);
}

#[test]
fn event_posted_during_dispatch_waits_for_the_next_window() {
    struct NestCtx {
        q: *const HostQueue,
        count: *const AtomicUsize,
    }

    fn nest(p: *mut u8) {
        // SAFETY: payload points at the NestCtx on the test stack.
        let ctx = unsafe { &*(p as *const NestCtx) };
        unsafe { &*ctx.q }.call(touch, ctx.count as *mut u8);
        thread::sleep(Duration::from_millis(10));
    }

    let count = AtomicUsize::new(0);
    let q = HostQueue::with_capacity(2048).unwrap();
    let ctx = NestCtx {
        q: &q,
        count: &count,
    };

    assert!(q.call(nest, &ctx as *const NestCtx as *mut u8).is_valid());

    // The nested event lands after this window's timeout already expired.
    q.dispatch(5);
    assert_eq!(count.load(Ordering::SeqCst), 0);

    q.dispatch(5);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn many_mixed_deadlines_all_dispatch() {
    let count = AtomicUsize::new(0);
    let q = HostQueue::with_capacity(4096).unwrap();

    for i in 0..20 {
        assert!(q.call_in(i % 5, touch, data(&count)).is_valid());
    }
    q.dispatch(10);
    assert_eq!(count.load(Ordering::SeqCst), 20);
}

#[test]
fn time_left_counts_down_then_goes_stale() {
    let q = HostQueue::with_capacity(2048).unwrap();

    let id = q.call_in(50, nop, ptr::null_mut());
    let left = q.time_left(id);
    assert!((40..=50).contains(&left), "time_left was {left}");

    q.dispatch(60);
    // Dispatched: the id no longer names anything.
    assert_eq!(q.time_left(id), -1);
}

#[test]
fn user_allocated_events_round_trip() {
    let count = AtomicUsize::new(0);
    let q = HostQueue::with_capacity(0).unwrap();

    let mut now = UserEvent::new(&count as *const AtomicUsize);
    let mut later = UserEvent::new(&count as *const AtomicUsize);
    later.set_delay(10);

    // SAFETY: both events outlive the dispatch below and are not touched
    // until they report done.
    unsafe {
        q.post_user_allocated(touch_indirect, &mut now);
        q.post_user_allocated(touch_indirect, &mut later);
    }
    assert!(!now.is_done());

    q.dispatch(15);
    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert!(now.is_done());
    assert!(later.is_done());

    // Completed events cannot be canceled.
    assert!(!unsafe { q.cancel_user_allocated(&mut now) });
}

#[test]
fn multithreaded_post_and_break() {
    let count = AtomicUsize::new(0);
    let q = HostQueue::with_capacity(2048).unwrap();

    assert!(q.call_every(1, touch, data(&count)).is_valid());

    thread::scope(|s| {
        s.spawn(|| q.dispatch(-1));

        thread::sleep(Duration::from_millis(10));
        q.break_dispatch();
    });

    assert!(count.load(Ordering::SeqCst) >= 1);
}

#[test]
fn chained_queue_dispatches_through_target() {
    let count = AtomicUsize::new(0);
    let q1 = HostQueue::with_capacity(2048).unwrap();
    let q2 = HostQueue::with_capacity(2048).unwrap();

    // SAFETY: q1 outlives q2 (declared first, dropped last) and neither
    // moves while chained.
    unsafe { q2.chain(Some(&q1)).unwrap() };

    assert!(q1.call_in(20, touch, data(&count)).is_valid());
    assert!(q2.call_in(20, touch, data(&count)).is_valid());

    assert!(q1.call(touch, data(&count)).is_valid());
    assert!(q2.call(touch, data(&count)).is_valid());

    let id1 = q1.call_in(5, touch, data(&count));
    let id2 = q2.call_in(5, touch, data(&count));
    assert!(q1.cancel(id1));
    assert!(q2.cancel(id2));

    assert!(q1.call_in(10, touch, data(&count)).is_valid());
    assert!(q2.call_in(10, touch, data(&count)).is_valid());

    // One dispatch on the target drives both queues.
    q1.dispatch(30);
    assert_eq!(count.load(Ordering::SeqCst), 6);
}

#[test]
fn immediate_events_flow_through_a_chain() {
    let count = AtomicUsize::new(0);
    let q1 = HostQueue::with_capacity(2048).unwrap();
    let q2 = HostQueue::with_capacity(2048).unwrap();

    // SAFETY: as above; q1 dropped last.
    unsafe { q2.chain(Some(&q1)).unwrap() };

    assert!(q2.call(touch, data(&count)).is_valid());
    assert!(q1.call(touch, data(&count)).is_valid());

    q1.dispatch(0);
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn unchain_and_rechain_the_other_way() {
    let count = AtomicUsize::new(0);
    let q2 = HostQueue::with_capacity(2048).unwrap();
    let q1 = HostQueue::with_capacity(2048).unwrap();

    // SAFETY: chains are torn down below before either queue drops.
    unsafe { q2.chain(Some(&q1)).unwrap() };

    assert!(q1.call(touch, data(&count)).is_valid());
    assert!(q2.call(touch, data(&count)).is_valid());
    q1.dispatch(0);
    assert_eq!(count.load(Ordering::SeqCst), 2);

    // SAFETY: as above.
    unsafe {
        q2.chain(None).unwrap();
        q1.chain(Some(&q2)).unwrap();
    }

    assert!(q1.call(touch, data(&count)).is_valid());
    assert!(q2.call(touch, data(&count)).is_valid());
    q2.dispatch(0);
    assert_eq!(count.load(Ordering::SeqCst), 4);

    // SAFETY: tear the remaining chain down while both queues are alive.
    unsafe { q1.chain(None).unwrap() };
}
