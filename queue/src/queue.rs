//! The event queue: lifecycle, ready-queue maintenance, and the producer
//! API (post, cancel, time-left, break).
//!
//! The ready queue is a singly-linked list of deadline slots ordered by
//! wraparound-correct target comparison. Events sharing an exact target
//! chain off the slot head via `sibling`, newest first; dequeue reverses
//! each detached chain so dispatch order equals post order.
//!
//! State is split along the two lock boundaries: `state` (the C original's
//! `queuelock`) owns the ready list, the dispatcher tick, the generation
//! counter, and the background registration; `slab` (`memlock`) owns the
//! allocator. No code path holds both at once, so producers can allocate
//! while the dispatcher walks the list.

use core::alloc::Layout;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use spin::Mutex;

use tickq_lib::{Platform, Semaphore, Tick, tick_clampdiff, tick_diff};

use crate::Error;
use crate::arena::{Arena, Slab};
use crate::event::{
    ALIGN, Backref, Callback, EventHeader, EventId, USER_EVENT_DONE, USER_EVENT_IN_PROGRESS,
    UpdateFn, UserEvent, payload_of,
};

/// Ready-queue state behind `queuelock`.
pub(crate) struct QueueState {
    /// First deadline slot, or null when idle.
    pub(crate) head: *mut EventHeader,
    /// The dispatcher's notion of "now"; only ever moves forward.
    pub(crate) tick: Tick,
    /// Bumped whenever dequeue detaches events, to resolve same-tick
    /// cancel-vs-dispatch races.
    pub(crate) generation: u8,
    pub(crate) background: BackgroundTimer,
}

// SAFETY: only reachable through the queue's `queuelock`.
unsafe impl Send for QueueState {}

/// Registration of an external one-shot timer driving this queue.
#[derive(Clone, Copy)]
pub(crate) struct BackgroundTimer {
    /// True between a bounded dispatch tail and the next dispatch entry;
    /// while set, enqueue re-arms the timer when a new head lands.
    pub(crate) active: bool,
    pub(crate) update: Option<UpdateFn>,
    pub(crate) timer: *mut (),
}

impl BackgroundTimer {
    const fn idle() -> Self {
        Self {
            active: false,
            update: None,
            timer: ptr::null_mut(),
        }
    }
}

/// A flexible event queue dispatching deferred callbacks at tick-relative
/// deadlines.
///
/// Producers (threads or interrupt handlers) allocate an event, configure
/// delay/period/destructor, and post it. A dispatcher thread drains expired
/// events in deadline order (post order within a deadline), re-enqueues
/// periodic events on their original grid, and recycles the rest through
/// the arena.
///
/// `alloc`, `dealloc`, `post`, `cancel`, `time_left`, and `break_dispatch`
/// are safe to call from interrupt context: they take only short spin-held
/// critical sections and never touch the platform heap after construction.
pub struct EventQueue<P: Platform> {
    pub(crate) arena: Arena,
    pub(crate) slab: Mutex<Slab>,
    pub(crate) state: Mutex<QueueState>,
    /// Edge-triggered: at most one pending break is honored.
    pub(crate) break_requested: AtomicBool,
    pub(crate) sema: P::Sema,
    pub(crate) platform: P,
}

// SAFETY: every pointer field is either arena memory owned by this queue or
// caller storage governed by a documented contract; all mutation happens
// under the two spin locks or through atomics.
unsafe impl<P: Platform> Send for EventQueue<P> {}
unsafe impl<P: Platform> Sync for EventQueue<P> {}

impl<P: Platform> EventQueue<P> {
    /// Create a queue with a heap-allocated arena of `size` bytes.
    pub fn with_capacity(size: usize) -> Result<Self, Error>
    where
        P: Default,
    {
        Self::with_capacity_in(P::default(), size)
    }

    /// Create a queue with a heap-allocated arena on an explicit platform.
    pub fn with_capacity_in(platform: P, size: usize) -> Result<Self, Error> {
        let size = if size >= ALIGN {
            size & !(ALIGN - 1)
        } else {
            size
        };
        check_arena_size(size)?;

        let sema = P::Sema::new()?;
        if size == 0 {
            return Ok(Self::assemble(platform, sema, ptr::null_mut(), 0, None));
        }

        let layout = Layout::from_size_align(size, ALIGN).map_err(|_| Error::Exhausted)?;
        // SAFETY: size is nonzero.
        let base = unsafe { alloc::alloc::alloc(layout) };
        if base.is_null() {
            return Err(Error::Exhausted);
        }
        Ok(Self::assemble(platform, sema, base, size, Some(layout)))
    }

    /// Create a queue around a caller-provided buffer. The base is aligned
    /// up to the header alignment and the length truncated to a multiple of
    /// it; residual bytes are ignored.
    pub fn with_buffer(buffer: &'static mut [u8]) -> Result<Self, Error>
    where
        P: Default,
    {
        Self::with_buffer_in(P::default(), buffer)
    }

    /// [`with_buffer`](Self::with_buffer) on an explicit platform.
    pub fn with_buffer_in(platform: P, buffer: &'static mut [u8]) -> Result<Self, Error> {
        let raw = buffer.as_mut_ptr();
        let len = buffer.len();

        let (base, size) = if len >= ALIGN {
            let base = ((raw as usize + ALIGN - 1) & !(ALIGN - 1)) as *mut u8;
            let skip = base as usize - raw as usize;
            (base, (len - skip) & !(ALIGN - 1))
        } else {
            // Tiny buffers stay as-is: a queue that only ever posts
            // user-allocated events needs no arena at all.
            (raw, len)
        };

        check_arena_size(size)?;
        let sema = P::Sema::new()?;
        Ok(Self::assemble(platform, sema, base, size, None))
    }

    fn assemble(
        platform: P,
        sema: P::Sema,
        base: *mut u8,
        size: usize,
        owned: Option<Layout>,
    ) -> Self {
        let arena = Arena::new(base, size, owned);
        let tick = platform.tick();
        debug!("event queue created: arena {size} bytes, npw2 {}", arena.npw2);

        Self {
            slab: Mutex::new(Slab::new(base, size)),
            state: Mutex::new(QueueState {
                head: ptr::null_mut(),
                tick,
                generation: 0,
                background: BackgroundTimer::idle(),
            }),
            arena,
            break_requested: AtomicBool::new(false),
            sema,
            platform,
        }
    }

    #[inline]
    pub(crate) fn is_user_allocated(&self, e: *const EventHeader) -> bool {
        !self.arena.contains(e)
    }

    #[inline]
    pub(crate) fn now(&self) -> Tick {
        self.platform.tick()
    }

    /// Point `prev`'s link field at `e` and record the backref.
    ///
    /// # Safety
    /// Caller holds `queuelock`; `prev` names a live link field.
    pub(crate) unsafe fn relink(state: &mut QueueState, prev: Backref, e: *mut EventHeader) {
        // SAFETY: per contract.
        unsafe {
            match prev {
                Backref::Head => state.head = e,
                Backref::Next(p) => (*p).next = e,
                Backref::Sibling(p) => (*p).sibling = e,
                Backref::None => debug_assert!(false, "relink against a detached event"),
            }
            (*e).backref = prev;
        }
    }

    /// Insert `e` into the ready queue. Deadlines already in the past are
    /// clamped up to `tick` so an event is never past-due on arrival.
    ///
    /// # Safety
    /// `e` must be a live header not currently reachable from any queue.
    pub(crate) unsafe fn enqueue(&self, e: *mut EventHeader, tick: Tick) {
        // SAFETY: `e` is unreachable from other threads until linked below;
        // list surgery happens under queuelock.
        unsafe {
            (*e).target = tick.wrapping_add(tick_clampdiff((*e).target, tick) as Tick);

            let mut state = self.state.lock();
            (*e).generation = state.generation;

            let mut prev = Backref::Head;
            let mut cur = state.head;
            while !cur.is_null() && tick_diff((*cur).target, (*e).target) < 0 {
                prev = Backref::Next(cur);
                cur = (*cur).next;
            }

            if !cur.is_null() && (*cur).target == (*e).target {
                // Join the slot: the newcomer takes over as slot head, so
                // the sibling chain holds reverse post order until dequeue
                // flattens it back.
                (*e).next = (*cur).next;
                if !(*e).next.is_null() {
                    (*(*e).next).backref = Backref::Next(e);
                }
                (*e).sibling = cur;
                (*cur).next = ptr::null_mut();
                (*cur).backref = Backref::Sibling(e);
            } else {
                (*e).next = cur;
                if !cur.is_null() {
                    (*cur).backref = Backref::Next(e);
                }
                (*e).sibling = ptr::null_mut();
            }

            Self::relink(&mut state, prev, e);

            // A strictly earlier deadline installed a new head; re-arm the
            // external timer if one is currently driving this queue.
            if state.background.active && state.head == e && (*e).sibling.is_null() {
                if let Some(update) = state.background.update {
                    update(state.background.timer, tick_clampdiff((*e).target, tick));
                }
            }
        }
    }

    /// Detach `e` from the ready queue if the dispatcher has not already
    /// committed to it. Always disarms the event first, so losing the race
    /// still suppresses the callback and any periodic reschedule.
    ///
    /// # Safety
    /// Caller holds `queuelock`; `e` must point at a live header.
    pub(crate) unsafe fn unqueue(&self, state: &mut QueueState, e: *mut EventHeader) -> bool {
        // SAFETY: per contract.
        unsafe {
            (*e).cb = None;
            (*e).period = -1;

            let diff = tick_diff((*e).target, state.tick);
            if diff < 0 || (diff == 0 && (*e).generation != state.generation) {
                // Already dequeued for dispatch.
                return false;
            }

            if !(*e).sibling.is_null() {
                // Promote the next sibling into this slot.
                let s = (*e).sibling;
                (*s).next = (*e).next;
                if !(*s).next.is_null() {
                    (*(*s).next).backref = Backref::Next(s);
                }
                Self::relink(state, (*e).backref, s);
            } else {
                let n = (*e).next;
                match (*e).backref {
                    Backref::Head => state.head = n,
                    Backref::Next(p) => (*p).next = n,
                    Backref::Sibling(p) => (*p).sibling = n,
                    Backref::None => return false,
                }
                if !n.is_null() {
                    (*n).backref = (*e).backref;
                }
            }

            (*e).backref = Backref::None;
            true
        }
    }

    /// Validate `id` and detach its event, rolling the local id forward so
    /// stale copies stop matching. One lock acquisition covers validation,
    /// unlink, and the id bump.
    fn unqueue_by_id(&self, id: EventId) -> Option<*mut EventHeader> {
        let e = self.arena.decode(id)?;

        let mut state = self.state.lock();
        // SAFETY: decode bounds-checked the offset; queuelock held.
        unsafe {
            if !self.arena.id_matches(e, id) {
                return None;
            }
            if !self.unqueue(&mut state, e) {
                return None;
            }
            self.arena.inc_id(e);
        }
        Some(e)
    }

    /// Detach every slot due at or before `target` and flatten the result
    /// into dispatch order. Advances the dispatcher tick and bumps the
    /// generation when anything was taken.
    pub(crate) fn dequeue(&self, target: Tick) -> *mut EventHeader {
        let mut head;
        {
            let mut state = self.state.lock();

            if tick_diff(state.tick, target) <= 0 {
                state.tick = target;
            }

            // SAFETY: list surgery under queuelock.
            unsafe {
                head = state.head;
                let mut p: *mut *mut EventHeader = &mut head;
                while !(*p).is_null() && tick_diff((**p).target, target) <= 0 {
                    p = &mut (**p).next;
                }

                state.head = *p;
                if !state.head.is_null() {
                    (*state.head).backref = Backref::Head;
                }
                *p = ptr::null_mut();
            }

            // Cancellation only conflicts with dequeueing when events were
            // actually taken off, so only then does the generation move.
            if !head.is_null() {
                state.generation = state.generation.wrapping_add(1);
            }
        }

        // Reverse each detached slot's sibling chain into a `next`-linked
        // run, restoring first-posted-first-dispatched order.
        //
        // SAFETY: the detached events are exclusively ours now; concurrent
        // cancels bounce off the generation check above.
        unsafe {
            let mut tail: *mut *mut EventHeader = &mut head;
            let mut slots = head;
            while !slots.is_null() {
                let slot = slots;
                slots = (*slot).next;

                let mut run: *mut EventHeader = ptr::null_mut();
                let mut e = slot;
                while !e.is_null() {
                    (*e).next = run;
                    run = e;
                    e = (*e).sibling;
                }

                *tail = run;
                tail = &mut (*slot).next;
            }
        }

        head
    }

    /// Post an allocated event onto the queue.
    ///
    /// The callback runs in the dispatch loop with the event's payload.
    /// Delay, period, and destructor come from the setters applied to the
    /// payload beforehand. Signals the dispatcher. Safe from interrupt
    /// context.
    ///
    /// # Safety
    /// `payload` must come from [`alloc`](Self::alloc) on this queue and
    /// not have been posted or deallocated since.
    pub unsafe fn post(&self, cb: Callback, payload: *mut u8) -> EventId {
        let e = crate::event::header_of(payload);
        let tick = self.now();

        // SAFETY: per contract `e` is a live, unqueued arena header.
        unsafe {
            (*e).cb = Some(cb);
            (*e).target = tick.wrapping_add((*e).target);
            let id = self.arena.event_id(e);
            self.enqueue(e, tick);
            self.sema.signal();
            id
        }
    }

    /// Post a caller-owned event. Completion is flagged through the event's
    /// own state ([`UserEvent::is_done`]) rather than an id.
    ///
    /// # Safety
    /// `event` must stay valid and untouched by the caller until it reports
    /// done; payload alignment must not exceed pointer alignment.
    pub unsafe fn post_user_allocated<T>(&self, cb: Callback, event: *mut UserEvent<T>) {
        const {
            assert!(align_of::<T>() <= ALIGN, "payload alignment too large");
        }

        let e = UserEvent::header_ptr(event);
        let tick = self.now();

        // SAFETY: per contract the caller hands us exclusive access.
        unsafe {
            (*e).cb = Some(cb);
            (*e).target = tick.wrapping_add((*e).target);
            (*e).id = USER_EVENT_IN_PROGRESS;
            self.enqueue(e, tick);
            self.sema.signal();
        }
    }

    /// Cancel a posted event.
    ///
    /// Returns `true` iff the event was detached before dispatch: the
    /// callback is then guaranteed not to run, and the destructor has run.
    /// Returns `false` for [`EventId::INVALID`], stale ids, and events
    /// whose dispatch is already in flight. Idempotent and irq-safe.
    pub fn cancel(&self, id: EventId) -> bool {
        if !id.is_valid() {
            return false;
        }

        match self.unqueue_by_id(id) {
            // SAFETY: the event is ours again; recycle it (and run its
            // destructor) outside the queue lock.
            Some(e) => unsafe {
                self.dealloc(payload_of(e));
                true
            },
            None => false,
        }
    }

    /// Cancel a user-allocated event by address.
    ///
    /// # Safety
    /// `event` must be a previously posted event owned by the caller.
    pub unsafe fn cancel_user_allocated<T>(&self, event: *mut UserEvent<T>) -> bool {
        if event.is_null() {
            return false;
        }
        let e = UserEvent::header_ptr(event);

        // SAFETY: per contract.
        unsafe {
            if (*e).id == USER_EVENT_DONE {
                return false;
            }

            let detached = {
                let mut state = self.state.lock();
                self.unqueue(&mut state, e)
            };
            if detached {
                self.dealloc(payload_of(e));
                true
            } else {
                false
            }
        }
    }

    /// Milliseconds until a delayed event is due, or `-1` when the id is
    /// stale or invalid. Irq-safe.
    pub fn time_left(&self, id: EventId) -> i32 {
        if !id.is_valid() {
            return -1;
        }
        let Some(e) = self.arena.decode(id) else {
            return -1;
        };

        let _state = self.state.lock();
        // SAFETY: header reads under queuelock.
        unsafe {
            if self.arena.id_matches(e, id) {
                tick_clampdiff((*e).target, self.now())
            } else {
                -1
            }
        }
    }

    /// Milliseconds until a user-allocated event is due. Irq-safe.
    ///
    /// # Safety
    /// `event` must be a previously posted event owned by the caller.
    pub unsafe fn time_left_user_allocated<T>(&self, event: *mut UserEvent<T>) -> i32 {
        if event.is_null() {
            return -1;
        }
        let e = UserEvent::header_ptr(event);

        let _state = self.state.lock();
        // SAFETY: per contract.
        unsafe { tick_clampdiff((*e).target, self.now()) }
    }

    /// Force a running dispatch loop to return. Edge-triggered: one break
    /// satisfies one pending or next-entered wait. Harmless with no
    /// dispatcher active. Irq-safe.
    pub fn break_dispatch(&self) {
        self.break_requested.store(true, Ordering::Release);
        self.sema.signal();
    }
}

impl<P: Platform> Drop for EventQueue<P> {
    /// Runs every pending event's destructor (no callbacks), tells the
    /// background timer to stand down, and releases the arena if owned.
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no dispatcher or producer is live; the
        // ready queue is ours to walk without locks.
        unsafe {
            let mut slots = self.state.get_mut().head;
            while !slots.is_null() {
                let mut e = (*slots).sibling;
                while !e.is_null() {
                    if let Some(dtor) = (*e).dtor {
                        dtor(payload_of(e));
                    }
                    e = (*e).sibling;
                }
                if let Some(dtor) = (*slots).dtor {
                    dtor(payload_of(slots));
                }
                slots = (*slots).next;
            }

            let background = self.state.get_mut().background;
            if let Some(update) = background.update {
                update(background.timer, -1);
            }

            if let Some(layout) = self.arena.owned {
                alloc::alloc::dealloc(self.arena.base, layout);
            }
        }
        debug!("event queue destroyed");
    }
}

fn check_arena_size(size: usize) -> Result<(), Error> {
    // The packed id spends npw2 bits on the offset and 8 on the rolling
    // counter; both must fit the 32-bit id.
    let npw2 = usize::BITS - size.leading_zeros();
    if npw2 + 8 > u32::BITS {
        return Err(Error::ArenaTooLarge);
    }
    Ok(())
}
