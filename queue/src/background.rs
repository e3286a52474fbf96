//! Backgrounding onto an external one-shot timer, and queue chaining.
//!
//! A registered updater is told, in milliseconds, when this queue next
//! needs a `dispatch(0)`; `-1` tells it to stand down. Chaining is just a
//! particular updater: one that posts a deferred `dispatch(0)` call onto
//! another queue, letting that queue's dispatch loop drive this one.

use core::mem::size_of;
use core::ptr;

use log::debug;

use tickq_lib::Platform;

use crate::Error;
use crate::event::{EventId, UpdateFn};
use crate::queue::EventQueue;

/// Per-chain bookkeeping, allocated from the chained queue's own arena and
/// freed back to it when the chain is torn down.
struct ChainContext<P: Platform> {
    queue: *const EventQueue<P>,
    target: *const EventQueue<P>,
    /// Pending `dispatch(0)` call on the target, canceled and replaced on
    /// every updater invocation.
    pending: EventId,
}

fn chain_dispatch<P: Platform>(data: *mut u8) {
    // SAFETY: `data` is the chained queue pointer stored by `chain`; the
    // chain contract keeps it alive while the chain exists.
    unsafe { (*(data as *const EventQueue<P>)).dispatch(0) }
}

fn chain_update<P: Platform>(timer: *mut (), ms: i32) {
    let c = timer as *mut ChainContext<P>;

    // SAFETY: `timer` is the ChainContext allocated by `chain`; the target
    // queue outlives the chain per the registration contract.
    unsafe {
        let target = &*(*c).target;
        target.cancel((*c).pending);

        if ms >= 0 {
            (*c).pending = target.call_in(ms, chain_dispatch::<P>, (*c).queue as *mut u8);
        } else {
            // Chain torn down: give the context back to the queue that
            // allocated it.
            let queue = &*(*c).queue;
            queue.dealloc(c as *mut u8);
        }
    }
}

impl<P: Platform> EventQueue<P> {
    /// Register an external one-shot timer to drive this queue.
    ///
    /// `update(timer, ms)` promises that the external timer calls
    /// `dispatch(0)` within `ms` milliseconds; `ms < 0` means the timer is
    /// no longer needed. The updater is invoked on registration when events
    /// are pending, whenever an earlier deadline becomes the queue head
    /// while backgrounded, at the tail of every bounded dispatch, and with
    /// `-1` once on destroy or when a new updater displaces it.
    ///
    /// Passing `None` disables the existing timer.
    ///
    /// # Safety
    /// `timer` must stay valid until the updater has been told to stand
    /// down. The updater is invoked with this queue's queue lock held and
    /// must not post to, cancel on, or dispatch this queue (allocator calls
    /// and operations on other queues are fine).
    pub unsafe fn background(&self, update: Option<UpdateFn>, timer: *mut ()) {
        let mut state = self.state.lock();

        if let Some(old) = state.background.update {
            old(state.background.timer, -1);
        }

        state.background.update = update;
        state.background.timer = timer;

        if let Some(update) = state.background.update {
            if !state.head.is_null() {
                // SAFETY: head is live under queuelock.
                let target = unsafe { (*state.head).target };
                update(
                    state.background.timer,
                    tickq_lib::tick_clampdiff(target, self.now()),
                );
            }
        }
        state.background.active = true;

        debug!(
            "background updater {}",
            if update.is_some() { "registered" } else { "cleared" }
        );
    }

    /// Chain this queue onto `target`: dispatching `target` also dispatches
    /// this queue. Both queues keep their own buffers and are managed
    /// independently. Passing `None` unchains.
    ///
    /// Fails with [`Error::Exhausted`] when the chain context cannot be
    /// allocated.
    ///
    /// # Safety
    /// Both queues must stay at their current addresses and outlive the
    /// chain; unchain (or drop this queue) before dropping `target`.
    pub unsafe fn chain(&self, target: Option<&EventQueue<P>>) -> Result<(), Error> {
        let Some(target) = target else {
            // SAFETY: clearing the updater tears the old chain down.
            unsafe { self.background(None, ptr::null_mut()) };
            return Ok(());
        };

        let payload = self
            .alloc(size_of::<ChainContext<P>>())
            .ok_or(Error::Exhausted)?;
        let c = payload.as_ptr() as *mut ChainContext<P>;

        // SAFETY: freshly allocated, correctly sized storage.
        unsafe {
            c.write(ChainContext {
                queue: self,
                target,
                pending: EventId::INVALID,
            });
            self.background(Some(chain_update::<P>), c as *mut ());
        }

        debug!("queue chained onto target");
        Ok(())
    }
}
