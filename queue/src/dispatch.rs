//! The dispatch loop: drain expired events, invoke callbacks, reschedule
//! periodic events, and recycle the rest.
//!
//! Callbacks and destructors always run with no lock held, so they are free
//! to post, cancel, or even dispatch another queue (which is exactly what
//! chaining does).

use core::sync::atomic::Ordering;

use log::trace;

use tickq_lib::{Platform, Semaphore, tick_clampdiff, tick_diff};

use crate::event::payload_of;
use crate::queue::EventQueue;

impl<P: Platform> EventQueue<P> {
    /// Execute events until `ms` milliseconds have passed.
    ///
    /// With `ms < 0`, dispatches indefinitely until
    /// [`break_dispatch`](Self::break_dispatch). With `ms == 0`, drains
    /// events that are ready now and returns without waiting, which makes
    /// the zero-timeout form safe to call from interrupt context.
    ///
    /// On a bounded return the registered background updater, if any, is
    /// handed the relative deadline of the remaining queue head.
    pub fn dispatch(&self, ms: i32) {
        let mut tick = self.now();
        let timeout = tick.wrapping_add(ms as u32);
        self.state.lock().background.active = false;

        loop {
            // Collect all expired events and run them in order.
            let mut es = self.dequeue(tick);
            while !es.is_null() {
                let e = es;
                // SAFETY: detached events are exclusively ours. A racing
                // cancel that lost the generation check has still cleared
                // `cb` and forced the period negative, which is why both
                // are re-read here rather than cached.
                unsafe {
                    es = (*e).next;

                    if let Some(cb) = (*e).cb {
                        cb(payload_of(e));
                    }

                    if (*e).period >= 0 {
                        // Reschedule on the event's own grid so period
                        // drift never accumulates.
                        (*e).target = (*e).target.wrapping_add((*e).period as u32);
                        self.enqueue(e, self.now());
                    } else {
                        if !self.is_user_allocated(e) {
                            self.arena.inc_id(e);
                        }
                        self.dealloc(payload_of(e));
                    }
                }
            }

            let mut deadline = -1i32;
            tick = self.now();

            if ms >= 0 {
                deadline = tick_diff(timeout, tick);
                if deadline <= 0 {
                    // Bounded dispatch is over; arm the external timer for
                    // whatever is still pending.
                    {
                        let mut state = self.state.lock();
                        if let Some(update) = state.background.update {
                            if !state.head.is_null() {
                                // SAFETY: head is live under queuelock.
                                let target = unsafe { (*state.head).target };
                                update(state.background.timer, tick_clampdiff(target, tick));
                            }
                            state.background.active = true;
                        }
                    }
                    self.break_requested.store(false, Ordering::Release);
                    return;
                }
            }

            // Wait for the earlier of the user timeout and the next
            // deadline; -1 (no bound) compares as u32::MAX.
            {
                let state = self.state.lock();
                if !state.head.is_null() {
                    // SAFETY: head is live under queuelock.
                    let diff = tick_clampdiff(unsafe { (*state.head).target }, tick);
                    if (diff as u32) < (deadline as u32) {
                        deadline = diff;
                    }
                }
            }

            self.sema.wait(deadline);

            if self.break_requested.swap(false, Ordering::AcqRel) {
                trace!("dispatch: break consumed");
                return;
            }

            tick = self.now();
        }
    }
}
