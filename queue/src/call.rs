//! One-line event posting: allocate a trampoline, configure it, post it.
//!
//! These helpers are the irq-safe mechanism for moving work out of
//! interrupt context. They report allocation failure by returning
//! [`EventId::INVALID`] rather than an error type, so an ISR can fire and
//! forget.

use core::mem::size_of;
use core::ptr::NonNull;

use tickq_lib::Platform;

use crate::event::{Callback, EventId, event_delay, event_period};
use crate::queue::EventQueue;

/// The two words every `call` event carries: the user callback and its
/// data argument.
#[repr(C)]
struct Trampoline {
    cb: Callback,
    data: *mut u8,
}

fn trampoline_dispatch(payload: *mut u8) {
    // SAFETY: only ever invoked on payloads written by the call helpers.
    let t = unsafe { &*(payload as *const Trampoline) };
    (t.cb)(t.data)
}

impl<P: Platform> EventQueue<P> {
    fn call_alloc(&self, delay: i32, period: Option<i32>) -> Option<NonNull<u8>> {
        let payload = self.alloc(size_of::<Trampoline>())?;
        // SAFETY: freshly allocated, not yet posted.
        unsafe {
            event_delay(payload.as_ptr(), delay);
            if let Some(period) = period {
                event_period(payload.as_ptr(), period);
            }
        }
        Some(payload)
    }

    fn call_post(&self, payload: NonNull<u8>, cb: Callback, data: *mut u8) -> EventId {
        // SAFETY: `payload` was sized for a Trampoline by `call_alloc` and
        // is exclusively ours until posted.
        unsafe {
            (payload.as_ptr() as *mut Trampoline).write(Trampoline { cb, data });
            self.post(trampoline_dispatch, payload.as_ptr())
        }
    }

    /// Post `cb(data)` for immediate dispatch.
    ///
    /// Returns the event's id, or [`EventId::INVALID`] when the arena is
    /// exhausted. Irq-safe.
    pub fn call(&self, cb: Callback, data: *mut u8) -> EventId {
        match self.call_alloc(0, None) {
            Some(p) => self.call_post(p, cb, data),
            None => EventId::INVALID,
        }
    }

    /// Post `cb(data)` to run after `ms` milliseconds. Irq-safe.
    pub fn call_in(&self, ms: i32, cb: Callback, data: *mut u8) -> EventId {
        match self.call_alloc(ms, None) {
            Some(p) => self.call_post(p, cb, data),
            None => EventId::INVALID,
        }
    }

    /// Post `cb(data)` to run every `ms` milliseconds until canceled.
    /// Irq-safe.
    pub fn call_every(&self, ms: i32, cb: Callback, data: *mut u8) -> EventId {
        match self.call_alloc(ms, Some(ms)) {
            Some(p) => self.call_post(p, cb, data),
            None => EventId::INVALID,
        }
    }
}
