//! A flexible, embedded-friendly event queue.
//!
//! Deferred callbacks dispatch at absolute tick-relative deadlines, with
//! periodic repetition, cancellation by stable id, queue composition
//! ("chaining"), and optional integration with an external one-shot timer
//! ("backgrounding"). Events live in a fixed arena with a size-bucketed
//! allocator: constant-time, zero-fragmentation reuse for fixed-size
//! workloads, which is what keeps posting viable from interrupt handlers.
//!
//! ```ignore
//! let q = tickq::HostQueue::with_capacity(2048)?;
//! q.call_in(10, blink, led_state);
//! q.dispatch(-1); // runs until q.break_dispatch()
//! ```
//!
//! The queue is generic over a small platform facade (tick source plus a
//! timed semaphore, see `tickq-lib`); the `std` feature provides a hosted
//! implementation and the [`HostQueue`] alias.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod arena;
mod background;
mod call;
mod dispatch;
mod event;
mod queue;

use thiserror::Error as ThisError;

use tickq_lib::PlatformError;

pub use event::{
    Callback, Dtor, EVENT_SIZE_MIN, EventId, UpdateFn, UserEvent, event_delay, event_dtor,
    event_period,
};
pub use queue::EventQueue;

pub use tickq_lib::{Platform, Semaphore, Tick};

#[cfg(feature = "std")]
pub use tickq_lib::HostPlatform;

/// An event queue on the hosted platform.
#[cfg(feature = "std")]
pub type HostQueue = EventQueue<HostPlatform>;

/// Constructor and chaining failures. Hot-path operations never produce
/// these; they report failure by value (`None`, [`EventId::INVALID`],
/// `false`) so they stay usable from interrupt context.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The arena (or the host heap backing it) could not satisfy an
    /// allocation.
    #[error("event arena exhausted")]
    Exhausted,
    /// The requested arena does not fit the id codec's offset bits.
    #[error("arena larger than the id codec can address")]
    ArenaTooLarge,
    /// A platform primitive could not be created; the queue was not built.
    #[error("platform resource creation failed")]
    Platform(#[from] PlatformError),
}
