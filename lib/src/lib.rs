//! Platform support layer for the tickq event queue.
//!
//! The queue core is portable; everything host-specific funnels through the
//! small facade defined here: a wrapping millisecond tick source and a
//! signaling semaphore with timed wait ([`platform`]). A ready-made hosted
//! implementation backed by the standard library lives in [`host`] behind
//! the `std` feature.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod platform;
pub mod tick;

#[cfg(feature = "std")]
pub mod host;

pub use platform::{Platform, PlatformError, Semaphore};
pub use tick::{Tick, tick_clampdiff, tick_diff};

#[cfg(feature = "std")]
pub use host::{HostPlatform, HostSema};
