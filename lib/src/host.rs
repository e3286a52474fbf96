//! Hosted platform implementation backed by the standard library.
//!
//! The tick source reads a process-global monotonic epoch, so every queue in
//! the process observes the same clock. The semaphore is a binary flag under
//! a mutex with a condvar for timed waits: `signal` sets the flag, `wait`
//! consumes it.

use std::sync::{Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use crate::platform::{Platform, PlatformError, Semaphore};
use crate::tick::Tick;

static EPOCH: OnceLock<Instant> = OnceLock::new();

fn now_ms() -> Tick {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as Tick
}

/// Standard-library platform: global monotonic clock + condvar semaphore.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostPlatform;

impl Platform for HostPlatform {
    type Sema = HostSema;

    #[inline]
    fn tick(&self) -> Tick {
        now_ms()
    }
}

/// Binary semaphore. A pending signal survives until the next wait, so a
/// post that races ahead of the dispatcher's wait is never lost.
pub struct HostSema {
    signaled: Mutex<bool>,
    cond: Condvar,
}

// A panic can never unwind while the flag mutex is held (the critical
// sections below only flip a bool), so poisoning is unreachable; recover
// rather than propagate.
fn relock(guard: std::sync::LockResult<MutexGuard<'_, bool>>) -> MutexGuard<'_, bool> {
    guard.unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Semaphore for HostSema {
    fn new() -> Result<Self, PlatformError> {
        Ok(Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    fn signal(&self) {
        let mut signaled = relock(self.signaled.lock());
        *signaled = true;
        self.cond.notify_one();
    }

    fn wait(&self, ms: i32) -> bool {
        let mut signaled = relock(self.signaled.lock());

        if ms < 0 {
            while !*signaled {
                signaled = relock(self.cond.wait(signaled));
            }
        } else if ms > 0 {
            let deadline = Instant::now() + Duration::from_millis(ms as u64);
            while !*signaled {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _) = self
                    .cond
                    .wait_timeout(signaled, deadline - now)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                signaled = guard;
            }
        }

        let was_signaled = *signaled;
        *signaled = false;
        was_signaled
    }
}
