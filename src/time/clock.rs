// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::OnceLock;
use std::time::Instant;

/// The process-wide origin of the monotonic millisecond scale.
///
/// A single origin shared by all scheduler contexts keeps absolute
/// deadlines meaningful across contexts within one process.
static ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed since the process-wide origin, read from the OS.
pub(crate) fn os_now() -> i64 {
    let origin = *ORIGIN.get_or_init(Instant::now);
    i64::try_from(origin.elapsed().as_millis()).unwrap_or(i64::MAX)
}

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
        use core::cell::Cell;

        #[cfg(target_arch = "x86")]
        use core::arch::x86::_rdtsc;
        #[cfg(target_arch = "x86_64")]
        use core::arch::x86_64::_rdtsc;

        /// One millisecond expressed in timestamp-counter cycles. Chosen
        /// to work reasonably well for CPU frequencies above 500MHz.
        const CLOCK_PRECISION: u64 = 1_000_000;

        /// Per-context monotonic clock.
        ///
        /// Caches the last OS reading and keeps returning it while the
        /// timestamp counter has advanced less than half a millisecond's
        /// worth of cycles, so timer bookkeeping does not pay a syscall
        /// per check. The cache lives in the scheduler context, never in
        /// a global.
        #[derive(Debug)]
        pub(crate) struct Clock {
            last_tsc: Cell<u64>,
            last_now: Cell<i64>,
        }

        impl Clock {
            pub(crate) fn new() -> Self {
                Self {
                    last_tsc: Cell::new(0),
                    last_now: Cell::new(-1),
                }
            }

            /// Current time in milliseconds on the monotonic scale.
            pub(crate) fn now(&self) -> i64 {
                // Safety: rdtsc has no preconditions; it only reads the
                // timestamp counter.
                let tsc = unsafe { _rdtsc() };
                let last_tsc = self.last_tsc.get();
                let last_now = self.last_now.get();
                // If the counter hasn't jumped back or progressed more
                // than half a millisecond, reuse the cached reading.
                if last_now >= 0 && tsc >= last_tsc && tsc - last_tsc <= CLOCK_PRECISION / 2 {
                    return last_now;
                }
                let now = os_now();
                self.last_tsc.set(tsc);
                self.last_now.set(now);
                now
            }
        }
    } else {
        /// Per-context monotonic clock; on this architecture every reading
        /// comes from the OS.
        #[derive(Debug)]
        pub(crate) struct Clock;

        impl Clock {
            pub(crate) fn new() -> Self {
                Self
            }

            /// Current time in milliseconds on the monotonic scale.
            pub(crate) fn now(&self) -> i64 {
                os_now()
            }
        }
    }
}

/// An absolute point on the runtime's monotonic millisecond scale.
///
/// `Deadline::IMMEDIATE` (zero) means "do not block; fail with
/// [`TimedOut`][crate::Error::TimedOut] if not immediately ready".
/// `Deadline::FOREVER` (negative) means "block until the event occurs".
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Deadline(i64);

impl Deadline {
    /// Block until the awaited event occurs.
    pub const FOREVER: Deadline = Deadline(-1);
    /// Do not block at all.
    pub const IMMEDIATE: Deadline = Deadline(0);

    /// A deadline at an absolute millisecond timestamp, as returned by
    /// [`now`][crate::now].
    #[must_use]
    pub const fn at(ms: i64) -> Self {
        Deadline(ms)
    }

    #[must_use]
    pub const fn is_immediate(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn is_forever(self) -> bool {
        self.0 < 0
    }

    /// True when the deadline names an actual point in time, as opposed to
    /// the immediate and forever sentinels.
    #[must_use]
    pub(crate) const fn is_finite(self) -> bool {
        self.0 > 0
    }

    #[must_use]
    pub const fn millis(self) -> i64 {
        self.0
    }
}

impl From<i64> for Deadline {
    fn from(ms: i64) -> Self {
        Deadline(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_clock_is_monotonic() {
        let a = os_now();
        let b = os_now();
        assert!(b >= a);
        assert!(a >= 0);
    }

    #[test]
    fn cached_clock_is_monotonic() {
        let clock = Clock::new();
        let mut prev = clock.now();
        for _ in 0..10_000 {
            let now = clock.now();
            assert!(now >= prev);
            prev = now;
        }
    }

    #[test]
    fn deadline_sentinels() {
        assert!(Deadline::IMMEDIATE.is_immediate());
        assert!(Deadline::FOREVER.is_forever());
        assert!(!Deadline::FOREVER.is_finite());
        assert!(Deadline::at(1).is_finite());
        assert_eq!(Deadline::from(42).millis(), 42);
    }
}
