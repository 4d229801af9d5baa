// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod clock;
mod sleep;
mod timer;

use crate::runtime::{self, Ctx};
use crate::wait::WaitCore;
use core::pin::Pin;

pub use clock::Deadline;
pub(crate) use clock::Clock;
pub use sleep::{Sleep, sleep_until};
pub(crate) use timer::{TimerClause, TimerHeap};

/// Current time in milliseconds on the monotonic scale shared by every
/// runtime in this process. Inside a runtime context the reading comes
/// from the context's cached clock.
#[must_use]
pub fn now() -> i64 {
    match runtime::try_current() {
        Some(ctx) => ctx.core.clock.now(),
        None => clock::os_now(),
    }
}

/// A deadline `ms` milliseconds from [`now`].
#[must_use]
pub fn deadline_in(ms: i64) -> Deadline {
    Deadline::at(now().saturating_add(ms))
}

/// Arms `entry` on the context's timer heap and registers it with `wait`
/// under `id`.
pub(crate) fn arm_timer(ctx: &Ctx, entry: Pin<&TimerClause>, wait: Pin<&WaitCore>, id: u32) {
    timer::arm(&ctx.core.timers, entry, wait, id);
}
