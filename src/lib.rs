// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single-threaded cooperative structured-concurrency runtime.
//!
//! Lightweight tasks multiplexed by a cooperative scheduler, rendezvous
//! channels with direct peer-to-peer message hand-off, and a unified wait
//! mechanism over channel operations, fd readiness, timers, and
//! cancellation; whichever condition fires first wins, and the rest are
//! withdrawn. Each [`Runtime`] is one scheduler context confined to its
//! thread; contexts share nothing. The default pollset backend requires a
//! Unix host.

mod chan;
mod error;
mod handle;
mod poll;
mod runtime;
mod task;
#[cfg(test)]
mod test_util;
mod time;
mod wait;

pub use chan::{ChanStorage, SelectClause, Selected, channel, channel_with, done, recv, select, send};
pub use error::Error;
pub use handle::{Handle, close, own};
#[cfg(unix)]
pub use poll::MioPollset;
pub use poll::{FdEvent, Interest, Pollset, fd_clean, fd_in, fd_out};
pub use runtime::Runtime;
pub use task::{YieldNow, bundle, bundle_spawn, cancel, join, spawn, yield_now};
pub use time::{Deadline, Sleep, deadline_in, now, sleep_until};
