// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Error codes reported by every public runtime operation.
///
/// Errors are local and final: nothing is retried by the runtime. A broken
/// channel stays broken, a cancelled task stays cancelled until it
/// terminates.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Error {
    /// The deadline was reached before the operation could complete.
    TimedOut,
    /// The channel was done-signalled or closed.
    BrokenPipe,
    /// The sender's and receiver's buffer lengths differ. Both peers of the
    /// rendezvous observe this error.
    MessageSize,
    /// The operation was interrupted by [`cancel`][crate::cancel], or was
    /// attempted on a close path where blocking is forbidden.
    Cancelled,
    /// The handle is out of range or already closed.
    BadHandle,
    /// The handle does not refer to an object of the requested type.
    NotSupported,
    /// Malformed call.
    InvalidArgument,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TimedOut => f.write_str("deadline reached"),
            Error::BrokenPipe => f.write_str("channel done or closed"),
            Error::MessageSize => f.write_str("rendezvous buffer length mismatch"),
            Error::Cancelled => f.write_str("operation cancelled"),
            Error::BadHandle => f.write_str("invalid or closed handle"),
            Error::NotSupported => f.write_str("handle does not support the requested type"),
            Error::InvalidArgument => f.write_str("invalid argument"),
        }
    }
}

impl core::error::Error for Error {}
