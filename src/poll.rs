// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! File-descriptor readiness.
//!
//! The scheduler owns the fd-to-clause table (at most one waiting task
//! per (fd, direction)) and talks to the OS through the [`Pollset`]
//! trait, the only place the runtime touches the OS event mechanism.
//! [`MioPollset`] is the shipped backend; alternative backends implement
//! the trait.

use crate::error::Error;
use crate::runtime::{self, Core, Ctx};
use crate::time::{self, Deadline, TimerClause};
use crate::wait::{self, CancelFn, ClauseHeader, WaitCore};
use bitflags::bitflags;
use core::cell::Cell;
use core::fmt;
use core::marker::PhantomPinned;
use core::mem::offset_of;
use core::pin::{Pin, pin};
use core::ptr::NonNull;
use core::time::Duration;
use static_assertions::const_assert_eq;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;

bitflags! {
    /// Readiness directions of interest for one fd.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Interest: u8 {
        const IN = 1 << 0;
        const OUT = 1 << 1;
    }
}

/// One readiness report from the pollset.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FdEvent {
    pub fd: RawFd,
    pub interest: Interest,
}

/// Contract between the scheduler and the OS event mechanism.
pub trait Pollset {
    /// Replaces the interest set for `fd`. An empty set stops watching the
    /// fd. Re-registering an already-watched fd must re-report its current
    /// readiness.
    ///
    /// # Errors
    ///
    /// OS errors; the caller surfaces registration failure to the waiting
    /// task immediately.
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Blocks the calling thread until at least one watched fd becomes
    /// ready or `timeout` elapses (`None` blocks indefinitely), appending
    /// reports to `events`.
    ///
    /// # Errors
    ///
    /// OS errors other than interruption.
    fn poll(&mut self, timeout: Option<Duration>, events: &mut Vec<FdEvent>) -> io::Result<()>;

    /// Drops all cached state for `fd`. Invoked before the application
    /// closes the fd.
    fn forget(&mut self, fd: RawFd);
}

// === fd clause table ===

/// A wait parked on fd readiness.
#[repr(C)]
pub(crate) struct FdClause {
    /// Must stay the first field; the cancel callback casts the header
    /// pointer back to the node.
    header: ClauseHeader,
    fd: RawFd,
    dir: Interest,
    /// The owning context; valid while `registered`.
    core: Cell<*const Core>,
    registered: Cell<bool>,
    _pin: PhantomPinned,
}

const_assert_eq!(offset_of!(FdClause, header), 0);

impl FdClause {
    fn new(fd: RawFd, dir: Interest) -> Self {
        Self {
            header: ClauseHeader::new(),
            fd,
            dir,
            core: Cell::new(core::ptr::null()),
            registered: Cell::new(false),
            _pin: PhantomPinned,
        }
    }

    fn header(self: Pin<&Self>) -> Pin<&ClauseHeader> {
        // Safety: projection only; the header is never moved out of the
        // pinned node.
        unsafe { self.map_unchecked(|n| &n.header) }
    }

    /// Withdraws the clause from the fd table and shrinks the pollset
    /// interest accordingly; idempotent.
    unsafe fn clear(ptr: NonNull<Self>) {
        // Safety: caller guarantees the node is live.
        let this = unsafe { ptr.as_ref() };
        if !this.registered.replace(false) {
            return;
        }
        // Safety: the context outlives every registered clause; clauses
        // are withdrawn when their operations are driven to completion
        // during teardown.
        let core = unsafe { &*this.core.get() };
        let remaining = {
            let mut fds = core.fds.borrow_mut();
            fds.clear_waiter(this.fd, this.dir, ptr);
            fds.interest(this.fd)
        };
        if let Err(error) = core.pollset.borrow_mut().register(this.fd, remaining) {
            tracing::debug!(fd = this.fd, %error, "pollset interest update failed");
        }
    }
}

impl Drop for FdClause {
    fn drop(&mut self) {
        // Safety: `self` is live for the duration of the call.
        unsafe { FdClause::clear(NonNull::from(&*self)) };
    }
}

unsafe fn cancel_fd(ptr: NonNull<ClauseHeader>) {
    // Safety: the clause engine hands us the header pointer of a live
    // `FdClause` (repr(C), header first).
    unsafe { FdClause::clear(ptr.cast()) };
}

#[derive(Default)]
struct FdSlot {
    rd: Option<NonNull<FdClause>>,
    wr: Option<NonNull<FdClause>>,
}

impl FdSlot {
    fn get(&self, dir: Interest) -> Option<NonNull<FdClause>> {
        if dir == Interest::IN { self.rd } else { self.wr }
    }

    fn set(&mut self, dir: Interest, node: Option<NonNull<FdClause>>) {
        if dir == Interest::IN {
            self.rd = node;
        } else {
            self.wr = node;
        }
    }

    fn interest(&self) -> Interest {
        let mut interest = Interest::empty();
        if self.rd.is_some() {
            interest |= Interest::IN;
        }
        if self.wr.is_some() {
            interest |= Interest::OUT;
        }
        interest
    }
}

/// Waiting tasks per fd and direction.
pub(crate) struct FdTable {
    slots: HashMap<RawFd, FdSlot>,
}

impl FdTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    fn waiter(&self, fd: RawFd, dir: Interest) -> Option<NonNull<FdClause>> {
        self.slots.get(&fd).and_then(|slot| slot.get(dir))
    }

    fn claim(&mut self, fd: RawFd, dir: Interest, node: NonNull<FdClause>) -> Result<(), Error> {
        let slot = self.slots.entry(fd).or_default();
        if slot.get(dir).is_some() {
            // One waiter per (fd, direction); a second one is diagnosed
            // rather than displacing the first.
            return Err(Error::InvalidArgument);
        }
        slot.set(dir, Some(node));
        Ok(())
    }

    fn take_waiter(&mut self, fd: RawFd, dir: Interest) -> Option<NonNull<FdClause>> {
        let slot = self.slots.get_mut(&fd)?;
        let node = slot.get(dir);
        slot.set(dir, None);
        if slot.rd.is_none() && slot.wr.is_none() {
            self.slots.remove(&fd);
        }
        node
    }

    fn clear_waiter(&mut self, fd: RawFd, dir: Interest, node: NonNull<FdClause>) {
        if self.waiter(fd, dir) == Some(node) {
            self.take_waiter(fd, dir);
        }
    }

    fn interest(&self, fd: RawFd) -> Interest {
        self.slots
            .get(&fd)
            .map_or(Interest::empty(), FdSlot::interest)
    }

    fn remove(&mut self, fd: RawFd) -> Option<FdSlot> {
        self.slots.remove(&fd)
    }
}

impl fmt::Debug for FdTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdTable")
            .field("fds", &self.slots.len())
            .finish()
    }
}

// === scheduler-side event delivery ===

impl Ctx {
    /// Blocks on the pollset for at most `timeout` and triggers the clause
    /// of every reported (fd, direction). Returns the number of clauses
    /// fired.
    pub(crate) fn poll_events(&self, timeout: Option<Duration>) -> usize {
        let mut events = self.core.events.take();
        events.clear();
        let result = self.core.pollset.borrow_mut().poll(timeout, &mut events);
        if let Err(error) = result {
            tracing::warn!(%error, "pollset poll failed");
        }
        let mut fired = 0;
        for event in events.drain(..) {
            for dir in [Interest::IN, Interest::OUT] {
                if !event.interest.contains(dir) {
                    continue;
                }
                let waiter = self.core.fds.borrow_mut().take_waiter(event.fd, dir);
                let Some(node) = waiter else { continue };
                // Safety: registered fd clauses are pinned and live.
                unsafe { node.as_ref().registered.set(false) };
                // Safety: node is live and just removed from the table.
                unsafe { wait::trigger(node.cast(), None) };
                fired += 1;
            }
            let remaining = self.core.fds.borrow().interest(event.fd);
            if let Err(error) = self.core.pollset.borrow_mut().register(event.fd, remaining) {
                tracing::debug!(fd = event.fd, %error, "pollset interest update failed");
            }
        }
        self.core.events.replace(events);
        fired
    }
}

// === entry points ===

/// Waits until `fd` is readable.
///
/// # Errors
///
/// - [`Error::TimedOut`] when `deadline` expires first.
/// - [`Error::InvalidArgument`] when another task already waits for the
///   same direction of `fd`, or when pollset registration fails.
/// - [`Error::Cancelled`] when the waiting task is cancelled or the fd is
///   withdrawn by [`fd_clean`].
pub async fn fd_in(fd: RawFd, deadline: Deadline) -> Result<(), Error> {
    fd_wait(fd, Interest::IN, deadline).await
}

/// Waits until `fd` is writable. Errors as for [`fd_in`].
pub async fn fd_out(fd: RawFd, deadline: Deadline) -> Result<(), Error> {
    fd_wait(fd, Interest::OUT, deadline).await
}

async fn fd_wait(fd: RawFd, dir: Interest, deadline: Deadline) -> Result<(), Error> {
    let ctx = runtime::current();
    ctx.canblock()?;
    let fdcl = pin!(FdClause::new(fd, dir));
    {
        let node = NonNull::from(fdcl.as_ref().get_ref());
        ctx.core.fds.borrow_mut().claim(fd, dir, node)?;
        fdcl.core.set(std::rc::Rc::as_ptr(&ctx.core));
        fdcl.registered.set(true);
        let interest = ctx.core.fds.borrow().interest(fd);
        if let Err(error) = ctx.core.pollset.borrow_mut().register(fd, interest) {
            tracing::debug!(fd, %error, "pollset registration failed");
            // Roll back the claim before surfacing the failure.
            fdcl.registered.set(false);
            ctx.core.fds.borrow_mut().clear_waiter(fd, dir, node);
            return Err(Error::InvalidArgument);
        }
    }
    let wait = pin!(WaitCore::new());
    wait.as_ref()
        .register(fdcl.as_ref().header(), 0, Some(cancel_fd as CancelFn));
    let tmcl = pin!(TimerClause::new(deadline));
    if !deadline.is_forever() {
        time::arm_timer(&ctx, tmcl.as_ref(), wait.as_ref(), 1);
    }
    let fired = wait.as_ref().suspend().await;
    match fired.id {
        0 => fired.err.map_or(Ok(()), Err),
        1 => Err(Error::TimedOut),
        _ => Err(fired.cancellation()),
    }
}

/// Drops all runtime state for `fd`. Must be called before closing an fd
/// that was ever passed to [`fd_in`] or [`fd_out`]; a task still waiting
/// on the fd resumes with [`Error::Cancelled`].
///
/// # Panics
///
/// Panics when called outside a runtime context.
pub fn fd_clean(fd: RawFd) {
    let ctx = runtime::current();
    let slot = ctx.core.fds.borrow_mut().remove(fd);
    if let Some(slot) = slot {
        for node in [slot.rd, slot.wr].into_iter().flatten() {
            // Safety: registered fd clauses are pinned and live.
            unsafe { node.as_ref().registered.set(false) };
            // Safety: node is live and just removed from the table.
            unsafe { wait::trigger(node.cast(), Some(Error::Cancelled)) };
        }
    }
    ctx.core.pollset.borrow_mut().forget(fd);
}

// === mio backend ===

/// The shipped [`Pollset`] backend, built on mio's OS poller.
#[cfg(unix)]
pub struct MioPollset {
    poll: mio::Poll,
    events: mio::Events,
    watched: HashMap<RawFd, mio::Interest>,
}

#[cfg(unix)]
impl MioPollset {
    /// # Errors
    ///
    /// Propagates OS errors from poller construction.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(1024),
            watched: HashMap::new(),
        })
    }

    fn mio_interest(interest: Interest) -> Option<mio::Interest> {
        match (interest.contains(Interest::IN), interest.contains(Interest::OUT)) {
            (true, true) => Some(mio::Interest::READABLE.add(mio::Interest::WRITABLE)),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

#[cfg(unix)]
impl Pollset for MioPollset {
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        use mio::unix::SourceFd;
        let registry = self.poll.registry();
        let mut source = SourceFd(&fd);
        let token = mio::Token(usize::try_from(fd).map_err(|_| io::ErrorKind::InvalidInput)?);
        match (self.watched.get(&fd), Self::mio_interest(interest)) {
            (None, None) => Ok(()),
            (None, Some(wanted)) => {
                registry.register(&mut source, token, wanted)?;
                self.watched.insert(fd, wanted);
                Ok(())
            }
            (Some(_), None) => {
                self.watched.remove(&fd);
                registry.deregister(&mut source)
            }
            (Some(_), Some(wanted)) => {
                // Re-register even for an unchanged set: the poller is
                // edge-triggered and re-registration re-reports current
                // readiness.
                registry.reregister(&mut source, token, wanted)?;
                self.watched.insert(fd, wanted);
                Ok(())
            }
        }
    }

    fn poll(&mut self, timeout: Option<Duration>, events: &mut Vec<FdEvent>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            result => result?,
        }
        for event in &self.events {
            let fd = event.token().0 as RawFd;
            let mut interest = Interest::empty();
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                interest |= Interest::IN;
            }
            if event.is_writable() || event.is_write_closed() || event.is_error() {
                interest |= Interest::OUT;
            }
            if !interest.is_empty() {
                events.push(FdEvent { fd, interest });
            }
        }
        Ok(())
    }

    fn forget(&mut self, fd: RawFd) {
        use mio::unix::SourceFd;
        if self.watched.remove(&fd).is_some() {
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
    }
}

#[cfg(unix)]
impl fmt::Debug for MioPollset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MioPollset")
            .field("watched", &self.watched.len())
            .finish_non_exhaustive()
    }
}
