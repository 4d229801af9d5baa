// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The clause engine.
//!
//! A blocking primitive that cannot complete immediately registers one or
//! more *clauses*, records of the form "wake me when condition C holds,
//! reporting id I", and
//! suspends. Clauses are intrusive records pinned inside the suspended
//! operation's state: one half of each clause links into a per-condition
//! queue (a channel endpoint, the timer heap, a pollset slot), the other
//! half into the owning wait's clause chain.
//!
//! [`trigger`] is called by the condition's owner when a clause becomes
//! satisfied. The first trigger wins: it withdraws every clause of that
//! wait from its condition queue (via the per-clause cancel callback),
//! records the winning id and error, and wakes the task. Because withdrawal
//! happens at trigger time, a clause that lost the race can never consume
//! an event: a task waiting on many conditions is woken by exactly one.

use crate::error::Error;
use crate::runtime;
use core::cell::{Cell, RefCell};
use core::fmt;
use core::marker::PhantomPinned;
use core::pin::Pin;
use core::ptr::NonNull;
use core::task::{Context, Poll, Waker};

/// Id reported when the wait was ended by cancellation rather than by one
/// of its clauses.
pub(crate) const CANCEL_ID: u32 = u32::MAX;

/// Unlinks a clause from its condition queue. Invoked exactly once per
/// registered clause, either by [`trigger`] when the wait completes or by
/// the suspending operation when it is cancelled. Must tolerate a clause
/// that is no longer queued.
pub(crate) type CancelFn = unsafe fn(NonNull<ClauseHeader>);

/// Common head of every concrete clause node.
///
/// Concrete clause types (channel, timer, pollset, join) embed this as
/// their first field under `#[repr(C)]`, so a `NonNull<ClauseHeader>` can
/// be cast back to the concrete node inside the cancel callback.
pub(crate) struct ClauseHeader {
    /// The wait this clause belongs to. `None` once the clause has been
    /// withdrawn.
    core: Cell<Option<NonNull<WaitCore>>>,
    /// Value reported by the wait if this clause fires.
    id: Cell<u32>,
    cancel: Cell<Option<CancelFn>>,
    /// Next clause in the owning wait's chain.
    next: Cell<Option<NonNull<ClauseHeader>>>,
    _pin: PhantomPinned,
}

impl ClauseHeader {
    pub(crate) const fn new() -> Self {
        Self {
            core: Cell::new(None),
            id: Cell::new(0),
            cancel: Cell::new(None),
            next: Cell::new(None),
            _pin: PhantomPinned,
        }
    }

    /// Detaches the clause from whatever wait it was registered with, so
    /// the node can be registered again later. Used when a wait is torn
    /// down without firing.
    pub(crate) fn reset(&self) {
        self.core.set(None);
        self.cancel.set(None);
        self.next.set(None);
    }
}

impl fmt::Debug for ClauseHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClauseHeader")
            .field("id", &self.id.get())
            .field("registered", &self.core.get().is_some())
            .finish()
    }
}

/// The clause that ended a wait: its id and the error supplied by the
/// trigger (`None` for success).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Fired {
    pub(crate) id: u32,
    pub(crate) err: Option<Error>,
}

impl Fired {
    /// Maps the cancellation outcome; callers match the remaining ids
    /// themselves.
    pub(crate) fn cancellation(self) -> Error {
        self.err.unwrap_or(Error::Cancelled)
    }
}

/// Per-suspension state, pinned inside the waiting operation.
///
/// Holds the winning clause once one fires, the chain of registered
/// clauses, and the waker of the suspended task.
pub(crate) struct WaitCore {
    fired: Cell<Option<Fired>>,
    clauses: Cell<Option<NonNull<ClauseHeader>>>,
    waker: RefCell<Option<Waker>>,
    _pin: PhantomPinned,
}

impl WaitCore {
    pub(crate) const fn new() -> Self {
        Self {
            fired: Cell::new(None),
            clauses: Cell::new(None),
            waker: RefCell::new(None),
            _pin: PhantomPinned,
        }
    }

    /// Adds `clause` to this wait. If the wait later completes through a
    /// different clause, `cancel` is invoked to withdraw this one from its
    /// condition queue.
    ///
    /// The caller must have already linked the clause into its condition
    /// queue; registration only records the wait-side bookkeeping.
    pub(crate) fn register(
        self: Pin<&Self>,
        clause: Pin<&ClauseHeader>,
        id: u32,
        cancel: Option<CancelFn>,
    ) {
        let this = self.get_ref();
        let clause = clause.get_ref();
        debug_assert!(
            clause.core.get().is_none(),
            "clause registered with a wait twice"
        );
        clause.core.set(Some(NonNull::from(this)));
        clause.id.set(id);
        clause.cancel.set(cancel);
        clause.next.set(this.clauses.get());
        this.clauses.set(Some(NonNull::from(clause)));
    }

    /// Suspends until one of the registered clauses fires.
    ///
    /// Completes immediately with [`CANCEL_ID`] if the owning task has been
    /// cancelled or the context forbids blocking; in that case all
    /// registered clauses are withdrawn before returning.
    pub(crate) fn suspend(self: Pin<&Self>) -> Suspend<'_> {
        Suspend { core: self }
    }

    pub(crate) fn poll_fired(self: Pin<&Self>, cx: &mut Context<'_>) -> Poll<Fired> {
        let this = self.get_ref();
        if let Some(fired) = this.fired.get() {
            return Poll::Ready(fired);
        }
        if let Some(err) = runtime::pending_cancellation() {
            this.withdraw_all();
            let fired = Fired {
                id: CANCEL_ID,
                err: Some(err),
            };
            this.fired.set(Some(fired));
            return Poll::Ready(fired);
        }
        *this.waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }

    /// Withdraws every registered clause from its condition queue and
    /// empties the chain. Each cancel callback runs exactly once.
    fn withdraw_all(&self) {
        let mut cur = self.clauses.take();
        while let Some(ptr) = cur {
            // Safety: registered clauses are pinned in the same suspended
            // operation as this wait and outlive it; the chain is only
            // walked while those pins are live.
            let clause = unsafe { ptr.as_ref() };
            cur = clause.next.take();
            clause.core.set(None);
            if let Some(cancel) = clause.cancel.take() {
                // Safety: `ptr` heads a live concrete clause node; the
                // callback was supplied for exactly this node type.
                unsafe { cancel(ptr) };
            }
        }
    }
}

impl fmt::Debug for WaitCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitCore")
            .field("fired", &self.fired.get())
            .finish_non_exhaustive()
    }
}

/// Fires a clause: the owning wait completes with `(id, err)` and all of
/// its clauses are withdrawn. A trigger on an already-withdrawn clause is
/// a benign no-op.
///
/// # Safety
///
/// `clause` must point at a live clause node. The caller must have removed
/// the node from its condition queue (or be prepared for the node's cancel
/// callback to do so) before the owning operation resumes.
pub(crate) unsafe fn trigger(clause: NonNull<ClauseHeader>, err: Option<Error>) {
    // Safety: per this function's contract the node is live.
    let header = unsafe { clause.as_ref() };
    let Some(core) = header.core.get() else {
        // Already withdrawn by an earlier trigger; nothing to do.
        return;
    };
    let id = header.id.get();
    // Safety: a registered clause's wait is pinned in the same suspended
    // operation and is live for as long as the clause is registered.
    let core = unsafe { core.as_ref() };
    debug_assert!(core.fired.get().is_none(), "wait fired twice");
    core.withdraw_all();
    core.fired.set(Some(Fired { id, err }));
    tracing::trace!(id, ?err, "clause fired");
    if let Some(waker) = core.waker.borrow_mut().take() {
        waker.wake();
    }
}

/// Future returned by [`WaitCore::suspend`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub(crate) struct Suspend<'a> {
    core: Pin<&'a WaitCore>,
}

impl Future for Suspend<'_> {
    type Output = Fired;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.core.poll_fired(cx)
    }
}
