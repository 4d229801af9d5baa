// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tasks and bundles.
//!
//! A task is a pinned, boxed future plus scheduler bookkeeping: its run
//! state, a level-triggered cancellation cell, and the queue of waits
//! parked in [`join`]. Spawning places the task at the tail of the ready
//! queue; when its future completes, every parked joiner is triggered.
//!
//! A bundle owns the handles of the tasks spawned into it. Closing the
//! bundle cancels every child and drives each to completion, so no child
//! outlives it.

use crate::error::Error;
use crate::handle::{Handle, Object};
use crate::runtime::{self, Core, Ctx};
use crate::time::{self, Deadline, TimerClause};
use crate::wait::{self, CancelFn, ClauseHeader, WaitCore};
use cordyceps::{Linked, List, list};
use core::any::{Any, TypeId};
use core::cell::{Cell, RefCell};
use core::fmt;
use core::marker::PhantomPinned;
use core::mem::{ManuallyDrop, offset_of};
use core::pin::{Pin, pin};
use core::ptr::NonNull;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use static_assertions::const_assert_eq;
use std::rc::{Rc, Weak};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum RunState {
    /// Not queued and not running; parked on its clauses or never polled.
    Idle,
    /// In the ready queue.
    Queued,
    /// Being polled right now.
    Running,
    /// Woke itself while running; goes back on the ready queue after the
    /// poll returns.
    Notified,
    /// Ran to completion. The control block stays until its owner frees
    /// it.
    Finished,
}

/// Task control block.
pub(crate) struct Task {
    id: u64,
    /// The root pseudo-task of `block_on`. It is queued like every other
    /// task, but its future lives on the `block_on` stack, so the
    /// scheduler polls it in place instead of through the control block.
    root: bool,
    state: Cell<RunState>,
    future: RefCell<Option<Pin<Box<dyn Future<Output = ()>>>>>,
    /// Level-triggered: set once, observed by every subsequent blocking
    /// attempt until the task exits.
    cancelled: Cell<Option<Error>>,
    /// Waits parked in [`join`] on this task.
    joiners: RefCell<List<JoinClause>>,
    core: Weak<Core>,
}

impl Task {
    pub(crate) fn new(
        id: u64,
        future: Pin<Box<dyn Future<Output = ()>>>,
        core: Weak<Core>,
    ) -> Self {
        Self {
            id,
            root: false,
            state: Cell::new(RunState::Idle),
            future: RefCell::new(Some(future)),
            cancelled: Cell::new(None),
            joiners: RefCell::new(List::new()),
            core,
        }
    }

    pub(crate) fn new_root(core: Weak<Core>) -> Self {
        Self {
            id: 0,
            root: true,
            state: Cell::new(RunState::Idle),
            future: RefCell::new(None),
            cancelled: Cell::new(None),
            joiners: RefCell::new(List::new()),
            core,
        }
    }

    pub(crate) fn run_state(&self) -> RunState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: RunState) {
        self.state.set(state);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.get() == RunState::Finished
    }

    pub(crate) fn is_root(&self) -> bool {
        self.root
    }

    pub(crate) fn cancelled(&self) -> Option<Error> {
        self.cancelled.get()
    }

    pub(crate) fn take_future(&self) -> Option<Pin<Box<dyn Future<Output = ()>>>> {
        self.future.borrow_mut().take()
    }

    pub(crate) fn put_future(&self, future: Pin<Box<dyn Future<Output = ()>>>) {
        *self.future.borrow_mut() = Some(future);
    }

    /// Moves the task to the tail of the ready queue. The root
    /// pseudo-task of `block_on` takes the same path, so it is scheduled
    /// with the same FIFO fairness as every spawned task. No-op if already
    /// queued or finished.
    pub(crate) fn schedule(self: &Rc<Self>) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        match self.state.get() {
            RunState::Idle => {
                self.state.set(RunState::Queued);
                core.ready.borrow_mut().push_back(self.clone());
                tracing::trace!(task = self.id, "task scheduled");
            }
            RunState::Running => self.state.set(RunState::Notified),
            RunState::Queued | RunState::Notified | RunState::Finished => {}
        }
    }

    /// Delivers cancellation: records `err` (first delivery wins) and
    /// schedules the task so its parked operation observes it.
    pub(crate) fn cancel_with(self: &Rc<Self>, err: Error) {
        if self.is_finished() {
            return;
        }
        if self.cancelled.get().is_none() {
            self.cancelled.set(Some(err));
            tracing::trace!(task = self.id, ?err, "task cancelled");
        }
        self.schedule();
    }

    /// Epilogue: marks the task finished and triggers every parked joiner.
    pub(crate) fn finish(&self) {
        self.state.set(RunState::Finished);
        loop {
            let node = self.joiners.borrow_mut().pop_front();
            let Some(node) = node else { break };
            // Safety: parked join clauses are pinned and live until
            // triggered.
            unsafe { node.as_ref().queued.set(false) };
            // Safety: node is live and freshly unlinked.
            unsafe { wait::trigger(node.cast(), None) };
        }
        tracing::trace!(task = self.id, "task finished");
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("cancelled", &self.cancelled.get())
            .finish()
    }
}

impl Object for Task {
    fn query(self: Rc<Self>, ty: TypeId) -> Option<Rc<dyn Any>> {
        (ty == TypeId::of::<Task>()).then_some(self as Rc<dyn Any>)
    }

    /// Closing a task handle cancels the task and runs it to completion on
    /// the closing stack; every blocking attempt inside it fails
    /// immediately, so this never suspends.
    fn close(self: Rc<Self>, ctx: &Ctx) {
        if self.is_finished() {
            return;
        }
        self.cancel_with(Error::Cancelled);
        ctx.drive(&self);
    }
}

// === task waker ===

/// A waker backed by an `Rc<Task>`.
///
/// # Safety
///
/// The scheduler context is `!Send`, so these wakers never leave the
/// runtime thread and the non-atomic reference count is never shared.
pub(crate) fn task_waker(task: &Rc<Task>) -> Waker {
    // Safety: the vtable below upholds the RawWaker contract for a pointer
    // produced by `Rc::into_raw`; see the type-level note on thread
    // confinement.
    unsafe { Waker::from_raw(RawWaker::new(Rc::into_raw(Rc::clone(task)).cast(), &VTABLE)) }
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone_waker, wake, wake_by_ref, drop_waker);

unsafe fn clone_waker(data: *const ()) -> RawWaker {
    // Safety: `data` came from `Rc::into_raw` and the count is at least 1.
    unsafe { Rc::increment_strong_count(data.cast::<Task>()) };
    RawWaker::new(data, &VTABLE)
}

unsafe fn wake(data: *const ()) {
    // Safety: consumes the reference this waker holds.
    let task = unsafe { Rc::from_raw(data.cast::<Task>()) };
    task.schedule();
}

unsafe fn wake_by_ref(data: *const ()) {
    // Safety: borrows the reference without consuming it.
    let task = unsafe { ManuallyDrop::new(Rc::from_raw(data.cast::<Task>())) };
    task.schedule();
}

unsafe fn drop_waker(data: *const ()) {
    // Safety: consumes the reference this waker holds.
    drop(unsafe { Rc::from_raw(data.cast::<Task>()) });
}

// === join clauses ===

/// A wait parked on task termination.
#[repr(C)]
pub(crate) struct JoinClause {
    /// Must stay the first field; the cancel callback casts the header
    /// pointer back to the node.
    header: ClauseHeader,
    links: list::Links<JoinClause>,
    /// The awaited task; valid while `queued`.
    task: Cell<*const Task>,
    queued: Cell<bool>,
    _pin: PhantomPinned,
}

const_assert_eq!(offset_of!(JoinClause, header), 0);

impl JoinClause {
    fn new() -> Self {
        Self {
            header: ClauseHeader::new(),
            links: list::Links::new(),
            task: Cell::new(core::ptr::null()),
            queued: Cell::new(false),
            _pin: PhantomPinned,
        }
    }

    fn header(self: Pin<&Self>) -> Pin<&ClauseHeader> {
        // Safety: projection only; the header is never moved out of the
        // pinned node.
        unsafe { self.map_unchecked(|n| &n.header) }
    }

    fn park(self: Pin<&Self>, task: &Task) {
        let this = self.get_ref();
        this.task.set(core::ptr::from_ref(task));
        task.joiners.borrow_mut().push_back(NonNull::from(this));
        this.queued.set(true);
    }

    /// Unlinks from the task's joiner queue; idempotent.
    unsafe fn unlink(ptr: NonNull<Self>) {
        // Safety: caller guarantees the node is live.
        let this = unsafe { ptr.as_ref() };
        if !this.queued.replace(false) {
            return;
        }
        // Safety: the awaited task is kept alive by the joining operation
        // for as long as the node is queued.
        let task = unsafe { &*this.task.get() };
        // Safety: the node is linked in exactly this list.
        unsafe { task.joiners.borrow_mut().remove(ptr) };
    }
}

impl Drop for JoinClause {
    fn drop(&mut self) {
        // Safety: `self` is live for the duration of the call.
        unsafe { JoinClause::unlink(NonNull::from(&*self)) };
    }
}

unsafe fn cancel_join(ptr: NonNull<ClauseHeader>) {
    // Safety: the clause engine hands us the header pointer of a live
    // `JoinClause` (repr(C), header first).
    unsafe { JoinClause::unlink(ptr.cast()) };
}

// Safety: JoinClause nodes are pinned while linked and `links` is a plain
// field of the node.
unsafe impl Linked<list::Links<JoinClause>> for JoinClause {
    type Handle = NonNull<Self>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<list::Links<Self>> {
        ptr.map_addr(|addr| {
            let offset = offset_of!(Self, links);
            addr.checked_add(offset).unwrap()
        })
        .cast()
    }
}

// === public task operations ===

/// Spawns `future` as a new task at the tail of the ready queue and
/// returns its handle. The handle owns the task: close it (or the bundle
/// it was spawned into) to free the task.
///
/// # Errors
///
/// [`Error::Cancelled`] when the spawning task has been cancelled or the
/// context forbids blocking.
///
/// # Panics
///
/// Panics when called outside a runtime context.
pub fn spawn<F>(future: F) -> Result<Handle, Error>
where
    F: Future<Output = ()> + 'static,
{
    runtime::current().spawn(future)
}

/// Waits until the task behind `h` has run to completion.
///
/// # Errors
///
/// - [`Error::TimedOut`] if `deadline` expires first.
/// - [`Error::Cancelled`] if the waiting task is cancelled.
/// - [`Error::BadHandle`] / [`Error::NotSupported`] if `h` does not name a
///   task.
pub async fn join(h: Handle, deadline: Deadline) -> Result<(), Error> {
    let ctx = runtime::current();
    ctx.canblock()?;
    let task: Rc<Task> = ctx.query(h)?;
    if task.is_finished() {
        return Ok(());
    }
    if deadline.is_immediate() {
        return Err(Error::TimedOut);
    }
    let wait = pin!(WaitCore::new());
    let jcl = pin!(JoinClause::new());
    jcl.as_ref().park(&task);
    wait.as_ref().register(jcl.as_ref().header(), 0, Some(cancel_join as CancelFn));
    let tmcl = pin!(TimerClause::new(deadline));
    if deadline.is_finite() {
        time::arm_timer(&ctx, tmcl.as_ref(), wait.as_ref(), 1);
    }
    let fired = wait.as_ref().suspend().await;
    match fired.id {
        0 => fired.err.map_or(Ok(()), Err),
        1 => Err(Error::TimedOut),
        _ => Err(fired.cancellation()),
    }
}

/// Delivers cancellation to the task behind `h`.
///
/// If the task is blocked it wakes out of its wait with `err`; if it is
/// ready or running, its next blocking attempt fails with `err`.
/// Cancellation is level-triggered: it stays delivered until the task
/// exits.
///
/// # Errors
///
/// [`Error::BadHandle`] / [`Error::NotSupported`] if `h` does not name a
/// task.
pub fn cancel(h: Handle, err: Error) -> Result<(), Error> {
    let ctx = runtime::current();
    let task: Rc<Task> = ctx.query(h)?;
    task.cancel_with(err);
    Ok(())
}

/// Yields to other ready tasks; the current task is rescheduled at the
/// tail of the ready queue.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
#[derive(Debug)]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            return Poll::Ready(Ok(()));
        }
        if let Some(err) = runtime::pending_cancellation() {
            return Poll::Ready(Err(err));
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

// === bundles ===

/// Owning collection of child tasks.
pub(crate) struct Bundle {
    children: RefCell<Vec<Handle>>,
}

impl Object for Bundle {
    fn query(self: Rc<Self>, ty: TypeId) -> Option<Rc<dyn Any>> {
        (ty == TypeId::of::<Bundle>()).then_some(self as Rc<dyn Any>)
    }

    /// Cancels every child, then drives each to completion and frees it.
    fn close(self: Rc<Self>, ctx: &Ctx) {
        let children = self.children.take();
        for &h in &children {
            if let Ok(task) = ctx.query::<Task>(h) {
                task.cancel_with(Error::Cancelled);
            }
        }
        for h in children {
            let _ = ctx.close(h);
        }
    }
}

/// Creates an empty bundle.
///
/// # Errors
///
/// [`Error::Cancelled`] when the context forbids blocking.
///
/// # Panics
///
/// Panics when called outside a runtime context.
pub fn bundle() -> Result<Handle, Error> {
    runtime::current().register_object(Rc::new(Bundle {
        children: RefCell::new(Vec::new()),
    }))
}

/// Spawns `future` as a child of `bundle`.
///
/// The returned handle identifies the child for [`cancel`] and [`join`],
/// but the bundle keeps ownership: closing the bundle is the only way to
/// free its children, and it closes each child handle itself.
///
/// # Errors
///
/// Propagates [`spawn`] errors, plus [`Error::BadHandle`] /
/// [`Error::NotSupported`] if `bundle` does not name a bundle.
pub fn bundle_spawn<F>(bundle: Handle, future: F) -> Result<Handle, Error>
where
    F: Future<Output = ()> + 'static,
{
    let ctx = runtime::current();
    let b: Rc<Bundle> = ctx.query(bundle)?;
    let h = ctx.spawn(future)?;
    b.children.borrow_mut().push(h);
    Ok(h)
}
