// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Rendezvous channels.
//!
//! A channel is two half-channels living in one shared block. Each half
//! keeps a queue of clauses parked to receive from it and a queue of
//! clauses parked to send into it; sending on a handle always targets the
//! *opposite* half, so one handle of the pair acts as the send side and
//! the other as the receive side, while holding both handles gives
//! bidirectional use.
//!
//! Message hand-off is a rendezvous: the arriving peer copies bytes
//! directly between the producer's and consumer's buffers, exactly once,
//! with no intermediate storage. Buffer lengths must match exactly; a
//! mismatch fails *both* sides with [`Error::MessageSize`].

use crate::error::Error;
use crate::handle::{Handle, Object};
use crate::runtime::{self, Ctx};
use crate::time::{self, Deadline, TimerClause};
use crate::wait::{self, CANCEL_ID, CancelFn, ClauseHeader, WaitCore};
use cordyceps::{Linked, List, list};
use core::any::{Any, TypeId};
use core::cell::{Cell, RefCell};
use core::fmt;
use core::marker::{PhantomData, PhantomPinned};
use core::mem::offset_of;
use core::pin::{Pin, pin};
use core::ptr::{self, NonNull};
use static_assertions::const_assert_eq;
use std::rc::Rc;

/// Which queue of a half-channel a clause is parked in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Queue {
    /// Clauses waiting to take a message out of this half.
    Receivers,
    /// Clauses waiting to hand a message into this half.
    Senders,
}

/// A parked channel operation: one end of a pending rendezvous.
#[repr(C)]
pub(crate) struct ChanClause {
    /// Must stay the first field; the cancel callback casts the header
    /// pointer back to the node.
    header: ClauseHeader,
    links: list::Links<ChanClause>,
    /// The parked peer's buffer: read from it (parked sender) or written
    /// through it (parked receiver) at rendezvous.
    buf: Cell<*mut u8>,
    len: Cell<usize>,
    /// Location of the queue this clause is linked into; valid while
    /// `queued`.
    chan: Cell<*const ChanCore>,
    half: Cell<usize>,
    queue: Cell<Queue>,
    queued: Cell<bool>,
    _pin: PhantomPinned,
}

const_assert_eq!(offset_of!(ChanClause, header), 0);

impl ChanClause {
    fn new() -> Self {
        Self {
            header: ClauseHeader::new(),
            links: list::Links::new(),
            buf: Cell::new(ptr::null_mut()),
            len: Cell::new(0),
            chan: Cell::new(ptr::null()),
            half: Cell::new(0),
            queue: Cell::new(Queue::Receivers),
            queued: Cell::new(false),
            _pin: PhantomPinned,
        }
    }

    fn header(self: Pin<&Self>) -> Pin<&ClauseHeader> {
        // Safety: projection only; the header is never moved out of the
        // pinned node.
        unsafe { self.map_unchecked(|n| &n.header) }
    }

    /// Links this clause into `queue` of `chan.halves[half]`.
    fn park(self: Pin<&Self>, chan: &Rc<ChanCore>, half: usize, queue: Queue, buf: *mut u8, len: usize) {
        let this = self.get_ref();
        debug_assert!(!this.queued.get(), "channel clause parked twice");
        this.buf.set(buf);
        this.len.set(len);
        this.chan.set(Rc::as_ptr(chan));
        this.half.set(half);
        this.queue.set(queue);
        chan.halves[half].list(queue).borrow_mut().push_back(NonNull::from(this));
        this.queued.set(true);
    }

    /// Unlinks from the condition queue; idempotent.
    unsafe fn unlink(ptr: NonNull<Self>) {
        // Safety: caller guarantees the node is live.
        let this = unsafe { ptr.as_ref() };
        if !this.queued.replace(false) {
            return;
        }
        // Safety: the channel is kept alive by its endpoint handles for as
        // long as any clause is queued on it.
        let chan = unsafe { &*this.chan.get() };
        let mut list = chan.halves[this.half.get()].list(this.queue.get()).borrow_mut();
        // Safety: the clause is linked in exactly this list.
        unsafe { list.remove(ptr) };
    }
}

impl Drop for ChanClause {
    fn drop(&mut self) {
        // Safety: `self` is live for the duration of the call.
        unsafe { ChanClause::unlink(NonNull::from(&*self)) };
    }
}

unsafe fn cancel_chan(ptr: NonNull<ClauseHeader>) {
    // Safety: the clause engine hands us the header pointer of a live
    // `ChanClause` (repr(C), header first).
    unsafe { ChanClause::unlink(ptr.cast()) };
}

// Safety: ChanClause nodes are pinned while linked and `links` is a plain
// field of the node.
unsafe impl Linked<list::Links<ChanClause>> for ChanClause {
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

/// One half of a channel.
struct HalfChan {
    receivers: RefCell<List<ChanClause>>,
    senders: RefCell<List<ChanClause>>,
    /// Set by `done` on the opposite handle; sends and receives touching
    /// this half fail with broken-pipe once set.
    done: Cell<bool>,
    closed: Cell<bool>,
}

impl HalfChan {
    fn new() -> Self {
        Self {
            receivers: RefCell::new(List::new()),
            senders: RefCell::new(List::new()),
            done: Cell::new(false),
            closed: Cell::new(false),
        }
    }

    fn list(&self, queue: Queue) -> &RefCell<List<ChanClause>> {
        match queue {
            Queue::Receivers => &self.receivers,
            Queue::Senders => &self.senders,
        }
    }

    /// Dequeues the first parked clause of `queue`, unlinking it.
    fn pop(&self, queue: Queue) -> Option<NonNull<ChanClause>> {
        let node = self.list(queue).borrow_mut().pop_front()?;
        // Safety: parked clauses are pinned and live until triggered.
        unsafe { node.as_ref().queued.set(false) };
        Some(node)
    }
}

/// The shared block holding both halves.
pub(crate) struct ChanCore {
    halves: [HalfChan; 2],
}

impl ChanCore {
    fn new() -> Self {
        Self {
            halves: [HalfChan::new(), HalfChan::new()],
        }
    }

    const fn other(index: usize) -> usize {
        index ^ 1
    }

    /// Resumes every clause parked on `half` with broken-pipe.
    fn drain_half(&self, half: usize) {
        for queue in [Queue::Receivers, Queue::Senders] {
            while let Some(node) = self.halves[half].pop(queue) {
                // Safety: freshly unlinked and still live.
                unsafe { wait::trigger(node.cast(), Some(Error::BrokenPipe)) };
            }
        }
    }
}

/// One endpoint of a channel: the object behind a channel handle.
pub(crate) struct ChanEndpoint {
    chan: Rc<ChanCore>,
    index: usize,
}

impl Object for ChanEndpoint {
    fn query(self: Rc<Self>, ty: TypeId) -> Option<Rc<dyn Any>> {
        (ty == TypeId::of::<ChanEndpoint>()).then_some(self as Rc<dyn Any>)
    }

    /// Marks this half closed. Once both halves are closed, every parked
    /// clause on either half is resumed with broken-pipe and the backing
    /// storage is released.
    fn close(self: Rc<Self>, _ctx: &Ctx) {
        let half = &self.chan.halves[self.index];
        debug_assert!(!half.closed.get(), "half-channel closed twice");
        half.closed.set(true);
        if self.chan.halves[ChanCore::other(self.index)].closed.get() {
            self.chan.drain_half(0);
            self.chan.drain_half(1);
        }
    }
}

/// Caller-preallocated backing for one channel.
///
/// [`channel_with`] consumes the storage and performs no allocation of its
/// own, so channels can be built from a pre-filled pool on hot paths. The
/// storage is reclaimed when both halves of the channel close.
pub struct ChanStorage {
    ends: [Rc<ChanEndpoint>; 2],
}

impl ChanStorage {
    #[must_use]
    pub fn new() -> Self {
        let chan = Rc::new(ChanCore::new());
        Self {
            ends: [
                Rc::new(ChanEndpoint {
                    chan: chan.clone(),
                    index: 0,
                }),
                Rc::new(ChanEndpoint { chan, index: 1 }),
            ],
        }
    }
}

impl Default for ChanStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChanStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChanStorage").finish_non_exhaustive()
    }
}

/// Creates a channel and returns the handles of its two halves.
///
/// # Errors
///
/// [`Error::Cancelled`] when the context forbids blocking.
///
/// # Panics
///
/// Panics when called outside a runtime context.
pub fn channel() -> Result<(Handle, Handle), Error> {
    channel_with(ChanStorage::new())
}

/// Creates a channel over caller-preallocated storage; no allocation
/// happens in this call.
///
/// # Errors
///
/// [`Error::Cancelled`] when the context forbids blocking.
///
/// # Panics
///
/// Panics when called outside a runtime context.
pub fn channel_with(storage: ChanStorage) -> Result<(Handle, Handle), Error> {
    let ctx = runtime::current();
    let [a, b] = storage.ends;
    let h0 = ctx.register_object(a)?;
    let h1 = match ctx.register_object(b) {
        Ok(h) => h,
        Err(err) => {
            // The second handle was never created; closing the first tears
            // the whole channel down.
            let _ = ctx.close(h0);
            return Err(err);
        }
    };
    Ok((h0, h1))
}

/// Completes one parked peer of a rendezvous: checks the length contract,
/// copies `len` bytes from `src` to `dst`, and wakes the peer.
///
/// # Safety
///
/// `node` must be a live, freshly-dequeued clause; `src` and `dst` must be
/// valid for `len` bytes and must include the parked peer's buffer, whose
/// backing `&[u8]`/`&mut [u8]` is held across its suspension.
unsafe fn complete_rendezvous(
    node: NonNull<ChanClause>,
    src: *const u8,
    dst: *mut u8,
    len: usize,
    peer_len: usize,
) -> Result<(), Error> {
    if peer_len != len {
        // Safety: per this function's contract.
        unsafe { wait::trigger(node.cast(), Some(Error::MessageSize)) };
        return Err(Error::MessageSize);
    }
    // The single copy of the message: producer buffer straight into
    // consumer buffer.
    // Safety: per this function's contract; the two buffers belong to two
    // different tasks and cannot overlap.
    unsafe { ptr::copy_nonoverlapping(src, dst, len) };
    // Safety: per this function's contract.
    unsafe { wait::trigger(node.cast(), None) };
    Ok(())
}

/// Sends `buf` over the channel handle `h`.
///
/// If a receiver is parked on the opposite half, the message is copied
/// straight into its buffer and both sides complete. Otherwise the sender
/// parks until a receiver arrives, `deadline` expires, or the channel is
/// torn down.
///
/// # Errors
///
/// - [`Error::BrokenPipe`] after `done` or close.
/// - [`Error::MessageSize`] when the peer's buffer length differs.
/// - [`Error::TimedOut`] when `deadline` expires.
/// - [`Error::Cancelled`] when the sending task is cancelled.
/// - [`Error::BadHandle`] / [`Error::NotSupported`] for a non-channel
///   handle.
pub async fn send(h: Handle, buf: &[u8], deadline: Deadline) -> Result<(), Error> {
    let ctx = runtime::current();
    ctx.canblock()?;
    let ep: Rc<ChanEndpoint> = ctx.query(h)?;
    let other = ChanCore::other(ep.index);
    let dst_half = &ep.chan.halves[other];
    if dst_half.done.get() {
        return Err(Error::BrokenPipe);
    }
    if let Some(node) = dst_half.pop(Queue::Receivers) {
        // Safety: parked clauses are pinned and live until triggered.
        let (peer_buf, peer_len) = unsafe { (node.as_ref().buf.get(), node.as_ref().len.get()) };
        tracing::trace!(handle = %h, len = buf.len(), "hand-off to parked receiver");
        // Safety: `node` was just dequeued; the peer buffer is held alive
        // by the parked receive.
        return unsafe { complete_rendezvous(node, buf.as_ptr(), peer_buf, buf.len(), peer_len) };
    }
    if deadline.is_immediate() {
        return Err(Error::TimedOut);
    }
    let wait = pin!(WaitCore::new());
    let chcl = pin!(ChanClause::new());
    chcl.as_ref().park(
        &ep.chan,
        other,
        Queue::Senders,
        buf.as_ptr().cast_mut(),
        buf.len(),
    );
    wait.as_ref()
        .register(chcl.as_ref().header(), 0, Some(cancel_chan as CancelFn));
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

/// Receives a message from the channel handle `h` into `buf`.
///
/// If a sender is parked on this half, its message is copied straight out
/// of the sender's buffer and both sides complete. Otherwise the receiver
/// parks until a sender arrives, `deadline` expires, or the channel is
/// torn down.
///
/// # Errors
///
/// As for [`send`].
pub async fn recv(h: Handle, buf: &mut [u8], deadline: Deadline) -> Result<(), Error> {
    let ctx = runtime::current();
    ctx.canblock()?;
    let ep: Rc<ChanEndpoint> = ctx.query(h)?;
    let half = &ep.chan.halves[ep.index];
    if half.done.get() {
        return Err(Error::BrokenPipe);
    }
    if let Some(node) = half.pop(Queue::Senders) {
        // Safety: parked clauses are pinned and live until triggered.
        let (peer_buf, peer_len) = unsafe { (node.as_ref().buf.get(), node.as_ref().len.get()) };
        tracing::trace!(handle = %h, len = buf.len(), "hand-off from parked sender");
        // Safety: `node` was just dequeued; the peer buffer is held alive
        // by the parked send.
        return unsafe {
            complete_rendezvous(node, peer_buf, buf.as_mut_ptr(), buf.len(), peer_len)
        };
    }
    if deadline.is_immediate() {
        return Err(Error::TimedOut);
    }
    let wait = pin!(WaitCore::new());
    let chcl = pin!(ChanClause::new());
    chcl.as_ref().park(
        &ep.chan,
        ep.index,
        Queue::Receivers,
        buf.as_mut_ptr(),
        buf.len(),
    );
    wait.as_ref()
        .register(chcl.as_ref().header(), 0, Some(cancel_chan as CancelFn));
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

/// Signals that no more messages will travel in the direction of `h`'s
/// peer: marks the opposite half done and resumes everything parked there
/// with broken-pipe. Subsequent sends on `h` and receives on the peer
/// handle fail immediately.
///
/// # Errors
///
/// - [`Error::BrokenPipe`] when `done` was already signalled on this side.
/// - [`Error::BadHandle`] / [`Error::NotSupported`] for a non-channel
///   handle.
pub fn done(h: Handle) -> Result<(), Error> {
    let ctx = runtime::current();
    let ep: Rc<ChanEndpoint> = ctx.query(h)?;
    let other = ChanCore::other(ep.index);
    if ep.chan.halves[other].done.replace(true) {
        return Err(Error::BrokenPipe);
    }
    tracing::trace!(handle = %h, "channel done");
    ep.chan.drain_half(other);
    Ok(())
}

/// One alternative of a [`select`], with the intrusive parking state
/// embedded so an N-way select allocates nothing.
pub struct SelectClause<'a> {
    ch: Handle,
    op: Op,
    buf: *mut u8,
    len: usize,
    node: ChanClause,
    _buffers: PhantomData<&'a mut [u8]>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Op {
    Send,
    Recv,
}

impl<'a> SelectClause<'a> {
    /// A send alternative: offer `buf` on `ch`.
    #[must_use]
    pub fn send(ch: Handle, buf: &'a [u8]) -> Self {
        Self {
            ch,
            op: Op::Send,
            buf: buf.as_ptr().cast_mut(),
            len: buf.len(),
            node: ChanClause::new(),
            _buffers: PhantomData,
        }
    }

    /// A receive alternative: accept a message from `ch` into `buf`.
    #[must_use]
    pub fn recv(ch: Handle, buf: &'a mut [u8]) -> Self {
        Self {
            ch,
            op: Op::Recv,
            buf: buf.as_mut_ptr(),
            len: buf.len(),
            node: ChanClause::new(),
            _buffers: PhantomData,
        }
    }

    #[must_use]
    pub fn handle(&self) -> Handle {
        self.ch
    }
}

impl fmt::Debug for SelectClause<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectClause")
            .field("ch", &self.ch)
            .field("op", &self.op)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// Outcome of a [`select`]: which alternative completed, and how.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Selected {
    pub index: usize,
    /// Per-alternative outcome; [`Error::BrokenPipe`] and
    /// [`Error::MessageSize`] are reported here together with the index
    /// they struck.
    pub result: Result<(), Error>,
}

/// Withdraws leftover select clauses when the operation is dropped
/// mid-park, so no queue retains a pointer into caller storage.
struct Parked<'s, 'b>(&'s [SelectClause<'b>]);

impl Drop for Parked<'_, '_> {
    fn drop(&mut self) {
        for clause in self.0 {
            // Safety: the nodes live in caller storage borrowed for longer
            // than this guard.
            unsafe { ChanClause::unlink(NonNull::from(&clause.node)) };
            clause.node.header.reset();
        }
    }
}

/// Waits until one of `clauses` can complete, trying them in caller order.
///
/// A single immediate pass runs first: the first alternative that can
/// complete right away does so, and its index is returned, including the
/// per-alternative failures ([`Error::BrokenPipe`], [`Error::MessageSize`],
/// bad handles), which are reported through [`Selected::result`] so the
/// caller knows which alternative they struck. Only if no alternative is
/// immediately available are all clauses parked; exactly one then wins and
/// the rest are withdrawn without consuming anything.
///
/// Ordering is the caller's; nothing is randomised.
///
/// # Errors
///
/// - [`Error::TimedOut`] when `deadline` expires before any alternative
///   completes.
/// - [`Error::Cancelled`] when the selecting task is cancelled.
///
/// # Panics
///
/// Panics when called outside a runtime context.
pub async fn select(clauses: &mut [SelectClause<'_>], deadline: Deadline) -> Result<Selected, Error> {
    let ctx = runtime::current();
    ctx.canblock()?;

    // Single-attempt pass over the alternatives, in caller order.
    for (index, clause) in clauses.iter().enumerate() {
        let ep = match ctx.query::<ChanEndpoint>(clause.ch) {
            Ok(ep) => ep,
            Err(err) => {
                return Ok(Selected {
                    index,
                    result: Err(err),
                });
            }
        };
        let outcome = match clause.op {
            Op::Send => {
                let dst_half = &ep.chan.halves[ChanCore::other(ep.index)];
                if dst_half.done.get() {
                    Some(Err(Error::BrokenPipe))
                } else {
                    dst_half.pop(Queue::Receivers).map(|node| {
                        // Safety: parked clauses are pinned and live.
                        let (peer_buf, peer_len) =
                            unsafe { (node.as_ref().buf.get(), node.as_ref().len.get()) };
                        // Safety: freshly dequeued; peer buffer held alive
                        // by the parked receive.
                        unsafe {
                            complete_rendezvous(node, clause.buf, peer_buf, clause.len, peer_len)
                        }
                    })
                }
            }
            Op::Recv => {
                let half = &ep.chan.halves[ep.index];
                if half.done.get() {
                    Some(Err(Error::BrokenPipe))
                } else {
                    half.pop(Queue::Senders).map(|node| {
                        // Safety: parked clauses are pinned and live.
                        let (peer_buf, peer_len) =
                            unsafe { (node.as_ref().buf.get(), node.as_ref().len.get()) };
                        // Safety: freshly dequeued; peer buffer held alive
                        // by the parked send.
                        unsafe {
                            complete_rendezvous(node, peer_buf, clause.buf, clause.len, peer_len)
                        }
                    })
                }
            }
        };
        if let Some(result) = outcome {
            return Ok(Selected { index, result });
        }
    }

    if deadline.is_immediate() {
        return Err(Error::TimedOut);
    }

    // Nothing is immediately available: park on every alternative.
    let wait = pin!(WaitCore::new());
    let _parked = Parked(&*clauses);
    for (index, clause) in _parked.0.iter().enumerate() {
        let ep = ctx
            .query::<ChanEndpoint>(clause.ch)
            .expect("channel handle vanished inside select");
        let (half, queue) = match clause.op {
            Op::Send => (ChanCore::other(ep.index), Queue::Senders),
            Op::Recv => (ep.index, Queue::Receivers),
        };
        // Safety: the node lives in caller storage that is mutably
        // borrowed by this operation and cannot move; the `Parked` guard
        // and the node's own drop unlink it before the borrow ends.
        let node = unsafe { Pin::new_unchecked(&clause.node) };
        node.park(&ep.chan, half, queue, clause.buf, clause.len);
        wait.as_ref()
            .register(node.header(), index as u32, Some(cancel_chan as CancelFn));
    }
    let tmcl = pin!(TimerClause::new(deadline));
    if deadline.is_finite() {
        time::arm_timer(&ctx, tmcl.as_ref(), wait.as_ref(), clauses.len() as u32);
    }
    let fired = wait.as_ref().suspend().await;
    if fired.id == CANCEL_ID {
        return Err(fired.cancellation());
    }
    let index = fired.id as usize;
    if index == clauses.len() {
        return Err(Error::TimedOut);
    }
    Ok(Selected {
        index,
        result: fired.err.map_or(Ok(()), Err),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{run, trace_init};
    use crate::time::deadline_in;
    use crate::{cancel, close, join, now, sleep_until, spawn};
    use std::cell::Cell as StdCell;

    #[test]
    fn ping_pong() {
        let _trace = trace_init();
        run(async {
            let (h0, h1) = channel().unwrap();
            let a = spawn(async move {
                send(h0, &1u32.to_ne_bytes(), Deadline::FOREVER)
                    .await
                    .unwrap();
                let mut buf = [0u8; 4];
                recv(h0, &mut buf, Deadline::FOREVER).await.unwrap();
                assert_eq!(u32::from_ne_bytes(buf), 2);
            })
            .unwrap();
            let b = spawn(async move {
                let mut buf = [0u8; 4];
                recv(h1, &mut buf, Deadline::FOREVER).await.unwrap();
                assert_eq!(u32::from_ne_bytes(buf), 1);
                send(h1, &2u32.to_ne_bytes(), Deadline::FOREVER)
                    .await
                    .unwrap();
            })
            .unwrap();
            join(a, Deadline::FOREVER).await.unwrap();
            join(b, Deadline::FOREVER).await.unwrap();
            close(a).unwrap();
            close(b).unwrap();
            close(h0).unwrap();
            close(h1).unwrap();
        });
    }

    #[test]
    fn recv_times_out_on_empty_channel() {
        let _trace = trace_init();
        run(async {
            let (h0, h1) = channel().unwrap();
            let begin = now();
            let mut buf = [0u8; 4];
            let err = recv(h0, &mut buf, deadline_in(50)).await.unwrap_err();
            assert_eq!(err, Error::TimedOut);
            let elapsed = now() - begin;
            assert!((50..200).contains(&elapsed), "timed out after {elapsed}ms");
            // the timed-out clause must be gone: a sender parks instead of
            // matching a stale receiver
            let err = send(h1, &buf, Deadline::IMMEDIATE).await.unwrap_err();
            assert_eq!(err, Error::TimedOut);
            close(h0).unwrap();
            close(h1).unwrap();
        });
    }

    #[test]
    fn immediate_send_and_recv_time_out() {
        let _trace = trace_init();
        run(async {
            let (h0, h1) = channel().unwrap();
            let mut buf = [0u8; 1];
            assert_eq!(
                send(h0, &buf, Deadline::IMMEDIATE).await.unwrap_err(),
                Error::TimedOut
            );
            assert_eq!(
                recv(h1, &mut buf, Deadline::IMMEDIATE).await.unwrap_err(),
                Error::TimedOut
            );
            close(h0).unwrap();
            close(h1).unwrap();
        });
    }

    #[test]
    fn select_wins_once() {
        let _trace = trace_init();
        run(async {
            let (a0, a1) = channel().unwrap();
            let (b0, b1) = channel().unwrap();
            let sender = spawn(async move {
                sleep_until(deadline_in(10)).await.unwrap();
                send(b0, &7u32.to_ne_bytes(), Deadline::FOREVER)
                    .await
                    .unwrap();
            })
            .unwrap();

            let mut buf_a = [0u8; 4];
            let mut buf_b = [0u8; 4];
            let mut clauses = [
                SelectClause::recv(a1, &mut buf_a),
                SelectClause::recv(b1, &mut buf_b),
            ];
            let selected = select(&mut clauses, deadline_in(100)).await.unwrap();
            assert_eq!(selected.index, 1);
            assert_eq!(selected.result, Ok(()));
            assert_eq!(u32::from_ne_bytes(buf_b), 7);

            // A later send on the losing channel must not reach the
            // already-completed select; it parks as a fresh sender and
            // times out immediately here.
            assert_eq!(
                send(a0, &buf_a, Deadline::IMMEDIATE).await.unwrap_err(),
                Error::TimedOut
            );

            join(sender, Deadline::FOREVER).await.unwrap();
            close(sender).unwrap();
            for h in [a0, a1, b0, b1] {
                close(h).unwrap();
            }
        });
    }

    #[test]
    fn select_over_ready_send_equals_immediate_send() {
        let _trace = trace_init();
        run(async {
            let (h0, h1) = channel().unwrap();
            let receiver = spawn(async move {
                let mut buf = [0u8; 4];
                recv(h1, &mut buf, Deadline::FOREVER).await.unwrap();
                assert_eq!(u32::from_ne_bytes(buf), 9);
            })
            .unwrap();
            // let the receiver park
            crate::yield_now().await.unwrap();

            let payload = 9u32.to_ne_bytes();
            let mut clauses = [SelectClause::send(h0, &payload)];
            let selected = select(&mut clauses, Deadline::IMMEDIATE).await.unwrap();
            assert_eq!(selected.index, 0);
            assert_eq!(selected.result, Ok(()));

            join(receiver, Deadline::FOREVER).await.unwrap();
            close(receiver).unwrap();
            close(h0).unwrap();
            close(h1).unwrap();
        });
    }

    #[test]
    fn select_times_out() {
        let _trace = trace_init();
        run(async {
            let (h0, h1) = channel().unwrap();
            let mut buf = [0u8; 4];
            let mut clauses = [SelectClause::recv(h1, &mut buf)];
            let err = select(&mut clauses, deadline_in(20)).await.unwrap_err();
            assert_eq!(err, Error::TimedOut);
            // and the clause array is reusable afterwards
            let err = select(&mut clauses, Deadline::IMMEDIATE).await.unwrap_err();
            assert_eq!(err, Error::TimedOut);
            close(h0).unwrap();
            close(h1).unwrap();
        });
    }

    #[test]
    fn done_broadcasts_broken_pipe() {
        let _trace = trace_init();
        run(async {
            let (h0, h1) = channel().unwrap();
            let woken = Rc::new(StdCell::new(0u32));
            let mut parked = Vec::new();
            for _ in 0..2 {
                let woken = woken.clone();
                parked.push(
                    spawn(async move {
                        let mut buf = [0u8; 4];
                        let err = recv(h1, &mut buf, Deadline::FOREVER).await.unwrap_err();
                        assert_eq!(err, Error::BrokenPipe);
                        woken.set(woken.get() + 1);
                    })
                    .unwrap(),
                );
            }
            // let both receivers park
            crate::yield_now().await.unwrap();
            done(h0).unwrap();
            for h in parked {
                join(h, Deadline::FOREVER).await.unwrap();
                close(h).unwrap();
            }
            assert_eq!(woken.get(), 2);

            // both directions observing the done flag fail immediately
            assert_eq!(
                send(h0, &[0u8; 4], Deadline::FOREVER).await.unwrap_err(),
                Error::BrokenPipe
            );
            let mut buf = [0u8; 4];
            assert_eq!(
                recv(h1, &mut buf, Deadline::FOREVER).await.unwrap_err(),
                Error::BrokenPipe
            );
            // a second done on the same side is a programmer error
            assert_eq!(done(h0).unwrap_err(), Error::BrokenPipe);
            close(h0).unwrap();
            close(h1).unwrap();
        });
    }

    #[test]
    fn message_size_mismatch_fails_both_sides() {
        let _trace = trace_init();
        run(async {
            let (h0, h1) = channel().unwrap();
            let peer = spawn(async move {
                let err = send(h0, &[1u8; 4], Deadline::FOREVER).await.unwrap_err();
                assert_eq!(err, Error::MessageSize);
            })
            .unwrap();
            crate::yield_now().await.unwrap();

            let mut buf = [0u8; 8];
            let err = recv(h1, &mut buf, Deadline::FOREVER).await.unwrap_err();
            assert_eq!(err, Error::MessageSize);
            assert_eq!(buf, [0u8; 8], "no bytes may land on a size mismatch");

            // the channel stays usable
            let sender = spawn(async move {
                send(h0, &3u32.to_ne_bytes(), Deadline::FOREVER)
                    .await
                    .unwrap();
            })
            .unwrap();
            let mut buf = [0u8; 4];
            recv(h1, &mut buf, Deadline::FOREVER).await.unwrap();
            assert_eq!(u32::from_ne_bytes(buf), 3);

            for h in [peer, sender] {
                join(h, Deadline::FOREVER).await.unwrap();
                close(h).unwrap();
            }
            close(h0).unwrap();
            close(h1).unwrap();
        });
    }

    #[test]
    fn bidirectional_use_over_both_handles() {
        let _trace = trace_init();
        run(async {
            let (h0, h1) = channel().unwrap();
            let peer = spawn(async move {
                let mut buf = [0u8; 4];
                recv(h1, &mut buf, Deadline::FOREVER).await.unwrap();
                send(h1, &buf, Deadline::FOREVER).await.unwrap();
            })
            .unwrap();
            send(h0, &5u32.to_ne_bytes(), Deadline::FOREVER)
                .await
                .unwrap();
            let mut buf = [0u8; 4];
            recv(h0, &mut buf, Deadline::FOREVER).await.unwrap();
            assert_eq!(u32::from_ne_bytes(buf), 5);
            join(peer, Deadline::FOREVER).await.unwrap();
            close(peer).unwrap();
            close(h0).unwrap();
            close(h1).unwrap();
        });
    }

    #[test]
    fn closing_both_halves_wakes_parked_peers() {
        let _trace = trace_init();
        run(async {
            let (h0, h1) = channel().unwrap();
            let parked = spawn(async move {
                let mut buf = [0u8; 4];
                let err = recv(h1, &mut buf, Deadline::FOREVER).await.unwrap_err();
                assert_eq!(err, Error::BrokenPipe);
            })
            .unwrap();
            crate::yield_now().await.unwrap();
            close(h0).unwrap();
            close(h1).unwrap();
            join(parked, Deadline::FOREVER).await.unwrap();
            close(parked).unwrap();
        });
    }

    #[test]
    fn channel_from_preallocated_storage() {
        let _trace = trace_init();
        let storage = ChanStorage::new();
        run(async move {
            let (h0, h1) = channel_with(storage).unwrap();
            let peer = spawn(async move {
                send(h0, &[9u8], Deadline::FOREVER).await.unwrap();
            })
            .unwrap();
            let mut buf = [0u8];
            recv(h1, &mut buf, Deadline::FOREVER).await.unwrap();
            assert_eq!(buf, [9]);
            join(peer, Deadline::FOREVER).await.unwrap();
            close(peer).unwrap();
            close(h0).unwrap();
            close(h1).unwrap();
        });
    }

    #[test]
    fn cancelling_a_parked_sender_resumes_it() {
        let _trace = trace_init();
        run(async {
            let (h0, h1) = channel().unwrap();
            let sender = spawn(async move {
                let err = send(h0, &[0u8; 4], Deadline::FOREVER).await.unwrap_err();
                assert_eq!(err, Error::Cancelled);
                // cancellation is level-triggered: every further blocking
                // attempt keeps failing
                let err = send(h0, &[0u8; 4], Deadline::FOREVER).await.unwrap_err();
                assert_eq!(err, Error::Cancelled);
            })
            .unwrap();
            crate::yield_now().await.unwrap();
            cancel(sender, Error::Cancelled).unwrap();
            join(sender, Deadline::FOREVER).await.unwrap();
            close(sender).unwrap();
            // the cancelled clause was withdrawn: no sender is parked
            let mut buf = [0u8; 4];
            assert_eq!(
                recv(h1, &mut buf, Deadline::IMMEDIATE).await.unwrap_err(),
                Error::TimedOut
            );
            close(h0).unwrap();
            close(h1).unwrap();
        });
    }

    #[test]
    fn rendezvous_with_self_through_both_handles() {
        let _trace = trace_init();
        run(async {
            let (h0, h1) = channel().unwrap();
            let payload = 11u32.to_ne_bytes();
            let mut buf = [0u8; 4];
            let (sent, received) = futures::join!(
                send(h0, &payload, Deadline::FOREVER),
                recv(h1, &mut buf, Deadline::FOREVER),
            );
            sent.unwrap();
            received.unwrap();
            assert_eq!(buf, payload);
            close(h0).unwrap();
            close(h1).unwrap();
        });
    }
}
