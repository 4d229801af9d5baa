// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The scheduler context.
//!
//! One [`Runtime`] is one single-threaded cooperative scheduler: a ready
//! FIFO of tasks, a timer heap, a pollset, and a handle table. Nothing is
//! shared between contexts; crossing a context boundary means copying data
//! out through an OS primitive. [`Runtime::block_on`] installs the context
//! in a scoped thread-local so the free functions of this crate (`spawn`,
//! `send`, `sleep_until`, ...) reach the scheduler of the calling thread.

use crate::error::Error;
use crate::handle::{Handle, HandleTable, Object};
use crate::poll::{FdEvent, FdTable, Pollset};
use crate::task::{RunState, Task, task_waker};
use crate::time::{Clock, TimerHeap};
use crate::wait;
use core::cell::{Cell, RefCell};
use core::fmt;
use core::pin::pin;
use core::task::{Context, Poll};
use core::time::Duration;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

std::thread_local! {
    /// Stack of entered contexts; the innermost one serves the free
    /// functions.
    static CURRENT: RefCell<Vec<Rc<Core>>> = const { RefCell::new(Vec::new()) };
}

/// State of one scheduler context.
pub(crate) struct Core {
    pub(crate) handles: RefCell<HandleTable>,
    pub(crate) ready: RefCell<VecDeque<Rc<Task>>>,
    pub(crate) timers: RefCell<TimerHeap>,
    pub(crate) fds: RefCell<FdTable>,
    pub(crate) pollset: RefCell<Box<dyn Pollset>>,
    /// Reused event buffer for pollset drainage.
    pub(crate) events: RefCell<Vec<FdEvent>>,
    pub(crate) clock: Clock,
    /// The task being polled right now.
    pub(crate) current: RefCell<Option<Rc<Task>>>,
    /// Set on close paths and during teardown; every blocking attempt in
    /// the context fails immediately while it holds.
    pub(crate) no_block: Cell<bool>,
    next_task_id: Cell<u64>,
}

/// A borrowed scheduler context.
#[derive(Clone)]
pub(crate) struct Ctx {
    pub(crate) core: Rc<Core>,
}

/// The innermost entered context.
///
/// # Panics
///
/// Panics when no context has been entered on this thread.
pub(crate) fn current() -> Ctx {
    try_current().expect("no runtime context on this thread; enter one via Runtime::block_on")
}

pub(crate) fn try_current() -> Option<Ctx> {
    CURRENT.with(|stack| {
        let stack = stack.borrow();
        stack.last().map(|core| Ctx { core: core.clone() })
    })
}

/// Cancellation pending against the currently-polled task, or the
/// context-wide no-block mode. Blocking primitives consult this before
/// and during every suspension.
pub(crate) fn pending_cancellation() -> Option<Error> {
    let ctx = current();
    let task_err = ctx
        .core
        .current
        .borrow()
        .as_ref()
        .and_then(|task| task.cancelled());
    if ctx.core.no_block.get() {
        return Some(task_err.unwrap_or(Error::Cancelled));
    }
    task_err
}

struct Enter;

fn enter(core: Rc<Core>) -> Enter {
    CURRENT.with(|stack| stack.borrow_mut().push(core));
    Enter
}

impl Drop for Enter {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

// === impl Ctx ===

impl Ctx {
    /// Fails with the pending cancellation code if the current task may
    /// not block. Checked on entry to every blocking primitive.
    pub(crate) fn canblock(&self) -> Result<(), Error> {
        let task_err = self
            .core
            .current
            .borrow()
            .as_ref()
            .and_then(|task| task.cancelled());
        if self.core.no_block.get() {
            return Err(task_err.unwrap_or(Error::Cancelled));
        }
        match task_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn register_object(&self, obj: Rc<dyn Object>) -> Result<Handle, Error> {
        self.canblock()?;
        Ok(self.core.handles.borrow_mut().alloc(obj))
    }

    pub(crate) fn query<T: Object>(&self, h: Handle) -> Result<Rc<T>, Error> {
        self.core.handles.borrow_mut().query(h)
    }

    /// Closes `h`: runs the object's teardown in no-block mode, then
    /// recycles the slot.
    pub(crate) fn close(&self, h: Handle) -> Result<(), Error> {
        let obj = self.core.handles.borrow().object(h)?;
        tracing::trace!(handle = %h, "closing handle");
        let prev = self.core.no_block.replace(true);
        obj.close(self);
        self.core.no_block.set(prev);
        self.core.handles.borrow_mut().release(h);
        Ok(())
    }

    /// Re-registers the object behind `h` under a fresh handle and retires
    /// `h` without tearing the object down.
    pub(crate) fn own(&self, h: Handle) -> Result<Handle, Error> {
        let obj = self.core.handles.borrow().object(h)?;
        let fresh = self.core.handles.borrow_mut().alloc(obj);
        self.core.handles.borrow_mut().release(h);
        Ok(fresh)
    }

    pub(crate) fn spawn<F>(&self, future: F) -> Result<Handle, Error>
    where
        F: Future<Output = ()> + 'static,
    {
        self.canblock()?;
        let id = self.core.next_task_id.get();
        self.core.next_task_id.set(id + 1);
        let task = Rc::new(Task::new(id, Box::pin(future), Rc::downgrade(&self.core)));
        let h = self.core.handles.borrow_mut().alloc(task.clone());
        task.schedule();
        tracing::trace!(task = id, handle = %h, "task spawned");
        Ok(h)
    }

    /// Polls `task` once, with `current` pointing at it for the duration.
    pub(crate) fn poll_task(&self, task: &Rc<Task>) {
        let Some(mut future) = task.take_future() else {
            return;
        };
        task.set_state(RunState::Running);
        let prev = self.core.current.replace(Some(task.clone()));
        let waker = task_waker(task);
        let mut cx = Context::from_waker(&waker);
        let poll = future.as_mut().poll(&mut cx);
        self.core.current.replace(prev);
        match poll {
            Poll::Ready(()) => task.finish(),
            Poll::Pending => {
                task.put_future(future);
                match task.run_state() {
                    RunState::Notified => {
                        task.set_state(RunState::Idle);
                        task.schedule();
                    }
                    RunState::Running => task.set_state(RunState::Idle),
                    _ => {}
                }
            }
        }
    }

    /// Runs `task` to completion on the calling stack. Used by close paths
    /// only; with cancellation delivered, every blocking attempt inside
    /// the task fails immediately.
    pub(crate) fn drive(&self, task: &Rc<Task>) {
        if let Some(cur) = &*self.core.current.borrow() {
            assert!(
                !Rc::ptr_eq(cur, task),
                "a task may not close its own handle"
            );
        }
        while !task.is_finished() {
            self.poll_task(task);
        }
    }

    /// Triggers every timer due by now. Returns the number fired.
    pub(crate) fn fire_timers(&self) -> usize {
        let now = self.core.clock.now();
        let mut fired = 0;
        loop {
            let due = self.core.timers.borrow_mut().pop_due(now);
            let Some(entry) = due else { break };
            fired += 1;
            // Safety: entries in the heap are pinned and live; `pop_due`
            // already unlinked this one.
            unsafe { wait::trigger(entry.cast(), None) };
        }
        if fired > 0 {
            tracing::trace!(fired, "timers fired");
        }
        fired
    }
}

// === impl Runtime ===

/// A single-threaded cooperative scheduler context.
///
/// Construct one per thread, run work with [`block_on`][Runtime::block_on],
/// drop it to tear everything down. Contexts on different threads share
/// nothing.
pub struct Runtime {
    core: Rc<Core>,
}

impl Runtime {
    /// Creates a runtime with the default [`MioPollset`] backend.
    ///
    /// # Errors
    ///
    /// Propagates OS errors from pollset construction.
    ///
    /// [`MioPollset`]: crate::MioPollset
    #[cfg(unix)]
    pub fn new() -> io::Result<Self> {
        Ok(Self::with_pollset(Box::new(crate::poll::MioPollset::new()?)))
    }

    /// Creates a runtime over a caller-supplied pollset backend.
    #[must_use]
    pub fn with_pollset(pollset: Box<dyn Pollset>) -> Self {
        Self {
            core: Rc::new(Core {
                handles: RefCell::new(HandleTable::new()),
                ready: RefCell::new(VecDeque::new()),
                timers: RefCell::new(TimerHeap::new()),
                fds: RefCell::new(FdTable::new()),
                pollset: RefCell::new(pollset),
                events: RefCell::new(Vec::new()),
                clock: Clock::new(),
                current: RefCell::new(None),
                no_block: Cell::new(false),
                next_task_id: Cell::new(1),
            }),
        }
    }

    /// Current time on this context's monotonic millisecond scale.
    #[must_use]
    pub fn now(&self) -> i64 {
        self.core.clock.now()
    }

    /// Spawns a task without entering the scheduler loop; it runs once
    /// [`block_on`][Runtime::block_on] does.
    ///
    /// # Errors
    ///
    /// See [`spawn`][crate::spawn].
    pub fn spawn<F>(&self, future: F) -> Result<Handle, Error>
    where
        F: Future<Output = ()> + 'static,
    {
        let _guard = enter(self.core.clone());
        Ctx {
            core: self.core.clone(),
        }
        .spawn(future)
    }

    /// Runs the scheduler until `future` completes.
    ///
    /// The root future takes part in scheduling as an ordinary task, with
    /// the same FIFO fairness as everything it spawns. Tasks still alive
    /// when it completes stay parked until their handles are closed or the
    /// runtime is dropped.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let _guard = enter(self.core.clone());
        let _span = tracing::debug_span!("scheduler").entered();
        let ctx = Ctx {
            core: self.core.clone(),
        };
        let root = Rc::new(Task::new_root(Rc::downgrade(&self.core)));
        let waker = task_waker(&root);
        let mut future = pin!(future);
        root.schedule();
        loop {
            // One tick: run the tasks that are ready now, not the ones
            // they wake.
            let mut progress = false;
            let queued = self.core.ready.borrow().len();
            for _ in 0..queued {
                let task = self.core.ready.borrow_mut().pop_front();
                let Some(task) = task else { break };
                if task.run_state() != RunState::Queued {
                    continue;
                }
                progress = true;
                if !task.is_root() {
                    ctx.poll_task(&task);
                    continue;
                }
                // The root future lives on this stack; poll it in place.
                task.set_state(RunState::Running);
                let prev = self.core.current.replace(Some(root.clone()));
                let poll = future.as_mut().poll(&mut Context::from_waker(&waker));
                self.core.current.replace(prev);
                match poll {
                    Poll::Ready(output) => return output,
                    Poll::Pending => match task.run_state() {
                        RunState::Notified => {
                            task.set_state(RunState::Idle);
                            task.schedule();
                        }
                        RunState::Running => task.set_state(RunState::Idle),
                        _ => {}
                    },
                }
            }

            if progress {
                continue;
            }

            // Out of work: block on the pollset until the next timer
            // deadline, or indefinitely if there is none. Ready fds are
            // delivered before expired timers, so an fd racing a
            // simultaneous deadline wins.
            let timeout = self.core.timers.borrow().next_deadline().map(|deadline| {
                let now = self.core.clock.now();
                Duration::from_millis(u64::try_from((deadline - now).max(0)).unwrap_or(0))
            });
            tracing::trace!(?timeout, "parking on the pollset");
            ctx.poll_events(timeout);
            ctx.fire_timers();
        }
    }
}

impl Drop for Runtime {
    /// Tears the context down: with blocking forbidden, cancels every live
    /// task and closes every live handle.
    fn drop(&mut self) {
        let _guard = enter(self.core.clone());
        let ctx = Ctx {
            core: self.core.clone(),
        };
        self.core.no_block.set(true);
        for h in self.core.handles.borrow().live_handles() {
            if let Ok(task) = ctx.query::<Task>(h) {
                task.cancel_with(Error::Cancelled);
            }
        }
        for h in self.core.handles.borrow().live_handles() {
            let _ = ctx.close(h);
        }
        self.core.ready.borrow_mut().clear();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("handles", &self.core.handles.borrow().live())
            .field("ready", &self.core.ready.borrow().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{run, trace_init};
    use crate::time::{Deadline, deadline_in};
    use crate::{bundle, bundle_spawn, cancel, close, join, own, sleep_until, spawn, yield_now};
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn block_on_returns_the_root_value() {
        let _trace = trace_init();
        assert_eq!(run(async { 2 + 2 }), 4);
    }

    #[test]
    fn spawned_task_runs_and_joins() {
        let _trace = trace_init();
        run(async {
            let ran = Rc::new(Cell::new(false));
            let flag = ran.clone();
            let h = spawn(async move {
                flag.set(true);
            })
            .unwrap();
            join(h, Deadline::FOREVER).await.unwrap();
            assert!(ran.get());
            close(h).unwrap();
        });
    }

    #[test]
    fn ready_queue_is_fifo_and_tasks_run_to_suspension() {
        let _trace = trace_init();
        run(async {
            let log = Rc::new(StdRefCell::new(Vec::new()));
            let mut tasks = Vec::new();
            for id in 0..3u32 {
                let log = log.clone();
                tasks.push(
                    spawn(async move {
                        log.borrow_mut().push(id);
                        yield_now().await.unwrap();
                        log.borrow_mut().push(id);
                    })
                    .unwrap(),
                );
            }
            for h in tasks {
                join(h, Deadline::FOREVER).await.unwrap();
                close(h).unwrap();
            }
            // spawn order on the first leg, re-queue order on the second;
            // nothing runs between a task's two suspension points
            assert_eq!(*log.borrow(), vec![0, 1, 2, 0, 1, 2]);
        });
    }

    #[test]
    fn join_times_out_on_a_running_task() {
        let _trace = trace_init();
        run(async {
            let h = spawn(async {
                sleep_until(Deadline::FOREVER).await.unwrap_err();
            })
            .unwrap();
            let err = join(h, deadline_in(20)).await.unwrap_err();
            assert_eq!(err, Error::TimedOut);
            close(h).unwrap();
        });
    }

    #[test]
    fn cancel_before_first_blocking_call() {
        let _trace = trace_init();
        run(async {
            let h = spawn(async {
                let err = sleep_until(Deadline::FOREVER).await.unwrap_err();
                assert_eq!(err, Error::Cancelled);
            })
            .unwrap();
            // the task has not run yet; cancellation is level-triggered
            cancel(h, Error::Cancelled).unwrap();
            join(h, Deadline::FOREVER).await.unwrap();
            close(h).unwrap();
        });
    }

    #[test]
    fn closing_an_unfinished_task_drives_it_out() {
        let _trace = trace_init();
        run(async {
            let h = spawn(async {
                let err = sleep_until(Deadline::FOREVER).await.unwrap_err();
                assert_eq!(err, Error::Cancelled);
            })
            .unwrap();
            yield_now().await.unwrap();
            close(h).unwrap();
            assert_eq!(join(h, Deadline::FOREVER).await.unwrap_err(), Error::BadHandle);
        });
    }

    #[test]
    fn bundle_close_cancels_and_frees_all_children() {
        let _trace = trace_init();
        run(async {
            let ctx = current();
            let before = ctx.core.handles.borrow().live();
            let b = bundle().unwrap();
            for _ in 0..3 {
                bundle_spawn(b, async {
                    let err = sleep_until(Deadline::FOREVER).await.unwrap_err();
                    assert_eq!(err, Error::Cancelled);
                })
                .unwrap();
            }
            yield_now().await.unwrap();
            close(b).unwrap();
            // no child task handle survives the bundle
            assert_eq!(ctx.core.handles.borrow().live(), before);
        });
    }

    #[test]
    fn own_transfers_the_handle_without_touching_the_object() {
        let _trace = trace_init();
        run(async {
            let ctx = current();
            let before = ctx.core.handles.borrow().live();
            let h = spawn(async {}).unwrap();
            let fresh = own(h).unwrap();
            assert_ne!(h, fresh);
            assert_eq!(join(h, Deadline::FOREVER).await.unwrap_err(), Error::BadHandle);
            join(fresh, Deadline::FOREVER).await.unwrap();
            close(fresh).unwrap();
            // owning then closing the fresh handle balances the books the
            // same as closing the original directly
            assert_eq!(ctx.core.handles.borrow().live(), before);
        });
    }

    #[test]
    fn dropping_the_runtime_tears_down_parked_tasks() {
        let _trace = trace_init();
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            spawn(async {
                let _ = sleep_until(Deadline::FOREVER).await;
            })
            .unwrap();
            yield_now().await.unwrap();
        });
        // the parked task is cancelled, driven to completion, and freed
        drop(rt);
    }

    #[test]
    fn spawning_before_block_on_queues_the_task() {
        let _trace = trace_init();
        let rt = Runtime::new().unwrap();
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let h = rt
            .spawn(async move {
                flag.set(true);
            })
            .unwrap();
        rt.block_on(async move {
            join(h, Deadline::FOREVER).await.unwrap();
            close(h).unwrap();
        });
        assert!(ran.get());
    }
}
