// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Error;
use crate::runtime;
use crate::time::{self, Deadline, TimerClause};
use crate::wait::WaitCore;
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use pin_project::pin_project;

/// Waits until `deadline`.
///
/// [`Deadline::FOREVER`] sleeps until the task is cancelled;
/// [`Deadline::IMMEDIATE`] completes on the next scheduler pass.
pub fn sleep_until(deadline: Deadline) -> Sleep {
    Sleep {
        state: State::Unarmed,
        deadline,
        wait: WaitCore::new(),
        entry: TimerClause::new(deadline),
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Unarmed,
    Armed,
}

/// Future returned by [`sleep_until`].
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Sleep {
    state: State,
    deadline: Deadline,
    #[pin]
    wait: WaitCore,
    #[pin]
    entry: TimerClause,
}

impl Future for Sleep {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if *this.state == State::Unarmed {
            let ctx = runtime::current();
            if let Err(err) = ctx.canblock() {
                return Poll::Ready(Err(err));
            }
            if !this.deadline.is_forever() {
                time::arm_timer(&ctx, this.entry.as_ref(), this.wait.as_ref(), 0);
            }
            *this.state = State::Armed;
        }
        match this.wait.as_ref().poll_fired(cx) {
            Poll::Ready(fired) if fired.id == 0 => Poll::Ready(Ok(())),
            Poll::Ready(fired) => Poll::Ready(Err(fired.cancellation())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for Sleep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sleep")
            .field("deadline", &self.deadline)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{run, trace_init};
    use crate::time::{deadline_in, now};
    use crate::{cancel, close, join, spawn};

    #[test]
    fn sleeps_approximately_the_requested_time() {
        let _trace = trace_init();
        run(async {
            let begin = now();
            sleep_until(deadline_in(50)).await.unwrap();
            let elapsed = now() - begin;
            assert!((50..200).contains(&elapsed), "slept {elapsed}ms");
        });
    }

    #[test]
    fn immediate_deadline_completes_promptly() {
        let _trace = trace_init();
        run(async {
            sleep_until(deadline_in(0)).await.unwrap();
        });
    }

    #[test]
    fn forever_sleep_ends_only_by_cancellation() {
        let _trace = trace_init();
        run(async {
            let sleeper = spawn(async {
                let err = sleep_until(Deadline::FOREVER).await.unwrap_err();
                assert_eq!(err, Error::Cancelled);
            })
            .unwrap();
            sleep_until(deadline_in(10)).await.unwrap();
            cancel(sleeper, Error::Cancelled).unwrap();
            join(sleeper, Deadline::FOREVER).await.unwrap();
            close(sleeper).unwrap();
        });
    }

    #[test]
    fn simultaneous_sleeps_wake_in_arming_order() {
        let _trace = trace_init();
        run(async {
            let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
            let deadline = deadline_in(20);
            let mut tasks = Vec::new();
            for i in 0..3u32 {
                let order = order.clone();
                tasks.push(
                    spawn(async move {
                        sleep_until(deadline).await.unwrap();
                        order.borrow_mut().push(i);
                    })
                    .unwrap(),
                );
            }
            for h in tasks {
                join(h, Deadline::FOREVER).await.unwrap();
                close(h).unwrap();
            }
            assert_eq!(*order.borrow(), vec![0, 1, 2]);
        });
    }
}
