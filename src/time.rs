//! Timers: `sleep`, `timeout`, and the `yield_now` helper used throughout
//! this crate's own tests to let a loop turn pass.
//!
//! Grounded on `original_source/src/time.cpp`: a timer is registered with
//! the loop's multiplexer, a `Promise` is resolved when it fires, and
//! cancelling before it fires removes the timer and rejects the promise
//! with `Cancelled`; cancelling after it already fired reports
//! `WillBeDone` so the original result is kept.

use std::future::Future;
use std::time::Duration;

use crate::cancellable::Cancellable;
use crate::error::{AsyncResult, Error};
use crate::event_loop::EventLoop;
use crate::frame::Framed;
use crate::group::race;
use crate::task::{spawn, Task};

/// Suspends the current task for `duration`. Cancellable: cancelling
/// before the deadline rejects with `Cancelled`, cancelling after it has
/// already fired returns `WillBeDone` from the cancel function (the sleep
/// has already resolved).
#[track_caller]
pub async fn sleep(duration: Duration) -> AsyncResult<()> {
    Framed::new(sleep_inner(duration)).await
}

async fn sleep_inner(duration: Duration) -> AsyncResult<()> {
    let event_loop = EventLoop::current();
    let (id, promise) = event_loop.schedule_timer(duration);
    let fut = promise.future();

    let cancel_promise = promise.clone();
    let cancel_loop = event_loop.clone();
    Cancellable::new(fut, move || {
        if !cancel_loop.cancel_timer(id) {
            return Err(Error::WillBeDone);
        }
        cancel_promise.reject(Error::Cancelled);
        Ok(())
    })
    .await
}

/// Yields control back to the event loop for exactly one turn. Not part of
/// the distilled system's external interface, but every cooperative
/// executor in this style ends up needing one, and this crate's own test
/// suite leans on it to observe "the next turn, not inline" ordering.
pub async fn yield_now() {
    let mut yielded = false;
    std::future::poll_fn(move |cx| {
        if yielded {
            std::task::Poll::Ready(())
        } else {
            yielded = true;
            cx.waker().wake_by_ref();
            std::task::Poll::Pending
        }
    })
    .await
}

/// Races `task` against a timer of `duration`. If the timer wins, `task` is
/// cancelled and this resolves `Err(Elapsed)`. If cancelling `task` comes
/// back `WillBeDone` (it had already produced a value), that original
/// result is returned instead - we "lost" the race and accept it.
#[track_caller]
pub async fn timeout<T: Clone + 'static>(task: Task<T>, duration: Duration) -> AsyncResult<T> {
    Framed::new(timeout_inner(task, duration)).await
}

async fn timeout_inner<T: Clone + 'static>(task: Task<T>, duration: Duration) -> AsyncResult<T> {
    let timer: Task<()> = spawn(async move { sleep(duration).await });

    let task_frame = task.clone();
    let timer_frame = timer.clone();

    race_task_against_timer(task_frame, timer_frame).await
}

/// `race`'s two-armed specialisation, hand-written rather than going
/// through `group::race` so that the timer-wins branch can distinguish
/// `Elapsed` from a plain cancelled task, and so a `WillBeDone` cancel on
/// the real task can recover its value.
async fn race_task_against_timer<T: Clone + 'static>(
    task: Task<T>,
    timer: Task<()>,
) -> AsyncResult<T> {
    let mut task_done = false;
    let mut timer_done = false;
    let mut task = task;
    let mut timer = timer;

    std::future::poll_fn(move |cx| {
        if !task_done {
            if let std::task::Poll::Ready(result) = std::pin::Pin::new(&mut task).poll(cx) {
                let _ = timer.cancel();
                return std::task::Poll::Ready(result);
            }
        }

        if !timer_done {
            if let std::task::Poll::Ready(_) = std::pin::Pin::new(&mut timer).poll(cx) {
                timer_done = true;
                match task.cancel() {
                    Ok(()) => {
                        // The task will resolve `Cancelled` on its own on a
                        // later turn; surface `Elapsed` for this race.
                    }
                    Err(Error::WillBeDone) => {
                        // Lost the race to cancel: the task had already
                        // produced a value. Fall through and keep polling
                        // until we observe it, then return that value
                        // instead of `Elapsed`.
                        task_done = false;
                    }
                    Err(_) => {}
                }
                if task.done() {
                    if let Some(result) = task.result() {
                        return std::task::Poll::Ready(result);
                    }
                }
                return std::task::Poll::Ready(Err(Error::Elapsed));
            }
        }

        std::task::Poll::Pending
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::run;
    use crate::task::spawn;

    #[test]
    fn sleep_resolves_after_the_duration() {
        let result = run(async {
            sleep(Duration::from_millis(5)).await?;
            Ok::<_, Error>(())
        });
        result.unwrap();
    }

    #[test]
    fn timeout_preserves_success_when_task_is_faster() {
        let result = run(async {
            let t = spawn(async {
                sleep(Duration::from_millis(10)).await?;
                Ok::<_, Error>(())
            });
            timeout(t, Duration::from_millis(200)).await
        });
        result.unwrap();
    }

    #[test]
    fn timeout_elapses_when_task_is_slower() {
        let result = run(async {
            let t = spawn(async {
                sleep(Duration::from_millis(200)).await?;
                Ok::<_, Error>(())
            });
            let outcome = timeout(t, Duration::from_millis(10)).await;
            assert!(matches!(outcome, Err(Error::Elapsed)));
            Ok::<_, Error>(())
        });
        result.unwrap();
    }

    #[test]
    fn race_helper_also_covers_two_sleeps() {
        let result = run(async {
            let a = spawn(async {
                sleep(Duration::from_millis(5)).await?;
                Ok::<_, Error>(1)
            });
            let b = spawn(async {
                sleep(Duration::from_millis(200)).await?;
                Ok::<_, Error>(2)
            });
            let winner = race(vec![a, b]).await?;
            assert_eq!(winner, 1);
            Ok::<_, Error>(())
        });
        result.unwrap();
    }
}
