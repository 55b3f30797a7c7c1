//! The user-facing coroutine handle.
//!
//! A [`Task`] is a [`crate::frame::FrameState`] (cancellation + tracing)
//! paired with a [`crate::promise::Future`] that resolves when the task's
//! body does. The actual polling happens on a type-erased "driver" future
//! registered with the [`crate::event_loop::EventLoop`]; the `Task` handle
//! itself never polls anything directly except when used as a `Future` via
//! [`Task::future`].

use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::{AsyncResult, Error};
use crate::event_loop::EventLoop;
use crate::frame::{self, FrameHandle, FrameState};
use crate::promise::{Future as AsyncFuture, Promise};

struct Driver<T> {
    inner: Pin<Box<dyn std::future::Future<Output = AsyncResult<T>>>>,
    frame: FrameHandle,
    promise: Promise<T, Error>,
}

impl<T: Clone + 'static> std::future::Future for Driver<T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // Safety: structural projection; `inner` is polled in place and
        // never moved, `frame`/`promise` are plain `Rc` handles.
        let this = unsafe { self.get_unchecked_mut() };

        let poll = frame::with_frame(this.frame.clone(), || this.inner.as_mut().poll(cx));

        match poll {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                FrameState::end(&this.frame);
                match result {
                    Ok(v) => this.promise.resolve(v),
                    Err(e) => this.promise.reject(e),
                }
                Poll::Ready(())
            }
        }
    }
}

/// A handle to a running (or finished) coroutine.
///
/// `Task<T>` is itself a [`std::future::Future`]: awaiting it waits for the
/// task to finish and yields its result, exactly like awaiting its
/// [`Task::future`] directly.
pub struct Task<T: Clone + 'static> {
    frame: FrameHandle,
    result: AsyncFuture<T, Error>,
}

impl<T: Clone + 'static> Clone for Task<T> {
    fn clone(&self) -> Self {
        Task {
            frame: self.frame.clone(),
            result: self.result.clone(),
        }
    }
}

impl<T: Clone + 'static> Task<T> {
    /// Cancels the task: walks its frame chain to the active leaf and
    /// invokes that leaf's cancel hook. The leaf decides the outcome -
    /// `Locked`, `CancellationNotSupported`, delegating into a nested
    /// `TaskGroup`, and so on.
    pub fn cancel(&self) -> AsyncResult<()> {
        frame::cancel_chain(&self.frame)
    }

    pub fn done(&self) -> bool {
        !self.result.is_pending()
    }

    /// The task's outcome. Only meaningful once [`Task::done`] is true;
    /// while pending this returns `None` rather than blocking.
    pub fn result(&self) -> Option<AsyncResult<T>> {
        self.result.try_result()
    }

    pub fn future(&self) -> AsyncFuture<T, Error> {
        self.result.clone()
    }

    /// A human-readable tree of this task's still-pending call sites,
    /// descending through nested instrumented awaits and, at a
    /// `TaskGroup`, into every unfinished child.
    pub fn trace(&self) -> String {
        frame::trace(&self.frame)
    }

    pub(crate) fn frame_handle(&self) -> FrameHandle {
        self.frame.clone()
    }
}

impl<T: Clone + 'static> std::future::Future for Task<T> {
    type Output = AsyncResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut fut = self.result.clone();
        Pin::new(&mut fut).poll(cx)
    }
}

/// Schedules `body` to run as a new task on the current event loop.
///
/// The task does not start running synchronously; it is scheduled for the
/// next drain of the loop's ready queue, same as a promise continuation.
#[track_caller]
pub fn spawn<T>(body: impl std::future::Future<Output = AsyncResult<T>> + 'static) -> Task<T>
where
    T: Clone + 'static,
{
    let location = Location::caller();
    let frame = FrameState::new(location);
    let promise: Promise<T, Error> = Promise::new();
    let result = promise.future();

    let driver = Driver {
        inner: Box::pin(body),
        frame: frame.clone(),
        promise,
    };

    EventLoop::current().register_task(Box::pin(driver));

    Task { frame, result }
}

/// Type-erased view of a [`Task`] that only cares about completion and
/// cancellation, used by [`crate::group::TaskGroup`] to hold children of
/// differing result types.
pub(crate) trait ErasedTask {
    fn done(&self) -> bool;
    fn cancel(&self) -> AsyncResult<()>;
    fn frame_handle(&self) -> FrameHandle;
    fn poll_done(&self, cx: &mut Context<'_>) -> Poll<AsyncResult<()>>;
}

impl<T: Clone + 'static> ErasedTask for Task<T> {
    fn done(&self) -> bool {
        Task::done(self)
    }

    fn cancel(&self) -> AsyncResult<()> {
        Task::cancel(self)
    }

    fn frame_handle(&self) -> FrameHandle {
        Task::frame_handle(self)
    }

    fn poll_done(&self, cx: &mut Context<'_>) -> Poll<AsyncResult<()>> {
        let mut fut = self.result.clone();
        match Pin::new(&mut fut).poll(cx) {
            Poll::Ready(Ok(_)) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: Clone + 'static> Task<T> {
    pub(crate) fn erase(self) -> Box<dyn ErasedTask> {
        Box::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::run;
    use crate::time::sleep;
    use std::time::Duration;

    #[test]
    fn cancel_a_sleep_resolves_cancelled() {
        let result = run(async {
            let t = spawn(async {
                sleep(Duration::from_millis(50)).await?;
                Ok::<_, Error>(())
            });
            crate::time::yield_now().await;
            t.cancel().unwrap();
            let outcome = t.await;
            assert!(matches!(outcome, Err(Error::Cancelled)));
            Ok::<_, Error>(())
        });
        result.unwrap();
    }

    #[test]
    fn trace_reports_pending_location() {
        let result = run(async {
            let t = spawn(async {
                sleep(Duration::from_millis(50)).await?;
                Ok::<_, Error>(())
            });
            crate::time::yield_now().await;
            assert!(t.trace().contains("task.rs") || t.trace().contains("time.rs"));
            t.cancel().unwrap();
            let _ = t.await;
            Ok::<_, Error>(())
        });
        result.unwrap();
    }
}
