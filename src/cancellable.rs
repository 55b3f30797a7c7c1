//! The adapter that turns an arbitrary awaitable into a cancellation-aware
//! await point.
//!
//! Grounded on every `co_await zero::async::coroutine::Cancellable{...}` use
//! in `original_source` (e.g. `src/time.cpp`, `src/sync/event.cpp`,
//! `src/sync/condition.cpp`): pair a future with a cancel closure, install
//! the closure on the current frame, and clear it again once the future
//! settles - whether that's because it completed normally or because the
//! cancel closure itself caused it to reject with `Cancelled`.

use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::AsyncResult;
use crate::frame;

/// Pairs `future` with `cancel_fn`, a closure invoked at most once by
/// [`crate::Task::cancel`] while this is the active leaf of the task's
/// frame chain.
///
/// `cancel_fn`'s contract:
/// - Returns `Err(WillBeDone)` if the underlying operation already
///   completed - cancellation came too late.
/// - Returns `Ok(())` if cancellation was initiated; `future` must still be
///   awaited and will resolve `Err(Cancelled)`.
/// - Any other error means cancellation itself failed and is surfaced to
///   the caller of `Task::cancel`.
pub struct Cancellable<F, C> {
    future: F,
    cancel_fn: Option<C>,
}

impl<F, C> Cancellable<F, C>
where
    F: std::future::Future,
    C: FnOnce() -> AsyncResult<()>,
{
    pub fn new(future: F, cancel_fn: C) -> Self {
        Cancellable {
            future,
            cancel_fn: Some(cancel_fn),
        }
    }
}

impl<F, C> std::future::Future for Cancellable<F, C>
where
    F: std::future::Future,
    C: FnOnce() -> AsyncResult<()> + 'static,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: structural projection; `future` is polled in place and
        // never moved, `cancel_fn` is only ever taken, never pinned.
        let this = unsafe { self.get_unchecked_mut() };

        if let Some(cancel_fn) = this.cancel_fn.take() {
            let frame = frame::current_frame().expect(
                "Cancellable awaited outside of a running task or instrumented primitive",
            );
            debug_assert!(
                frame.borrow().cancel.is_none(),
                "this frame already has a cancel hook installed"
            );
            frame.borrow_mut().cancel = Some(Box::new(cancel_fn));
        }

        let future = unsafe { Pin::new_unchecked(&mut this.future) };
        let poll = future.poll(cx);

        if poll.is_ready() {
            if let Some(frame) = frame::current_frame() {
                frame.borrow_mut().cancel = None;
            }
        }

        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::event_loop::run;
    use crate::promise::Promise;
    use crate::task::spawn;

    #[test]
    fn cancel_fn_runs_at_most_once() {
        let result = run(async {
            let promise: Promise<(), Error> = Promise::new();
            let fut = promise.future();
            let calls = std::rc::Rc::new(std::cell::Cell::new(0));
            let c = calls.clone();
            let p = promise.clone();

            let t = spawn(async move {
                Cancellable::new(fut, move || {
                    c.set(c.get() + 1);
                    p.reject(Error::Cancelled);
                    Ok(())
                })
                .await
            });

            crate::time::yield_now().await;
            t.cancel().unwrap();
            assert!(matches!(t.cancel(), Err(Error::CancellationNotSupported)));
            let _ = t.await;
            assert_eq!(calls.get(), 1);
            Ok::<_, Error>(())
        });
        result.unwrap();
    }
}
