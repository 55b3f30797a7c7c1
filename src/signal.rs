//! Waiting for a process signal.
//!
//! Grounded on `original_source/src/signal.cpp`'s `Signal::on`: start a
//! one-shot watch for `sig`, resolve a promise from the delivery callback,
//! and race that against cancellation exactly like every other
//! `Cancellable`-wrapped primitive in this crate. Delivery is one-shot per
//! call - awaiting `signal_on` again re-arms it, mirroring
//! `uv_signal_start_oneshot`.

use crate::cancellable::Cancellable;
use crate::error::{AsyncResult, Error};
use crate::event_loop::EventLoop;
use crate::frame::Framed;

/// Resolves with `signal` the next time the process receives it.
///
/// Only one delivery is observed per call; to keep watching, call this
/// again after it resolves. On non-Unix targets this never resolves and
/// rejects `CancellationNotSupported` on cancellation, since there is no
/// signal delivery to wait for.
#[track_caller]
pub async fn signal_on(signal: i32) -> AsyncResult<i32> {
    Framed::new(signal_on_inner(signal)).await
}

async fn signal_on_inner(signal: i32) -> AsyncResult<i32> {
    let event_loop = EventLoop::current();
    let promise = event_loop.register_signal(signal);
    let fut = promise.future();

    let cancel_event_loop = event_loop.clone();
    let cancel_promise = promise.clone();
    Cancellable::new(fut, move || {
        if !cancel_promise.is_pending() {
            return Err(Error::WillBeDone);
        }
        // Remove ourselves from the loop's waiter list first: otherwise a
        // later genuine delivery would try to resolve this already-
        // rejected promise and trip the double-settle guard.
        cancel_event_loop.cancel_signal_wait(signal, &cancel_promise);
        cancel_promise.reject(Error::Cancelled);
        Ok(())
    })
    .await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::event_loop::run;
    use std::time::Duration;

    #[test]
    fn cancelling_before_delivery_rejects_cancelled() {
        let result = run(async {
            let t = crate::task::spawn(async { signal_on(libc_sigusr1()).await });
            crate::time::yield_now().await;
            t.cancel().unwrap();
            let outcome = t.await;
            assert!(matches!(outcome, Err(Error::Cancelled)));
            Ok::<_, Error>(())
        });
        result.unwrap();
    }

    #[test]
    fn races_against_a_timeout_when_never_delivered() {
        let result = run(async {
            let t = crate::task::spawn(async { signal_on(libc_sigusr1()).await });
            let outcome = crate::time::timeout(t, Duration::from_millis(20)).await;
            assert!(matches!(outcome, Err(Error::Elapsed)));
            Ok::<_, Error>(())
        });
        result.unwrap();
    }

    #[test]
    fn cancelling_then_a_later_delivery_does_not_double_settle() {
        let result = run(async {
            let t = crate::task::spawn(async { signal_on(libc_sigusr1()).await });
            crate::time::yield_now().await;
            t.cancel().unwrap();
            let outcome = t.await;
            assert!(matches!(outcome, Err(Error::Cancelled)));

            // The cancelled promise has been removed from the loop's
            // waiter list, so a signal delivered afterwards must not try
            // to resolve it again.
            unsafe {
                libc_raise(libc_sigusr1());
            }
            crate::time::sleep(Duration::from_millis(20)).await?;
            Ok::<_, Error>(())
        });
        result.unwrap();
    }

    // Avoids pulling in `libc` just for one constant used by tests.
    fn libc_sigusr1() -> i32 {
        10
    }

    extern "C" {
        #[link_name = "raise"]
        fn libc_raise(sig: i32) -> i32;
    }
}
