//! A manual-reset latch.
//!
//! Grounded on `original_source/src/sync/event.cpp`: `wait()` resolves
//! immediately once `set()` has been called, until a subsequent `reset()`.
//! Already-completed waits are unaffected by a later `reset()`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::cancellable::Cancellable;
use crate::error::{AsyncResult, Error};
use crate::frame::Framed;
use crate::promise::Promise;

struct Inner {
    set: bool,
    pending: VecDeque<Promise<(), Error>>,
}

#[derive(Clone)]
pub struct Event {
    inner: Rc<RefCell<Inner>>,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    pub fn new() -> Self {
        Event {
            inner: Rc::new(RefCell::new(Inner {
                set: false,
                pending: VecDeque::new(),
            })),
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.borrow().set
    }

    /// Resolves every current waiter and latches the flag. A no-op if
    /// already set.
    pub fn set(&self) {
        let mut state = self.inner.borrow_mut();
        if state.set {
            return;
        }
        state.set = true;
        let pending = std::mem::take(&mut state.pending);
        drop(state);
        for waiter in pending {
            waiter.resolve(());
        }
    }

    /// Clears the flag. Does not affect waits that already completed.
    pub fn reset(&self) {
        self.inner.borrow_mut().set = false;
    }

    #[track_caller]
    pub async fn wait(&self) -> AsyncResult<()> {
        Framed::new(wait_inner(self.inner.clone())).await
    }
}

async fn wait_inner(inner: Rc<RefCell<Inner>>) -> AsyncResult<()> {
    if inner.borrow().set {
        return Ok(());
    }

    let promise: Promise<(), Error> = Promise::new();
    inner.borrow_mut().pending.push_back(promise.clone());
    let fut = promise.future();

    let cancel_inner = inner.clone();
    let cancel_promise = promise.clone();

    Cancellable::new(fut, move || {
        if !cancel_promise.is_pending() {
            return Err(Error::WillBeDone);
        }
        cancel_inner
            .borrow_mut()
            .pending
            .retain(|p| !Promise::ptr_eq(p, &cancel_promise));
        cancel_promise.reject(Error::Cancelled);
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::run;
    use crate::task::spawn;

    #[test]
    fn wait_resolves_immediately_once_set() {
        let result = run(async {
            let event = Event::new();
            event.set();
            event.wait().await?;
            Ok::<_, Error>(())
        });
        result.unwrap();
    }

    #[test]
    fn set_wakes_all_current_waiters() {
        let result = run(async {
            let event = Event::new();
            let waiters: Vec<_> = (0..3)
                .map(|_| {
                    let e = event.clone();
                    spawn(async move { e.wait().await })
                })
                .collect();
            crate::time::yield_now().await;
            event.set();
            for w in waiters {
                w.await?;
            }
            Ok::<_, Error>(())
        });
        result.unwrap();
    }

    #[test]
    fn reset_does_not_retroactively_undo_a_completed_wait() {
        let result = run(async {
            let event = Event::new();
            event.set();
            event.wait().await?;
            event.reset();
            assert!(!event.is_set());
            Ok::<_, Error>(())
        });
        result.unwrap();
    }

    #[test]
    fn cancel_removes_the_waiter() {
        let result = run(async {
            let event = Event::new();
            let e = event.clone();
            let waiter = spawn(async move { e.wait().await });
            crate::time::yield_now().await;
            waiter.cancel().unwrap();
            let outcome = waiter.await;
            assert!(matches!(outcome, Err(Error::Cancelled)));
            Ok::<_, Error>(())
        });
        result.unwrap();
    }
}
