//! A FIFO-fair, non-reentrant async mutex.
//!
//! Grounded on `original_source/src/sync/mutex.cpp`. Unlike `std::sync`'s
//! mutex this has no RAII guard - `lock()`/`unlock()` are separate calls,
//! matching `original_source/test/sync/mutex.cpp`'s usage and this
//! system's preference for explicit ownership transfer over scope-based
//! unlocking (a cancelled `lock()` must be able to hand the lock it never
//! got to its own successor, which a guard-based API can't express).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::cancellable::Cancellable;
use crate::error::{AsyncResult, Error};
use crate::frame::Framed;
use crate::promise::Promise;

struct Inner {
    locked: bool,
    pending: VecDeque<Promise<(), Error>>,
}

/// An async mutex. Cloning shares the same lock state (it is an `Rc`
/// handle, not a new mutex).
#[derive(Clone)]
pub struct Mutex {
    inner: Rc<RefCell<Inner>>,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub fn new() -> Self {
        Mutex {
            inner: Rc::new(RefCell::new(Inner {
                locked: false,
                pending: VecDeque::new(),
            })),
        }
    }

    pub fn locked(&self) -> bool {
        self.inner.borrow().locked
    }

    /// Acquires the lock, suspending in strict FIFO order behind any
    /// already-waiting callers. Cancelling a suspended `lock()` removes it
    /// from the queue without disturbing anyone else's position.
    #[track_caller]
    pub async fn lock(&self) -> AsyncResult<()> {
        Framed::new(lock_inner(self.inner.clone())).await
    }

    /// Releases the lock. If another task is waiting, ownership transfers
    /// directly to it (`locked` stays `true`); otherwise the mutex becomes
    /// unlocked.
    ///
    /// # Panics
    /// Debug builds assert the mutex was actually locked; this is a
    /// programming error in the caller, not a runtime condition.
    pub fn unlock(&self) {
        let mut state = self.inner.borrow_mut();
        debug_assert!(state.locked, "unlock() called on an unlocked Mutex");
        match state.pending.pop_front() {
            Some(next) => {
                drop(state);
                next.resolve(());
            }
            None => state.locked = false,
        }
    }
}

async fn lock_inner(inner: Rc<RefCell<Inner>>) -> AsyncResult<()> {
    {
        let mut state = inner.borrow_mut();
        if !state.locked {
            state.locked = true;
            return Ok(());
        }
    }

    let promise: Promise<(), Error> = Promise::new();
    inner.borrow_mut().pending.push_back(promise.clone());
    let fut = promise.future();

    let cancel_inner = inner.clone();
    let cancel_promise = promise.clone();

    Cancellable::new(fut, move || {
        if !cancel_promise.is_pending() {
            // Already granted by a racing `unlock()`; the lock is ours.
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
