//! A condition variable paired with a [`Mutex`].
//!
//! Grounded on `original_source/src/sync/condition.cpp`. The caller must
//! hold `mutex` on entry to [`Condition::wait`]; it is released before
//! suspending and reacquired (itself possibly suspending) before
//! returning. A generation counter guards against the lost-wakeup race
//! where a waiter is cancelled in the same turn it was signalled: if the
//! counter moved while this wait was being cancelled, the signal is
//! forwarded to the next waiter instead of being silently dropped.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::cancellable::Cancellable;
use crate::error::{AsyncResult, Error};
use crate::frame::{self, Framed};
use crate::promise::Promise;
use crate::sync::Mutex;

struct Inner {
    counter: u64,
    pending: VecDeque<Promise<(), Error>>,
}

#[derive(Clone)]
pub struct Condition {
    inner: Rc<RefCell<Inner>>,
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

impl Condition {
    pub fn new() -> Self {
        Condition {
            inner: Rc::new(RefCell::new(Inner {
                counter: 0,
                pending: VecDeque::new(),
            })),
        }
    }

    /// Releases `mutex`, suspends until notified (or cancelled), then
    /// reacquires `mutex` before returning - even on the cancelled path.
    ///
    /// # Panics
    /// Debug builds assert `mutex` is held on entry; calling this without
    /// the lock is a programming error, not a runtime condition.
    #[track_caller]
    pub async fn wait(&self, mutex: &Mutex) -> AsyncResult<()> {
        Framed::new(wait_inner(self.inner.clone(), mutex.clone())).await
    }

    /// Waits until `predicate` returns `false`, reacquiring `mutex` and
    /// re-checking between every wakeup. `mutex` must be held for the
    /// duration this is awaited, exactly as `wait` requires.
    #[track_caller]
    pub async fn wait_while(
        &self,
        mutex: &Mutex,
        mut predicate: impl FnMut() -> bool,
    ) -> AsyncResult<()> {
        while predicate() {
            self.wait(mutex).await?;
        }
        Ok(())
    }

    /// Wakes the longest-waiting task, if any.
    pub fn notify(&self) {
        notify_one(&self.inner);
    }

    /// Wakes every currently-waiting task.
    pub fn broadcast(&self) {
        let mut state = self.inner.borrow_mut();
        state.counter += 1;
        let pending = std::mem::take(&mut state.pending);
        drop(state);
        for waiter in pending {
            waiter.resolve(());
        }
    }
}

fn notify_one(inner: &Rc<RefCell<Inner>>) {
    let mut state = inner.borrow_mut();
    state.counter += 1;
    let Some(waiter) = state.pending.pop_front() else {
        return;
    };
    drop(state);
    waiter.resolve(());
}

async fn wait_inner(inner: Rc<RefCell<Inner>>, mutex: Mutex) -> AsyncResult<()> {
    let counter = inner.borrow().counter;
    debug_assert!(mutex.locked(), "Condition::wait called without holding the mutex");
    mutex.unlock();

    let promise: Promise<(), Error> = Promise::new();
    inner.borrow_mut().pending.push_back(promise.clone());
    let fut = promise.future();

    let cancel_inner = inner.clone();
    let cancel_promise = promise.clone();

    let result = Cancellable::new(fut, move || {
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
    .await;

    // Reacquiring the mutex is not itself cancellable: a waiter that was
    // signalled, or one that simply finished waiting, must not come back
    // without the lock.
    frame::set_locked();
    loop {
        if mutex.lock().await.is_ok() {
            break;
        }
    }
    frame::unset_locked();

    if let Err(e) = result {
        // We were cancelled, but the generation counter moved while that
        // was happening - a notify() raced us and would otherwise be lost.
        // Forward it to whoever is next in line.
        if counter != inner.borrow().counter {
            notify_one(&inner);
        }
        return Err(e);
    }

    Ok(())
}
