//! Single-assignment value cell (`Promise`) and its observer handle
//! (`Future`).
//!
//! Grounded on `original_source`'s promise/future split (every `*.cpp` file
//! constructs a `Promise`, stashes it behind a raw pointer or closure
//! capture, and hands the caller `promise.getFuture()`). The state machine
//! is the same: `Pending -> Fulfilled(v) | Rejected(e)`, monotone,
//! happens-once. What changes for Rust is the observer representation:
//! instead of a bespoke callback list we also have to support native
//! `.await`, so an observer is either a boxed continuation (registered via
//! [`Future::then`]/[`Future::fail`]) or a [`std::task::Waker`] (registered
//! by polling the `Future` directly).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::event_loop::EventLoop;

enum State<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

enum Observer<T, E> {
    Waker(Waker),
    Callback(Box<dyn FnOnce(Result<T, E>)>),
}

struct Inner<T, E> {
    state: State<T, E>,
    observers: VecDeque<Observer<T, E>>,
}

/// A single-producer, many-observer value cell.
///
/// `resolve`/`reject` may each be called at most once across the pair; a
/// second call is a precondition violation (`debug_assert!`s in debug
/// builds, silently dropped in release).
pub struct Promise<T, E = crate::error::Error> {
    inner: Rc<RefCell<Inner<T, E>>>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Promise {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Promise<T, E> {
    pub fn new() -> Self {
        Promise {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Pending,
                observers: VecDeque::new(),
            })),
        }
    }

    pub fn resolve(&self, value: T) {
        self.settle(Ok(value));
    }

    pub fn reject(&self, error: E) {
        self.settle(Err(error));
    }

    fn settle(&self, result: Result<T, E>) {
        let observers = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, State::Pending) {
                debug_assert!(
                    false,
                    "Promise resolved/rejected twice; ignoring the second value"
                );
                return;
            }
            inner.state = match &result {
                Ok(v) => State::Fulfilled(v.clone()),
                Err(e) => State::Rejected(e.clone()),
            };
            std::mem::take(&mut inner.observers)
        };

        let loop_handle = EventLoop::current();
        for observer in observers {
            match observer {
                Observer::Waker(waker) => waker.wake(),
                Observer::Callback(callback) => {
                    let result = result.clone();
                    let _ = loop_handle.post(Box::new(move || callback(result)));
                }
            }
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self.inner.borrow().state, State::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.inner.borrow().state, State::Rejected(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.inner.borrow().state, State::Pending)
    }

    pub fn future(&self) -> Future<T, E> {
        Future {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> Promise<T, E> {
    /// Identity comparison, used by FIFO wait queues (`Mutex`, `Event`,
    /// `Condition`) to find and remove a specific waiter on cancellation.
    pub(crate) fn ptr_eq(a: &Promise<T, E>, b: &Promise<T, E>) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Default for Promise<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// A cheap, clonable handle to a [`Promise`]'s eventual value.
///
/// Futures are shared: every clone observes the same terminal value. `then`
/// and `fail` register continuations that are always *posted* to the owning
/// loop, even if the `Future` is already terminal - this is the property
/// that keeps resolution non-reentrant.
pub struct Future<T, E = crate::error::Error> {
    inner: Rc<RefCell<Inner<T, E>>>,
}

impl<T, E> Clone for Future<T, E> {
    fn clone(&self) -> Self {
        Future {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Future<T, E> {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self.inner.borrow().state, State::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.inner.borrow().state, State::Rejected(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.inner.borrow().state, State::Pending)
    }

    /// Non-blocking read of the terminal value, if any. Used by the loop's
    /// own `run()` to know when the root task has finished without needing
    /// to poll it as a `Future`.
    pub(crate) fn try_result(&self) -> Option<Result<T, E>> {
        self.terminal()
    }

    fn terminal(&self) -> Option<Result<T, E>> {
        match &self.inner.borrow().state {
            State::Pending => None,
            State::Fulfilled(v) => Some(Ok(v.clone())),
            State::Rejected(e) => Some(Err(e.clone())),
        }
    }

    /// Registers `f` to run with the terminal value. Always posted to the
    /// event loop, in registration order relative to other `then`/`fail`
    /// calls and to already-pending native-`.await` wakers.
    pub fn then(&self, f: impl FnOnce(Result<T, E>) + 'static) {
        if let Some(result) = self.terminal() {
            let _ = EventLoop::current().post(Box::new(move || f(result)));
            return;
        }
        self.inner
            .borrow_mut()
            .observers
            .push_back(Observer::Callback(Box::new(f)));
    }

    /// Registers `f` to run only if the promise is rejected.
    pub fn fail(&self, f: impl FnOnce(E) + 'static) {
        self.then(|result| {
            if let Err(e) = result {
                f(e);
            }
        });
    }
}

impl<T: Clone + 'static, E: Clone + 'static> std::future::Future for Future<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.terminal() {
            return Poll::Ready(result);
        }
        self.inner
            .borrow_mut()
            .observers
            .push_back(Observer::Waker(cx.waker().clone()));
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn observers_fire_in_registration_order_after_a_turn() {
        let result = crate::event_loop::run(async {
            let promise: Promise<i32, Error> = Promise::new();
            let order = Rc::new(StdRefCell::new(Vec::new()));

            let a = order.clone();
            promise.future().then(move |_| a.borrow_mut().push('A'));
            let b = order.clone();
            promise.future().then(move |_| b.borrow_mut().push('B'));

            promise.resolve(42);
            assert!(order.borrow().is_empty(), "then() must never run inline");

            // Yield one loop turn so the posted continuations run.
            crate::time::yield_now().await;
            assert_eq!(*order.borrow(), vec!['A', 'B']);
            Ok::<_, Error>(())
        });
        result.unwrap();
    }

    #[test]
    fn await_resolves_with_fulfilled_value() {
        let result = crate::event_loop::run(async {
            let promise: Promise<i32, Error> = Promise::new();
            promise.resolve(7);
            assert_eq!(promise.future().await.unwrap(), 7);
            Ok::<_, Error>(())
        });
        result.unwrap();
    }
}
