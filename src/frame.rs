//! Per-coroutine bookkeeping.
//!
//! Rust's `async`/`await` already gives us the compiler-generated state
//! machine the original design wanted to hand-roll, so `FrameState` does not
//! drive polling itself. What it carries instead is everything *about* a
//! suspension point that the compiler's state machine does not expose:
//! whether this await can be cancelled, where it is (for `trace()`), and
//! what to run once it finishes.
//!
//! A task's frames form a single-spine chain through `next`, mirroring a
//! call stack of nested, instrumented awaits (`Mutex::lock`,
//! `Condition::wait`, `sleep`, a `TaskGroup` await, ...). Exactly one frame
//! in the chain is the "leaf": the one actually suspended with a `cancel`
//! hook installed, or awaiting a group.

use std::cell::RefCell;
use std::panic::Location;
use std::rc::{Rc, Weak};

use crate::error::{AsyncResult, Error};
use crate::group::GroupInner;

pub(crate) type CancelFn = Box<dyn FnOnce() -> AsyncResult<()>>;
pub(crate) type Callback = Box<dyn FnOnce()>;

/// A reference-counted handle to a frame. Frames are owned by the chain
/// that links them (a parent's `next`) plus whichever task currently
/// considers itself "at" that frame.
pub(crate) type FrameHandle = Rc<RefCell<FrameState>>;

pub(crate) struct FrameState {
    pub finished: bool,
    pub cancelled: bool,
    /// Set while a non-cancellable critical section (e.g. the body of a
    /// `Mutex`-protected region reacquiring the lock) is running.
    pub locked: bool,
    pub location: Option<&'static Location<'static>>,
    pub next: Option<FrameHandle>,
    pub cancel: Option<CancelFn>,
    pub group: Option<Weak<GroupInner>>,
    pub callbacks: Vec<Callback>,
    pub parent: Option<Weak<RefCell<FrameState>>>,
}

impl FrameState {
    pub fn new(location: &'static Location<'static>) -> FrameHandle {
        Rc::new(RefCell::new(FrameState {
            finished: false,
            cancelled: false,
            locked: false,
            location: Some(location),
            next: None,
            cancel: None,
            group: None,
            callbacks: Vec::new(),
            parent: None,
        }))
    }

    pub fn root() -> FrameHandle {
        Rc::new(RefCell::new(FrameState {
            finished: false,
            cancelled: false,
            locked: false,
            location: None,
            next: None,
            cancel: None,
            group: None,
            callbacks: Vec::new(),
            parent: None,
        }))
    }

    /// Clears everything this frame was suspended on. Called right before
    /// it is repurposed to represent a fresh await point (it has already
    /// resumed from the previous one).
    pub fn step(&mut self) {
        self.next = None;
        self.location = None;
        self.cancel = None;
        self.group = None;
    }

    /// Marks the frame finished and drains its completion callbacks onto
    /// the owning event loop, exactly once.
    pub fn end(frame: &FrameHandle) {
        let callbacks = {
            let mut state = frame.borrow_mut();
            if state.finished {
                return;
            }
            state.finished = true;
            std::mem::take(&mut state.callbacks)
        };

        let loop_handle = crate::event_loop::EventLoop::current();
        for callback in callbacks {
            // A post failure here means the loop is already tearing down;
            // there is nothing useful left to notify.
            let _ = loop_handle.post(callback);
        }
    }

    pub fn on_finish(frame: &FrameHandle, callback: Callback) {
        let mut state = frame.borrow_mut();
        if state.finished {
            drop(state);
            let _ = crate::event_loop::EventLoop::current().post(callback);
            return;
        }
        state.callbacks.push(callback);
    }
}

/// Walks the single-spine chain from `frame` to its leaf, marking every
/// frame along the way `cancelled`, then acts on the leaf: invoking its
/// cancel hook, deferring to its group, or reporting that this await point
/// cannot be interrupted.
pub(crate) fn cancel_chain(frame: &FrameHandle) -> AsyncResult<()> {
    let mut current = frame.clone();

    loop {
        let next = {
            let mut state = current.borrow_mut();
            state.cancelled = true;

            if state.locked {
                return Err(Error::Locked);
            }

            if let Some(cancel) = state.cancel.take() {
                return cancel();
            }

            if state.next.is_none() {
                if let Some(group) = state.group.as_ref().and_then(Weak::upgrade) {
                    drop(state);
                    return GroupInner::cancel(&group);
                }
                return Err(Error::CancellationNotSupported);
            }

            state.next.clone()
        };

        current = next.expect("checked above");
    }
}

/// Produces a human-readable, indented tree of the still-pending source
/// locations under `frame`, descending through `next` and, at a group
/// await, through every unfinished child.
pub(crate) fn trace(frame: &FrameHandle) -> String {
    let mut lines = Vec::new();
    trace_into(frame, 0, &mut lines);
    lines.join("\n")
}

fn trace_into(frame: &FrameHandle, depth: usize, lines: &mut Vec<String>) {
    let state = frame.borrow();
    if state.finished {
        return;
    }

    if let Some(location) = state.location {
        lines.push(format!("{}{}", "  ".repeat(depth), location));
    }

    if let Some(next) = state.next.clone() {
        drop(state);
        trace_into(&next, depth + 1, lines);
        return;
    }

    if let Some(group) = state.group.as_ref().and_then(Weak::upgrade) {
        drop(state);
        for child in GroupInner::children(&group) {
            trace_into(&child, depth + 1, lines);
        }
    }
}

/// Wraps an inner future so that, while it is being polled, it is visible
/// on the frame chain: a child [`FrameState`] is created lazily on first
/// poll, linked as the parent's `next`, and unlinked once the inner future
/// resolves. This is what gives every instrumented primitive in this crate
/// (`sleep`, `Mutex::lock`, `Condition::wait`, channel sends/receives,
/// `signal_on`, a `TaskGroup` await, ...) its own entry in `Task::trace()`
/// and its own cancellation leaf.
pub(crate) struct Framed<F> {
    inner: F,
    frame: Option<FrameHandle>,
    parent: Option<FrameHandle>,
    location: &'static Location<'static>,
}

impl<F> Framed<F> {
    #[track_caller]
    pub fn new(inner: F) -> Self {
        Framed {
            inner,
            frame: None,
            parent: None,
            location: Location::caller(),
        }
    }
}

impl<F: std::future::Future> std::future::Future for Framed<F> {
    type Output = F::Output;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        // Safety: we never move `inner` out; this is a standard structural
        // pin projection for a struct with no `Drop` impl of its own.
        let this = unsafe { self.get_unchecked_mut() };

        let frame = match &this.frame {
            Some(frame) => frame.clone(),
            None => {
                let parent = current_frame().expect(
                    "an instrumented asyncio primitive was awaited outside of a running task",
                );
                let child = FrameState::new(this.location);
                parent.borrow_mut().next = Some(child.clone());
                this.parent = Some(parent);
                this.frame = Some(child.clone());
                child
            }
        };

        let inner = unsafe { std::pin::Pin::new_unchecked(&mut this.inner) };
        let poll = with_frame(frame.clone(), || inner.poll(cx));

        if poll.is_ready() {
            frame.borrow_mut().finished = true;
            if let Some(parent) = &this.parent {
                parent.borrow_mut().next = None;
            }
        }

        poll
    }
}

thread_local! {
    /// Mirrors the call stack of instrumented awaits for whichever task is
    /// currently being polled. Exactly one task is ever polling at a time
    /// (the loop is single-threaded and cooperative), so a single stack
    /// here always means "the innermost frame of the task on the stack
    /// right now".
    static CURRENT_FRAME: RefCell<Vec<FrameHandle>> = const { RefCell::new(Vec::new()) };
}

/// Pushes `frame` as the new innermost frame for the duration of `body`.
pub(crate) fn with_frame<R>(frame: FrameHandle, body: impl FnOnce() -> R) -> R {
    CURRENT_FRAME.with(|stack| stack.borrow_mut().push(frame));
    let result = body();
    CURRENT_FRAME.with(|stack| {
        stack.borrow_mut().pop();
    });
    result
}

/// The frame the currently-polling task is suspended at, if any.
pub(crate) fn current_frame() -> Option<FrameHandle> {
    CURRENT_FRAME.with(|stack| stack.borrow().last().cloned())
}

/// Marks the current frame `locked` - a non-cancellable critical section,
/// e.g. `Condition::wait` reacquiring its mutex - until [`unset_locked`] is
/// called. Mirrors `co_await coroutine::lock` / `coroutine::unlock` in
/// `original_source/src/sync/condition.cpp`; a bracketing pair rather than
/// a closure because the critical section here spans an `.await`.
pub(crate) fn set_locked() {
    if let Some(frame) = current_frame() {
        frame.borrow_mut().locked = true;
    }
}

pub(crate) fn unset_locked() {
    if let Some(frame) = current_frame() {
        frame.borrow_mut().locked = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_drains_callbacks_once() {
        let result = crate::event_loop::run(async {
            let frame = FrameState::root();
            let calls = Rc::new(RefCell::new(0));
            let c1 = calls.clone();
            FrameState::on_finish(&frame, Box::new(move || *c1.borrow_mut() += 1));
            FrameState::end(&frame);
            FrameState::end(&frame);
            crate::time::yield_now().await;
            assert_eq!(*calls.borrow(), 1);
            Ok::<_, Error>(())
        });
        result.unwrap();
    }

    #[test]
    fn cancel_chain_reports_unsupported_when_no_leaf() {
        let result = crate::event_loop::run(async {
            let frame = FrameState::root();
            assert!(matches!(
                cancel_chain(&frame),
                Err(Error::CancellationNotSupported)
            ));
            Ok::<_, Error>(())
        });
        result.unwrap();
    }
}
