//! A set of child tasks cancelled together.
//!
//! Grounded on `original_source/src/task.cpp`'s `TaskGroup::cancel`, which
//! cancels every unfinished child and folds their cancellation errors down
//! to "the last one seen". Awaiting the group itself is native: it is a
//! `Future` that polls every child's completion and resolves once they have
//! all finished.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use crate::error::{AsyncResult, Error};
use crate::frame::{self, FrameHandle, Framed};
use crate::task::{ErasedTask, Task};

pub(crate) struct GroupInner {
    children: RefCell<Vec<Box<dyn ErasedTask>>>,
    cancelled: RefCell<bool>,
}

impl GroupInner {
    pub(crate) fn cancel(this: &Rc<GroupInner>) -> AsyncResult<()> {
        *this.cancelled.borrow_mut() = true;

        let mut last_err = None;
        for child in this.children.borrow().iter() {
            if child.done() {
                continue;
            }
            if let Err(e) = child.cancel() {
                last_err = Some(e);
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) fn children(this: &Rc<GroupInner>) -> Vec<FrameHandle> {
        this.children.borrow().iter().map(|c| c.frame_handle()).collect()
    }
}

/// A set of tasks awaited, and optionally cancelled, as a unit.
///
/// Unlike scope-style structured concurrency, a `TaskGroup` does not
/// automatically cancel siblings when one child errors: a single failure
/// propagates only through `join()`'s result. Compose explicit `cancel()`
/// calls, or use [`race`]/[`all_settled`], when that auto-cancel behaviour
/// is wanted.
pub struct TaskGroup {
    inner: Rc<GroupInner>,
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGroup {
    pub fn new() -> Self {
        TaskGroup {
            inner: Rc::new(GroupInner {
                children: RefCell::new(Vec::new()),
                cancelled: RefCell::new(false),
            }),
        }
    }

    /// Adds `task` to the group. If the group has already been cancelled,
    /// the new child is cancelled immediately.
    pub fn add<T: Clone + 'static>(&self, task: Task<T>) {
        let erased = task.erase();
        if *self.inner.cancelled.borrow() {
            let _ = erased.cancel();
        }
        self.inner.children.borrow_mut().push(erased);
    }

    pub fn cancelled(&self) -> bool {
        *self.inner.cancelled.borrow()
    }

    /// Cancels every unfinished child. Idempotent.
    pub fn cancel(&self) -> AsyncResult<()> {
        GroupInner::cancel(&self.inner)
    }

    /// Awaits every child. Resolves `Ok(())` if none errored, otherwise the
    /// first non-ok child error encountered in insertion order.
    pub fn join(self) -> JoinGroup {
        JoinGroup {
            inner: Framed::new(JoinGroupInner { group: self.inner }),
        }
    }
}

pub struct JoinGroup {
    inner: Framed<JoinGroupInner>,
}

impl std::future::Future for JoinGroup {
    type Output = AsyncResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: structural projection, `inner` is never moved elsewhere.
        let inner = unsafe { self.map_unchecked_mut(|s| &mut s.inner) };
        inner.poll(cx)
    }
}

struct JoinGroupInner {
    group: Rc<GroupInner>,
}

impl std::future::Future for JoinGroupInner {
    type Output = AsyncResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Mark the polling frame as "awaiting this group" so that
        // cancellation and trace() can descend into its children.
        if let Some(frame) = frame::current_frame() {
            frame.borrow_mut().group = Some(Rc::downgrade(&self.group));
        }

        let mut first_error = None;
        let mut all_done = true;

        for child in self.group.children.borrow().iter() {
            match child.poll_done(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Poll::Pending => all_done = false,
            }
        }

        if !all_done {
            return Poll::Pending;
        }

        if let Some(frame) = frame::current_frame() {
            frame.borrow_mut().group = None;
        }

        match first_error {
            Some(e) => Poll::Ready(Err(e)),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Awaits every child regardless of outcome, returning each result in
/// insertion order. Never short-circuits and never cancels siblings.
pub async fn all_settled<T: Clone + 'static>(tasks: Vec<Task<T>>) -> Vec<AsyncResult<T>> {
    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        results.push(task.future().await);
    }
    results
}

/// Awaits whichever of `tasks` finishes first, then cancels every other
/// still-pending task. The cancelled tasks' errors are discarded; only the
/// winner's result is returned.
pub async fn race<T: Clone + 'static>(tasks: Vec<Task<T>>) -> AsyncResult<T> {
    if tasks.is_empty() {
        return Err(Error::CancellationNotSupported);
    }

    let winner: Rc<RefCell<Option<(usize, AsyncResult<T>)>>> = Rc::new(RefCell::new(None));
    race_poll(tasks, winner.clone()).await;

    let winner = Rc::try_unwrap(winner)
        .unwrap_or_else(|_| unreachable!("no other strong reference survives race_poll"))
        .into_inner();
    winner.map(|(_, r)| r).unwrap_or(Err(Error::Cancelled))
}

async fn race_poll<T: Clone + 'static>(
    mut tasks: Vec<Task<T>>,
    winner: Rc<RefCell<Option<(usize, AsyncResult<T>)>>>,
) {
    std::future::poll_fn(move |cx| {
        for (idx, task) in tasks.iter_mut().enumerate() {
            if winner.borrow().is_some() {
                break;
            }
            if let Poll::Ready(result) = Pin::new(task).poll(cx) {
                *winner.borrow_mut() = Some((idx, result));
            }
        }

        if winner.borrow().is_none() {
            return Poll::Pending;
        }

        let winning_idx = winner.borrow().as_ref().map(|(w, _)| *w);
        for (idx, task) in tasks.iter().enumerate() {
            if Some(idx) != winning_idx && !task.done() {
                let _ = task.cancel();
            }
        }

        Poll::Ready(())
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::run;
    use crate::task::spawn;
    use crate::time::sleep;
    use std::time::Duration;

    #[test]
    fn group_join_aggregates_first_error() {
        let result = run(async {
            let group = TaskGroup::new();
            group.add(spawn(async { Ok::<_, Error>(()) }));
            group.add(spawn(async { Err::<(), _>(Error::Cancelled) }));
            let outcome = group.join().await;
            assert!(matches!(outcome, Err(Error::Cancelled)));
            Ok::<_, Error>(())
        });
        result.unwrap();
    }

    #[test]
    fn race_returns_first_winner_and_cancels_rest() {
        let result = run(async {
            let fast = spawn(async { Ok::<_, Error>(1) });
            let slow = spawn(async {
                sleep(Duration::from_millis(200)).await?;
                Ok::<_, Error>(2)
            });
            let outcome = race(vec![fast, slow]).await;
            assert_eq!(outcome.unwrap(), 1);
            Ok::<_, Error>(())
        });
        result.unwrap();
    }
}
