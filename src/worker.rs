//! Running a blocking closure on a background OS thread without blocking
//! the loop.
//!
//! Grounded on `original_source/src/worker.cpp`: a persistent thread holds
//! one job at a time and blocks until it gets one. The channel-closes-to-
//! exit shape here is the same lifecycle, just expressed with `mpsc`
//! instead of a mutex, a condvar and an explicit exit flag. `to_thread`
//! (`original_source/test/thread.cpp`) is the public entry point a task
//! awaits; cancellation does not interrupt the OS thread (Rust has no
//! portable equivalent of signalling a `std::thread::native_handle_type`)
//! - instead the caller's `cancel_fn` is cooperative, typically flipping a
//! shared flag the running closure polls, exactly like the "timeout"
//! section of that same test.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::cancellable::Cancellable;
use crate::error::{AsyncResult, Error};
use crate::event_loop::EventLoop;
use crate::frame::Framed;
use crate::promise::Promise;

struct Worker {
    sender: mpsc::Sender<Box<dyn FnOnce() + Send>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn() -> Self {
        let (sender, receiver) = mpsc::channel::<Box<dyn FnOnce() + Send>>();
        let handle = std::thread::spawn(move || {
            while let Ok(job) = receiver.recv() {
                job();
            }
        });
        Worker {
            sender,
            handle: Some(handle),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Dropping `sender` closes the channel, which ends the worker's
        // `recv()` loop; join to make sure it has actually exited before
        // the pool (and the loop that owns it) goes away.
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A small fixed-size pool of persistent worker threads, created lazily the
/// first time [`to_thread`] is called on a given loop and torn down with
/// it.
pub(crate) struct WorkerPool {
    workers: Vec<Worker>,
    next: std::cell::Cell<usize>,
}

impl WorkerPool {
    pub(crate) fn new() -> Self {
        let count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(8);
        WorkerPool {
            workers: (0..count).map(|_| Worker::spawn()).collect(),
            next: std::cell::Cell::new(0),
        }
    }

    pub(crate) fn dispatch(&self, job: Box<dyn FnOnce() + Send>) {
        let i = self.next.get();
        self.next.set((i + 1) % self.workers.len());
        let _ = self.workers[i].sender.send(job);
    }
}

/// Type-erased handle the loop polls every turn to see whether a
/// background job has finished. Lives entirely on the loop thread; only
/// the `mpsc::Receiver` it wraps ever crossed a thread boundary.
pub(crate) trait PendingThread {
    /// Returns `true` once this slot should be dropped from the loop's
    /// pending list: either the result arrived and was delivered, or the
    /// promise had already been settled by cancellation.
    fn try_finish(&self) -> bool;
}

struct ThreadSlot<T: Clone + 'static> {
    receiver: mpsc::Receiver<AsyncResult<T>>,
    promise: Promise<T, Error>,
}

impl<T: Clone + 'static> PendingThread for ThreadSlot<T> {
    fn try_finish(&self) -> bool {
        if !self.promise.is_pending() {
            // Settled by cancellation already; the eventual send (if any)
            // is simply discarded when the receiver drops.
            return true;
        }
        match self.receiver.try_recv() {
            Ok(Ok(value)) => {
                self.promise.resolve(value);
                true
            }
            Ok(Err(e)) => {
                self.promise.reject(e);
                true
            }
            Err(mpsc::TryRecvError::Empty) => false,
            Err(mpsc::TryRecvError::Disconnected) => {
                self.promise.reject(Error::ResourceDestroyed);
                true
            }
        }
    }
}

/// Runs `f` on a background thread and resolves with its result without
/// blocking the loop. Not cancellable: once dispatched, the closure always
/// runs to completion on its worker thread. See [`to_thread_cancellable`]
/// for a version that can signal the closure to stop early.
#[track_caller]
pub async fn to_thread<T>(f: impl FnOnce() -> AsyncResult<T> + Send + 'static) -> AsyncResult<T>
where
    T: Clone + Send + 'static,
{
    Framed::new(dispatch(f)).await
}

/// Like [`to_thread`], but `cancel_fn` is invoked (on the loop thread, like
/// any other cancel hook) if the task is cancelled while the background
/// closure is still running. `cancel_fn` cannot stop the OS thread itself
/// - it is expected to flip a flag `f` observes and exits on, the same
/// pattern the `"timeout"` case in `original_source/test/thread.cpp` uses
/// with a shared `stop` boolean.
#[track_caller]
pub async fn to_thread_cancellable<T>(
    f: impl FnOnce() -> AsyncResult<T> + Send + 'static,
    cancel_fn: impl FnOnce() -> AsyncResult<()> + 'static,
) -> AsyncResult<T>
where
    T: Clone + Send + 'static,
{
    Framed::new(dispatch_cancellable(f, cancel_fn)).await
}

async fn dispatch<T>(f: impl FnOnce() -> AsyncResult<T> + Send + 'static) -> AsyncResult<T>
where
    T: Clone + Send + 'static,
{
    dispatch_cancellable(f, || Err(Error::CancellationNotSupported)).await
}

async fn dispatch_cancellable<T>(
    f: impl FnOnce() -> AsyncResult<T> + Send + 'static,
    cancel_fn: impl FnOnce() -> AsyncResult<()> + 'static,
) -> AsyncResult<T>
where
    T: Clone + Send + 'static,
{
    let event_loop = EventLoop::current();
    let waker: Arc<mio::Waker> = event_loop.thread_waker();
    let (sender, receiver) = mpsc::channel();

    event_loop.dispatch_thread_job(Box::new(move || {
        let _ = sender.send(f());
        let _ = waker.wake();
    }));

    let promise: Promise<T, Error> = Promise::new();
    event_loop.register_pending_thread(Box::new(ThreadSlot {
        receiver,
        promise: promise.clone(),
    }));
    let fut = promise.future();

    Cancellable::new(fut, move || {
        if !promise.is_pending() {
            return Err(Error::WillBeDone);
        }
        cancel_fn()?;
        promise.reject(Error::Cancelled);
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::run;
    use crate::task::{spawn, Task};
    use crate::time::sleep;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn runs_the_closure_and_returns_its_value() {
        let result = run(async {
            to_thread(|| {
                std::thread::sleep(Duration::from_millis(5));
                Ok(1024)
            })
            .await
        });
        assert_eq!(result.unwrap(), 1024);
    }

    #[test]
    fn propagates_the_closure_s_error() {
        let result: AsyncResult<()> = run(async {
            to_thread(|| {
                std::thread::sleep(Duration::from_millis(5));
                Err(Error::BrokenPipe)
            })
            .await
        });
        assert!(matches!(result, Err(Error::BrokenPipe)));
    }

    #[test]
    fn cancelling_signals_the_shared_stop_flag() {
        let result = run(async {
            let stop = Arc::new(AtomicBool::new(false));
            let worker_stop = stop.clone();
            let cancel_stop = stop.clone();

            let t: Task<()> = spawn(async move {
                to_thread_cancellable(
                    move || {
                        while !worker_stop.load(Ordering::SeqCst) {
                            std::thread::sleep(Duration::from_millis(5));
                        }
                        Err(Error::Cancelled)
                    },
                    move || {
                        cancel_stop.store(true, Ordering::SeqCst);
                        Ok(())
                    },
                )
                .await
            });

            sleep(Duration::from_millis(10)).await?;
            assert!(!t.done());
            t.cancel().unwrap();
            let outcome = t.await;
            assert!(matches!(outcome, Err(Error::Cancelled)));
            Ok::<_, Error>(())
        });
        result.unwrap();
    }
}
