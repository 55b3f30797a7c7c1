//! The single-threaded reactor.
//!
//! Everything in this crate eventually funnels through one `EventLoop`:
//! deferred callbacks (`post`, and every `Promise` continuation), native
//! task wake-ups, the timer heap, and `mio`-backed I/O readiness (signals
//! today; sockets/files are an external collaborator's problem, out of
//! scope here). The loop owns all of it as plain `RefCell`-guarded
//! state because nothing above it ever runs off the loop thread -
//! `original_source`'s C++ loop leans on the same assumption.

use std::cell::{Cell, RefCell};
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::time::{Duration, Instant};

use crate::error::{AsyncResult, Error};
use crate::promise::Promise;
use crate::worker::{PendingThread, WorkerPool};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct TaskId(pub(crate) u64);

struct TimerEntry {
    deadline: Instant,
    id: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the earliest deadline.
        other.deadline.cmp(&self.deadline).then(other.id.cmp(&self.id))
    }
}

struct EventLoopInner {
    deferred: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    ready: RefCell<VecDeque<TaskId>>,
    tasks: RefCell<HashMap<TaskId, Pin<Box<dyn Future<Output = ()>>>>>,
    next_task_id: Cell<u64>,

    timers: RefCell<BinaryHeap<TimerEntry>>,
    timer_promises: RefCell<HashMap<u64, Promise<(), Error>>>,
    cancelled_timers: RefCell<HashSet<u64>>,
    next_timer_id: Cell<u64>,

    poll: RefCell<mio::Poll>,
    events: RefCell<mio::event::Events>,
    next_token: Cell<usize>,

    #[cfg(unix)]
    signals: RefCell<Option<signal_hook_mio::v0_8::Signals>>,
    #[cfg(unix)]
    registered_signums: RefCell<HashSet<i32>>,
    signal_token: Cell<Option<mio::Token>>,
    signal_pending: RefCell<HashMap<i32, Vec<Promise<i32, Error>>>>,

    worker_pool: RefCell<Option<WorkerPool>>,
    thread_waker: RefCell<Option<Arc<mio::Waker>>>,
    pending_threads: RefCell<Vec<Box<dyn PendingThread>>>,
    bridges: RefCell<Vec<Box<dyn FnMut()>>>,

    stopping: Cell<bool>,
}

/// A cheap, clonable handle to the event loop running on this thread.
///
/// Only ever exists while inside [`crate::run`]; there is no way to obtain
/// one outside of a running loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<EventLoopInner>,
}

thread_local! {
    static CURRENT: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
}

struct InstallGuard(Option<EventLoop>);
impl Drop for InstallGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| *c.borrow_mut() = self.0.take());
    }
}

impl EventLoop {
    fn new() -> AsyncResult<Self> {
        let poll = mio::Poll::new()?;
        Ok(EventLoop {
            inner: Rc::new(EventLoopInner {
                deferred: RefCell::new(VecDeque::new()),
                ready: RefCell::new(VecDeque::new()),
                tasks: RefCell::new(HashMap::new()),
                next_task_id: Cell::new(0),
                timers: RefCell::new(BinaryHeap::new()),
                timer_promises: RefCell::new(HashMap::new()),
                cancelled_timers: RefCell::new(HashSet::new()),
                next_timer_id: Cell::new(0),
                poll: RefCell::new(poll),
                events: RefCell::new(mio::event::Events::with_capacity(128)),
                next_token: Cell::new(0),
                #[cfg(unix)]
                signals: RefCell::new(None),
                #[cfg(unix)]
                registered_signums: RefCell::new(HashSet::new()),
                signal_token: Cell::new(None),
                signal_pending: RefCell::new(HashMap::new()),
                worker_pool: RefCell::new(None),
                thread_waker: RefCell::new(None),
                pending_threads: RefCell::new(Vec::new()),
                bridges: RefCell::new(Vec::new()),
                stopping: Cell::new(false),
            }),
        })
    }

    /// The loop currently running on this thread.
    ///
    /// # Panics
    /// Panics when called outside of [`crate::run`]. Every public API that
    /// touches the loop (`Promise`, `sleep`, `spawn`, ...) is itself only
    /// reachable from inside a running task, so this should never fire in
    /// practice.
    pub fn current() -> EventLoop {
        CURRENT.with(|c| {
            c.borrow()
                .clone()
                .expect("no asyncio EventLoop is running on this thread")
        })
    }

    /// Appends `callback` to the deferred queue. Fails with
    /// [`Error::ResourceDestroyed`] once the loop has started tearing down.
    pub fn post(&self, callback: Box<dyn FnOnce()>) -> AsyncResult<()> {
        if self.inner.stopping.get() {
            return Err(Error::ResourceDestroyed);
        }
        self.inner.deferred.borrow_mut().push_back(callback);
        Ok(())
    }

    /// Raw access to the underlying `mio::Poll`, for external I/O
    /// back-ends that register their own sources.
    pub fn raw(&self) -> std::cell::Ref<'_, mio::Poll> {
        self.inner.poll.borrow()
    }

    fn wake(&self, id: TaskId) {
        self.inner.ready.borrow_mut().push_back(id);
    }

    // -- task registry --

    pub(crate) fn register_task(&self, fut: Pin<Box<dyn Future<Output = ()>>>) -> TaskId {
        let id = TaskId(self.inner.next_task_id.get());
        self.inner.next_task_id.set(id.0 + 1);
        self.inner.tasks.borrow_mut().insert(id, fut);
        self.wake(id);
        id
    }

    pub(crate) fn poll_task(&self, id: TaskId) {
        let fut = self.inner.tasks.borrow_mut().remove(&id);
        let Some(mut fut) = fut else {
            return; // already finished, or a stale wake
        };

        let waker = task_waker(id);
        let mut cx = Context::from_waker(&waker);

        match fut.as_mut().poll(&mut cx) {
            Poll::Pending => {
                self.inner.tasks.borrow_mut().insert(id, fut);
            }
            Poll::Ready(()) => {}
        }
    }

    fn drain_ready_work(&self) {
        loop {
            let mut did_work = false;

            while let Some(callback) = self.inner.deferred.borrow_mut().pop_front() {
                did_work = true;
                callback();
            }

            while let Some(id) = self.inner.ready.borrow_mut().pop_front() {
                did_work = true;
                self.poll_task(id);
            }

            if !did_work {
                break;
            }
        }
    }

    // -- timers --

    pub(crate) fn schedule_timer(&self, delay: Duration) -> (u64, Promise<(), Error>) {
        let id = self.inner.next_timer_id.get();
        self.inner.next_timer_id.set(id + 1);
        let promise = Promise::new();
        self.inner
            .timer_promises
            .borrow_mut()
            .insert(id, promise.clone());
        self.inner.timers.borrow_mut().push(TimerEntry {
            deadline: Instant::now() + delay,
            id,
        });
        (id, promise)
    }

    /// Cancels a timer before it fires. Returns `false` if it had already
    /// fired (or was already cancelled), matching the `WillBeDone` contract
    /// used by `sleep`'s cancel function.
    pub(crate) fn cancel_timer(&self, id: u64) -> bool {
        if self.inner.timer_promises.borrow_mut().remove(&id).is_none() {
            return false;
        }
        self.inner.cancelled_timers.borrow_mut().insert(id);
        true
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.inner.timers.borrow().peek().map(|t| t.deadline)
    }

    fn fire_expired_timers(&self) {
        let now = Instant::now();
        loop {
            let due = {
                let timers = self.inner.timers.borrow();
                matches!(timers.peek(), Some(t) if t.deadline <= now)
            };
            if !due {
                break;
            }
            let entry = self.inner.timers.borrow_mut().pop().unwrap();
            if self.inner.cancelled_timers.borrow_mut().remove(&entry.id) {
                continue;
            }
            if let Some(promise) = self.inner.timer_promises.borrow_mut().remove(&entry.id) {
                promise.resolve(());
            }
        }
    }

    // -- signals --

    #[cfg(unix)]
    pub(crate) fn register_signal(&self, signum: i32) -> Promise<i32, Error> {
        use mio::Interest;

        let promise = Promise::new();
        self.inner
            .signal_pending
            .borrow_mut()
            .entry(signum)
            .or_default()
            .push(promise.clone());

        if self.inner.registered_signums.borrow_mut().insert(signum) {
            let mut signals_slot = self.inner.signals.borrow_mut();
            match signals_slot.as_mut() {
                // Already watching at least one signal: just add this one.
                Some(signals) => {
                    signals.add_signal(signum).expect("failed to add signal");
                }
                // First signal ever requested on this loop: create the
                // watcher and register it with the multiplexer.
                //
                // SAFETY: `Signals::new` only touches signal masks, not
                // memory shared with a handler; delivery is observed
                // through a self-pipe via mio, so no code ever runs in
                // actual signal-handler context.
                None => {
                    let mut signals = signal_hook_mio::v0_8::Signals::new([signum])
                        .expect("failed to install signal handler");

                    let token = mio::Token(self.next_token());
                    self.inner
                        .poll
                        .borrow()
                        .registry()
                        .register(&mut signals, token, Interest::READABLE)
                        .expect("failed to register signal source with mio");

                    self.signal_token_set(token);
                    *signals_slot = Some(signals);
                }
            }
        }

        promise
    }

    #[cfg(not(unix))]
    pub(crate) fn register_signal(&self, _signum: i32) -> Promise<i32, Error> {
        Promise::new()
    }

    /// Removes `promise` from `signum`'s waiter list before it is rejected
    /// by cancellation, mirroring [`cancel_timer`](Self::cancel_timer): a
    /// stale entry left behind would get `resolve`d by `drain_signals` if
    /// the signal is later actually delivered, tripping the double-settle
    /// guard on an already-cancelled promise. Returns `false` if the
    /// promise was not found (already delivered or already removed).
    #[cfg(unix)]
    pub(crate) fn cancel_signal_wait(&self, signum: i32, promise: &Promise<i32, Error>) -> bool {
        let mut pending = self.inner.signal_pending.borrow_mut();
        let (removed, now_empty) = match pending.get_mut(&signum) {
            Some(waiters) => {
                let before = waiters.len();
                waiters.retain(|p| !Promise::ptr_eq(p, promise));
                (before != waiters.len(), waiters.is_empty())
            }
            None => (false, false),
        };
        if now_empty {
            pending.remove(&signum);
        }
        removed
    }

    #[cfg(not(unix))]
    pub(crate) fn cancel_signal_wait(&self, _signum: i32, _promise: &Promise<i32, Error>) -> bool {
        false
    }

    fn signal_token_set(&self, token: mio::Token) {
        self.inner.signal_token.set(Some(token));
    }

    #[cfg(unix)]
    fn drain_signals(&self, token: mio::Token) {
        if self.inner.signal_token.get() != Some(token) {
            return;
        }
        let mut signals = self.inner.signals.borrow_mut();
        let Some(signals) = signals.as_mut() else {
            return;
        };
        let delivered: Vec<i32> = signals.pending().collect();
        drop(signals);

        for signum in delivered {
            if let Some(waiters) = self.inner.signal_pending.borrow_mut().remove(&signum) {
                for waiter in waiters {
                    waiter.resolve(signum);
                }
            }
        }
    }

    // -- background-thread work (`crate::worker::to_thread`) --

    /// Returns the loop's cross-thread waker, creating and registering it
    /// with the multiplexer on first use. Worker threads hold a clone and
    /// call [`mio::Waker::wake`] on it to pull the loop out of a blocking
    /// `poll_io` wait once they have a result ready.
    pub(crate) fn thread_waker(&self) -> Arc<mio::Waker> {
        if let Some(waker) = self.inner.thread_waker.borrow().as_ref() {
            return waker.clone();
        }

        let token = mio::Token(self.next_token());
        let waker = Arc::new(
            mio::Waker::new(self.inner.poll.borrow().registry(), token)
                .expect("failed to register cross-thread waker"),
        );
        *self.inner.thread_waker.borrow_mut() = Some(waker.clone());
        waker
    }

    /// Hands `job` to the loop's background worker pool, spinning one up on
    /// first use.
    pub(crate) fn dispatch_thread_job(&self, job: Box<dyn FnOnce() + Send>) {
        let mut pool = self.inner.worker_pool.borrow_mut();
        if pool.is_none() {
            *pool = Some(WorkerPool::new());
        }
        pool.as_ref().unwrap().dispatch(job);
    }

    pub(crate) fn register_pending_thread(&self, pending: Box<dyn PendingThread>) {
        self.inner.pending_threads.borrow_mut().push(pending);
    }

    fn drain_pending_threads(&self) {
        self.inner
            .pending_threads
            .borrow_mut()
            .retain(|pending| !pending.try_finish());
    }

    /// Registers a permanent cross-thread bridge, polled every turn for as
    /// long as the loop runs. Used by [`crate::channel::Channel::sync_handle`]
    /// to let a non-loop OS thread hand values to an `Rc`-based `Channel`:
    /// the bridge itself never touches the channel off this thread, it just
    /// drains whatever a `mpsc::Sender` delivered since the last turn.
    pub(crate) fn register_bridge(&self, bridge: Box<dyn FnMut()>) {
        self.inner.bridges.borrow_mut().push(bridge);
    }

    fn poll_bridges(&self) {
        for bridge in self.inner.bridges.borrow_mut().iter_mut() {
            bridge();
        }
    }

    // -- generic I/O readiness (for external transport back-ends) --

    pub(crate) fn next_token(&self) -> usize {
        let token = self.inner.next_token.get();
        self.inner.next_token.set(token + 1);
        token
    }

    fn poll_io(&self, timeout: Option<Duration>) {
        let mut events = self.inner.events.borrow_mut();
        let mut poll = self.inner.poll.borrow_mut();
        match poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return,
            Err(_) => return,
        }
        drop(poll);

        let tokens: Vec<mio::Token> = events.iter().map(|e| e.token()).collect();
        drop(events);

        for token in tokens {
            #[cfg(unix)]
            self.drain_signals(token);
            #[cfg(not(unix))]
            let _ = token;
        }
    }

    fn stop(&self) {
        self.inner.stopping.set(true);
    }
}

fn task_waker(id: TaskId) -> Waker {
    fn raw(id: TaskId) -> RawWaker {
        RawWaker::new(id.0 as usize as *const (), &VTABLE)
    }
    fn clone(data: *const ()) -> RawWaker {
        raw(TaskId(data as u64))
    }
    fn wake(data: *const ()) {
        wake_by_ref(data);
    }
    fn wake_by_ref(data: *const ()) {
        let id = TaskId(data as u64);
        // Only ever called on the loop thread: every `Waker` this crate
        // hands out is cloned from one created here, and the only futures
        // we poll are ours.
        EventLoop::current().wake(id);
    }
    fn drop(_data: *const ()) {}

    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);

    // SAFETY: the vtable functions never dereference `data`; they only
    // round-trip the integer `TaskId` through it, and are only invoked on
    // the loop thread they were created on.
    unsafe { Waker::from_raw(raw(id)) }
}

/// Runs `body` to completion on a fresh event loop owned by this thread,
/// returning its result. This is the crate's single entry point.
#[track_caller]
pub fn run<T>(body: impl Future<Output = AsyncResult<T>> + 'static) -> AsyncResult<T>
where
    T: Clone + 'static,
{
    let event_loop = EventLoop::new()?;
    let previous = CURRENT.with(|c| c.borrow_mut().replace(event_loop.clone()));
    let _guard = InstallGuard(previous);

    let root = crate::task::spawn(body);
    let result_future = root.future();

    loop {
        event_loop.drain_ready_work();

        if let Some(result) = result_future.try_result() {
            event_loop.stop();
            return result;
        }

        let timeout = match event_loop.next_deadline() {
            Some(deadline) => Some(deadline.saturating_duration_since(Instant::now())),
            None if event_loop.inner.tasks.borrow().is_empty() => Some(Duration::from_millis(0)),
            None => None,
        };

        event_loop.poll_io(timeout);
        event_loop.fire_expired_timers();
        event_loop.drain_pending_threads();
        event_loop.poll_bridges();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_returns_root_result() {
        let result = run(async { Ok::<_, Error>(42) });
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn post_runs_between_turns_not_inline() {
        let result = run(async {
            let flag = Rc::new(Cell::new(false));
            let f = flag.clone();
            EventLoop::current()
                .post(Box::new(move || f.set(true)))
                .unwrap();
            assert!(!flag.get(), "post() must not run its callback inline");
            crate::time::yield_now().await;
            assert!(flag.get());
            Ok::<_, Error>(())
        });
        result.unwrap();
    }
}
