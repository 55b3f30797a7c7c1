//! A bounded, FIFO, multi-producer multi-consumer channel.
//!
//! Not modelled on a single `original_source` file - that codebase builds
//! its pipe/stream transports directly on libuv handles - but grounded on
//! the same `Promise` wait-queue idiom as [`crate::sync`], generalized to a
//! ring buffer with two wait queues (one per direction). `try_*` never
//! suspends; `send_sync`/`receive_sync`
//! on a [`SyncChannel`] block the calling OS thread by parking on a condvar
//! that a bridge poller on the loop thread wakes via the shared
//! cross-thread waker (see [`crate::event_loop::EventLoop::thread_waker`]).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::{mpsc, Arc, Condvar, Mutex as StdMutex};

use crate::cancellable::Cancellable;
use crate::error::{AsyncResult, Error};
use crate::event_loop::EventLoop;
use crate::frame::Framed;
use crate::promise::Promise;

struct Inner<T> {
    buffer: VecDeque<T>,
    capacity: usize,
    closed: bool,
    send_waiters: VecDeque<Promise<(), Error>>,
    recv_waiters: VecDeque<Promise<(), Error>>,
}

/// The sending half's state and the receiving half's state are the same
/// `Inner`; `Sender`/`Receiver` just control which queue a clone waits on.
struct Shared<T> {
    inner: RefCell<Inner<T>>,
}

/// A bounded channel of capacity `capacity`. Cloning shares the same
/// buffer - every clone is both a producer and a consumer, matching
/// "multi-producer multi-consumer" channel.
#[derive(Clone)]
pub struct Channel<T> {
    shared: Rc<Shared<T>>,
}

impl<T: 'static> Channel<T> {
    pub fn new(capacity: usize) -> Self {
        Channel {
            shared: Rc::new(Shared {
                inner: RefCell::new(Inner {
                    buffer: VecDeque::with_capacity(capacity),
                    capacity,
                    closed: false,
                    send_waiters: VecDeque::new(),
                    recv_waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Sends without suspending. Fails `Full` if the buffer has no room,
    /// `Disconnected` if the channel is closed.
    pub fn try_send(&self, value: T) -> AsyncResult<()> {
        let mut inner = self.shared.inner.borrow_mut();
        if inner.closed {
            return Err(Error::Disconnected);
        }
        if inner.buffer.len() >= inner.capacity {
            return Err(Error::Full);
        }
        inner.buffer.push_back(value);
        wake_one(&mut inner.recv_waiters);
        Ok(())
    }

    /// Receives without suspending. Fails `Empty` if nothing is buffered
    /// and the channel is open, `Disconnected` once closed and drained.
    pub fn try_receive(&self) -> AsyncResult<T> {
        let mut inner = self.shared.inner.borrow_mut();
        match inner.buffer.pop_front() {
            Some(value) => {
                wake_one(&mut inner.send_waiters);
                Ok(value)
            }
            None if inner.closed => Err(Error::Disconnected),
            None => Err(Error::Empty),
        }
    }

    /// Sends, suspending while the buffer is full.
    #[track_caller]
    pub async fn send(&self, value: T) -> AsyncResult<()> {
        Framed::new(send_inner(self.shared.clone(), value)).await
    }

    /// Receives, suspending while the buffer is empty and the channel is
    /// still open.
    #[track_caller]
    pub async fn receive(&self) -> AsyncResult<T> {
        Framed::new(receive_inner(self.shared.clone())).await
    }

    /// Closes the channel: idempotent, wakes every waiter on both sides.
    /// Buffered items already sent remain receivable; `receive` only
    /// starts failing `Disconnected` once the buffer is drained.
    pub fn close(&self) {
        let mut inner = self.shared.inner.borrow_mut();
        if inner.closed {
            return;
        }
        inner.closed = true;
        let send_waiters = std::mem::take(&mut inner.send_waiters);
        let recv_waiters = std::mem::take(&mut inner.recv_waiters);
        drop(inner);
        for waiter in send_waiters {
            waiter.resolve(());
        }
        for waiter in recv_waiters {
            waiter.resolve(());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.borrow().closed
    }

    pub fn len(&self) -> usize {
        self.shared.inner.borrow().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.inner.borrow().capacity
    }
}

fn wake_one(waiters: &mut VecDeque<Promise<(), Error>>) {
    if let Some(waiter) = waiters.pop_front() {
        waiter.resolve(());
    }
}

async fn send_inner<T: 'static>(shared: Rc<Shared<T>>, value: T) -> AsyncResult<()> {
    let mut value = value;
    loop {
        {
            let mut inner = shared.inner.borrow_mut();
            if inner.closed {
                return Err(Error::Disconnected);
            }
            if inner.buffer.len() < inner.capacity {
                inner.buffer.push_back(value);
                wake_one(&mut inner.recv_waiters);
                return Ok(());
            }
        }

        let promise: Promise<(), Error> = Promise::new();
        shared.inner.borrow_mut().send_waiters.push_back(promise.clone());
        let fut = promise.future();

        let cancel_shared = shared.clone();
        let cancel_promise = promise.clone();
        Cancellable::new(fut, move || {
            if !cancel_promise.is_pending() {
                return Err(Error::WillBeDone);
            }
            cancel_shared
                .inner
                .borrow_mut()
                .send_waiters
                .retain(|p| !Promise::ptr_eq(p, &cancel_promise));
            cancel_promise.reject(Error::Cancelled);
            Ok(())
        })
        .await?;

        // Woken because either room opened up or the channel closed;
        // either way, loop back and re-check under the lock. `value` was
        // never moved out on this path, so it is still here to retry with.
    }
}

async fn receive_inner<T: 'static>(shared: Rc<Shared<T>>) -> AsyncResult<T> {
    loop {
        {
            let mut inner = shared.inner.borrow_mut();
            if let Some(value) = inner.buffer.pop_front() {
                wake_one(&mut inner.send_waiters);
                return Ok(value);
            }
            if inner.closed {
                return Err(Error::Disconnected);
            }
        }

        let promise: Promise<(), Error> = Promise::new();
        shared.inner.borrow_mut().recv_waiters.push_back(promise.clone());
        let fut = promise.future();

        let cancel_shared = shared.clone();
        let cancel_promise = promise.clone();
        Cancellable::new(fut, move || {
            if !cancel_promise.is_pending() {
                return Err(Error::WillBeDone);
            }
            cancel_shared
                .inner
                .borrow_mut()
                .recv_waiters
                .retain(|p| !Promise::ptr_eq(p, &cancel_promise));
            cancel_promise.reject(Error::Cancelled);
            Ok(())
        })
        .await?;
    }
}

/// A thread-safe mailbox a non-loop OS thread can block on, backed by the
/// loop delivering into it once a bridged operation completes. Used by
/// [`SyncChannel::send_sync`]/[`SyncChannel::receive_sync`] to let code
/// outside the loop interoperate with an `Rc`-based [`Channel`], the same
/// role `original_source`'s blocking APIs play for callers that aren't
/// coroutines.
struct Mailbox<T> {
    state: StdMutex<Option<T>>,
    condvar: Condvar,
}

impl<T> Mailbox<T> {
    fn new() -> Arc<Self> {
        Arc::new(Mailbox {
            state: StdMutex::new(None),
            condvar: Condvar::new(),
        })
    }

    fn deliver(&self, value: T) {
        *self.state.lock().unwrap() = Some(value);
        self.condvar.notify_one();
    }

    fn block_for(&self) -> T {
        let mut guard = self.state.lock().unwrap();
        loop {
            if let Some(value) = guard.take() {
                return value;
            }
            guard = self.condvar.wait(guard).unwrap();
        }
    }
}

/// One pending cross-thread request, carried over an `mpsc::Sender` from
/// whichever thread called [`SyncChannel::send_sync`]/`receive_sync` to the
/// loop's bridge poller.
enum BridgeOp<T> {
    Send(T, Arc<Mailbox<AsyncResult<()>>>),
    Receive(Arc<Mailbox<AsyncResult<T>>>),
}

/// A `Send`-able handle that lets an OS thread not running the loop
/// exchange values with an `Rc`-based [`Channel`] living on it. Obtained
/// from [`Channel::sync_handle`], which must be called on the loop thread
/// (typically right before spawning the other thread) since it registers
/// the bridge poller that [`crate::event_loop::run`] drains every turn.
#[derive(Clone)]
pub struct SyncChannel<T> {
    bridge: mpsc::Sender<BridgeOp<T>>,
    waker: Arc<mio::Waker>,
}

impl<T: Send + Clone + 'static> Channel<T> {
    /// Registers a cross-thread bridge for this channel and returns a
    /// handle usable from any OS thread. Must be called on the loop thread.
    pub fn sync_handle(&self) -> SyncChannel<T> {
        let event_loop = EventLoop::current();
        let waker = event_loop.thread_waker();
        let (bridge_tx, bridge_rx) = mpsc::channel::<BridgeOp<T>>();
        let channel = self.clone();

        event_loop.register_bridge(Box::new(move || {
            while let Ok(op) = bridge_rx.try_recv() {
                match op {
                    BridgeOp::Send(value, reply) => {
                        let c = channel.clone();
                        let task = crate::task::spawn(async move { c.send(value).await });
                        task.future().then(move |result| reply.deliver(result));
                    }
                    BridgeOp::Receive(reply) => {
                        let c = channel.clone();
                        let task = crate::task::spawn(async move { c.receive().await });
                        task.future().then(move |result| reply.deliver(result));
                    }
                }
            }
        }));

        SyncChannel {
            bridge: bridge_tx,
            waker,
        }
    }
}

impl<T: Send + 'static> SyncChannel<T> {
    /// Blocks the calling OS thread until `value` can be sent. Calling this
    /// from the loop thread itself would deadlock it, since the bridge
    /// poller that would service the request only runs between turns of
    /// the very loop this call is blocking.
    pub fn send_sync(&self, value: T) -> AsyncResult<()> {
        let mailbox = Mailbox::new();
        self.bridge
            .send(BridgeOp::Send(value, mailbox.clone()))
            .map_err(|_| Error::Disconnected)?;
        let _ = self.waker.wake();
        mailbox.block_for()
    }

    /// Blocks the calling OS thread until a value is available.
    pub fn receive_sync(&self) -> AsyncResult<T> {
        let mailbox = Mailbox::new();
        self.bridge
            .send(BridgeOp::Receive(mailbox.clone()))
            .map_err(|_| Error::Disconnected)?;
        let _ = self.waker.wake();
        mailbox.block_for()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::run;
    use crate::task::spawn;

    #[test]
    fn try_send_and_try_receive_round_trip() {
        let channel: Channel<i32> = Channel::new(2);
        channel.try_send(1).unwrap();
        channel.try_send(2).unwrap();
        assert!(matches!(channel.try_send(3), Err(Error::Full)));
        assert_eq!(channel.try_receive().unwrap(), 1);
        assert_eq!(channel.try_receive().unwrap(), 2);
        assert!(matches!(channel.try_receive(), Err(Error::Empty)));
    }

    #[test]
    fn send_suspends_until_room_then_receive_drains_in_order() {
        let result = run(async {
            let channel: Channel<i32> = Channel::new(1);
            channel.send(1).await?;

            let c = channel.clone();
            let sender = spawn(async move { c.send(2).await });
            crate::time::yield_now().await;
            assert!(!sender.done(), "buffer is full, send must suspend");

            assert_eq!(channel.receive().await?, 1);
            sender.await?;
            assert_eq!(channel.receive().await?, 2);
            Ok::<_, Error>(())
        });
        result.unwrap();
    }

    #[test]
    fn close_wakes_waiters_and_drains_then_disconnects() {
        let result = run(async {
            let channel: Channel<i32> = Channel::new(1);
            channel.try_send(7).unwrap();

            let c = channel.clone();
            let receiver = spawn(async move {
                let first = c.receive().await?;
                let second = c.receive().await;
                Ok::<_, Error>((first, second))
            });
            crate::time::yield_now().await;
            channel.close();

            let (first, second) = receiver.await?;
            assert_eq!(first, 7);
            assert!(matches!(second, Err(Error::Disconnected)));
            Ok::<_, Error>(())
        });
        result.unwrap();
    }

    #[test]
    fn sync_handle_lets_a_real_os_thread_exchange_values_with_the_loop() {
        let result = run(async {
            let channel: Channel<i32> = Channel::new(1);
            let sync = channel.sync_handle();

            let worker = std::thread::spawn(move || -> AsyncResult<i32> {
                sync.send_sync(42)?;
                sync.receive_sync()
            });

            let received = channel.receive().await?;
            assert_eq!(received, 42);
            channel.send(received * 2).await?;

            Ok::<_, Error>(worker.join().unwrap()?)
        });
        assert_eq!(result.unwrap(), 84);
    }

    #[test]
    fn cancelling_a_suspended_send_removes_the_waiter() {
        let result = run(async {
            let channel: Channel<i32> = Channel::new(1);
            channel.try_send(1).unwrap();

            let c = channel.clone();
            let sender = spawn(async move { c.send(2).await });
            crate::time::yield_now().await;
            sender.cancel().unwrap();
            let outcome = sender.await;
            assert!(matches!(outcome, Err(Error::Cancelled)));
            Ok::<_, Error>(())
        });
        result.unwrap();
    }
}
