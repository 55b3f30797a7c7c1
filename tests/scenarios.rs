//! End-to-end scenarios exercising the runtime as a whole, one per item
//! in the seed scenario list: promise observer ordering, cancelling a
//! sleep, mutex fairness across several waiters, timeout's two outcomes,
//! a channel drained after close, and a race between a timer and a
//! delivered signal.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use asyncio::sync::Mutex;
use asyncio::{run, signal_on, sleep, spawn, timeout, Channel, Error, Promise};

#[test]
fn promise_observers_fire_in_registration_order_on_a_later_turn() {
    run(async {
        let promise: Promise<i32, Error> = Promise::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let a = order.clone();
        promise.future().then(move |_| a.borrow_mut().push('a'));
        let b = order.clone();
        promise.future().then(move |_| b.borrow_mut().push('b'));

        promise.resolve(42);
        assert!(order.borrow().is_empty(), "observers must not fire synchronously");

        asyncio::yield_now().await;
        assert_eq!(*order.borrow(), vec!['a', 'b']);
        Ok::<_, Error>(())
    })
    .unwrap();
}

#[test]
fn cancelling_a_sleep_resolves_cancelled_and_the_loop_still_finishes_ok() {
    let result = run(async {
        let task = spawn(async { sleep(Duration::from_millis(50)).await });
        asyncio::yield_now().await;
        task.cancel().unwrap();
        let outcome = task.await;
        assert!(matches!(outcome, Err(Error::Cancelled)));
        Ok::<_, Error>(())
    });
    assert!(result.is_ok());
}

#[test]
fn mutex_wakes_three_waiters_in_fifo_order_one_unlock_at_a_time() {
    run(async {
        let mutex = Mutex::new();
        mutex.lock().await?;

        let order = Rc::new(RefCell::new(Vec::new()));
        let mut waiters = Vec::new();
        for id in 1..=3 {
            let m = mutex.clone();
            let o = order.clone();
            waiters.push(spawn(async move {
                m.lock().await?;
                assert!(m.locked());
                o.borrow_mut().push(id);
                m.unlock();
                Ok::<_, Error>(())
            }));
            asyncio::yield_now().await;
        }

        for _ in 0..3 {
            mutex.unlock();
            asyncio::yield_now().await;
        }
        for w in waiters {
            w.await?;
        }
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
        Ok::<_, Error>(())
    })
    .unwrap();
}

#[test]
fn timeout_resolves_ok_when_faster_and_elapsed_when_slower() {
    run(async {
        let fast = spawn(async { sleep(Duration::from_millis(10)).await });
        assert!(timeout(fast, Duration::from_millis(100)).await.is_ok());

        let slow = spawn(async { sleep(Duration::from_millis(100)).await });
        let outcome = timeout(slow, Duration::from_millis(10)).await;
        assert!(matches!(outcome, Err(Error::Elapsed)));
        Ok::<_, Error>(())
    })
    .unwrap();
}

#[test]
fn channel_close_drains_buffered_items_then_disconnects() {
    run(async {
        let channel: Channel<i32> = Channel::new(8);
        for v in [1, 2, 3] {
            channel.send(v).await?;
        }
        channel.close();

        assert_eq!(channel.receive().await?, 1);
        assert_eq!(channel.receive().await?, 2);
        assert_eq!(channel.receive().await?, 3);
        assert!(matches!(channel.receive().await, Err(Error::Disconnected)));
        Ok::<_, Error>(())
    })
    .unwrap();
}

#[cfg(unix)]
#[test]
fn racing_a_sleep_against_a_delivered_signal_resolves_on_the_signal_branch() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    // SIGUSR1 is delivered to this test's own process shortly after the
    // race starts; the sleep side loses and is left cancelled.
    let fired = Arc::new(AtomicBool::new(false));
    let fired_for_task = fired.clone();
    let result = run(async move {
        let sleeper = spawn(async { sleep(Duration::from_millis(200)).await });
        let signalled = spawn(async { signal_on(libc_sigusr1()).await });

        let raised = fired_for_task.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            raise_sigusr1();
            raised.store(true, Ordering::SeqCst);
        });

        let signal_outcome = signalled.await;
        assert!(signal_outcome.is_ok());

        sleeper.cancel().ok();
        let sleep_outcome = sleeper.await;
        assert!(matches!(sleep_outcome, Err(Error::Cancelled)));
        Ok::<_, Error>(())
    });
    result.unwrap();
    assert!(fired.load(Ordering::SeqCst));
}

#[cfg(unix)]
fn libc_sigusr1() -> i32 {
    10
}

#[cfg(unix)]
fn raise_sigusr1() {
    extern "C" {
        fn raise(sig: i32) -> i32;
    }
    unsafe {
        raise(libc_sigusr1());
    }
}
