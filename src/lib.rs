//! A single-threaded, cooperative async runtime.
//!
//! Everything here runs on whatever OS thread calls [`run`]: futures are
//! driven by a [`mio`]-backed reactor, tasks are cancellable, and the sync
//! primitives under [`sync`] are FIFO-fair. The one place work genuinely
//! leaves this thread is [`to_thread`], which hands a closure to a small
//! background worker pool and bridges its result back in safely.

mod cancellable;
mod channel;
mod error;
mod event_loop;
mod frame;
mod group;
mod promise;
mod signal;
pub mod sync;
mod task;
mod time;
mod worker;

pub use cancellable::Cancellable;
pub use channel::{Channel, SyncChannel};
pub use error::{AsyncResult, Error};
pub use event_loop::{run, EventLoop};
pub use group::{all_settled, race, JoinGroup, TaskGroup};
pub use promise::{Future, Promise};
pub use signal::signal_on;
pub use task::{spawn, Task};
pub use time::{sleep, timeout, yield_now};
pub use worker::{to_thread, to_thread_cancellable};
