//! The error taxonomy shared by every public API in this crate.
//!
//! Futures never panic or unwind to report failure: they resolve with
//! `Err(Error)`. The variants below are grouped the same way the original
//! design groups them (IO / lifecycle / task / time / channel / system).
//!
//! `Error` is `Clone` because every `Promise<T, E>` in this crate (it
//! defaults to `E = Error`) fans a single terminal value out to many
//! observers, each getting its own owned copy. `io::Error` itself isn't
//! `Clone`, so the IO variant holds an `Arc<io::Error>` instead of the
//! bare error - cheap to clone, `Send + Sync` like the rest of this enum
//! needs to be for the worker-thread bridge in `worker.rs`/`channel.rs`.

use std::io;
use std::sync::Arc;

/// Crate-wide result alias.
pub type AsyncResult<T> = Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    // -- IO --
    #[error("end of file")]
    IoEof,
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("device or resource busy")]
    DeviceOrResourceBusy,

    // -- Lifecycle --
    #[error("resource destroyed")]
    ResourceDestroyed,

    // -- Task / cancellation --
    #[error("cancelled")]
    Cancelled,
    #[error("operation will be done, cancellation has no effect")]
    WillBeDone,
    #[error("frame is locked, cancellation refused")]
    Locked,
    #[error("this await point does not support cancellation")]
    CancellationNotSupported,

    // -- Time --
    #[error("deadline elapsed")]
    Elapsed,

    // -- Channel --
    #[error("channel full")]
    Full,
    #[error("channel empty")]
    Empty,
    #[error("channel disconnected")]
    Disconnected,

    // -- System passthrough --
    #[error("io error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl Error {
    /// Whether this error represents an interrupted-but-cancellable await
    /// that the caller may want to treat as expected control flow rather
    /// than a hard failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
