use std::fmt;
use std::process;
use std::sync::Arc;

use log::Level;

use crate::key::KeyKind;

/// Errors raised by map and region operations.
///
/// A missing key is never an error; lookups report it as `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Reservation, commit or reallocation of `bytes` failed.
    AllocFailed { bytes: usize },
    /// A key of `len` bytes was presented to a map bound to `expected`.
    KeyMismatch { expected: KeyKind, len: usize },
    /// Fixed-width keys must be 1 to 8 bytes wide.
    UnsupportedKeyWidth { width: u8 },
    /// A growth step would exceed the configured budget.
    CapacityExceeded { requested: usize, limit: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::AllocFailed { bytes } => write!(f, "allocation of {} bytes failed", bytes),
            Error::KeyMismatch { expected, len } => {
                write!(f, "key is not the correct size: got {} bytes for a {}", len, expected)
            }
            Error::UnsupportedKeyWidth { width } => {
                write!(f, "unsupported fixed key width {} (must be 1..=8)", width)
            }
            Error::CapacityExceeded { requested, limit } => {
                write!(f, "max size exceeded: {} requested, limit is {}", requested, limit)
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Receives every error an infallible map operation cannot return.
///
/// Handlers must not return: they either terminate the process or unwind.
/// Each map carries its own handler, see [`Config::error_handler`].
///
/// [`Config::error_handler`]: ../struct.Config.html#method.error_handler
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, err: Error) -> !;
}

/// Logs the error and aborts the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortHandler;

impl ErrorHandler for AbortHandler {
    fn handle(&self, err: Error) -> ! {
        report(&err);
        process::abort()
    }
}

/// Writes `err` to the log, or to stderr when no logger takes errors.
fn report(err: &Error) -> bool {
    if log_enabled!(Level::Error) {
        error!("dmap: {}", err);
        true
    } else {
        eprintln!("dmap: {}", err);
        false
    }
}

impl<H: ErrorHandler + ?Sized> ErrorHandler for Arc<H> {
    fn handle(&self, err: Error) -> ! {
        (**self).handle(err)
    }
}

/// Logs the error and panics, so callers can recover with `catch_unwind`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PanicHandler;

impl ErrorHandler for PanicHandler {
    fn handle(&self, err: Error) -> ! {
        error!("dmap: {}", err);
        panic!("dmap: {}", err)
    }
}
