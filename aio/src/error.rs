use std::io;

use thiserror::Error;

/// Shorthand for results whose error is [`enum@Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors reported synchronously by submission and lifecycle calls.
///
/// Failures that happen after an operation was accepted are never reported
/// through this type; they arrive as an [`io::Error`] in the operation's
/// callback.
#[derive(Debug, Error)]
pub enum Error {
  /// An operation of the same direction is already in flight on the handle.
  #[error("an operation is already pending in this direction")]
  Busy,

  /// The handle was destroyed.
  #[error("socket handle is closed")]
  Closed,

  /// `Timeout::start` was called on an armed timer.
  #[error("timeout is already armed")]
  Armed,

  /// `aio::init` was called twice without `aio::clean`.
  #[error("reactor is already initialized")]
  AlreadyInit,

  /// A process-wide call was made before `aio::init`.
  #[error("reactor is not initialized")]
  NotInit,

  /// The operating system refused the request.
  #[error("I/O error: {0}")]
  Io(
    #[source]
    #[from]
    io::Error,
  ),
}

impl Error {
  /// The errno (Unix) or WinSock (Windows) code matching this error, the way
  /// a C caller would have seen it.
  pub fn raw_os_error(&self) -> i32 {
    match self {
      Error::Busy => codes::BUSY,
      Error::Closed => codes::CLOSED,
      Error::Armed => codes::ARMED,
      Error::AlreadyInit => codes::ARMED,
      Error::NotInit => codes::NOT_INIT,
      Error::Io(err) => err.raw_os_error().unwrap_or(codes::NOT_INIT),
    }
  }
}

impl From<Error> for io::Error {
  fn from(err: Error) -> io::Error {
    match err {
      Error::Io(err) => err,
      other => io::Error::from_raw_os_error(other.raw_os_error()),
    }
  }
}

/// Completion error of an operation abandoned by `Socket::destroy`.
pub(crate) fn cancelled() -> io::Error {
  io::Error::from_raw_os_error(codes::CANCELLED)
}

/// Completion error of a guarded operation whose deadline passed.
pub(crate) fn timed_out() -> io::Error {
  io::Error::from_raw_os_error(codes::TIMED_OUT)
}

#[cfg(unix)]
mod codes {
  pub const BUSY: i32 = libc::EBUSY;
  pub const CLOSED: i32 = libc::EBADF;
  pub const ARMED: i32 = libc::EALREADY;
  pub const NOT_INIT: i32 = libc::EINVAL;
  pub const CANCELLED: i32 = libc::ECANCELED;
  pub const TIMED_OUT: i32 = libc::ETIMEDOUT;
}

#[cfg(windows)]
mod codes {
  use windows_sys::Win32::Foundation::ERROR_OPERATION_ABORTED;
  use windows_sys::Win32::Networking::WinSock::{
    WSAEALREADY, WSAEBADF, WSAEINPROGRESS, WSAEINVAL, WSAETIMEDOUT,
  };

  pub const BUSY: i32 = WSAEINPROGRESS;
  pub const CLOSED: i32 = WSAEBADF;
  pub const ARMED: i32 = WSAEALREADY;
  pub const NOT_INIT: i32 = WSAEINVAL;
  pub const CANCELLED: i32 = ERROR_OPERATION_ABORTED as i32;
  pub const TIMED_OUT: i32 = WSAETIMEDOUT;
}
