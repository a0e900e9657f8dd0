//! OS backends.
//!
//! Exactly one backend is compiled in, selected by target:
//!
//! | target                         | backend                                  |
//! |--------------------------------|------------------------------------------|
//! | Linux, Android                 | [`readiness::Readiness`] over epoll      |
//! | macOS/iOS, FreeBSD, DragonFly  | [`readiness::Readiness`] over kqueue     |
//! | Windows                        | [`iocp::Iocp`]                           |

use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::RawSock;
use crate::config::Config;
use crate::op::Operation;
use crate::reactor::Shared;
use crate::socket::SocketInner;

#[cfg(unix)]
mod interest;
#[cfg(unix)]
mod readiness;

#[cfg(linux)]
mod epoll;
#[cfg(kqueue)]
mod kqueue;
#[cfg(windows)]
mod iocp;

#[cfg(linux)]
pub(crate) type Backend = readiness::Readiness<epoll::OsPoller>;
#[cfg(kqueue)]
pub(crate) type Backend = readiness::Readiness<kqueue::OsPoller>;
#[cfg(windows)]
pub(crate) type Backend = iocp::Iocp;

#[cfg(not(any(linux, kqueue, windows)))]
compile_error!(
  "aio supports Linux, Android, macOS/iOS, FreeBSD, DragonFly and Windows"
);

/// Per-handle state owned by the compiled-in backend.
pub(crate) type Registration = <Backend as IoBackend>::Registration;

/// What the socket layer needs from an OS backend.
pub(crate) trait IoBackend: Sized + Send + Sync + 'static {
  type Registration: Send + Sync;

  fn new(config: &Config) -> io::Result<Self>;

  /// Puts a freshly wrapped socket into the mode the backend needs
  /// (non-blocking, port association, no SIGPIPE).
  fn prepare(&self, raw: RawSock) -> io::Result<()>;

  /// Creates the per-handle registration. Called once, while the handle is
  /// being constructed.
  fn attach(&self, handle: Weak<SocketInner>) -> Self::Registration;

  /// Drops every kernel-side reference to `raw`. Called once, before an
  /// owned socket is closed.
  fn detach(&self, raw: RawSock, reg: &Self::Registration);

  /// Starts `op` on `handle`.
  ///
  /// `Ok` guarantees `SocketInner::complete` will be called exactly once for
  /// `op`, never from inside this call. `Err` guarantees it never will.
  fn submit(
    &self,
    shared: &Shared,
    handle: &Arc<SocketInner>,
    op: Box<dyn Operation>,
  ) -> io::Result<()>;

  /// Forces every outstanding operation on `handle` to complete with the
  /// cancellation error. The handle is already marked closed.
  fn cancel(&self, shared: &Shared, handle: &Arc<SocketInner>);

  /// Waits up to `timeout` (`None` = forever) and dispatches whatever the
  /// kernel reported. Returns the number of native events handled, wakeups
  /// included; `0` means the wait returned empty.
  fn poll(&self, shared: &Shared, timeout: Option<Duration>)
  -> io::Result<usize>;

  /// Wakes one thread blocked in [`IoBackend::poll`].
  fn notify(&self) -> io::Result<()>;
}
