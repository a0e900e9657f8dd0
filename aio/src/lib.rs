#![allow(private_bounds)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # aio - callback-driven socket I/O
//!
//! `aio` runs accept, connect, send and receive operations on non-blocking
//! sockets and reports each result through a callback. One contract covers
//! both the readiness model (epoll, kqueue) and the completion model (IOCP).
//!
//! ## Platform support
//!
//! | Platform                   | Mechanism | Status |
//! |----------------------------|-----------|--------|
//! | Linux, Android             | epoll     | Yes    |
//! | macOS, FreeBSD, DragonFly  | kqueue    | Yes    |
//! | Windows                    | IOCP      | Yes    |
//!
//! ## Model
//!
//! - The library owns no threads. Callers run workers that loop over
//!   [`Reactor::process`] and [`TimerRegistry::process`]; callbacks run on
//!   whichever worker observed the completion.
//! - Each [`Socket`] has a read slot (accept, recv, recv_from) and a write
//!   slot (send, send_to, connect), each holding one operation at a time.
//!   A second submission into a busy slot fails with [`Error::Busy`].
//! - A submission that returns `Ok` gets exactly one callback. One that
//!   returns `Err` gets none.
//! - Buffers are moved in and handed back in the callback.
//! - [`Socket::destroy`] never blocks: pending operations complete with a
//!   cancellation error and the `ondestroy` callback runs after the last of
//!   them.
//!
//! On top of single operations, `*_timeout` variants race the operation
//! against a [`Timeout`], and [`Socket::send_all`] / [`Socket::recv_all`]
//! repeat until a whole [`IoBufs`] has moved.
//!
//! ## Quick start
//!
//! ```no_run
//! # #[cfg(unix)]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use std::os::fd::IntoRawFd;
//! use std::time::Duration;
//!
//! let reactor = aio::Reactor::new(aio::Config::new())?;
//! let stream = std::net::TcpStream::connect("127.0.0.1:8080")?;
//! let socket = reactor.create(stream.into_raw_fd(), true)?;
//!
//! socket.recv(Vec::with_capacity(1024), |res, buf| match res {
//!   Ok(0) => println!("peer closed"),
//!   Ok(n) => println!("got {n} bytes: {:?}", &buf[..n]),
//!   Err(err) => eprintln!("recv failed: {err}"),
//! })?;
//!
//! loop {
//!   reactor.process(Duration::from_millis(100))?;
//!   reactor.timers().process();
//! }
//! # }
//! # #[cfg(not(unix))]
//! # fn main() {}
//! ```
//!
//! ## Errors
//!
//! Submission and lifecycle calls return [`Result`] with [`enum@Error`].
//! Failures after submission arrive in the callback as [`std::io::Error`];
//! an orderly peer shutdown is `Ok(0)`, not an error.

#[macro_use]
mod macros;

mod backends;
pub mod buf;
mod compose;
mod config;
mod driver;
mod error;
mod net_utils;
mod op;
mod reactor;
mod socket;
#[cfg(unix)]
mod store;
mod sync;
mod timeout;

pub use buf::{BufResult, IoBuf, IoBufs, MAX_SLICES};
pub use compose::AllOutcome;
pub use config::Config;
pub use driver::{
  clean, create, init, init_with, process, reactor, timeout_process,
};
pub use error::{Error, Result};
pub use reactor::Reactor;
pub use socket::Socket;
pub use timeout::{Timeout, TimerRegistry};

/// The raw OS socket type wrapped by a [`Socket`].
#[cfg(unix)]
pub type RawSock = std::os::fd::RawFd;
/// The raw OS socket type wrapped by a [`Socket`].
#[cfg(windows)]
pub type RawSock = std::os::windows::io::RawSocket;

mod private {
  /// One contiguous piece of a buffer, as handed to the kernel.
  #[derive(Clone, Copy, Debug)]
  pub struct Region {
    pub ptr: *mut u8,
    pub len: usize,
  }

  /// Buffer layout as seen by the operations. Keeps [`crate::IoBuf`]
  /// sealed.
  pub trait BufRegions {
    /// Regions holding the bytes to send.
    fn send_regions(&self, out: &mut Vec<Region>);

    /// Regions the kernel may fill.
    fn recv_regions(&mut self, out: &mut Vec<Region>);

    /// Called once with the byte count of a successful receive.
    fn received(&mut self, bytes: usize);
  }
}
