//! The socket handle.
//!
//! A [`Socket`] wraps one OS socket registered with a [`Reactor`]. It carries
//! two slots (read and write), each holding at most one in-flight
//! operation, and an explicit reference count: the creator holds one
//! reference, every accepted submission holds one until its callback has
//! returned. The release that brings the count to zero detaches the socket
//! from the backend, closes it when owned and runs the `ondestroy`
//! callback, all exactly once.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::{debug, trace};

use crate::RawSock;
use crate::backends::{IoBackend, Registration};
use crate::buf::IoBufs;
use crate::error::{Error, Result};
use crate::op::{self, Direction, Operation};
use crate::reactor::{Reactor, Shared};
use crate::sync::Mutex;

mod slot;

use slot::Slot;

type OnDestroy = Box<dyn FnOnce() + Send>;

pub(crate) struct SocketInner {
  raw: RawSock,
  own: bool,
  refs: AtomicUsize,
  closed: AtomicBool,
  finalized: AtomicBool,
  read: Slot,
  write: Slot,
  ondestroy: Mutex<Option<OnDestroy>>,
  pub(crate) reg: Registration,
  pub(crate) shared: Arc<Shared>,
}

impl SocketInner {
  pub(crate) fn new(
    raw: RawSock,
    own: bool,
    reg: Registration,
    shared: Arc<Shared>,
  ) -> Self {
    Self {
      raw,
      own,
      refs: AtomicUsize::new(1),
      closed: AtomicBool::new(false),
      finalized: AtomicBool::new(false),
      read: Slot::new(),
      write: Slot::new(),
      ondestroy: Mutex::new(None),
      reg,
      shared,
    }
  }

  pub(crate) fn raw(&self) -> RawSock {
    self.raw
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  fn slot(&self, dir: Direction) -> &Slot {
    match dir {
      Direction::Read => &self.read,
      Direction::Write => &self.write,
    }
  }

  /// Takes a reference for a new submission. Fails once the handle is
  /// closed or already finalized.
  fn acquire(&self) -> Result<()> {
    if self.is_closed() {
      return Err(Error::Closed);
    }
    self
      .refs
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
        (n != 0).then_some(n + 1)
      })
      .map_err(|_| Error::Closed)?;

    // `destroy` may have raced in between the two checks.
    if self.is_closed() {
      self.release();
      return Err(Error::Closed);
    }
    Ok(())
  }

  fn release(&self) {
    if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
      self.finalize();
    }
  }

  fn finalize(&self) {
    if self.finalized.swap(true, Ordering::AcqRel) {
      return;
    }
    self.shared.backend.detach(self.raw, &self.reg);
    if self.own {
      close_raw(self.raw);
    }
    debug!(socket = ?self.raw, own = self.own, "finalized");

    let ondestroy = self.ondestroy.lock().take();
    if let Some(ondestroy) = ondestroy {
      ondestroy();
    }
  }

  /// Delivers `res` for an operation the backend accepted earlier.
  pub(crate) fn complete(&self, op: Box<dyn Operation>, res: io::Result<usize>) {
    let dir = op.direction();
    trace!(socket = ?self.raw, op = op.name(), ok = res.is_ok(), "complete");

    // Free the slot first so the callback can submit the next operation.
    self.slot(dir).release();
    op.complete(res);
    self.release();
  }
}

impl Drop for SocketInner {
  fn drop(&mut self) {
    // Every `Socket` was dropped without `destroy`.
    if !*self.finalized.get_mut() {
      self.shared.backend.detach(self.raw, &self.reg);
      if self.own {
        close_raw(self.raw);
      }
    }
  }
}

#[cfg(unix)]
fn close_raw(raw: RawSock) {
  if let Err(err) = syscall!(close(raw)) {
    tracing::warn!(socket = raw, %err, "close failed");
  }
}

#[cfg(windows)]
fn close_raw(raw: RawSock) {
  if let Err(err) = wsa_call!(closesocket(raw as usize)) {
    tracing::warn!(socket = raw, %err, "closesocket failed");
  }
}

/// Shuts both directions down so that blocked peers and pending readiness
/// waits observe the close. Errors such as `ENOTCONN` are expected for
/// listeners and datagram sockets.
#[cfg(unix)]
fn shutdown_raw(raw: RawSock) {
  let _ = syscall!(shutdown(raw, libc::SHUT_RDWR));
}

#[cfg(windows)]
fn shutdown_raw(raw: RawSock) {
  use windows_sys::Win32::Networking::WinSock::SD_BOTH;
  let _ = wsa_call!(shutdown(raw as usize, SD_BOTH));
}

/// Receives need somewhere to put at least one byte.
fn check_room(room: usize) -> Result<()> {
  if room == 0 {
    return Err(
      io::Error::new(io::ErrorKind::InvalidInput, "receive buffer has no room")
        .into(),
    );
  }
  Ok(())
}

/// A socket registered with a [`Reactor`].
///
/// Cloning is cheap and every clone refers to the same handle. Operations
/// take ownership of their buffers and give them back in the callback.
/// Callbacks run on whichever thread calls [`Reactor::process`] and
/// observes the completion, never inside the submitting call.
///
/// Submission errors are returned directly and the callback is then
/// dropped without being called.
#[derive(Clone)]
pub struct Socket {
  inner: Arc<SocketInner>,
}

impl fmt::Debug for Socket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Socket")
      .field("raw", &self.inner.raw)
      .field("own", &self.inner.own)
      .field("closed", &self.inner.is_closed())
      .field("reading", &self.inner.read.is_busy())
      .field("writing", &self.inner.write.is_busy())
      .finish()
  }
}

impl Socket {
  pub(crate) fn from_inner(inner: Arc<SocketInner>) -> Self {
    Self { inner }
  }

  pub(crate) fn inner(&self) -> &Arc<SocketInner> {
    &self.inner
  }

  /// The wrapped OS socket.
  pub fn raw(&self) -> RawSock {
    self.inner.raw
  }

  /// `true` once [`Socket::destroy`] has been called.
  pub fn is_closed(&self) -> bool {
    self.inner.is_closed()
  }

  /// The reactor this socket is registered with.
  pub fn reactor(&self) -> Reactor {
    Reactor::from_shared(self.inner.shared.clone())
  }

  /// Begins teardown.
  ///
  /// Marks the handle closed, shuts the socket down and cancels pending
  /// operations; their callbacks still run, with `ECANCELED`
  /// (`ERROR_OPERATION_ABORTED` on Windows). Once the last of them has
  /// returned, the socket is closed (if owned) and `ondestroy` runs. Never
  /// blocks.
  ///
  /// Returns [`Error::Closed`] if the handle was already destroyed.
  pub fn destroy<F>(&self, ondestroy: F) -> Result<()>
  where
    F: FnOnce() + Send + 'static,
  {
    let inner = &self.inner;
    if inner.closed.swap(true, Ordering::AcqRel) {
      return Err(Error::Closed);
    }
    debug!(socket = ?inner.raw, "destroy");

    *inner.ondestroy.lock() = Some(Box::new(ondestroy));
    shutdown_raw(inner.raw);
    inner.shared.backend.cancel(&inner.shared, inner);
    inner.release();
    Ok(())
  }

  fn submit(&self, op: Box<dyn Operation>) -> Result<()> {
    let inner = &self.inner;
    let dir = op.direction();

    inner.acquire()?;
    if !inner.slot(dir).claim() {
      inner.release();
      return Err(Error::Busy);
    }

    if let Err(err) = inner.shared.backend.submit(&inner.shared, inner, op) {
      inner.slot(dir).release();
      inner.release();
      return Err(err.into());
    }
    Ok(())
  }

  /// Accepts one connection. The callback receives the new socket (not yet
  /// registered with any reactor) and the peer address.
  pub fn accept<F>(&self, callback: F) -> Result<()>
  where
    F: FnOnce(io::Result<(RawSock, SocketAddr)>) + Send + 'static,
  {
    self.submit(Box::new(op::Accept::new(callback)))
  }

  /// Connects a stream socket to `addr`. Immediate refusals (bad address,
  /// unreachable network) are returned here; everything else is reported to
  /// the callback.
  pub fn connect<F>(&self, addr: SocketAddr, callback: F) -> Result<()>
  where
    F: FnOnce(io::Result<()>) + Send + 'static,
  {
    self.submit(Box::new(op::Connect::new(addr, callback)))
  }

  /// Sends the contents of `buf`. The count may be short.
  pub fn send<F>(&self, buf: Vec<u8>, callback: F) -> Result<()>
  where
    F: FnOnce(io::Result<usize>, Vec<u8>) + Send + 'static,
  {
    self.submit(Box::new(op::Send::new(buf, callback)))
  }

  /// Receives into the spare capacity of `buf`; its length is set to the
  /// number of bytes received. `Ok(0)` means the peer shut down.
  ///
  /// A buffer with no capacity is rejected with
  /// [`io::ErrorKind::InvalidInput`], since its result could not be told
  /// apart from a shutdown.
  pub fn recv<F>(&self, buf: Vec<u8>, callback: F) -> Result<()>
  where
    F: FnOnce(io::Result<usize>, Vec<u8>) + Send + 'static,
  {
    check_room(buf.capacity())?;
    self.submit(Box::new(op::Recv::new(buf, callback)))
  }

  /// Gathering send of the bytes after the cursor of `bufs`. The cursor is
  /// not moved.
  pub fn send_v<F>(&self, bufs: IoBufs, callback: F) -> Result<()>
  where
    F: FnOnce(io::Result<usize>, IoBufs) + Send + 'static,
  {
    self.submit(Box::new(op::Send::new(bufs, callback)))
  }

  /// Scattering receive into the bytes after the cursor of `bufs`. The
  /// cursor is not moved.
  pub fn recv_v<F>(&self, bufs: IoBufs, callback: F) -> Result<()>
  where
    F: FnOnce(io::Result<usize>, IoBufs) + Send + 'static,
  {
    check_room(bufs.remaining())?;
    self.submit(Box::new(op::Recv::new(bufs, callback)))
  }

  /// Sends one datagram to `target`.
  pub fn send_to<F>(
    &self,
    buf: Vec<u8>,
    target: SocketAddr,
    callback: F,
  ) -> Result<()>
  where
    F: FnOnce(io::Result<usize>, Vec<u8>) + Send + 'static,
  {
    self.submit(Box::new(op::SendTo::new(buf, target, callback)))
  }

  /// Receives one datagram into the spare capacity of `buf`, along with its
  /// sender.
  ///
  /// On a connected stream socket this behaves like [`Socket::recv`] and
  /// reports the peer address; the address is `None` when it cannot be
  /// determined.
  pub fn recv_from<F>(&self, buf: Vec<u8>, callback: F) -> Result<()>
  where
    F: FnOnce(io::Result<(usize, Option<SocketAddr>)>, Vec<u8>)
      + Send
      + 'static,
  {
    check_room(buf.capacity())?;
    self.submit(Box::new(op::RecvFrom::new(buf, callback)))
  }

  pub fn send_to_v<F>(
    &self,
    bufs: IoBufs,
    target: SocketAddr,
    callback: F,
  ) -> Result<()>
  where
    F: FnOnce(io::Result<usize>, IoBufs) + Send + 'static,
  {
    self.submit(Box::new(op::SendTo::new(bufs, target, callback)))
  }

  pub fn recv_from_v<F>(&self, bufs: IoBufs, callback: F) -> Result<()>
  where
    F: FnOnce(io::Result<(usize, Option<SocketAddr>)>, IoBufs)
      + Send
      + 'static,
  {
    check_room(bufs.remaining())?;
    self.submit(Box::new(op::RecvFrom::new(bufs, callback)))
  }
}
