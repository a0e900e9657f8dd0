use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tracing::trace;

use crate::buf::IoBufs;
use crate::error::{Result, timed_out};
use crate::socket::Socket;
use crate::sync::Mutex;
use crate::timeout::Timeout;

/// Submitted, timer not armed yet.
const INIT: u8 = 0;
/// Timer armed.
const START: u8 = 1;
/// The operation won.
const DONE: u8 = 2;
/// The timer won.
const TIMEOUT: u8 = 3;

/// Decides which of the operation and its timer reports to the caller.
struct Guard<B, F> {
  status: AtomicU8,
  timer: Timeout,
  callback: Mutex<Option<F>>,
  _buf: std::marker::PhantomData<fn(B)>,
}

impl<B, F> Guard<B, F>
where
  B: Send + 'static,
  F: FnOnce(io::Result<usize>, Option<B>) + Send + 'static,
{
  fn new(socket: &Socket, callback: F) -> Arc<Self> {
    Arc::new(Self {
      status: AtomicU8::new(INIT),
      timer: socket.reactor().timers().timeout(),
      callback: Mutex::new(Some(callback)),
      _buf: std::marker::PhantomData,
    })
  }

  fn deliver(&self, res: io::Result<usize>, buf: Option<B>) {
    let callback = self.callback.lock().take();
    if let Some(callback) = callback {
      callback(res, buf);
    }
  }

  /// Arms the timer after a successful submission, unless the operation
  /// already finished.
  fn arm(self: &Arc<Self>, timeout: Duration) {
    if self
      .status
      .compare_exchange(INIT, START, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return;
    }

    let guard = self.clone();
    if let Err(err) = self.timer.start(timeout, move || guard.expire()) {
      // Too far in the future to represent: the operation alone decides.
      trace!(%err, "guard timer not armed");
      return;
    }
    // The operation may have won between the transition and the start.
    if self.status.load(Ordering::Acquire) != START {
      self.timer.stop();
    }
  }

  fn complete(&self, res: io::Result<usize>, buf: B) {
    let won = self.status.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
      (s != TIMEOUT).then_some(DONE)
    });
    match won {
      Ok(prev) => {
        if prev == START {
          self.timer.stop();
        }
        self.deliver(res, Some(buf));
      }
      // Already reported as timed out; the buffer goes down with the op.
      Err(_) => trace!("completion after timeout suppressed"),
    }
  }

  fn expire(&self) {
    if self
      .status
      .compare_exchange(START, TIMEOUT, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
    {
      trace!("guarded operation timed out");
      self.deliver(Err(timed_out()), None);
    }
  }
}

/// Timeout-guarded variants.
///
/// The callback runs exactly once: with the operation's own result and its
/// buffer, or with `ETIMEDOUT` and no buffer if `timeout` elapsed first. A
/// timed-out operation stays in flight (its slot stays busy) until the kernel
/// completes it or the socket is destroyed; its result is then discarded.
///
/// Expiry is observed by [`TimerRegistry::process`](crate::TimerRegistry::process)
/// on the socket's reactor.
impl Socket {
  pub fn send_timeout<F>(
    &self,
    buf: Vec<u8>,
    timeout: Duration,
    callback: F,
  ) -> Result<()>
  where
    F: FnOnce(io::Result<usize>, Option<Vec<u8>>) + Send + 'static,
  {
    let guard = Guard::new(self, callback);
    let op = guard.clone();
    self.send(buf, move |res, buf| op.complete(res, buf))?;
    guard.arm(timeout);
    Ok(())
  }

  pub fn recv_timeout<F>(
    &self,
    buf: Vec<u8>,
    timeout: Duration,
    callback: F,
  ) -> Result<()>
  where
    F: FnOnce(io::Result<usize>, Option<Vec<u8>>) + Send + 'static,
  {
    let guard = Guard::new(self, callback);
    let op = guard.clone();
    self.recv(buf, move |res, buf| op.complete(res, buf))?;
    guard.arm(timeout);
    Ok(())
  }

  pub fn send_v_timeout<F>(
    &self,
    bufs: IoBufs,
    timeout: Duration,
    callback: F,
  ) -> Result<()>
  where
    F: FnOnce(io::Result<usize>, Option<IoBufs>) + Send + 'static,
  {
    let guard = Guard::new(self, callback);
    let op = guard.clone();
    self.send_v(bufs, move |res, bufs| op.complete(res, bufs))?;
    guard.arm(timeout);
    Ok(())
  }

  pub fn recv_v_timeout<F>(
    &self,
    bufs: IoBufs,
    timeout: Duration,
    callback: F,
  ) -> Result<()>
  where
    F: FnOnce(io::Result<usize>, Option<IoBufs>) + Send + 'static,
  {
    let guard = Guard::new(self, callback);
    let op = guard.clone();
    self.recv_v(bufs, move |res, bufs| op.complete(res, bufs))?;
    guard.arm(timeout);
    Ok(())
  }
}
