use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::buf::IoBufs;
use crate::error::{Error, Result, timed_out};
use crate::socket::Socket;
use crate::sync::Mutex;

/// Final report of [`Socket::send_all`] or [`Socket::recv_all`].
#[derive(Debug)]
pub struct AllOutcome {
  /// Bytes moved before the transfer finished or failed.
  pub transferred: usize,
  /// `Ok` once every requested byte moved. Otherwise the first error:
  /// `ETIMEDOUT` when the budget ran out, `UnexpectedEof` when the peer shut
  /// down mid-receive, `WriteZero` when a send made no progress.
  pub result: io::Result<()>,
  /// The buffers, cursor advanced by `transferred`. `None` when they were
  /// still held by an operation that timed out or could not be resubmitted.
  pub bufs: Option<IoBufs>,
}

#[derive(Debug, Clone, Copy)]
enum Kind {
  Send,
  Recv,
}

struct Transfer<F> {
  socket: Socket,
  kind: Kind,
  total: usize,
  started: Instant,
  budget: Duration,
  transferred: AtomicUsize,
  callback: Mutex<Option<F>>,
}

impl<F> Transfer<F>
where
  F: FnOnce(AllOutcome) + Send + 'static,
{
  /// Submits one guarded operation over what is left of `bufs`.
  fn step(self: &Arc<Self>, bufs: IoBufs, budget: Duration) -> Result<()> {
    let next = self.clone();
    let on_step = move |res: io::Result<usize>, bufs: Option<IoBufs>| {
      next.advance(res, bufs)
    };
    trace!(kind = ?self.kind, left = bufs.remaining(), "transfer step");
    match self.kind {
      Kind::Send => self.socket.send_v_timeout(bufs, budget, on_step),
      Kind::Recv => self.socket.recv_v_timeout(bufs, budget, on_step),
    }
  }

  fn advance(self: Arc<Self>, res: io::Result<usize>, bufs: Option<IoBufs>) {
    let (n, mut bufs) = match (res, bufs) {
      (Ok(n), Some(bufs)) => (n, bufs),
      (Err(err), bufs) => return self.finish(Err(err), bufs),
      (Ok(_), None) => return self.finish(Err(timed_out()), None),
    };

    if n == 0 {
      let err = match self.kind {
        Kind::Send => io::ErrorKind::WriteZero,
        Kind::Recv => io::ErrorKind::UnexpectedEof,
      };
      return self.finish(Err(err.into()), Some(bufs));
    }

    bufs.advance(n);
    let transferred = self.transferred.fetch_add(n, Ordering::AcqRel) + n;
    if transferred >= self.total {
      return self.finish(Ok(()), Some(bufs));
    }

    let left = self.budget.saturating_sub(self.started.elapsed());
    if left.is_zero() {
      return self.finish(Err(timed_out()), Some(bufs));
    }
    if let Err(err) = self.step(bufs, left) {
      self.finish(Err(err.into()), None);
    }
  }

  fn finish(&self, result: io::Result<()>, bufs: Option<IoBufs>) {
    let transferred = self.transferred.load(Ordering::Acquire);
    debug!(
      kind = ?self.kind,
      transferred,
      total = self.total,
      ok = result.is_ok(),
      "transfer finished"
    );
    let callback = self.callback.lock().take();
    if let Some(callback) = callback {
      callback(AllOutcome { transferred, result, bufs });
    }
  }
}

/// Whole-buffer transfers.
///
/// The requested length is [`IoBufs::remaining`] at the call. Guarded
/// vectored operations are chained over the unconsumed suffix until every
/// byte has moved, an operation fails, a receive returns 0 or `timeout`
/// (measured from this call) elapses. The callback runs exactly once, never
/// inside this call.
///
/// Submission errors of the first operation are returned here and the
/// callback is dropped. Later ones end the transfer through the callback.
impl Socket {
  pub fn send_all<F>(
    &self,
    bufs: IoBufs,
    timeout: Duration,
    callback: F,
  ) -> Result<()>
  where
    F: FnOnce(AllOutcome) + Send + 'static,
  {
    self.transfer_all(Kind::Send, bufs, timeout, callback)
  }

  pub fn recv_all<F>(
    &self,
    bufs: IoBufs,
    timeout: Duration,
    callback: F,
  ) -> Result<()>
  where
    F: FnOnce(AllOutcome) + Send + 'static,
  {
    self.transfer_all(Kind::Recv, bufs, timeout, callback)
  }

  fn transfer_all<F>(
    &self,
    kind: Kind,
    bufs: IoBufs,
    timeout: Duration,
    callback: F,
  ) -> Result<()>
  where
    F: FnOnce(AllOutcome) + Send + 'static,
  {
    let total = bufs.remaining();
    if total == 0 {
      if self.is_closed() {
        return Err(Error::Closed);
      }
      let outcome = AllOutcome { transferred: 0, result: Ok(()), bufs: Some(bufs) };
      self.inner().shared.defer(Box::new(move || callback(outcome)));
      return Ok(());
    }

    let transfer = Arc::new(Transfer {
      socket: self.clone(),
      kind,
      total,
      started: Instant::now(),
      budget: timeout,
      transferred: AtomicUsize::new(0),
      callback: Mutex::new(Some(callback)),
    });
    transfer.step(bufs, timeout)
  }
}
