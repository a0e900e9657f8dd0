//! The reactor: one OS backend, its timer registry and the deferred
//! completion queue.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

use crate::RawSock;
use crate::backends::{Backend, IoBackend};
use crate::config::Config;
use crate::error::Result;
use crate::socket::{Socket, SocketInner};
use crate::timeout::TimerRegistry;

/// A completion produced by the reactor itself rather than the kernel.
pub(crate) type Job = Box<dyn FnOnce() + Send>;

pub(crate) struct Shared {
  pub(crate) backend: Backend,
  timers: TimerRegistry,
  jobs_tx: Sender<Job>,
  jobs_rx: Receiver<Job>,
  config: Config,
}

impl Shared {
  /// Queues `job` for the next `process()` call on any thread and wakes a
  /// poller.
  pub(crate) fn defer(&self, job: Job) {
    // Cannot fail: `jobs_rx` lives as long as `self`.
    let _ = self.jobs_tx.send(job);
    if let Err(err) = self.backend.notify() {
      warn!(%err, "failed to wake a poller for deferred work");
    }
  }

  fn run_deferred(&self) -> usize {
    let mut ran = 0;
    while let Ok(job) = self.jobs_rx.try_recv() {
      job();
      ran += 1;
    }
    ran
  }
}

/// Handle to a reactor. Clones share the same backend.
///
/// ```no_run
/// use std::time::Duration;
///
/// let reactor = aio::Reactor::new(aio::Config::new().threads(2))?;
/// let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
/// # #[cfg(unix)]
/// # {
/// use std::os::fd::IntoRawFd;
/// let socket = reactor.create(listener.into_raw_fd(), true)?;
/// socket.accept(|res| println!("accepted: {res:?}"))?;
/// # }
/// reactor.process(Duration::from_millis(100))?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Clone)]
pub struct Reactor {
  shared: Arc<Shared>,
}

impl fmt::Debug for Reactor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Reactor")
      .field("config", &self.shared.config)
      .field("timers", &self.shared.timers)
      .finish()
  }
}

impl Reactor {
  pub fn new(config: Config) -> io::Result<Self> {
    let backend = Backend::new(&config)?;
    let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded();
    debug!(?config, "reactor created");
    Ok(Self {
      shared: Arc::new(Shared {
        backend,
        timers: TimerRegistry::new(),
        jobs_tx,
        jobs_rx,
        config,
      }),
    })
  }

  pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
    Self { shared }
  }

  /// Registers `raw` with this reactor.
  ///
  /// The socket is switched to non-blocking mode (associated with the
  /// completion port on Windows). With `own`, it is closed once the handle
  /// is finalized; otherwise the caller keeps ownership.
  pub fn create(&self, raw: RawSock, own: bool) -> Result<Socket> {
    self.shared.backend.prepare(raw)?;
    let inner = Arc::new_cyclic(|weak| {
      let reg = self.shared.backend.attach(weak.clone());
      SocketInner::new(raw, own, reg, self.shared.clone())
    });
    debug!(socket = ?raw, own, "socket created");
    Ok(Socket::from_inner(inner))
  }

  /// Waits up to `timeout` for completions and runs their callbacks on the
  /// calling thread.
  ///
  /// Returns the number of events handled: kernel events (including
  /// wakeups from [`Reactor::notify`]) plus completions the reactor queued
  /// itself. `0` means the wait timed out (or was interrupted by a signal)
  /// with nothing to do. A positive count does not imply a callback ran,
  /// since a readiness event may only re-arm the socket.
  ///
  /// Safe to call from any number of threads at once.
  pub fn process(&self, timeout: Duration) -> io::Result<usize> {
    let shared = &self.shared;
    let mut ran = shared.run_deferred();
    let wait = if ran > 0 { Duration::ZERO } else { timeout };
    ran += shared.backend.poll(shared, Some(wait))?;
    ran += shared.run_deferred();
    Ok(ran)
  }

  /// The timer registry used by timeout-guarded operations on this
  /// reactor's sockets.
  pub fn timers(&self) -> &TimerRegistry {
    &self.shared.timers
  }

  /// Wakes one thread blocked in [`Reactor::process`].
  pub fn notify(&self) -> io::Result<()> {
    self.shared.backend.notify()
  }

  pub fn config(&self) -> &Config {
    &self.shared.config
  }

  /// Disarms every timer and runs the completions still queued.
  ///
  /// Sockets should be destroyed, and their completions processed, first.
  pub fn shutdown(&self) {
    self.shared.timers.shutdown();
    let ran = self.shared.run_deferred();
    debug!(ran, "reactor shut down");
  }
}
