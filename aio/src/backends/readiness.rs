//! Readiness-model dispatch shared by epoll and kqueue.
//!
//! Submitting stores the operation in the handle's slot and arms one-shot
//! interest for its direction. When the kernel reports readiness the
//! dispatcher performs the non-blocking syscall; `EAGAIN` re-arms and is
//! never reported to the user.

use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{trace, warn};

use super::IoBackend;
use super::interest::Interest;
use crate::config::Config;
use crate::error::cancelled;
use crate::op::{Direction, Operation};
use crate::reactor::Shared;
use crate::socket::SocketInner;
use crate::store::HandleStore;
use crate::sync::Mutex;

/// Key reserved for the poller's own wakeup source.
pub(crate) const NOTIFY_KEY: u64 = u64::MAX;

/// The OS-specific half of a readiness backend.
pub(crate) trait ReadinessPoll: Send + Sync + Sized + 'static {
  type NativeEvent;

  /// `true` when a one-shot delivery disarms every direction of the fd
  /// (epoll), `false` when each direction is armed independently (kqueue).
  const ONESHOT_PER_HANDLE: bool;

  fn new() -> io::Result<Self>;

  /// First registration of `fd`. Not idempotent.
  fn add(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()>;

  /// Re-arms an fd previously passed to [`ReadinessPoll::add`].
  fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()>;

  fn delete(&self, fd: RawFd) -> io::Result<()>;

  /// Fills the spare capacity of `events`.
  fn wait(
    &self,
    events: &mut Vec<Self::NativeEvent>,
    timeout: Option<Duration>,
  ) -> io::Result<()>;

  fn notify(&self) -> io::Result<()>;

  fn event_key(event: &Self::NativeEvent) -> u64;

  fn event_interest(event: &Self::NativeEvent) -> Interest;
}

pub(crate) struct Readiness<P> {
  poller: P,
  handles: HandleStore<SocketInner>,
  events: usize,
}

/// Per-handle readiness state.
pub(crate) struct Registration {
  key: u64,
  armed: Mutex<Armed>,
  read: Mutex<Option<Pending>>,
  write: Mutex<Option<Pending>>,
}

#[derive(Default)]
struct Armed {
  registered: bool,
  mask: Interest,
}

/// An operation waiting for readiness. Holds the handle alive until it
/// completes.
struct Pending {
  op: Box<dyn Operation>,
  pin: Arc<SocketInner>,
}

impl Pending {
  fn finish(self, res: io::Result<usize>) {
    let Pending { op, pin } = self;
    pin.complete(op, res);
  }
}

impl Registration {
  fn pending(&self, dir: Direction) -> &Mutex<Option<Pending>> {
    match dir {
      Direction::Read => &self.read,
      Direction::Write => &self.write,
    }
  }
}

fn interest_of(dir: Direction) -> Interest {
  match dir {
    Direction::Read => Interest::READ,
    Direction::Write => Interest::WRITE,
  }
}

impl<P: ReadinessPoll> Readiness<P> {
  /// Adds `add` to the handle's armed set and tells the kernel.
  fn arm(&self, handle: &SocketInner, add: Interest) -> io::Result<()> {
    let reg = &handle.reg;
    let mut armed = reg.armed.lock();
    let mask = armed.mask | add;
    let request = if P::ONESHOT_PER_HANDLE { mask } else { add };

    if armed.registered {
      self.poller.modify(handle.raw(), reg.key, request)?;
    } else {
      self.poller.add(handle.raw(), reg.key, request)?;
      armed.registered = true;
    }
    armed.mask = mask;
    trace!(fd = handle.raw(), key = reg.key, ?mask, "armed");
    Ok(())
  }

  /// Takes the pending op of `dir`, if any, and completes it with the
  /// cancellation error from a worker thread.
  fn reclaim(&self, shared: &Shared, handle: &SocketInner, dir: Direction) {
    let taken = handle.reg.pending(dir).lock().take();
    if let Some(pending) = taken {
      shared.defer(Box::new(move || pending.finish(Err(cancelled()))));
    }
  }

  /// Completes every pending op in `lost` with `err`.
  fn fail(&self, handle: &SocketInner, lost: Interest, err: &io::Error) {
    for dir in [Direction::Read, Direction::Write] {
      if !lost.contains(interest_of(dir)) {
        continue;
      }
      let taken = handle.reg.pending(dir).lock().take();
      if let Some(pending) = taken {
        let err = match err.raw_os_error() {
          Some(code) => io::Error::from_raw_os_error(code),
          None => io::Error::new(err.kind(), err.to_string()),
        };
        pending.finish(Err(err));
      }
    }
  }

  fn dispatch(&self, shared: &Shared, key: u64, ready: Interest) {
    let Some(handle) = self.handles.get(key) else {
      trace!(key, "event for a stale key");
      return;
    };

    let (fired, lost) = {
      let mut armed = handle.reg.armed.lock();
      let fired = armed.mask & ready;
      armed.mask = armed.mask.remove(fired);

      let mut lost = None;
      if P::ONESHOT_PER_HANDLE && !armed.mask.is_none() {
        if let Err(err) = self.poller.modify(handle.raw(), key, armed.mask) {
          warn!(fd = handle.raw(), %err, "failed to re-arm remaining interest");
          lost = Some((std::mem::take(&mut armed.mask), err));
        }
      }
      (fired, lost)
    };

    if let Some((lost, err)) = lost {
      self.fail(&handle, lost, &err);
    }

    for dir in [Direction::Read, Direction::Write] {
      if fired.contains(interest_of(dir)) {
        self.perform(shared, &handle, dir);
      }
    }
  }

  /// Runs the pending op of `dir`, re-arming if it would block.
  fn perform(
    &self,
    shared: &Shared,
    handle: &Arc<SocketInner>,
    dir: Direction,
  ) {
    let Some(mut pending) = handle.reg.pending(dir).lock().take() else {
      return;
    };

    if handle.is_closed() {
      pending.finish(Err(cancelled()));
      return;
    }

    match pending.op.perform(handle.raw()) {
      Err(err)
        if matches!(
          err.kind(),
          io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        ) =>
      {
        trace!(fd = handle.raw(), op = pending.op.name(), "spurious wakeup");
        *handle.reg.pending(dir).lock() = Some(pending);

        if let Err(err) = self.arm(handle, interest_of(dir)) {
          warn!(fd = handle.raw(), %err, "failed to re-arm");
          let taken = handle.reg.pending(dir).lock().take();
          if let Some(pending) = taken {
            pending.finish(Err(err));
          }
          return;
        }
        if handle.is_closed() {
          self.reclaim(shared, handle, dir);
        }
      }
      res => pending.finish(res),
    }
  }
}

impl<P: ReadinessPoll> IoBackend for Readiness<P> {
  type Registration = Registration;

  fn new(config: &Config) -> io::Result<Self> {
    Ok(Self {
      poller: P::new()?,
      handles: HandleStore::with_capacity(config.get_handles()),
      events: config.get_events(),
    })
  }

  fn prepare(&self, fd: RawFd) -> io::Result<()> {
    crate::net_utils::set_nonblocking(fd)?;
    #[cfg(apple)]
    crate::net_utils::set_nosigpipe(fd)?;
    Ok(())
  }

  fn attach(&self, handle: Weak<SocketInner>) -> Registration {
    Registration {
      key: self.handles.insert(handle),
      armed: Mutex::new(Armed::default()),
      read: Mutex::new(None),
      write: Mutex::new(None),
    }
  }

  fn detach(&self, fd: RawFd, reg: &Registration) {
    self.handles.remove(reg.key);

    let mut armed = reg.armed.lock();
    if std::mem::take(&mut armed.registered) {
      if let Err(err) = self.poller.delete(fd) {
        warn!(fd, %err, "failed to deregister socket");
      }
    }
    armed.mask = Interest::NONE;
  }

  fn submit(
    &self,
    shared: &Shared,
    handle: &Arc<SocketInner>,
    mut op: Box<dyn Operation>,
  ) -> io::Result<()> {
    let dir = op.direction();
    op.start(handle.raw())?;
    trace!(fd = handle.raw(), op = op.name(), "submit");

    *handle.reg.pending(dir).lock() = Some(Pending { op, pin: handle.clone() });

    if let Err(err) = self.arm(handle, interest_of(dir)) {
      let taken = handle.reg.pending(dir).lock().take();
      // Already gone means `cancel` took it and will complete it.
      return match taken {
        Some(_) => Err(err),
        None => Ok(()),
      };
    }

    // `destroy` may have run its cancel pass before the op was stored.
    if handle.is_closed() {
      self.reclaim(shared, handle, dir);
    }
    Ok(())
  }

  fn cancel(&self, shared: &Shared, handle: &Arc<SocketInner>) {
    handle.reg.armed.lock().mask = Interest::NONE;
    self.reclaim(shared, handle, Direction::Read);
    self.reclaim(shared, handle, Direction::Write);
  }

  fn poll(
    &self,
    shared: &Shared,
    timeout: Option<Duration>,
  ) -> io::Result<usize> {
    let mut events = Vec::with_capacity(self.events);
    self.poller.wait(&mut events, timeout)?;

    for event in &events {
      let key = P::event_key(event);
      if key != NOTIFY_KEY {
        self.dispatch(shared, key, P::event_interest(event));
      }
    }
    Ok(events.len())
  }

  fn notify(&self) -> io::Result<()> {
    self.poller.notify()
  }
}
