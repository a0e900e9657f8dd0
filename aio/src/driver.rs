//! Process-wide reactor.
//!
//! Optional convenience over an explicit [`Reactor`]: [`init`] installs one
//! shared instance, [`clean`] tears it down, and the free functions forward
//! to it.

use std::time::Duration;

use tracing::debug;

use crate::RawSock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::reactor::Reactor;
use crate::socket::Socket;
use crate::sync::RwLock;

static REACTOR: RwLock<Option<Reactor>> = RwLock::new(None);

/// Installs the process-wide reactor. `threads` is the number of worker
/// threads the caller will run.
pub fn init(threads: usize) -> Result<()> {
  init_with(Config::new().threads(threads))
}

pub fn init_with(config: Config) -> Result<()> {
  let mut slot = REACTOR.write();
  if slot.is_some() {
    return Err(Error::AlreadyInit);
  }
  *slot = Some(Reactor::new(config)?);
  debug!("process-wide reactor installed");
  Ok(())
}

/// Removes the process-wide reactor, disarming its timers and running the
/// completions still queued.
///
/// Every socket should be destroyed, and its completions processed, first.
/// Sockets that outlive the call keep working through their own
/// [`Socket::reactor`] handle.
pub fn clean() -> Result<()> {
  let reactor = REACTOR.write().take().ok_or(Error::NotInit)?;
  reactor.shutdown();
  debug!("process-wide reactor removed");
  Ok(())
}

/// A handle to the process-wide reactor.
pub fn reactor() -> Result<Reactor> {
  REACTOR.read().clone().ok_or(Error::NotInit)
}

/// [`Reactor::create`] on the process-wide reactor.
pub fn create(raw: RawSock, own: bool) -> Result<Socket> {
  reactor()?.create(raw, own)
}

/// [`Reactor::process`] on the process-wide reactor.
pub fn process(timeout: Duration) -> Result<usize> {
  Ok(reactor()?.process(timeout)?)
}

/// [`TimerRegistry::process`](crate::TimerRegistry::process) on the
/// process-wide reactor's registry.
pub fn timeout_process() -> Result<bool> {
  Ok(reactor()?.timers().process())
}
