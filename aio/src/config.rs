//! Reactor configuration.

use std::num::NonZeroUsize;
use std::thread;

/// Tunables for a [`Reactor`](crate::Reactor).
///
/// ```
/// let config = aio::Config::new().threads(4).events(128);
/// assert_eq!(config.get_threads(), 4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
  threads: usize,
  events: usize,
  handles: usize,
}

impl Default for Config {
  fn default() -> Self {
    let threads =
      thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1);
    Self { threads, events: 256, handles: 1024 }
  }
}

impl Config {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of worker threads the caller intends to run.
  ///
  /// IOCP uses it as the port's concurrency value. The readiness backends
  /// accept any number of concurrent pollers and ignore it.
  pub fn threads(mut self, threads: usize) -> Self {
    self.threads = threads.max(1);
    self
  }

  /// Maximum number of native events taken from the kernel per
  /// `process()` call.
  pub fn events(mut self, events: usize) -> Self {
    self.events = events.max(1);
    self
  }

  /// Initial capacity of the handle table.
  pub fn handles(mut self, handles: usize) -> Self {
    self.handles = handles;
    self
  }

  pub fn get_threads(&self) -> usize {
    self.threads
  }

  pub fn get_events(&self) -> usize {
    self.events
  }

  pub fn get_handles(&self) -> usize {
    self.handles
  }
}
