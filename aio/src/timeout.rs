//! Cooperative timers.
//!
//! A [`TimerRegistry`] holds armed [`Timeout`]s ordered by deadline. Nothing
//! fires on its own: worker threads call [`TimerRegistry::process`], which
//! runs at most one expired notify per call, outside the registry lock.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{Error, Result};
use crate::sync::Mutex;

type Callback = Box<dyn FnOnce() + Send>;

/// Deadline, then arming sequence number.
type Key = (Instant, u64);

struct Entry {
  node: Arc<Node>,
  notify: Callback,
}

#[derive(Default)]
struct Registry {
  timers: Mutex<BTreeMap<Key, Entry>>,
  seq: AtomicU64,
}

/// The set of armed timeouts.
///
/// Cloning yields another handle to the same registry. Every
/// [`Reactor`](crate::Reactor) owns one; standalone registries work the same.
#[derive(Clone, Default)]
pub struct TimerRegistry {
  inner: Arc<Registry>,
}

impl fmt::Debug for TimerRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TimerRegistry").field("armed", &self.len()).finish()
  }
}

impl TimerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// A new, unarmed timeout bound to this registry.
  pub fn timeout(&self) -> Timeout {
    Timeout {
      node: Arc::new(Node {
        key: Mutex::new(None),
        refs: AtomicUsize::new(1),
        on_cancel: Mutex::new(None),
      }),
      registry: self.clone(),
    }
  }

  /// Fires the earliest expired timer, if any. Returns `true` when a notify
  /// ran.
  ///
  /// A timer expires once its deadline lies strictly in the past. Timers
  /// with equal deadlines fire in the order they were armed.
  pub fn process(&self) -> bool {
    let now = Instant::now();
    let fired = {
      let mut timers = self.inner.timers.lock();
      let Some(first) = timers.first_entry() else {
        return false;
      };
      if first.key().0 >= now {
        return false;
      }
      let entry = first.remove();
      *entry.node.key.lock() = None;
      entry.node.refs.fetch_add(1, Ordering::AcqRel);
      entry
    };

    trace!("timeout fired");
    let Entry { node, notify } = fired;
    notify();
    node.release();
    true
  }

  /// Deadline of the earliest armed timer.
  pub fn next_deadline(&self) -> Option<Instant> {
    self.inner.timers.lock().first_key_value().map(|(key, _)| key.0)
  }

  /// Number of armed timers.
  pub fn len(&self) -> usize {
    self.inner.timers.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Disarms every timer without running its notify.
  pub fn shutdown(&self) {
    let drained = {
      let mut timers = self.inner.timers.lock();
      for entry in timers.values() {
        *entry.node.key.lock() = None;
      }
      std::mem::take(&mut *timers)
    };
    // Notifies may own timeouts whose drop re-enters the registry.
    drop(drained);
  }
}

struct Node {
  /// Position in the registry while armed. Only touched under the registry
  /// lock.
  key: Mutex<Option<Key>>,
  /// One for the owning `Timeout`, one per notify in flight.
  refs: AtomicUsize,
  on_cancel: Mutex<Option<Callback>>,
}

impl Node {
  fn release(&self) {
    if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
      let on_cancel = self.on_cancel.lock().take();
      if let Some(on_cancel) = on_cancel {
        on_cancel();
      }
    }
  }
}

/// A single timer, armed at most once at a time.
///
/// Dropping a `Timeout` stops it; use [`Timeout::delete`] to learn when a
/// concurrently running notify has finished.
pub struct Timeout {
  node: Arc<Node>,
  registry: TimerRegistry,
}

impl fmt::Debug for Timeout {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Timeout").field("armed", &self.is_armed()).finish()
  }
}

impl Timeout {
  /// Arms the timer to run `notify` once `duration` has elapsed.
  ///
  /// Returns [`Error::Armed`] if the timer is already armed.
  pub fn start<F>(&self, duration: Duration, notify: F) -> Result<()>
  where
    F: FnOnce() + Send + 'static,
  {
    let deadline = Instant::now().checked_add(duration).ok_or_else(|| {
      io::Error::new(io::ErrorKind::InvalidInput, "timeout overflows the clock")
    })?;
    self.arm_at(deadline, Box::new(notify))
  }

  fn arm_at(&self, deadline: Instant, notify: Callback) -> Result<()> {
    let rejected = {
      let mut timers = self.registry.inner.timers.lock();
      let mut key = self.node.key.lock();
      if key.is_some() {
        Some(notify)
      } else {
        let seq = self.registry.inner.seq.fetch_add(1, Ordering::Relaxed);
        timers.insert((deadline, seq), Entry { node: self.node.clone(), notify });
        *key = Some((deadline, seq));
        None
      }
    };

    match rejected {
      Some(_) => Err(Error::Armed),
      None => Ok(()),
    }
  }

  /// Disarms the timer. `true` if it was armed; its notify will not run.
  /// `false` if it already fired (or is firing) or was never started.
  pub fn stop(&self) -> bool {
    let removed = {
      let mut timers = self.registry.inner.timers.lock();
      let key = self.node.key.lock().take();
      key.and_then(|key| timers.remove(&key))
    };
    removed.is_some()
  }

  pub fn is_armed(&self) -> bool {
    let _timers = self.registry.inner.timers.lock();
    self.node.key.lock().is_some()
  }

  /// Stops the timer and releases it. `on_cancel` runs once no notify of
  /// this timer is executing: immediately, or on the worker finishing the
  /// notify.
  pub fn delete<F>(self, on_cancel: F)
  where
    F: FnOnce() + Send + 'static,
  {
    *self.node.on_cancel.lock() = Some(Box::new(on_cancel));
  }
}

impl Drop for Timeout {
  fn drop(&mut self) {
    self.stop();
    self.node.release();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicBool;
  use std::sync::mpsc;
  use std::thread;

  fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Callback) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let make = move |id: u32| -> Callback {
      let sink = sink.clone();
      Box::new(move || sink.lock().push(id))
    };
    (log, make)
  }

  #[test]
  fn test_fires_earliest_first_one_per_call() {
    let registry = TimerRegistry::new();
    let (log, make) = recorder();

    let timers: Vec<Timeout> = (0..3).map(|_| registry.timeout()).collect();
    let now = Instant::now();
    timers[0].arm_at(now + Duration::from_millis(3), make(0)).unwrap();
    timers[1].arm_at(now + Duration::from_millis(1), make(1)).unwrap();
    timers[2].arm_at(now + Duration::from_millis(2), make(2)).unwrap();
    assert_eq!(registry.len(), 3);

    thread::sleep(Duration::from_millis(10));
    assert!(registry.process());
    assert_eq!(*log.lock(), vec![1]);
    assert!(registry.process());
    assert!(registry.process());
    assert!(!registry.process());
    assert_eq!(*log.lock(), vec![1, 2, 0]);
    assert!(registry.is_empty());
  }

  #[test]
  fn test_equal_deadlines_fire_in_arming_order() {
    let registry = TimerRegistry::new();
    let (log, make) = recorder();
    let deadline = Instant::now();

    let timers: Vec<Timeout> = (0..4).map(|_| registry.timeout()).collect();
    for (id, timer) in timers.iter().enumerate() {
      timer.arm_at(deadline, make(id as u32)).unwrap();
    }

    thread::sleep(Duration::from_millis(2));
    while registry.process() {}
    assert_eq!(*log.lock(), vec![0, 1, 2, 3]);
  }

  #[test]
  fn test_not_fired_before_deadline() {
    let registry = TimerRegistry::new();
    let timer = registry.timeout();
    timer.start(Duration::from_secs(60), || panic!("fired early")).unwrap();

    assert!(!registry.process());
    assert!(timer.is_armed());
    assert!(registry.next_deadline().unwrap() > Instant::now());
  }

  #[test]
  fn test_start_twice_is_rejected() {
    let registry = TimerRegistry::new();
    let timer = registry.timeout();
    timer.start(Duration::from_secs(60), || {}).unwrap();
    assert!(matches!(
      timer.start(Duration::from_secs(1), || {}),
      Err(Error::Armed)
    ));
    assert_eq!(registry.len(), 1);
  }

  #[test]
  fn test_stop_wins_before_fire() {
    let registry = TimerRegistry::new();
    let timer = registry.timeout();
    timer.start(Duration::ZERO, || panic!("stopped timer fired")).unwrap();

    thread::sleep(Duration::from_millis(2));
    assert!(timer.stop());
    assert!(!timer.stop());
    assert!(!registry.process());
  }

  #[test]
  fn test_stop_after_fire_returns_false() {
    let registry = TimerRegistry::new();
    let timer = registry.timeout();
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    timer
      .start(Duration::ZERO, move || flag.store(true, Ordering::SeqCst))
      .unwrap();

    thread::sleep(Duration::from_millis(2));
    assert!(registry.process());
    assert!(fired.load(Ordering::SeqCst));
    assert!(!timer.stop());

    // A fired timer can be armed again.
    timer.start(Duration::from_secs(60), || {}).unwrap();
    assert!(timer.is_armed());
  }

  #[test]
  fn test_delete_unfired_runs_on_cancel_immediately() {
    let registry = TimerRegistry::new();
    let timer = registry.timeout();
    timer.start(Duration::ZERO, || panic!("deleted timer fired")).unwrap();

    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    timer.delete(move || flag.store(true, Ordering::SeqCst));

    assert!(cancelled.load(Ordering::SeqCst));
    thread::sleep(Duration::from_millis(2));
    assert!(!registry.process());
  }

  #[test]
  fn test_delete_waits_for_running_notify() {
    let registry = TimerRegistry::new();
    let timer = registry.timeout();

    let (entered_tx, entered_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    timer
      .start(Duration::ZERO, move || {
        entered_tx.send(()).unwrap();
        go_rx.recv().unwrap();
      })
      .unwrap();
    thread::sleep(Duration::from_millis(2));

    let worker = {
      let registry = registry.clone();
      thread::spawn(move || registry.process())
    };
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    timer.delete(move || flag.store(true, Ordering::SeqCst));
    assert!(!cancelled.load(Ordering::SeqCst));

    go_tx.send(()).unwrap();
    assert!(worker.join().unwrap());
    assert!(cancelled.load(Ordering::SeqCst));
  }

  #[test]
  fn test_shutdown_disarms_everything() {
    let registry = TimerRegistry::new();
    let timers: Vec<Timeout> = (0..5).map(|_| registry.timeout()).collect();
    for timer in &timers {
      timer.start(Duration::ZERO, || panic!("fired after shutdown")).unwrap();
    }

    registry.shutdown();
    assert!(registry.is_empty());
    assert!(timers.iter().all(|t| !t.is_armed()));
    thread::sleep(Duration::from_millis(2));
    assert!(!registry.process());
  }

  #[test]
  fn test_concurrent_processing_fires_each_once() {
    let registry = TimerRegistry::new();
    let count = Arc::new(AtomicUsize::new(0));
    let timers: Vec<Timeout> = (0..64)
      .map(|_| {
        let timer = registry.timeout();
        let count = count.clone();
        let delay = Duration::from_micros(fastrand::u64(0..2000));
        timer
          .start(delay, move || {
            count.fetch_add(1, Ordering::SeqCst);
          })
          .unwrap();
        timer
      })
      .collect();

    thread::sleep(Duration::from_millis(5));
    let workers: Vec<_> = (0..4)
      .map(|_| {
        let registry = registry.clone();
        thread::spawn(move || while registry.process() {})
      })
      .collect();
    for worker in workers {
      worker.join().unwrap();
    }

    assert_eq!(count.load(Ordering::SeqCst), timers.len());
    assert!(registry.is_empty());
  }

  #[test]
  fn test_stop_racing_expiry_either_fires_or_cancels() {
    for _ in 0..500 {
      let registry = TimerRegistry::new();
      let timer = registry.timeout();
      let fired = Arc::new(AtomicBool::new(false));
      let flag = fired.clone();
      timer
        .start(Duration::ZERO, move || flag.store(true, Ordering::SeqCst))
        .unwrap();

      let barrier = Arc::new(std::sync::Barrier::new(2));
      let processor = {
        let registry = registry.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
          barrier.wait();
          while !registry.is_empty() {
            if registry.process() {
              break;
            }
          }
        })
      };

      barrier.wait();
      let stopped = timer.stop();
      processor.join().unwrap();

      assert!(stopped ^ fired.load(Ordering::SeqCst));
      assert!(registry.is_empty());
    }
  }
}
