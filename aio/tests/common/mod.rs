#![allow(dead_code)]

use std::net::{TcpListener, TcpStream};
use std::os::fd::IntoRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use aio::{Config, Reactor, Socket};

/// How long a test waits for any single callback.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

pub fn reactor() -> Reactor {
  init_tracing();
  Reactor::new(Config::new().threads(2)).unwrap()
}

/// Worker threads driving a reactor and its timers until dropped.
pub struct Pump {
  stop: Arc<AtomicBool>,
  reactor: Reactor,
  workers: Vec<JoinHandle<()>>,
}

impl Pump {
  pub fn start(reactor: &Reactor, threads: usize) -> Self {
    let stop = Arc::new(AtomicBool::new(false));
    let workers = (0..threads)
      .map(|_| {
        let stop = stop.clone();
        let reactor = reactor.clone();
        thread::spawn(move || {
          while !stop.load(Ordering::Acquire) {
            reactor.process(Duration::from_millis(5)).unwrap();
            reactor.timers().process();
          }
        })
      })
      .collect();
    Self { stop, reactor: reactor.clone(), workers }
  }
}

impl Drop for Pump {
  fn drop(&mut self) {
    self.stop.store(true, Ordering::Release);
    for _ in &self.workers {
      let _ = self.reactor.notify();
    }
    for worker in self.workers.drain(..) {
      worker.join().unwrap();
    }
  }
}

/// A connected TCP pair: the local end registered with `reactor`, the peer
/// as a blocking std stream.
pub fn tcp_pair(reactor: &Reactor) -> (Socket, TcpStream) {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let local = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
  let (peer, _) = listener.accept().unwrap();
  peer.set_read_timeout(Some(WAIT)).unwrap();
  let socket = reactor.create(local.into_raw_fd(), true).unwrap();
  (socket, peer)
}
