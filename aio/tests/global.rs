#![cfg(unix)]

//! The process-wide reactor. Kept in its own test binary, and in a single
//! test, because the instance is shared by everything in the process.

mod common;

use std::io::Write;
use std::os::fd::IntoRawFd;
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use aio::Error;

#[test]
fn test_global_lifecycle() {
  common::init_tracing();

  assert!(matches!(aio::reactor(), Err(Error::NotInit)));
  assert!(matches!(aio::clean(), Err(Error::NotInit)));
  assert!(matches!(aio::process(Duration::ZERO), Err(Error::NotInit)));

  aio::init(2).unwrap();
  assert!(matches!(aio::init(2), Err(Error::AlreadyInit)));
  assert_eq!(aio::reactor().unwrap().config().get_threads(), 2);

  let (a, mut b) = UnixStream::pair().unwrap();
  let socket = aio::create(a.into_raw_fd(), true).unwrap();
  b.write_all(b"xy").unwrap();

  let (tx, rx) = mpsc::channel();
  socket
    .recv(Vec::with_capacity(4), move |res, buf| tx.send((res.unwrap(), buf)).unwrap())
    .unwrap();

  let started = Instant::now();
  let (n, buf) = loop {
    aio::process(Duration::from_millis(5)).unwrap();
    aio::timeout_process().unwrap();
    if let Ok(out) = rx.try_recv() {
      break out;
    }
    assert!(started.elapsed() < common::WAIT, "no callback");
  };
  assert_eq!(n, 2);
  assert_eq!(buf, b"xy");

  let (done_tx, done_rx) = mpsc::channel();
  socket.destroy(move || done_tx.send(()).unwrap()).unwrap();
  done_rx.recv_timeout(common::WAIT).unwrap();

  aio::clean().unwrap();
  assert!(matches!(aio::reactor(), Err(Error::NotInit)));

  // A fresh instance can be installed after cleaning.
  aio::init_with(aio::Config::new().events(16)).unwrap();
  assert_eq!(aio::reactor().unwrap().config().get_events(), 16);
  aio::clean().unwrap();
}
