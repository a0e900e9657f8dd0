#![cfg(unix)]

mod common;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::{FromRawFd, IntoRawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use aio::{Error, IoBufs};
use common::{Pump, WAIT, reactor, tcp_pair};

#[test]
fn test_recv_reports_partial_read() {
  let reactor = reactor();
  let _pump = Pump::start(&reactor, 2);
  let (socket, mut peer) = tcp_pair(&reactor);

  peer.write_all(b"abcd").unwrap();

  let (tx, rx) = mpsc::sync_channel(1);
  socket
    .recv(Vec::with_capacity(10), move |res, buf| {
      tx.send((res.unwrap(), buf)).unwrap();
    })
    .unwrap();

  let (n, buf) = rx.recv_timeout(WAIT).unwrap();
  assert_eq!(n, 4);
  assert_eq!(buf, b"abcd");
}

#[test]
fn test_send_reaches_peer() {
  let reactor = reactor();
  let _pump = Pump::start(&reactor, 1);
  let (socket, mut peer) = tcp_pair(&reactor);

  let (tx, rx) = mpsc::sync_channel(1);
  socket
    .send(b"hello".to_vec(), move |res, buf| {
      tx.send((res.unwrap(), buf)).unwrap();
    })
    .unwrap();

  let (n, buf) = rx.recv_timeout(WAIT).unwrap();
  assert_eq!(n, 5);
  assert_eq!(buf, b"hello");

  let mut got = [0u8; 5];
  peer.read_exact(&mut got).unwrap();
  assert_eq!(&got, b"hello");
}

#[test]
fn test_recv_zero_on_orderly_shutdown() {
  let reactor = reactor();
  let _pump = Pump::start(&reactor, 1);
  let (socket, peer) = tcp_pair(&reactor);
  drop(peer);

  let (tx, rx) = mpsc::sync_channel(1);
  socket
    .recv(Vec::with_capacity(8), move |res, _| tx.send(res.unwrap()).unwrap())
    .unwrap();
  assert_eq!(rx.recv_timeout(WAIT).unwrap(), 0);
}

#[test]
fn test_busy_slot_rejects_second_op() {
  let reactor = reactor();
  let (socket, _peer) = tcp_pair(&reactor);

  socket.recv(Vec::with_capacity(8), |_, _| {}).unwrap();
  let second = socket.recv(Vec::with_capacity(8), |_, _| {
    panic!("rejected submission called back")
  });
  assert!(matches!(second, Err(Error::Busy)));
  assert_eq!(second.unwrap_err().raw_os_error(), libc::EBUSY);

  // The write slot is independent.
  socket.send(b"x".to_vec(), |_, _| {}).unwrap();

  socket.destroy(|| {}).unwrap();
  reactor.process(Duration::from_millis(10)).unwrap();
}

#[test]
fn test_recv_without_room_is_rejected() {
  let reactor = reactor();
  let (socket, _peer) = tcp_pair(&reactor);

  let res = socket.recv(Vec::new(), |_, _| {
    panic!("rejected submission called back")
  });
  match res {
    Err(Error::Io(err)) => {
      assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput)
    }
    other => panic!("expected InvalidInput, got {other:?}"),
  }

  let mut bufs = IoBufs::new(vec![vec![0; 4]]);
  bufs.advance(4);
  assert!(socket.recv_v(bufs, |_, _| {}).is_err());
  assert!(socket.recv_from(Vec::new(), |_, _| {}).is_err());

  // The slot was never claimed.
  socket.recv(Vec::with_capacity(4), |_, _| {}).unwrap();
  socket.destroy(|| {}).unwrap();
  reactor.process(Duration::from_millis(10)).unwrap();
}

#[test]
fn test_each_op_calls_back_exactly_once() {
  let reactor = reactor();
  let _pump = Pump::start(&reactor, 4);
  let (socket, mut peer) = tcp_pair(&reactor);
  let calls = Arc::new(AtomicUsize::new(0));

  let rounds = 50;
  let (tx, rx) = mpsc::sync_channel(rounds);
  for i in 0..rounds {
    let byte = [i as u8];
    peer.write_all(&byte).unwrap();

    let calls = calls.clone();
    let tx = tx.clone();
    socket
      .recv(Vec::with_capacity(1), move |res, buf| {
        calls.fetch_add(1, Ordering::SeqCst);
        tx.send((res.unwrap(), buf)).unwrap();
      })
      .unwrap();

    let (n, buf) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(n, 1);
    assert_eq!(buf, byte);
  }

  thread::sleep(Duration::from_millis(20));
  assert_eq!(calls.load(Ordering::SeqCst), rounds);
}

#[test]
fn test_submit_after_destroy_is_rejected() {
  let reactor = reactor();
  let (socket, _peer) = tcp_pair(&reactor);
  socket.destroy(|| {}).unwrap();

  let res = socket.send(b"x".to_vec(), |_, _| panic!("called back"));
  assert!(matches!(res, Err(Error::Closed)));
  assert!(matches!(socket.destroy(|| {}), Err(Error::Closed)));
}

#[test]
fn test_destroy_with_pending_recv_cancels_then_finalizes() {
  let reactor = reactor();
  let (socket, _peer) = tcp_pair(&reactor);

  let order = Arc::new(std::sync::Mutex::new(Vec::new()));
  let log = order.clone();
  socket
    .recv(Vec::with_capacity(16), move |res, _| {
      let code = res.unwrap_err().raw_os_error();
      log.lock().unwrap().push(format!("recv {code:?}"));
    })
    .unwrap();

  let log = order.clone();
  socket
    .destroy(move || log.lock().unwrap().push("ondestroy".to_owned()))
    .unwrap();
  // The pending recv still holds a reference.
  assert!(order.lock().unwrap().is_empty());

  let _pump = Pump::start(&reactor, 1);
  let deadline = std::time::Instant::now() + WAIT;
  while order.lock().unwrap().len() < 2 {
    assert!(std::time::Instant::now() < deadline, "teardown never finished");
    thread::sleep(Duration::from_millis(5));
  }

  let order = order.lock().unwrap();
  assert_eq!(
    *order,
    vec![format!("recv {:?}", Some(libc::ECANCELED)), "ondestroy".to_owned()]
  );
}

#[test]
fn test_ondestroy_waits_for_every_pending_op() {
  let reactor = reactor();
  let _pump = Pump::start(&reactor, 2);
  let (socket, _peer) = tcp_pair(&reactor);

  let completed = Arc::new(AtomicUsize::new(0));
  let c = completed.clone();
  socket
    .recv(Vec::with_capacity(4), move |_, _| {
      thread::sleep(Duration::from_millis(20));
      c.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

  let (tx, rx) = mpsc::sync_channel(1);
  let seen = completed.clone();
  socket
    .destroy(move || tx.send(seen.load(Ordering::SeqCst)).unwrap())
    .unwrap();

  assert_eq!(rx.recv_timeout(WAIT).unwrap(), 1);
}

#[test]
fn test_unowned_socket_stays_open() {
  let reactor = reactor();
  let (a, mut b) = std::os::unix::net::UnixStream::pair().unwrap();
  let fd = a.into_raw_fd();

  let socket = reactor.create(fd, false).unwrap();
  socket.destroy(|| {}).unwrap();

  // Only shut down, not closed: the fd is still ours.
  let a = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
  let mut buf = [0u8; 1];
  assert_eq!(b.read(&mut buf).unwrap(), 0);
  drop(a);
}

#[test]
fn test_accept_and_connect() {
  let reactor = reactor();
  let _pump = Pump::start(&reactor, 2);

  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let addr = listener.local_addr().unwrap();
  let listener = reactor.create(listener.into_raw_fd(), true).unwrap();

  let (accepted_tx, accepted_rx) = mpsc::sync_channel(1);
  listener
    .accept(move |res| accepted_tx.send(res.unwrap()).unwrap())
    .unwrap();

  let client_fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
  assert!(client_fd >= 0);
  let client = reactor.create(client_fd, true).unwrap();

  let (connected_tx, connected_rx) = mpsc::sync_channel(1);
  client
    .connect(addr, move |res| connected_tx.send(res.is_ok()).unwrap())
    .unwrap();

  assert!(connected_rx.recv_timeout(WAIT).unwrap());
  let (raw, peer) = accepted_rx.recv_timeout(WAIT).unwrap();
  assert!(peer.ip().is_loopback());

  let mut server_side = unsafe { TcpStream::from_raw_fd(raw) };
  let (tx, rx) = mpsc::sync_channel(1);
  client
    .send(b"ping".to_vec(), move |res, _| tx.send(res.unwrap()).unwrap())
    .unwrap();
  assert_eq!(rx.recv_timeout(WAIT).unwrap(), 4);

  let mut got = [0u8; 4];
  server_side.read_exact(&mut got).unwrap();
  assert_eq!(&got, b"ping");
}

#[test]
fn test_connect_refused_reports_error() {
  let reactor = reactor();
  let _pump = Pump::start(&reactor, 1);

  // Bind then drop to get a port nobody listens on.
  let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();

  let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
  let client = reactor.create(fd, true).unwrap();

  let (tx, rx) = mpsc::sync_channel(1);
  let submitted =
    client.connect(addr, move |res| tx.send(res.map_err(|e| e.kind())).unwrap());

  match submitted {
    Ok(()) => assert_eq!(
      rx.recv_timeout(WAIT).unwrap(),
      Err(std::io::ErrorKind::ConnectionRefused)
    ),
    // Some kernels refuse loopback connects synchronously.
    Err(err) => assert_eq!(
      std::io::Error::from(err).kind(),
      std::io::ErrorKind::ConnectionRefused
    ),
  }
}

#[test]
fn test_udp_send_to_and_recv_from() {
  let reactor = reactor();
  let _pump = Pump::start(&reactor, 2);

  let a = UdpSocket::bind("127.0.0.1:0").unwrap();
  let b = UdpSocket::bind("127.0.0.1:0").unwrap();
  let a_addr = a.local_addr().unwrap();
  let b_addr: SocketAddr = b.local_addr().unwrap();

  let a = reactor.create(a.into_raw_fd(), true).unwrap();
  let b = reactor.create(b.into_raw_fd(), true).unwrap();

  let (recv_tx, recv_rx) = mpsc::sync_channel(1);
  b.recv_from(Vec::with_capacity(64), move |res, buf| {
    recv_tx.send((res.unwrap(), buf)).unwrap();
  })
  .unwrap();

  let (send_tx, send_rx) = mpsc::sync_channel(1);
  a.send_to(b"datagram".to_vec(), b_addr, move |res, _| {
    send_tx.send(res.unwrap()).unwrap();
  })
  .unwrap();

  assert_eq!(send_rx.recv_timeout(WAIT).unwrap(), 8);
  let ((n, from), buf) = recv_rx.recv_timeout(WAIT).unwrap();
  assert_eq!(n, 8);
  assert_eq!(from, Some(a_addr));
  assert_eq!(buf, b"datagram");
}

#[test]
fn test_recv_from_on_stream_keeps_data_and_reports_peer() {
  let reactor = reactor();
  let _pump = Pump::start(&reactor, 1);
  let (socket, mut peer) = tcp_pair(&reactor);
  let peer_addr = peer.local_addr().unwrap();

  peer.write_all(b"data").unwrap();

  let (tx, rx) = mpsc::sync_channel(1);
  socket
    .recv_from(Vec::with_capacity(16), move |res, buf| {
      tx.send((res.unwrap(), buf)).unwrap();
    })
    .unwrap();

  let ((n, from), buf) = rx.recv_timeout(WAIT).unwrap();
  assert_eq!(n, 4);
  assert_eq!(buf, b"data");
  assert_eq!(from, Some(peer_addr));
}

#[test]
fn test_recv_from_on_stream_reports_orderly_shutdown() {
  let reactor = reactor();
  let _pump = Pump::start(&reactor, 1);
  let (socket, peer) = tcp_pair(&reactor);
  drop(peer);

  let (tx, rx) = mpsc::sync_channel(1);
  socket
    .recv_from(Vec::with_capacity(16), move |res, buf| {
      tx.send((res.map(|(n, _)| n).map_err(|e| e.raw_os_error()), buf.len()))
        .unwrap();
    })
    .unwrap();

  assert_eq!(rx.recv_timeout(WAIT).unwrap(), (Ok(0), 0));
}

#[test]
fn test_udp_vectored_datagram() {
  let reactor = reactor();
  let _pump = Pump::start(&reactor, 1);

  let a = UdpSocket::bind("127.0.0.1:0").unwrap();
  let b = UdpSocket::bind("127.0.0.1:0").unwrap();
  let b_addr = b.local_addr().unwrap();
  let a = reactor.create(a.into_raw_fd(), true).unwrap();
  let b = reactor.create(b.into_raw_fd(), true).unwrap();

  let (recv_tx, recv_rx) = mpsc::sync_channel(1);
  b.recv_from_v(IoBufs::new(vec![vec![0; 3], vec![0; 8]]), move |res, bufs| {
    recv_tx.send((res.unwrap().0, bufs)).unwrap();
  })
  .unwrap();

  let (send_tx, send_rx) = mpsc::sync_channel(1);
  let out = IoBufs::new(vec![b"he".to_vec(), b"llo".to_vec()]);
  a.send_to_v(out, b_addr, move |res, _| send_tx.send(res.unwrap()).unwrap())
    .unwrap();

  assert_eq!(send_rx.recv_timeout(WAIT).unwrap(), 5);
  let (n, bufs) = recv_rx.recv_timeout(WAIT).unwrap();
  assert_eq!(n, 5);
  assert_eq!(bufs.bufs()[0], b"hel");
  assert_eq!(&bufs.bufs()[1][..2], b"lo");
  // The reactor never moves the cursor.
  assert_eq!(bufs.position(), 0);
}

#[test]
fn test_vectored_stream_ops() {
  let reactor = reactor();
  let _pump = Pump::start(&reactor, 2);
  let (socket, mut peer) = tcp_pair(&reactor);

  let (tx, rx) = mpsc::sync_channel(1);
  let mut out = IoBufs::new(vec![b"abc".to_vec(), b"defg".to_vec()]);
  out.advance(1);
  socket
    .send_v(out, move |res, _| tx.send(res.unwrap()).unwrap())
    .unwrap();
  assert_eq!(rx.recv_timeout(WAIT).unwrap(), 6);

  let mut got = [0u8; 6];
  peer.read_exact(&mut got).unwrap();
  assert_eq!(&got, b"bcdefg");

  peer.write_all(b"xyz").unwrap();
  let (tx, rx) = mpsc::sync_channel(1);
  socket
    .recv_v(IoBufs::new(vec![vec![0; 2], vec![0; 2]]), move |res, bufs| {
      tx.send((res.unwrap(), bufs)).unwrap();
    })
    .unwrap();
  let (n, bufs) = rx.recv_timeout(WAIT).unwrap();
  assert_eq!(n, 3);
  assert_eq!(bufs.bufs()[0], b"xy");
  assert_eq!(bufs.bufs()[1][0], b'z');
}

#[test]
fn test_read_and_write_slots_run_concurrently() {
  let reactor = reactor();
  let _pump = Pump::start(&reactor, 4);
  let (socket, mut peer) = tcp_pair(&reactor);

  let (recv_tx, recv_rx) = mpsc::sync_channel(1);
  socket
    .recv(Vec::with_capacity(4), move |res, buf| {
      recv_tx.send((res.unwrap(), buf)).unwrap();
    })
    .unwrap();

  let (send_tx, send_rx) = mpsc::sync_channel(1);
  socket
    .send(b"out".to_vec(), move |res, _| send_tx.send(res.unwrap()).unwrap())
    .unwrap();
  assert_eq!(send_rx.recv_timeout(WAIT).unwrap(), 3);

  let mut got = [0u8; 3];
  peer.read_exact(&mut got).unwrap();
  peer.write_all(b"in").unwrap();

  let (n, buf) = recv_rx.recv_timeout(WAIT).unwrap();
  assert_eq!(n, 2);
  assert_eq!(buf, b"in");
}
