use std::io;
use std::net::SocketAddr;

use crate::buf::IoBuf;
use crate::net_utils::{self, AddrLen, Storage};
use crate::op::{Direction, Operation};

/// `recvfrom` / `recvfrom_v`: receives one datagram and reports its sender.
///
/// On a connected stream socket the kernel reports no source address; the
/// peer address is looked up instead, and left out if that fails too.
pub(crate) struct RecvFrom<B, F> {
  buf: Option<B>,
  addr: Storage,
  addr_len: AddrLen,
  callback: Option<F>,
  #[cfg(windows)]
  flags: u32,
}

impl<B, F> RecvFrom<B, F>
where
  B: IoBuf,
  F: FnOnce(io::Result<(usize, Option<SocketAddr>)>, B)
    + std::marker::Send
    + 'static,
{
  pub(crate) fn new(buf: B, callback: F) -> Self {
    let (addr, addr_len) = net_utils::empty_storage();
    Self {
      buf: Some(buf),
      addr,
      addr_len,
      callback: Some(callback),
      #[cfg(windows)]
      flags: 0,
    }
  }
}

impl<B, F> Operation for RecvFrom<B, F>
where
  B: IoBuf,
  F: FnOnce(io::Result<(usize, Option<SocketAddr>)>, B)
    + std::marker::Send
    + 'static,
{
  fn direction(&self) -> Direction {
    Direction::Read
  }

  fn name(&self) -> &'static str {
    "recv_from"
  }

  #[cfg(unix)]
  fn perform(&mut self, fd: std::os::fd::RawFd) -> io::Result<usize> {
    use super::unix;

    let mut regions = Vec::new();
    self.buf.as_mut().expect("recv_from buffer taken").recv_regions(&mut regions);
    let mut iov = unix::iovecs(&regions);
    let mut msg = unix::msghdr(&mut iov);
    msg.msg_name = (&mut self.addr as *mut Storage).cast();
    msg.msg_namelen = std::mem::size_of::<Storage>() as AddrLen;
    let n = unix::recvmsg(fd, &mut msg)?;
    self.addr_len = match msg.msg_namelen {
      0 => net_utils::peer_name(fd, &mut self.addr).unwrap_or(0),
      len => len,
    };
    Ok(n)
  }

  #[cfg(windows)]
  unsafe fn start(
    &mut self,
    sock: std::os::windows::io::RawSocket,
    overlapped: *mut windows_sys::Win32::System::IO::OVERLAPPED,
  ) -> io::Result<()> {
    use windows_sys::Win32::Networking::WinSock::WSARecvFrom;

    let mut regions = Vec::new();
    self.buf.as_mut().expect("recv_from buffer taken").recv_regions(&mut regions);
    let bufs = super::windows::wsabufs(&regions);
    self.addr_len = std::mem::size_of::<Storage>() as AddrLen;
    // SAFETY: buffers, flags and address storage live in `self`, which the
    // caller keeps pinned until completion.
    let ret = unsafe {
      WSARecvFrom(
        sock as usize,
        bufs.as_ptr(),
        bufs.len() as u32,
        std::ptr::null_mut(),
        &mut self.flags,
        (&mut self.addr as *mut Storage).cast(),
        &mut self.addr_len,
        overlapped,
        None,
      )
    };
    super::windows::pending(ret)
  }

  #[cfg(windows)]
  fn finish(
    &mut self,
    sock: std::os::windows::io::RawSocket,
    res: io::Result<usize>,
  ) -> io::Result<usize> {
    if res.is_ok() && self.addr.ss_family == 0 {
      self.addr_len = net_utils::peer_name(sock, &mut self.addr).unwrap_or(0);
    }
    res
  }

  fn complete(mut self: Box<Self>, res: io::Result<usize>) {
    let mut buf = self.buf.take().expect("recv_from completed twice");
    let callback = self.callback.take().expect("recv_from completed twice");

    let res = res.map(|n| {
      let from = match self.addr_len {
        0 => None,
        // SAFETY: a non-zero length means the kernel filled the storage.
        _ => unsafe { net_utils::raw_into_socketaddr(&self.addr) }.ok(),
      };
      (n, from)
    });
    buf.received(res.as_ref().map_or(0, |(n, _)| *n));
    callback(res, buf);
  }
}
