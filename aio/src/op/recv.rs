use std::io;

use crate::buf::IoBuf;
use crate::op::{Direction, Operation};

/// `recv` / `recv_v`. A result of `Ok(0)` is an orderly shutdown by the
/// peer.
pub(crate) struct Recv<B, F> {
  buf: Option<B>,
  callback: Option<F>,
  #[cfg(windows)]
  flags: u32,
}

impl<B, F> Recv<B, F>
where
  B: IoBuf,
  F: FnOnce(io::Result<usize>, B) + std::marker::Send + 'static,
{
  pub(crate) fn new(buf: B, callback: F) -> Self {
    Self {
      buf: Some(buf),
      callback: Some(callback),
      #[cfg(windows)]
      flags: 0,
    }
  }
}

impl<B, F> Operation for Recv<B, F>
where
  B: IoBuf,
  F: FnOnce(io::Result<usize>, B) + std::marker::Send + 'static,
{
  fn direction(&self) -> Direction {
    Direction::Read
  }

  fn name(&self) -> &'static str {
    "recv"
  }

  #[cfg(unix)]
  fn perform(&mut self, fd: std::os::fd::RawFd) -> io::Result<usize> {
    use super::unix;

    let mut regions = Vec::new();
    self.buf.as_mut().expect("recv buffer taken").recv_regions(&mut regions);
    let mut iov = unix::iovecs(&regions);
    let mut msg = unix::msghdr(&mut iov);
    unix::recvmsg(fd, &mut msg)
  }

  #[cfg(windows)]
  unsafe fn start(
    &mut self,
    sock: std::os::windows::io::RawSocket,
    overlapped: *mut windows_sys::Win32::System::IO::OVERLAPPED,
  ) -> io::Result<()> {
    use windows_sys::Win32::Networking::WinSock::WSARecv;

    let mut regions = Vec::new();
    self.buf.as_mut().expect("recv buffer taken").recv_regions(&mut regions);
    let bufs = super::windows::wsabufs(&regions);
    // SAFETY: buffers and flags live in `self`, which the caller keeps
    // pinned.
    let ret = unsafe {
      WSARecv(
        sock as usize,
        bufs.as_ptr(),
        bufs.len() as u32,
        std::ptr::null_mut(),
        &mut self.flags,
        overlapped,
        None,
      )
    };
    super::windows::pending(ret)
  }

  fn complete(mut self: Box<Self>, res: io::Result<usize>) {
    let mut buf = self.buf.take().expect("recv completed twice");
    let callback = self.callback.take().expect("recv completed twice");
    buf.received(*res.as_ref().unwrap_or(&0));
    callback(res, buf);
  }
}
