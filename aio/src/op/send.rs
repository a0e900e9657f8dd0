use std::io;

use crate::buf::IoBuf;
use crate::op::{Direction, Operation};

/// `send` / `send_v`: writes the buffer's pending bytes on a connected
/// socket.
pub(crate) struct Send<B, F> {
  buf: Option<B>,
  callback: Option<F>,
  #[cfg(windows)]
  flags: u32,
}

impl<B, F> Send<B, F>
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

impl<B, F> Operation for Send<B, F>
where
  B: IoBuf,
  F: FnOnce(io::Result<usize>, B) + std::marker::Send + 'static,
{
  fn direction(&self) -> Direction {
    Direction::Write
  }

  fn name(&self) -> &'static str {
    "send"
  }

  #[cfg(unix)]
  fn perform(&mut self, fd: std::os::fd::RawFd) -> io::Result<usize> {
    use super::unix;

    let mut regions = Vec::new();
    self.buf.as_ref().expect("send buffer taken").send_regions(&mut regions);
    let mut iov = unix::iovecs(&regions);
    let msg = unix::msghdr(&mut iov);
    unix::sendmsg(fd, &msg)
  }

  #[cfg(windows)]
  unsafe fn start(
    &mut self,
    sock: std::os::windows::io::RawSocket,
    overlapped: *mut windows_sys::Win32::System::IO::OVERLAPPED,
  ) -> io::Result<()> {
    use windows_sys::Win32::Networking::WinSock::WSASend;

    let mut regions = Vec::new();
    self.buf.as_ref().expect("send buffer taken").send_regions(&mut regions);
    let bufs = super::windows::wsabufs(&regions);
    // SAFETY: the buffers live in `self`, which the caller keeps pinned.
    let ret = unsafe {
      WSASend(
        sock as usize,
        bufs.as_ptr(),
        bufs.len() as u32,
        std::ptr::null_mut(),
        self.flags,
        overlapped,
        None,
      )
    };
    super::windows::pending(ret)
  }

  fn complete(mut self: Box<Self>, res: io::Result<usize>) {
    let buf = self.buf.take().expect("send completed twice");
    let callback = self.callback.take().expect("send completed twice");
    callback(res, buf);
  }
}
