use std::io;
use std::net::SocketAddr;

use crate::buf::IoBuf;
use crate::net_utils::{self, AddrLen, Storage};
use crate::op::{Direction, Operation};

/// `sendto` / `sendto_v` on a datagram socket.
pub(crate) struct SendTo<B, F> {
  buf: Option<B>,
  addr: Storage,
  addr_len: AddrLen,
  callback: Option<F>,
}

impl<B, F> SendTo<B, F>
where
  B: IoBuf,
  F: FnOnce(io::Result<usize>, B) + std::marker::Send + 'static,
{
  pub(crate) fn new(buf: B, target: SocketAddr, callback: F) -> Self {
    let (addr, addr_len) = net_utils::socketaddr_into_raw(target);
    Self { buf: Some(buf), addr, addr_len, callback: Some(callback) }
  }
}

impl<B, F> Operation for SendTo<B, F>
where
  B: IoBuf,
  F: FnOnce(io::Result<usize>, B) + std::marker::Send + 'static,
{
  fn direction(&self) -> Direction {
    Direction::Write
  }

  fn name(&self) -> &'static str {
    "send_to"
  }

  #[cfg(unix)]
  fn perform(&mut self, fd: std::os::fd::RawFd) -> io::Result<usize> {
    use super::unix;

    let mut regions = Vec::new();
    self.buf.as_ref().expect("send_to buffer taken").send_regions(&mut regions);
    let mut iov = unix::iovecs(&regions);
    let mut msg = unix::msghdr(&mut iov);
    msg.msg_name = (&mut self.addr as *mut Storage).cast();
    msg.msg_namelen = self.addr_len;
    unix::sendmsg(fd, &msg)
  }

  #[cfg(windows)]
  unsafe fn start(
    &mut self,
    sock: std::os::windows::io::RawSocket,
    overlapped: *mut windows_sys::Win32::System::IO::OVERLAPPED,
  ) -> io::Result<()> {
    use windows_sys::Win32::Networking::WinSock::WSASendTo;

    let mut regions = Vec::new();
    self.buf.as_ref().expect("send_to buffer taken").send_regions(&mut regions);
    let bufs = super::windows::wsabufs(&regions);
    // SAFETY: buffers and address live in `self`, which the caller keeps
    // pinned.
    let ret = unsafe {
      WSASendTo(
        sock as usize,
        bufs.as_ptr(),
        bufs.len() as u32,
        std::ptr::null_mut(),
        0,
        (&self.addr as *const Storage).cast(),
        self.addr_len,
        overlapped,
        None,
      )
    };
    super::windows::pending(ret)
  }

  fn complete(mut self: Box<Self>, res: io::Result<usize>) {
    let buf = self.buf.take().expect("send_to completed twice");
    let callback = self.callback.take().expect("send_to completed twice");
    callback(res, buf);
  }
}
