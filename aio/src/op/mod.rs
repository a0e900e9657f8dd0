//! Operation descriptors.
//!
//! An operation owns everything the kernel may touch while it is in flight
//! (buffers, address storage) plus the user callback. Backends drive it
//! through [`Operation`] and hand it back to the socket for completion.

use std::io;

#[cfg(unix)]
use std::os::fd::RawFd;
#[cfg(windows)]
use std::os::windows::io::RawSocket;
#[cfg(windows)]
use windows_sys::Win32::System::IO::OVERLAPPED;

mod accept;
mod connect;
mod recv;
mod recv_from;
mod send;
mod send_to;

pub(crate) use accept::Accept;
pub(crate) use connect::Connect;
pub(crate) use recv::Recv;
pub(crate) use recv_from::RecvFrom;
pub(crate) use send::Send;
pub(crate) use send_to::SendTo;

/// Which of a handle's two slots an operation occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
  /// accept, recv, recvfrom.
  Read,
  /// send, sendto, connect.
  Write,
}

pub(crate) trait Operation: std::marker::Send + 'static {
  fn direction(&self) -> Direction;

  fn name(&self) -> &'static str;

  /// Issued once at submission, before the handle is armed.
  ///
  /// An error here is a submission failure: the callback will not run.
  #[cfg(unix)]
  fn start(&mut self, fd: RawFd) -> io::Result<()> {
    let _ = fd;
    Ok(())
  }

  /// Non-blocking attempt, called when the handle reports readiness.
  /// `WouldBlock` means "arm again".
  #[cfg(unix)]
  fn perform(&mut self, fd: RawFd) -> io::Result<usize>;

  /// Issues the overlapped call. `Ok` means a completion packet will be
  /// queued for `overlapped`.
  ///
  /// # Safety
  ///
  /// `overlapped` and `self` must stay at a fixed address until the
  /// completion packet is dequeued.
  #[cfg(windows)]
  unsafe fn start(
    &mut self,
    sock: RawSocket,
    overlapped: *mut OVERLAPPED,
  ) -> io::Result<()>;

  /// Post-processing once the packet arrived.
  #[cfg(windows)]
  fn finish(
    &mut self,
    sock: RawSocket,
    res: io::Result<usize>,
  ) -> io::Result<usize> {
    let _ = sock;
    res
  }

  /// Delivers the outcome to the user callback.
  fn complete(self: Box<Self>, res: io::Result<usize>);
}

#[cfg(unix)]
pub(crate) mod unix {
  use std::{io, mem};

  use crate::private::Region;

  pub(crate) fn iovecs(regions: &[Region]) -> Vec<libc::iovec> {
    regions
      .iter()
      .map(|r| libc::iovec { iov_base: r.ptr.cast(), iov_len: r.len })
      .collect()
  }

  /// A zeroed `msghdr` pointing at `iov`.
  pub(crate) fn msghdr(iov: &mut [libc::iovec]) -> libc::msghdr {
    // SAFETY: msghdr is plain data; zero is valid for every field and covers
    // platform padding members.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = iov.len() as _;
    msg
  }

  pub(crate) fn sendmsg(
    fd: libc::c_int,
    msg: &libc::msghdr,
  ) -> io::Result<usize> {
    let n = syscall!(sendmsg(fd, msg, crate::net_utils::SEND_FLAGS))?;
    Ok(n as usize)
  }

  pub(crate) fn recvmsg(
    fd: libc::c_int,
    msg: &mut libc::msghdr,
  ) -> io::Result<usize> {
    let n = syscall!(recvmsg(fd, msg, 0))?;
    Ok(n as usize)
  }
}

#[cfg(windows)]
pub(crate) mod windows {
  use std::io;

  use windows_sys::Win32::Networking::WinSock::{
    SOCKET_ERROR, WSA_IO_PENDING, WSABUF, WSAGetLastError,
  };

  use crate::private::Region;

  pub(crate) fn wsabufs(regions: &[Region]) -> Vec<WSABUF> {
    regions
      .iter()
      .map(|r| WSABUF { len: r.len.min(u32::MAX as usize) as u32, buf: r.ptr })
      .collect()
  }

  /// Interprets the return value of an overlapped WinSock call.
  pub(crate) fn pending(ret: i32) -> io::Result<()> {
    if ret != SOCKET_ERROR {
      return Ok(());
    }
    // SAFETY: plain FFI call reading thread-local state.
    match unsafe { WSAGetLastError() } {
      WSA_IO_PENDING => Ok(()),
      code => Err(io::Error::from_raw_os_error(code)),
    }
  }
}
