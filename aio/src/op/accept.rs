use std::io;
use std::net::SocketAddr;

use crate::RawSock;
use crate::op::{Direction, Operation};

/// Accepts one connection on a listening socket.
///
/// The accepted socket is returned raw; the caller decides whether to wrap
/// it with `Reactor::create`.
pub(crate) struct Accept<F> {
  accepted: Option<(RawSock, SocketAddr)>,
  callback: Option<F>,
  #[cfg(windows)]
  win: Option<win::Pending>,
}

impl<F> Accept<F>
where
  F: FnOnce(io::Result<(RawSock, SocketAddr)>) + Send + 'static,
{
  pub(crate) fn new(callback: F) -> Self {
    Self {
      accepted: None,
      callback: Some(callback),
      #[cfg(windows)]
      win: None,
    }
  }
}

impl<F> Operation for Accept<F>
where
  F: FnOnce(io::Result<(RawSock, SocketAddr)>) + Send + 'static,
{
  fn direction(&self) -> Direction {
    Direction::Read
  }

  fn name(&self) -> &'static str {
    "accept"
  }

  #[cfg(unix)]
  fn perform(&mut self, fd: std::os::fd::RawFd) -> io::Result<usize> {
    use crate::net_utils::{self, Storage};

    let (mut storage, mut len) = net_utils::empty_storage();
    let addr_ptr = (&mut storage as *mut Storage).cast::<libc::sockaddr>();

    #[cfg(any(linux, target_os = "freebsd", target_os = "dragonfly"))]
    let conn = syscall!(accept4(fd, addr_ptr, &mut len, libc::SOCK_CLOEXEC))?;

    #[cfg(not(any(linux, target_os = "freebsd", target_os = "dragonfly")))]
    let conn = {
      let conn = syscall!(accept(fd, addr_ptr, &mut len))?;
      let _ = syscall!(fcntl(conn, libc::F_SETFD, libc::FD_CLOEXEC));
      conn
    };

    // SAFETY: accept filled the storage.
    match unsafe { net_utils::raw_into_socketaddr(&storage) } {
      Ok(peer) => {
        self.accepted = Some((conn, peer));
        Ok(0)
      }
      Err(err) => {
        let _ = syscall!(close(conn));
        Err(err)
      }
    }
  }

  #[cfg(windows)]
  unsafe fn start(
    &mut self,
    sock: std::os::windows::io::RawSocket,
    overlapped: *mut windows_sys::Win32::System::IO::OVERLAPPED,
  ) -> io::Result<()> {
    let pending = self.win.insert(win::Pending::new(sock)?);
    // SAFETY: the output buffer lives in `self`, which the caller keeps
    // pinned.
    unsafe { pending.issue(sock, overlapped) }
  }

  #[cfg(windows)]
  fn finish(
    &mut self,
    sock: std::os::windows::io::RawSocket,
    res: io::Result<usize>,
  ) -> io::Result<usize> {
    let pending = self.win.take().expect("accept finished without start");
    let accepted = pending.finish(sock, res)?;
    self.accepted = Some(accepted);
    Ok(0)
  }

  fn complete(mut self: Box<Self>, res: io::Result<usize>) {
    let callback = self.callback.take().expect("accept completed twice");
    let accepted = res.and_then(|_| {
      self
        .accepted
        .take()
        .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    });
    callback(accepted);
  }
}

impl<F> Drop for Accept<F> {
  fn drop(&mut self) {
    // Accepted but never handed to the callback.
    if let Some((conn, _)) = self.accepted.take() {
      #[cfg(unix)]
      let _ = syscall!(close(conn));
      #[cfg(windows)]
      unsafe {
        windows_sys::Win32::Networking::WinSock::closesocket(conn as usize)
      };
    }
  }
}

#[cfg(windows)]
mod win {
  use std::io;
  use std::mem;
  use std::net::SocketAddr;
  use std::os::windows::io::RawSocket;

  use windows_sys::Win32::Networking::WinSock::{
    AcceptEx, GetAcceptExSockaddrs, INVALID_SOCKET, IPPROTO_TCP, SOCK_STREAM,
    SOCKADDR, SOCKADDR_STORAGE, SO_UPDATE_ACCEPT_CONTEXT, SOL_SOCKET,
    WSA_FLAG_OVERLAPPED, WSAGetLastError, WSASocketW, closesocket, getsockname,
    setsockopt,
  };

  use crate::net_utils::{self, Storage};
  use crate::op::connect::winsock;

  const ADDR_LEN: usize = mem::size_of::<SOCKADDR_STORAGE>() + 16;

  /// The pre-created socket and address buffer AcceptEx writes into.
  pub(super) struct Pending {
    conn: usize,
    out: [u8; ADDR_LEN * 2],
  }

  impl Pending {
    pub(super) fn new(listener: RawSocket) -> io::Result<Self> {
      let (mut storage, mut len) = net_utils::empty_storage();
      wsa_call!(getsockname(
        listener as usize,
        (&mut storage as *mut Storage).cast(),
        &mut len
      ))?;

      // SAFETY: plain FFI call.
      let conn = unsafe {
        WSASocketW(
          storage.ss_family as i32,
          SOCK_STREAM,
          IPPROTO_TCP,
          std::ptr::null(),
          0,
          WSA_FLAG_OVERLAPPED,
        )
      };
      if conn == INVALID_SOCKET {
        return Err(io::Error::from_raw_os_error(unsafe { WSAGetLastError() }));
      }
      Ok(Self { conn, out: [0; ADDR_LEN * 2] })
    }

    /// # Safety
    ///
    /// `self` must not move until the completion is dequeued.
    pub(super) unsafe fn issue(
      &mut self,
      listener: RawSocket,
      overlapped: *mut windows_sys::Win32::System::IO::OVERLAPPED,
    ) -> io::Result<()> {
      let mut received = 0u32;
      // SAFETY: guaranteed by the caller.
      let ok = unsafe {
        AcceptEx(
          listener as usize,
          self.conn,
          self.out.as_mut_ptr().cast(),
          0,
          ADDR_LEN as u32,
          ADDR_LEN as u32,
          &mut received,
          overlapped,
        )
      };
      winsock::pending_bool(ok)
    }

    pub(super) fn finish(
      mut self,
      listener: RawSocket,
      res: io::Result<usize>,
    ) -> io::Result<(crate::RawSock, SocketAddr)> {
      res?;
      wsa_call!(setsockopt(
        self.conn,
        SOL_SOCKET,
        SO_UPDATE_ACCEPT_CONTEXT,
        (&listener as *const RawSocket).cast(),
        mem::size_of::<usize>() as i32,
      ))?;

      let mut local: *mut SOCKADDR = std::ptr::null_mut();
      let mut remote: *mut SOCKADDR = std::ptr::null_mut();
      let (mut local_len, mut remote_len) = (0i32, 0i32);
      // SAFETY: `out` was filled by a successful AcceptEx.
      unsafe {
        GetAcceptExSockaddrs(
          self.out.as_ptr().cast(),
          0,
          ADDR_LEN as u32,
          ADDR_LEN as u32,
          &mut local,
          &mut local_len,
          &mut remote,
          &mut remote_len,
        )
      };
      // SAFETY: GetAcceptExSockaddrs points `remote` into `out`.
      let peer = unsafe { net_utils::raw_into_socketaddr(remote.cast()) }?;

      let conn = mem::replace(&mut self.conn, INVALID_SOCKET);
      Ok((conn as crate::RawSock, peer))
    }
  }

  impl Drop for Pending {
    fn drop(&mut self) {
      if self.conn != INVALID_SOCKET {
        // SAFETY: we own the socket.
        unsafe { closesocket(self.conn) };
      }
    }
  }
}
