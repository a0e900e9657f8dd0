use std::io;
use std::net::SocketAddr;

use crate::net_utils::{self, AddrLen, Storage};
use crate::op::{Direction, Operation};

/// Stream connect. Occupies the write slot: completion is signalled by
/// writability.
pub(crate) struct Connect<F> {
  addr: Storage,
  addr_len: AddrLen,
  callback: Option<F>,
}

impl<F> Connect<F>
where
  F: FnOnce(io::Result<()>) + Send + 'static,
{
  pub(crate) fn new(target: SocketAddr, callback: F) -> Self {
    let (addr, addr_len) = net_utils::socketaddr_into_raw(target);
    Self { addr, addr_len, callback: Some(callback) }
  }
}

impl<F> Operation for Connect<F>
where
  F: FnOnce(io::Result<()>) + Send + 'static,
{
  fn direction(&self) -> Direction {
    Direction::Write
  }

  fn name(&self) -> &'static str {
    "connect"
  }

  #[cfg(unix)]
  fn start(&mut self, fd: std::os::fd::RawFd) -> io::Result<()> {
    let res = syscall!(connect(
      fd,
      (&self.addr as *const Storage).cast(),
      self.addr_len
    ));
    match res {
      Ok(_) => Ok(()),
      Err(err)
        if matches!(
          err.raw_os_error(),
          Some(libc::EINPROGRESS) | Some(libc::EINTR)
        ) =>
      {
        Ok(())
      }
      Err(err) => Err(err),
    }
  }

  #[cfg(unix)]
  fn perform(&mut self, fd: std::os::fd::RawFd) -> io::Result<usize> {
    net_utils::take_socket_error(fd)?;
    Ok(0)
  }

  #[cfg(windows)]
  unsafe fn start(
    &mut self,
    sock: std::os::windows::io::RawSocket,
    overlapped: *mut windows_sys::Win32::System::IO::OVERLAPPED,
  ) -> io::Result<()> {
    let connect_ex = winsock::connect_ex(sock)?;
    winsock::bind_if_unbound(sock, self.addr.ss_family)?;
    // SAFETY: the address lives in `self`, which the caller keeps pinned.
    let ok = unsafe {
      connect_ex(
        sock as usize,
        (&self.addr as *const Storage).cast(),
        self.addr_len,
        std::ptr::null(),
        0,
        std::ptr::null_mut(),
        overlapped,
      )
    };
    winsock::pending_bool(ok)
  }

  #[cfg(windows)]
  fn finish(
    &mut self,
    sock: std::os::windows::io::RawSocket,
    res: io::Result<usize>,
  ) -> io::Result<usize> {
    use windows_sys::Win32::Networking::WinSock::{
      SO_UPDATE_CONNECT_CONTEXT, SOL_SOCKET, setsockopt,
    };

    let n = res?;
    wsa_call!(setsockopt(
      sock as usize,
      SOL_SOCKET,
      SO_UPDATE_CONNECT_CONTEXT,
      std::ptr::null(),
      0
    ))?;
    Ok(n)
  }

  fn complete(mut self: Box<Self>, res: io::Result<usize>) {
    let callback = self.callback.take().expect("connect completed twice");
    callback(res.map(|_| ()));
  }
}

#[cfg(windows)]
pub(crate) mod winsock {
  use std::io;
  use std::mem;
  use std::os::windows::io::RawSocket;
  use std::sync::OnceLock;

  use windows_sys::Win32::Foundation::BOOL;
  use windows_sys::Win32::Networking::WinSock::{
    ADDRESS_FAMILY, AF_INET, LPFN_CONNECTEX, SIO_GET_EXTENSION_FUNCTION_POINTER,
    SOCKADDR, WSA_IO_PENDING, WSAEINVAL, WSAGetLastError, WSAID_CONNECTEX,
    WSAIoctl, bind, getsockname,
  };

  use crate::net_utils::{self, AddrLen, Storage};

  type ConnectEx = unsafe extern "system" fn(
    usize,
    *const SOCKADDR,
    i32,
    *const core::ffi::c_void,
    u32,
    *mut u32,
    *mut windows_sys::Win32::System::IO::OVERLAPPED,
  ) -> BOOL;

  static CONNECT_EX: OnceLock<usize> = OnceLock::new();

  /// Loads `ConnectEx` through `SIO_GET_EXTENSION_FUNCTION_POINTER`.
  pub(crate) fn connect_ex(sock: RawSocket) -> io::Result<ConnectEx> {
    if let Some(&ptr) = CONNECT_EX.get() {
      // SAFETY: stored from a successful lookup below.
      return Ok(unsafe { mem::transmute::<usize, ConnectEx>(ptr) });
    }

    let guid = WSAID_CONNECTEX;
    let mut func: LPFN_CONNECTEX = None;
    let mut returned = 0u32;
    wsa_call!(WSAIoctl(
      sock as usize,
      SIO_GET_EXTENSION_FUNCTION_POINTER,
      (&guid as *const windows_sys::core::GUID).cast(),
      mem::size_of_val(&guid) as u32,
      (&mut func as *mut LPFN_CONNECTEX).cast(),
      mem::size_of::<LPFN_CONNECTEX>() as u32,
      &mut returned,
      std::ptr::null_mut(),
      None,
    ))?;

    let func = func.ok_or_else(|| io::Error::from_raw_os_error(WSAEINVAL))?;
    let _ = CONNECT_EX.set(func as usize);
    Ok(func)
  }

  /// ConnectEx refuses unbound sockets; bind to the wildcard address of the
  /// target's family in that case.
  pub(crate) fn bind_if_unbound(
    sock: RawSocket,
    family: ADDRESS_FAMILY,
  ) -> io::Result<()> {
    let (mut storage, mut len) = net_utils::empty_storage();
    let bound = wsa_call!(getsockname(
      sock as usize,
      (&mut storage as *mut Storage).cast(),
      &mut len
    ));
    match bound {
      Ok(_) => return Ok(()),
      Err(err) if err.raw_os_error() == Some(WSAEINVAL) => {}
      Err(err) => return Err(err),
    }

    let wildcard = if family == AF_INET {
      "0.0.0.0:0".parse().expect("valid wildcard")
    } else {
      "[::]:0".parse().expect("valid wildcard")
    };
    let (addr, addr_len): (Storage, AddrLen) =
      net_utils::socketaddr_into_raw(wildcard);
    wsa_call!(bind(
      sock as usize,
      (&addr as *const Storage).cast(),
      addr_len
    ))?;
    Ok(())
  }

  /// Interprets the `BOOL` returned by the Ex family of calls.
  pub(crate) fn pending_bool(ok: BOOL) -> io::Result<()> {
    if ok != 0 {
      return Ok(());
    }
    // SAFETY: plain FFI call reading thread-local state.
    match unsafe { WSAGetLastError() } {
      WSA_IO_PENDING => Ok(()),
      code => Err(io::Error::from_raw_os_error(code)),
    }
  }
}
