//! Conversions between [`SocketAddr`] and native socket address storage,
//! plus small per-socket setup helpers.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::{io, mem};

pub(crate) use self::sys::*;

#[cfg(unix)]
mod sys {
  use super::*;
  use std::os::fd::RawFd;

  pub(crate) type Storage = libc::sockaddr_storage;
  pub(crate) type AddrLen = libc::socklen_t;

  pub(crate) fn empty_storage() -> (Storage, AddrLen) {
    // SAFETY: sockaddr_storage is plain data, all-zero is a valid value.
    (unsafe { mem::zeroed() }, mem::size_of::<Storage>() as AddrLen)
  }

  pub(crate) fn socketaddr_into_raw(addr: SocketAddr) -> (Storage, AddrLen) {
    let (mut storage, _) = empty_storage();
    let len = match addr {
      SocketAddr::V4(v4) => {
        // SAFETY: sockaddr_in fits in sockaddr_storage and shares its
        // alignment requirements.
        let sin = unsafe {
          &mut *(&mut storage as *mut Storage).cast::<libc::sockaddr_in>()
        };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_port = v4.port().to_be();
        sin.sin_addr = libc::in_addr { s_addr: u32::from(*v4.ip()).to_be() };
        mem::size_of::<libc::sockaddr_in>()
      }
      SocketAddr::V6(v6) => {
        // SAFETY: as above for sockaddr_in6.
        let sin6 = unsafe {
          &mut *(&mut storage as *mut Storage).cast::<libc::sockaddr_in6>()
        };
        sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        sin6.sin6_port = v6.port().to_be();
        sin6.sin6_flowinfo = v6.flowinfo();
        sin6.sin6_addr = libc::in6_addr { s6_addr: v6.ip().octets() };
        sin6.sin6_scope_id = v6.scope_id();
        mem::size_of::<libc::sockaddr_in6>()
      }
    };
    (storage, len as AddrLen)
  }

  /// # Safety
  ///
  /// `storage` must point at a socket address filled in by the kernel.
  pub(crate) unsafe fn raw_into_socketaddr(
    storage: *const Storage,
  ) -> io::Result<SocketAddr> {
    // SAFETY: guaranteed by the caller.
    let family = unsafe { (*storage).ss_family } as libc::c_int;
    match family {
      libc::AF_INET => {
        // SAFETY: family says this is a sockaddr_in.
        let sin = unsafe { *storage.cast::<libc::sockaddr_in>() };
        let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
        Ok(SocketAddrV4::new(ip, u16::from_be(sin.sin_port)).into())
      }
      libc::AF_INET6 => {
        // SAFETY: family says this is a sockaddr_in6.
        let sin6 = unsafe { *storage.cast::<libc::sockaddr_in6>() };
        Ok(
          SocketAddrV6::new(
            Ipv6Addr::from(sin6.sin6_addr.s6_addr),
            u16::from_be(sin6.sin6_port),
            sin6.sin6_flowinfo,
            sin6.sin6_scope_id,
          )
          .into(),
        )
      }
      _ => Err(io::Error::from_raw_os_error(libc::EAFNOSUPPORT)),
    }
  }

  /// Fills `storage` with the address of the connected peer.
  pub(crate) fn peer_name(
    fd: RawFd,
    storage: &mut Storage,
  ) -> io::Result<AddrLen> {
    let mut len = mem::size_of::<Storage>() as AddrLen;
    syscall!(getpeername(fd, (storage as *mut Storage).cast(), &mut len))?;
    Ok(len)
  }

  pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    if flags & libc::O_NONBLOCK == 0 {
      syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    }
    Ok(())
  }

  /// Apple has no `MSG_NOSIGNAL`; the socket option does the same job.
  #[cfg(apple)]
  pub(crate) fn set_nosigpipe(fd: RawFd) -> io::Result<()> {
    let on: libc::c_int = 1;
    syscall!(setsockopt(
      fd,
      libc::SOL_SOCKET,
      libc::SO_NOSIGPIPE,
      (&on as *const libc::c_int).cast(),
      mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))?;
    Ok(())
  }

  /// Pending error of a socket (`SO_ERROR`), cleared by the read.
  pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
      fd,
      libc::SOL_SOCKET,
      libc::SO_ERROR,
      (&mut err as *mut libc::c_int).cast(),
      &mut len,
    ))?;
    if err == 0 { Ok(()) } else { Err(io::Error::from_raw_os_error(err)) }
  }

  /// Flags passed to every `sendmsg`.
  #[cfg(not(apple))]
  pub(crate) const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
  #[cfg(apple)]
  pub(crate) const SEND_FLAGS: libc::c_int = 0;
}

#[cfg(windows)]
mod sys {
  use super::*;
  use windows_sys::Win32::Networking::WinSock::{
    AF_INET, AF_INET6, IN_ADDR, IN_ADDR_0, IN6_ADDR, IN6_ADDR_0, SOCKADDR_IN,
    SOCKADDR_IN6, SOCKADDR_IN6_0, SOCKADDR_STORAGE, WSAEAFNOSUPPORT,
  };

  pub(crate) type Storage = SOCKADDR_STORAGE;
  pub(crate) type AddrLen = i32;

  pub(crate) fn empty_storage() -> (Storage, AddrLen) {
    // SAFETY: SOCKADDR_STORAGE is plain data, all-zero is a valid value.
    (unsafe { mem::zeroed() }, mem::size_of::<Storage>() as AddrLen)
  }

  pub(crate) fn socketaddr_into_raw(addr: SocketAddr) -> (Storage, AddrLen) {
    let (mut storage, _) = empty_storage();
    let len = match addr {
      SocketAddr::V4(v4) => {
        let sin = SOCKADDR_IN {
          sin_family: AF_INET,
          sin_port: v4.port().to_be(),
          sin_addr: IN_ADDR {
            S_un: IN_ADDR_0 { S_addr: u32::from(*v4.ip()).to_be() },
          },
          sin_zero: [0; 8],
        };
        // SAFETY: SOCKADDR_IN fits in SOCKADDR_STORAGE.
        unsafe {
          (&mut storage as *mut Storage).cast::<SOCKADDR_IN>().write(sin)
        };
        mem::size_of::<SOCKADDR_IN>()
      }
      SocketAddr::V6(v6) => {
        let sin6 = SOCKADDR_IN6 {
          sin6_family: AF_INET6,
          sin6_port: v6.port().to_be(),
          sin6_flowinfo: v6.flowinfo(),
          sin6_addr: IN6_ADDR { u: IN6_ADDR_0 { Byte: v6.ip().octets() } },
          Anonymous: SOCKADDR_IN6_0 { sin6_scope_id: v6.scope_id() },
        };
        // SAFETY: SOCKADDR_IN6 fits in SOCKADDR_STORAGE.
        unsafe {
          (&mut storage as *mut Storage).cast::<SOCKADDR_IN6>().write(sin6)
        };
        mem::size_of::<SOCKADDR_IN6>()
      }
    };
    (storage, len as AddrLen)
  }

  /// Fills `storage` with the address of the connected peer.
  pub(crate) fn peer_name(
    sock: std::os::windows::io::RawSocket,
    storage: &mut Storage,
  ) -> io::Result<AddrLen> {
    let mut len = mem::size_of::<Storage>() as AddrLen;
    wsa_call!(getpeername(
      sock as usize,
      (storage as *mut Storage).cast(),
      &mut len
    ))?;
    Ok(len)
  }

  /// # Safety
  ///
  /// `storage` must point at a socket address filled in by WinSock.
  pub(crate) unsafe fn raw_into_socketaddr(
    storage: *const Storage,
  ) -> io::Result<SocketAddr> {
    // SAFETY: guaranteed by the caller.
    let family = unsafe { (*storage).ss_family };
    if family == AF_INET {
      // SAFETY: family says this is a SOCKADDR_IN.
      let sin = unsafe { &*storage.cast::<SOCKADDR_IN>() };
      let ip = Ipv4Addr::from(u32::from_be(unsafe { sin.sin_addr.S_un.S_addr }));
      Ok(SocketAddrV4::new(ip, u16::from_be(sin.sin_port)).into())
    } else if family == AF_INET6 {
      // SAFETY: family says this is a SOCKADDR_IN6.
      let sin6 = unsafe { &*storage.cast::<SOCKADDR_IN6>() };
      let ip = Ipv6Addr::from(unsafe { sin6.sin6_addr.u.Byte });
      let scope_id = unsafe { sin6.Anonymous.sin6_scope_id };
      Ok(
        SocketAddrV6::new(
          ip,
          u16::from_be(sin6.sin6_port),
          sin6.sin6_flowinfo,
          scope_id,
        )
        .into(),
      )
    } else {
      Err(io::Error::from_raw_os_error(WSAEAFNOSUPPORT))
    }
  }
}
