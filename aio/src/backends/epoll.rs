use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use super::interest::Interest;
use super::readiness::{NOTIFY_KEY, ReadinessPoll};

/// An epoll instance plus the eventfd used to wake it.
pub(crate) struct OsPoller {
  epoll_fd: OwnedFd,
  notifier: OwnedFd,
}

impl OsPoller {
  fn ctl(
    &self,
    op: libc::c_int,
    fd: RawFd,
    key: u64,
    interest: Interest,
  ) -> io::Result<()> {
    let mut events = libc::EPOLLONESHOT as u32;
    if interest.is_readable() {
      events |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
      events |= libc::EPOLLOUT as u32;
    }

    let mut event = libc::epoll_event { events, u64: key };
    syscall!(epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut event))?;
    Ok(())
  }

  fn drain_notifier(&self) -> io::Result<()> {
    let mut buf = [0u8; 8];
    let _ = syscall!(read(
      self.notifier.as_raw_fd(),
      buf.as_mut_ptr().cast::<libc::c_void>(),
      buf.len()
    ));
    self.ctl(
      libc::EPOLL_CTL_MOD,
      self.notifier.as_raw_fd(),
      NOTIFY_KEY,
      Interest::READ,
    )
  }
}

/// Milliseconds for `epoll_wait`, rounded up so short timeouts do not
/// degrade into busy polling.
fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
  match timeout {
    None => -1,
    Some(t) => {
      let ms = t.as_nanos().div_ceil(1_000_000);
      ms.min(libc::c_int::MAX as u128) as libc::c_int
    }
  }
}

impl ReadinessPoll for OsPoller {
  type NativeEvent = libc::epoll_event;

  const ONESHOT_PER_HANDLE: bool = true;

  fn new() -> io::Result<Self> {
    let epoll_fd = {
      let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
      // SAFETY: freshly created, owned by nobody else.
      unsafe { OwnedFd::from_raw_fd(fd) }
    };
    let notifier = {
      let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
      // SAFETY: as above.
      unsafe { OwnedFd::from_raw_fd(fd) }
    };

    let poller = Self { epoll_fd, notifier };
    poller.ctl(
      libc::EPOLL_CTL_ADD,
      poller.notifier.as_raw_fd(),
      NOTIFY_KEY,
      Interest::READ,
    )?;
    Ok(poller)
  }

  fn add(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    self.ctl(libc::EPOLL_CTL_ADD, fd, key, interest)
  }

  fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    self.ctl(libc::EPOLL_CTL_MOD, fd, key, interest)
  }

  fn delete(&self, fd: RawFd) -> io::Result<()> {
    syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_DEL,
      fd,
      ptr::null_mut()
    ))?;
    Ok(())
  }

  fn wait(
    &self,
    events: &mut Vec<Self::NativeEvent>,
    timeout: Option<Duration>,
  ) -> io::Result<()> {
    events.clear();
    let spare = events.spare_capacity_mut();
    let capacity = spare.len().min(libc::c_int::MAX as usize);

    let n = match syscall!(epoll_wait(
      self.epoll_fd.as_raw_fd(),
      spare.as_mut_ptr().cast::<libc::epoll_event>(),
      capacity as libc::c_int,
      timeout_ms(timeout),
    )) {
      Ok(n) => n as usize,
      Err(err) if err.kind() == io::ErrorKind::Interrupted => 0,
      Err(err) => return Err(err),
    };
    // SAFETY: the kernel initialized the first `n` entries.
    unsafe { events.set_len(n) };

    if events.iter().any(|e| Self::event_key(e) == NOTIFY_KEY) {
      self.drain_notifier()?;
    }
    Ok(())
  }

  fn notify(&self) -> io::Result<()> {
    let buf = 1u64.to_ne_bytes();
    match syscall!(write(
      self.notifier.as_raw_fd(),
      buf.as_ptr().cast::<libc::c_void>(),
      buf.len()
    )) {
      // Counter saturated: a wakeup is already pending.
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
      Err(err) => Err(err),
      Ok(_) => Ok(()),
    }
  }

  fn event_key(event: &Self::NativeEvent) -> u64 {
    event.u64
  }

  fn event_interest(event: &Self::NativeEvent) -> Interest {
    let bits = event.events;
    // Errors and hangups are reported to whichever side is waiting; the
    // syscall surfaces the actual error.
    if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
      return Interest::READ_AND_WRITE;
    }

    let mut interest = Interest::NONE;
    if bits & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32 != 0 {
      interest |= Interest::READ;
    }
    if bits & libc::EPOLLOUT as u32 != 0 {
      interest |= Interest::WRITE;
    }
    interest
  }
}
