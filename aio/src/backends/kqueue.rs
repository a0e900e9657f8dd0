use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use super::interest::Interest;
use super::readiness::{NOTIFY_KEY, ReadinessPoll};

/// Identifier of the `EVFILT_USER` event used for wakeups.
const NOTIFY_IDENT: libc::uintptr_t = 0;

/// A kqueue instance. Wakeups go through `EVFILT_USER`, so no extra fd is
/// needed.
pub(crate) struct OsPoller {
  kq_fd: OwnedFd,
}

fn kevent(
  ident: libc::uintptr_t,
  filter: i16,
  flags: u16,
  fflags: u32,
  udata: u64,
) -> libc::kevent {
  // SAFETY: kevent is plain data; zero fills the platform-specific extras.
  let mut kev: libc::kevent = unsafe { std::mem::zeroed() };
  kev.ident = ident;
  kev.filter = filter as _;
  kev.flags = flags as _;
  kev.fflags = fflags as _;
  kev.udata = udata as usize as _;
  kev
}

impl OsPoller {
  fn apply(&self, changes: &[libc::kevent]) -> io::Result<()> {
    syscall!(kevent(
      self.kq_fd.as_raw_fd(),
      changes.as_ptr(),
      changes.len() as libc::c_int,
      ptr::null_mut(),
      0,
      ptr::null(),
    ))?;
    Ok(())
  }

  /// Arms one `EV_ONESHOT` filter per requested direction in a single call.
  fn arm(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    let flags = (libc::EV_ADD | libc::EV_ENABLE | libc::EV_ONESHOT) as u16;
    let mut changes = Vec::with_capacity(2);
    if interest.is_readable() {
      changes.push(kevent(fd as _, libc::EVFILT_READ as i16, flags, 0, key));
    }
    if interest.is_writable() {
      changes.push(kevent(fd as _, libc::EVFILT_WRITE as i16, flags, 0, key));
    }
    if changes.is_empty() {
      return Ok(());
    }
    self.apply(&changes)
  }

  fn delete_filter(&self, fd: RawFd, filter: i16) -> io::Result<()> {
    let change = kevent(fd as _, filter, libc::EV_DELETE as u16, 0, 0);
    match self.apply(&[change]) {
      Err(err) if err.raw_os_error() == Some(libc::ENOENT) => Ok(()),
      res => res,
    }
  }
}

impl ReadinessPoll for OsPoller {
  type NativeEvent = libc::kevent;

  const ONESHOT_PER_HANDLE: bool = false;

  fn new() -> io::Result<Self> {
    // SAFETY: freshly created, owned by nobody else.
    let kq_fd = unsafe { OwnedFd::from_raw_fd(syscall!(kqueue())?) };
    syscall!(fcntl(kq_fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC))?;

    let poller = Self { kq_fd };
    poller.apply(&[kevent(
      NOTIFY_IDENT,
      libc::EVFILT_USER as i16,
      (libc::EV_ADD | libc::EV_CLEAR) as u16,
      0,
      NOTIFY_KEY,
    )])?;
    Ok(poller)
  }

  fn add(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    self.arm(fd, key, interest)
  }

  fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    self.arm(fd, key, interest)
  }

  fn delete(&self, fd: RawFd) -> io::Result<()> {
    let read = self.delete_filter(fd, libc::EVFILT_READ as i16);
    let write = self.delete_filter(fd, libc::EVFILT_WRITE as i16);
    read.and(write)
  }

  fn wait(
    &self,
    events: &mut Vec<Self::NativeEvent>,
    timeout: Option<Duration>,
  ) -> io::Result<()> {
    let timespec = timeout.map(|t| libc::timespec {
      tv_sec: t.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
      tv_nsec: t.subsec_nanos() as libc::c_long,
    });
    let timeout_ptr = timespec
      .as_ref()
      .map_or(ptr::null(), |ts| ts as *const libc::timespec);

    events.clear();
    let spare = events.spare_capacity_mut();
    let capacity = spare.len().min(libc::c_int::MAX as usize);

    let n = match syscall!(kevent(
      self.kq_fd.as_raw_fd(),
      ptr::null(),
      0,
      spare.as_mut_ptr().cast::<libc::kevent>(),
      capacity as libc::c_int,
      timeout_ptr,
    )) {
      Ok(n) => n as usize,
      Err(err) if err.kind() == io::ErrorKind::Interrupted => 0,
      Err(err) => return Err(err),
    };
    // SAFETY: the kernel initialized the first `n` entries.
    unsafe { events.set_len(n) };
    Ok(())
  }

  fn notify(&self) -> io::Result<()> {
    self.apply(&[kevent(
      NOTIFY_IDENT,
      libc::EVFILT_USER as i16,
      0,
      libc::NOTE_TRIGGER as u32,
      NOTIFY_KEY,
    )])
  }

  fn event_key(event: &Self::NativeEvent) -> u64 {
    event.udata as usize as u64
  }

  fn event_interest(event: &Self::NativeEvent) -> Interest {
    // One event per filter; EV_EOF and EV_ERROR ride on the filter that
    // observed them.
    match event.filter as i16 {
      f if f == libc::EVFILT_READ as i16 => Interest::READ,
      f if f == libc::EVFILT_WRITE as i16 => Interest::WRITE,
      _ => Interest::NONE,
    }
  }
}
