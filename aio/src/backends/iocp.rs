//! I/O completion port backend.
//!
//! Every operation is issued immediately with its own heap block whose first
//! field is the `OVERLAPPED`. The port hands the block back on completion,
//! including for calls that succeeded synchronously.

use std::io;
use std::mem;
use std::os::windows::io::RawSocket;
use std::ptr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{trace, warn};
use windows_sys::Win32::Foundation::{
  CloseHandle, FALSE, HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT,
};
use windows_sys::Win32::Networking::WinSock::{
  WSAGetLastError, WSAGetOverlappedResult,
};
use windows_sys::Win32::System::IO::{
  CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatusEx, OVERLAPPED,
  OVERLAPPED_ENTRY, PostQueuedCompletionStatus,
};

use super::IoBackend;
use crate::config::Config;
use crate::op::Operation;
use crate::reactor::Shared;
use crate::socket::SocketInner;

pub(crate) struct Iocp {
  port: HANDLE,
  events: usize,
}

// SAFETY: a completion port handle may be used from any thread.
unsafe impl Send for Iocp {}
unsafe impl Sync for Iocp {}

/// Heap block carried through the kernel. `overlapped` must stay first so
/// the pointer the port returns can be cast back.
#[repr(C)]
struct OpBlock {
  overlapped: OVERLAPPED,
  handle: Arc<SocketInner>,
  op: Box<dyn Operation>,
}

fn as_handle(raw: RawSocket) -> HANDLE {
  raw as usize as HANDLE
}

fn timeout_ms(timeout: Option<Duration>) -> u32 {
  match timeout {
    None => u32::MAX,
    Some(t) => t.as_nanos().div_ceil(1_000_000).min((u32::MAX - 1) as u128)
      as u32,
  }
}

impl Iocp {
  fn finish(&self, entry: &OVERLAPPED_ENTRY) {
    // SAFETY: every non-null OVERLAPPED posted to this port comes from
    // `Box::into_raw` in `submit`.
    let block = unsafe { Box::from_raw(entry.lpOverlapped.cast::<OpBlock>()) };
    let OpBlock { overlapped, handle, mut op } = *block;

    let res = if overlapped.Internal == 0 {
      Ok(entry.dwNumberOfBytesTransferred as usize)
    } else {
      let mut bytes = 0u32;
      let mut flags = 0u32;
      // SAFETY: the overlapped belongs to a finished operation on `handle`.
      let ok = unsafe {
        WSAGetOverlappedResult(
          handle.raw() as usize,
          &overlapped,
          &mut bytes,
          FALSE,
          &mut flags,
        )
      };
      if ok == FALSE {
        Err(io::Error::from_raw_os_error(unsafe { WSAGetLastError() }))
      } else {
        Ok(bytes as usize)
      }
    };

    let res = op.finish(handle.raw(), res);
    trace!(socket = handle.raw(), op = op.name(), ?res, "completed");
    handle.complete(op, res);
  }
}

impl Drop for Iocp {
  fn drop(&mut self) {
    // SAFETY: we own the port.
    unsafe { CloseHandle(self.port) };
  }
}

impl IoBackend for Iocp {
  type Registration = ();

  fn new(config: &Config) -> io::Result<Self> {
    // SAFETY: creating a fresh port.
    let port = unsafe {
      CreateIoCompletionPort(
        INVALID_HANDLE_VALUE,
        ptr::null_mut(),
        0,
        config.get_threads() as u32,
      )
    };
    if port.is_null() {
      return Err(io::Error::last_os_error());
    }
    Ok(Self { port, events: config.get_events() })
  }

  fn prepare(&self, raw: RawSocket) -> io::Result<()> {
    // SAFETY: associating a caller-provided socket with our port.
    let res =
      unsafe { CreateIoCompletionPort(as_handle(raw), self.port, 0, 0) };
    if res.is_null() { Err(io::Error::last_os_error()) } else { Ok(()) }
  }

  fn attach(&self, _handle: Weak<SocketInner>) {}

  fn detach(&self, _raw: RawSocket, _reg: &()) {}

  fn submit(
    &self,
    _shared: &Shared,
    handle: &Arc<SocketInner>,
    op: Box<dyn Operation>,
  ) -> io::Result<()> {
    let block = Box::into_raw(Box::new(OpBlock {
      // SAFETY: OVERLAPPED is plain data.
      overlapped: unsafe { mem::zeroed() },
      handle: handle.clone(),
      op,
    }));

    // SAFETY: the block stays leaked until the port returns it.
    let res = unsafe {
      let overlapped = ptr::addr_of_mut!((*block).overlapped);
      (*block).op.start(handle.raw(), overlapped)
    };
    if let Err(err) = res {
      // Nothing was queued; the block is ours again.
      drop(unsafe { Box::from_raw(block) });
      return Err(err);
    }

    if handle.is_closed() {
      // `destroy` may have cancelled before this op was issued.
      // The block may already be gone, so cancel by handle only.
      unsafe { CancelIoEx(as_handle(handle.raw()), ptr::null()) };
    }
    Ok(())
  }

  fn cancel(&self, _shared: &Shared, handle: &Arc<SocketInner>) {
    // SAFETY: cancels every overlapped call on the socket; completions still
    // arrive through the port with ERROR_OPERATION_ABORTED.
    unsafe { CancelIoEx(as_handle(handle.raw()), ptr::null()) };
  }

  fn poll(
    &self,
    _shared: &Shared,
    timeout: Option<Duration>,
  ) -> io::Result<usize> {
    let mut entries: Vec<OVERLAPPED_ENTRY> = Vec::with_capacity(self.events);
    let mut removed = 0u32;

    // SAFETY: `entries` has room for `capacity` entries.
    let ok = unsafe {
      GetQueuedCompletionStatusEx(
        self.port,
        entries.as_mut_ptr(),
        entries.capacity() as u32,
        &mut removed,
        timeout_ms(timeout),
        FALSE,
      )
    };
    if ok == FALSE {
      let err = io::Error::last_os_error();
      return match err.raw_os_error() {
        Some(code) if code == WAIT_TIMEOUT as i32 => Ok(0),
        _ => Err(err),
      };
    }
    // SAFETY: the kernel initialized `removed` entries.
    unsafe { entries.set_len(removed as usize) };

    for entry in &entries {
      if !entry.lpOverlapped.is_null() {
        self.finish(entry);
      }
    }
    Ok(entries.len())
  }

  fn notify(&self) -> io::Result<()> {
    // SAFETY: a null OVERLAPPED marks the packet as a wakeup.
    let ok =
      unsafe { PostQueuedCompletionStatus(self.port, 0, 0, ptr::null_mut()) };
    if ok == FALSE {
      let err = io::Error::last_os_error();
      warn!(%err, "failed to post wakeup packet");
      return Err(err);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_timeout_rounds_up() {
    assert_eq!(timeout_ms(None), u32::MAX);
    assert_eq!(timeout_ms(Some(Duration::from_micros(10))), 1);
    assert_eq!(timeout_ms(Some(Duration::from_millis(7))), 7);
  }
}
