//! Owned buffers handed to the kernel for the lifetime of an operation.
//!
//! Every submission moves its buffer into the reactor and the callback hands
//! it back, so memory stays valid for as long as the kernel may touch it.
//!
//! Two buffer shapes are supported:
//!
//! - `Vec<u8>`: sends write the vector's contents; receives fill the
//!   vector's spare capacity starting at index 0 and set its length to the
//!   number of bytes received.
//! - [`IoBufs`]: an ordered scatter/gather list with a consumption cursor.
//!   Sends write the bytes after the cursor; receives fill the bytes after
//!   the cursor in place. The reactor never moves the cursor, callers (and
//!   the `*_all` helpers) do it with [`IoBufs::advance`].

use crate::private::{BufRegions, Region};

/// Result type for operations that return both a result and a buffer.
pub type BufResult<T, B> = (std::io::Result<T>, B);

/// Upper bound on the number of regions passed to one vectored syscall.
///
/// Matches `IOV_MAX` on Linux and the BSDs; longer lists are truncated and
/// the caller observes a short transfer.
pub const MAX_SLICES: usize = 1024;

/// A buffer the reactor can send from or receive into.
///
/// Implemented for `Vec<u8>` and [`IoBufs`]; the trait is sealed.
pub trait IoBuf: BufRegions + Send + 'static {}

impl IoBuf for Vec<u8> {}

impl BufRegions for Vec<u8> {
  fn send_regions(&self, out: &mut Vec<Region>) {
    if !self.is_empty() {
      out.push(Region { ptr: self.as_ptr().cast_mut(), len: self.len() });
    }
  }

  fn recv_regions(&mut self, out: &mut Vec<Region>) {
    if self.capacity() > 0 {
      out.push(Region { ptr: self.as_mut_ptr(), len: self.capacity() });
    }
  }

  fn received(&mut self, bytes: usize) {
    assert!(
      bytes <= self.capacity(),
      "received {} bytes into a buffer of capacity {}",
      bytes,
      self.capacity()
    );
    // SAFETY: the kernel initialized the first `bytes` bytes of the
    // allocation, which is at least that large.
    unsafe { self.set_len(bytes) };
  }
}

/// An ordered list of buffers with a cursor marking how much has been
/// consumed.
///
/// ```
/// let mut bufs = aio::IoBufs::new(vec![vec![1, 2, 3], vec![4, 5]]);
/// bufs.advance(4);
/// assert_eq!(bufs.remaining(), 1);
/// assert_eq!(bufs.position(), 4);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoBufs {
  bufs: Vec<Vec<u8>>,
  /// Index of the first buffer that still has unconsumed bytes.
  index: usize,
  /// Consumed bytes inside `bufs[index]`.
  offset: usize,
}

impl IoBufs {
  pub fn new(bufs: Vec<Vec<u8>>) -> Self {
    let mut this = Self { bufs, index: 0, offset: 0 };
    this.skip_exhausted();
    this
  }

  /// Sum of all buffer lengths, ignoring the cursor.
  pub fn total_len(&self) -> usize {
    self.bufs.iter().map(Vec::len).sum()
  }

  /// Bytes after the cursor.
  pub fn remaining(&self) -> usize {
    self.total_len() - self.position()
  }

  /// Bytes before the cursor.
  pub fn position(&self) -> usize {
    self.bufs[..self.index].iter().map(Vec::len).sum::<usize>() + self.offset
  }

  pub fn is_empty(&self) -> bool {
    self.index >= self.bufs.len()
  }

  /// Moves the cursor forward by `n` bytes, crossing buffer boundaries as
  /// needed. Advancing past the end leaves the cursor at the end.
  pub fn advance(&mut self, mut n: usize) {
    while n > 0 && self.index < self.bufs.len() {
      let left = self.bufs[self.index].len() - self.offset;
      if n < left {
        self.offset += n;
        return;
      }
      n -= left;
      self.index += 1;
      self.offset = 0;
    }
    self.skip_exhausted();
  }

  /// Moves the cursor back to the start.
  pub fn rewind(&mut self) {
    self.index = 0;
    self.offset = 0;
    self.skip_exhausted();
  }

  pub fn bufs(&self) -> &[Vec<u8>] {
    &self.bufs
  }

  pub fn into_inner(self) -> Vec<Vec<u8>> {
    self.bufs
  }

  /// Empty buffers never hold the cursor.
  fn skip_exhausted(&mut self) {
    while self.index < self.bufs.len()
      && self.offset >= self.bufs[self.index].len()
    {
      self.index += 1;
      self.offset = 0;
    }
  }
}

/// Pushes the part of each buffer after `offset` (which applies to the first
/// buffer only), at most [`MAX_SLICES`] regions.
fn unconsumed(
  mut offset: usize,
  bufs: impl Iterator<Item = (*mut u8, usize)>,
  out: &mut Vec<Region>,
) {
  for (ptr, len) in bufs {
    if out.len() == MAX_SLICES {
      break;
    }
    if len > offset {
      // SAFETY: offset < len.
      out.push(Region { ptr: unsafe { ptr.add(offset) }, len: len - offset });
    }
    offset = 0;
  }
}

impl From<Vec<Vec<u8>>> for IoBufs {
  fn from(bufs: Vec<Vec<u8>>) -> Self {
    Self::new(bufs)
  }
}

impl IoBuf for IoBufs {}

impl BufRegions for IoBufs {
  fn send_regions(&self, out: &mut Vec<Region>) {
    let start = self.index.min(self.bufs.len());
    let bufs =
      self.bufs[start..].iter().map(|b| (b.as_ptr().cast_mut(), b.len()));
    unconsumed(self.offset, bufs, out)
  }

  fn recv_regions(&mut self, out: &mut Vec<Region>) {
    let start = self.index.min(self.bufs.len());
    let bufs = self.bufs[start..].iter_mut().map(|b| (b.as_mut_ptr(), b.len()));
    unconsumed(self.offset, bufs, out)
  }

  fn received(&mut self, _bytes: usize) {}
}
