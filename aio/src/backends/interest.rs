/// Readiness directions, used both for what a handle is armed for and for
/// what an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Interest {
  bits: u8,
}

impl Interest {
  pub const NONE: Self = Self { bits: 0 };
  pub const READ: Self = Self { bits: 1 << 0 };
  pub const WRITE: Self = Self { bits: 1 << 1 };
  pub const READ_AND_WRITE: Self =
    Self { bits: Self::READ.bits | Self::WRITE.bits };

  pub const fn is_readable(self) -> bool {
    self.bits & Self::READ.bits != 0
  }

  pub const fn is_writable(self) -> bool {
    self.bits & Self::WRITE.bits != 0
  }

  pub const fn is_none(self) -> bool {
    self.bits == 0
  }

  pub const fn or(self, other: Self) -> Self {
    Self { bits: self.bits | other.bits }
  }

  pub const fn and(self, other: Self) -> Self {
    Self { bits: self.bits & other.bits }
  }

  /// `self` without the bits of `other`.
  pub const fn remove(self, other: Self) -> Self {
    Self { bits: self.bits & !other.bits }
  }

  pub const fn contains(self, other: Self) -> bool {
    (self.bits & other.bits) == other.bits
  }
}

impl std::ops::BitOr for Interest {
  type Output = Self;

  fn bitor(self, rhs: Self) -> Self::Output {
    self.or(rhs)
  }
}

impl std::ops::BitOrAssign for Interest {
  fn bitor_assign(&mut self, rhs: Self) {
    *self = self.or(rhs);
  }
}

impl std::ops::BitAnd for Interest {
  type Output = Self;

  fn bitand(self, rhs: Self) -> Self::Output {
    self.and(rhs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_combine_and_split() {
    let both = Interest::READ | Interest::WRITE;
    assert_eq!(both, Interest::READ_AND_WRITE);
    assert!(both.is_readable() && both.is_writable());

    let write = both.remove(Interest::READ);
    assert_eq!(write, Interest::WRITE);
    assert!(!write.is_readable());
    assert!(write.remove(Interest::WRITE).is_none());
  }

  #[test]
  fn test_intersection() {
    assert_eq!(Interest::READ_AND_WRITE & Interest::WRITE, Interest::WRITE);
    assert!((Interest::READ & Interest::WRITE).is_none());
    assert!(Interest::READ_AND_WRITE.contains(Interest::READ));
    assert!(!Interest::READ.contains(Interest::READ_AND_WRITE));
  }
}
