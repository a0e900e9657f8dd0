use std::sync::atomic::{AtomicBool, Ordering};

/// Busy flag of one direction of a handle.
#[derive(Debug, Default)]
pub(crate) struct Slot {
  busy: AtomicBool,
}

impl Slot {
  pub(crate) const fn new() -> Self {
    Self { busy: AtomicBool::new(false) }
  }

  /// Marks the slot busy. `false` if another operation already holds it.
  pub(crate) fn claim(&self) -> bool {
    !self.busy.swap(true, Ordering::AcqRel)
  }

  pub(crate) fn release(&self) {
    self.busy.store(false, Ordering::Release);
  }

  pub(crate) fn is_busy(&self) -> bool {
    self.busy.load(Ordering::Acquire)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_claim_is_exclusive() {
    let slot = Slot::new();
    assert!(slot.claim());
    assert!(!slot.claim());
    assert!(slot.is_busy());

    slot.release();
    assert!(!slot.is_busy());
    assert!(slot.claim());
  }
}
