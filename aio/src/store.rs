//! Generation-tagged table mapping event keys to live handles.
//!
//! Readiness backends register a handle's key with the kernel instead of a
//! pointer. An event whose key no longer resolves (slot freed, or reused by a
//! newer handle) is simply dropped.

use std::sync::{Arc, Weak};

use crate::sync::RwLock;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Index {
  generation: u32,
  slot: u32,
}

impl Index {
  /// High 32 bits = generation, low 32 bits = slot.
  fn as_u64(self) -> u64 {
    ((self.generation as u64) << 32) | (self.slot as u64)
  }

  fn from_u64(packed: u64) -> Self {
    Index { slot: (packed & 0xFFFF_FFFF) as u32, generation: (packed >> 32) as u32 }
  }
}

struct Slot<T> {
  generation: u32,
  entry: Option<Weak<T>>,
}

struct Table<T> {
  slots: Vec<Slot<T>>,
  free: Vec<u32>,
}

pub(crate) struct HandleStore<T> {
  table: RwLock<Table<T>>,
}

impl<T> HandleStore<T> {
  pub(crate) fn with_capacity(cap: usize) -> Self {
    Self {
      table: RwLock::new(Table {
        slots: Vec::with_capacity(cap),
        free: Vec::new(),
      }),
    }
  }

  /// Stores `handle` and returns the key events will carry.
  pub(crate) fn insert(&self, handle: Weak<T>) -> u64 {
    let mut table = self.table.write();
    let index = match table.free.pop() {
      Some(slot) => {
        let entry = &mut table.slots[slot as usize];
        debug_assert!(entry.entry.is_none(), "free slot {slot} still occupied");
        entry.entry = Some(handle);
        Index { slot, generation: entry.generation }
      }
      None => {
        let slot = u32::try_from(table.slots.len())
          .expect("handle table exhausted the 32-bit slot space");
        table.slots.push(Slot { generation: 0, entry: Some(handle) });
        Index { slot, generation: 0 }
      }
    };
    index.as_u64()
  }

  /// Frees the slot behind `key`. Returns `false` for unknown or stale keys.
  pub(crate) fn remove(&self, key: u64) -> bool {
    let index = Index::from_u64(key);
    let mut table = self.table.write();

    let Some(slot) = table.slots.get_mut(index.slot as usize) else {
      return false;
    };
    if slot.generation != index.generation || slot.entry.is_none() {
      return false;
    }

    slot.entry = None;
    slot.generation = slot.generation.wrapping_add(1);
    table.free.push(index.slot);
    true
  }

  /// Resolves `key` to a strong reference, if the handle is still alive.
  pub(crate) fn get(&self, key: u64) -> Option<Arc<T>> {
    let index = Index::from_u64(key);
    let table = self.table.read();
    let slot = table.slots.get(index.slot as usize)?;
    if slot.generation != index.generation {
      return None;
    }
    slot.entry.as_ref()?.upgrade()
  }

  #[cfg(test)]
  fn len(&self) -> usize {
    self.table.read().slots.iter().filter(|s| s.entry.is_some()).count()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  fn store() -> HandleStore<u32> {
    HandleStore::with_capacity(16)
  }

  #[test]
  fn test_basic_insert_and_remove() {
    let store = store();
    let value = Arc::new(7);
    let key = store.insert(Arc::downgrade(&value));

    assert_eq!(store.get(key).as_deref(), Some(&7));
    assert!(store.remove(key));
    assert!(!store.remove(key));
    assert!(store.get(key).is_none());
  }

  #[test]
  fn test_keys_are_unique() {
    let store = store();
    let values: Vec<_> = (0..100).map(Arc::new).collect();
    let mut keys = HashSet::new();

    for value in &values {
      let key = store.insert(Arc::downgrade(value));
      assert!(keys.insert(key), "duplicate key {key}");
    }
    assert_eq!(store.len(), 100);
  }

  #[test]
  fn test_slot_reuse_increments_generation() {
    let store = store();
    let value = Arc::new(1);

    let first = Index::from_u64(store.insert(Arc::downgrade(&value)));
    assert_eq!(first, Index { slot: 0, generation: 0 });
    store.remove(first.as_u64());

    let second = Index::from_u64(store.insert(Arc::downgrade(&value)));
    assert_eq!(second.slot, 0, "slot should be reused");
    assert_eq!(second.generation, 1, "generation should increment");
  }

  #[test]
  fn test_stale_key_rejected() {
    let store = store();
    let old = Arc::new(1);
    let new = Arc::new(2);

    let stale = store.insert(Arc::downgrade(&old));
    store.remove(stale);
    let fresh = store.insert(Arc::downgrade(&new));

    assert!(store.get(stale).is_none(), "stale key must not resolve");
    assert!(!store.remove(stale));
    assert_eq!(store.get(fresh).as_deref(), Some(&2));
  }

  #[test]
  fn test_dead_handle_does_not_resolve() {
    let store = store();
    let value = Arc::new(3);
    let key = store.insert(Arc::downgrade(&value));
    drop(value);

    assert!(store.get(key).is_none());
    // The slot is still reserved until the owner removes it.
    assert!(store.remove(key));
  }

  #[test]
  fn test_unknown_key() {
    let store = store();
    assert!(store.get(u64::MAX).is_none());
    assert!(!store.remove(42));
  }

  #[test]
  fn test_index_packing() {
    let index = Index { slot: 42, generation: 123 };
    assert_eq!(Index::from_u64(index.as_u64()), index);
  }
}
