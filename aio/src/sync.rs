//! Lock types used throughout the crate.
//!
//! With the `parking_lot` feature the locks come straight from
//! `parking_lot`. Without it, thin wrappers around `std::sync` are used that
//! ignore poisoning: a panicking user callback must not wedge the reactor for
//! every other thread.

#[cfg(feature = "parking_lot")]
pub use parking_lot::{
  Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

#[cfg(not(feature = "parking_lot"))]
pub use self::std_sync::*;

#[cfg(not(feature = "parking_lot"))]
mod std_sync {
  use std::ops::{Deref, DerefMut};
  use std::sync as std_sync;

  /// Poison-free `std::sync::Mutex`.
  #[derive(Debug, Default)]
  pub struct Mutex<T: ?Sized> {
    inner: std_sync::Mutex<T>,
  }

  impl<T> Mutex<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
      Self { inner: std_sync::Mutex::new(value) }
    }
  }

  impl<T: ?Sized> Mutex<T> {
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
      MutexGuard { inner: self.inner.lock().unwrap_or_else(|e| e.into_inner()) }
    }
  }

  pub struct MutexGuard<'a, T: ?Sized> {
    inner: std_sync::MutexGuard<'a, T>,
  }

  impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
      &self.inner
    }
  }

  impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
      &mut self.inner
    }
  }

  /// Poison-free `std::sync::RwLock`.
  #[derive(Debug, Default)]
  pub struct RwLock<T: ?Sized> {
    inner: std_sync::RwLock<T>,
  }

  impl<T> RwLock<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
      Self { inner: std_sync::RwLock::new(value) }
    }
  }

  impl<T: ?Sized> RwLock<T> {
    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
      RwLockReadGuard {
        inner: self.inner.read().unwrap_or_else(|e| e.into_inner()),
      }
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
      RwLockWriteGuard {
        inner: self.inner.write().unwrap_or_else(|e| e.into_inner()),
      }
    }
  }

  pub struct RwLockReadGuard<'a, T: ?Sized> {
    inner: std_sync::RwLockReadGuard<'a, T>,
  }

  impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
      &self.inner
    }
  }

  pub struct RwLockWriteGuard<'a, T: ?Sized> {
    inner: std_sync::RwLockWriteGuard<'a, T>,
  }

  impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
      &self.inner
    }
  }

  impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
      &mut self.inner
    }
  }

  #[cfg(test)]
  mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_mutex_survives_panicking_holder() {
      let lock = Arc::new(Mutex::new(0u32));

      let cloned = lock.clone();
      let res = thread::spawn(move || {
        let mut guard = cloned.lock();
        *guard += 1;
        panic!("callback blew up");
      })
      .join();
      assert!(res.is_err());

      // Poisoning is ignored, the value written before the panic is visible.
      assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn test_rwlock_read_write() {
      let lock = RwLock::new(vec![1, 2]);
      lock.write().push(3);
      assert_eq!(lock.read().len(), 3);
    }
  }
}
