use crate::backoff::{Backoff, DefaultBackoff};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

/// User mode SpinLock, backing off with `B` while contended.
pub struct SpinLock<B = DefaultBackoff> {
    atomic: AtomicBool,
    _backoff: PhantomData<B>,
}

impl<B> Default for SpinLock<B> {
    fn default() -> Self {
        SpinLock::new()
    }
}

impl<B> SpinLock<B> {
    pub const fn new() -> Self {
        SpinLock {
            atomic: AtomicBool::new(false),
            _backoff: PhantomData,
        }
    }

    /// Return true if locked.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.atomic.load(Ordering::Relaxed)
    }

    /// Return true if lock successfully.
    #[inline]
    pub fn try_lock(&self) -> bool {
        !self.is_locked()
            && self
                .atomic
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    /// Unlock if is locked, else panic.
    #[inline]
    pub fn unlock(&self) {
        assert!(
            self.is_locked()
                && self
                    .atomic
                    .compare_exchange(true, false, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
        );
    }
}

impl<B: Backoff> SpinLock<B> {
    /// Keep trying to lock until success.
    pub fn lock(&self) {
        let mut bk = B::default();
        while !self.try_lock() {
            bk.backoff();
        }
    }

    /// Keep trying to lock until success, then return SpinLockGuard.
    #[inline]
    pub fn lock_guard(&self) -> SpinLockGuard<B> {
        self.lock();
        SpinLockGuard::new(self)
    }
}

impl<B> fmt::Debug for SpinLock<B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Guard of SpinLock, unlock it when dropped.
pub struct SpinLockGuard<'a, B = DefaultBackoff> {
    spin_lock: &'a SpinLock<B>,
}

impl<'a, B> SpinLockGuard<'a, B> {
    fn new(spin_lock: &'a SpinLock<B>) -> Self {
        SpinLockGuard { spin_lock }
    }
}

impl<'a, B> Drop for SpinLockGuard<'a, B> {
    fn drop(&mut self) {
        self.spin_lock.unlock();
    }
}
