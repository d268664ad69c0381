//! The lock contract consumed by [`Cond`](crate::Cond)
//!
//! `Cond` never assumes a concrete lock type. Anything providing a blocking
//! acquire and a release with mutual-exclusion semantics can back it.

use std::sync::Arc;

/// A lock that can be acquired and released without a guard
///
/// Locks are not tied to the agent that acquired them: any agent may call
/// `unlock` on a held lock.
pub trait Locker: Send + Sync {
    /// Acquire the lock, blocking until it is available
    fn lock(&self);

    /// Release the lock
    ///
    /// # Panics
    /// Implementations panic if the lock is not held.
    fn unlock(&self);

    /// Whether the lock is currently held by anyone
    ///
    /// Only used to detect misuse. Locks that cannot report their state keep
    /// the default, which always answers `true` and so skips those checks.
    fn is_locked(&self) -> bool {
        true
    }
}

impl Locker for crate::Mutex {
    fn lock(&self) {
        crate::Mutex::lock(self)
    }

    fn unlock(&self) {
        crate::Mutex::unlock(self)
    }

    fn is_locked(&self) -> bool {
        crate::Mutex::is_locked(self)
    }
}

/// The platform's native lock
impl Locker for parking_lot::RawMutex {
    fn lock(&self) {
        parking_lot::lock_api::RawMutex::lock(self)
    }

    fn unlock(&self) {
        assert!(
            parking_lot::lock_api::RawMutex::is_locked(self),
            "unlock of unlocked parking_lot::RawMutex"
        );
        // SAFETY: the lock is held. With the `send_guard` feature enabled,
        // parking_lot allows a held RawMutex to be released from any thread.
        unsafe { parking_lot::lock_api::RawMutex::unlock(self) }
    }

    fn is_locked(&self) -> bool {
        parking_lot::lock_api::RawMutex::is_locked(self)
    }
}

impl<L: Locker + ?Sized> Locker for &L {
    fn lock(&self) {
        (**self).lock()
    }

    fn unlock(&self) {
        (**self).unlock()
    }

    fn is_locked(&self) -> bool {
        (**self).is_locked()
    }
}

impl<L: Locker + ?Sized> Locker for Arc<L> {
    fn lock(&self) {
        (**self).lock()
    }

    fn unlock(&self) {
        (**self).unlock()
    }

    fn is_locked(&self) -> bool {
        (**self).is_locked()
    }
}

/// Releases a lock on creation and re-acquires it on drop
///
/// Used by `Cond` so the lock is held again on every exit path of a wait.
pub(crate) struct Relock<'a, L: Locker + ?Sized> {
    lock: &'a L,
}

impl<'a, L: Locker + ?Sized> Relock<'a, L> {
    pub(crate) fn release(lock: &'a L) -> Self {
        lock.unlock();
        Self { lock }
    }
}

impl<L: Locker + ?Sized> Drop for Relock<'_, L> {
    fn drop(&mut self) {
        self.lock.lock();
    }
}
