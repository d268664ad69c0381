//! RAII guards for automatic mutex unlock

use crate::context::{Cancelled, Context};
use crate::{Mutex, MutexError};
use std::sync::Arc;

/// RAII guard for Mutex (auto-unlocks on drop)
///
/// This guard ensures that a mutex is automatically unlocked when
/// the guard goes out of scope, even in the case of panics.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
    unlocked: bool,
}

impl<'a> MutexGuard<'a> {
    /// The caller must have just locked `mutex`.
    fn new(mutex: &'a Mutex) -> Self {
        Self {
            mutex,
            unlocked: false,
        }
    }

    /// Manually unlock the mutex early (before drop)
    pub fn unlock(mut self) -> Result<(), MutexError> {
        self.unlocked = true;
        self.mutex.try_unlock()
    }

    /// Give up the guard without unlocking
    ///
    /// The mutex stays locked; some other agent becomes responsible for
    /// calling [`Mutex::unlock`].
    pub fn leak(mut self) -> &'a Mutex {
        self.unlocked = true;
        self.mutex
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if !self.unlocked {
            // Ignore any errors on drop - we're already cleaning up
            let _ = self.mutex.try_unlock();
        }
    }
}

/// RAII guard for Arc<Mutex> (owned version)
///
/// This version owns an Arc to the mutex, so it can be moved to another
/// thread and released there.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct OwnedMutexGuard {
    mutex: Arc<Mutex>,
    unlocked: bool,
}

impl OwnedMutexGuard {
    /// Manually unlock the mutex early (before drop)
    pub fn unlock(mut self) -> Result<(), MutexError> {
        self.unlocked = true;
        self.mutex.try_unlock()
    }

    /// Give up the guard without unlocking, returning the still-locked mutex
    pub fn leak(mut self) -> Arc<Mutex> {
        self.unlocked = true;
        self.mutex.clone()
    }

    /// Get a reference to the mutex
    pub fn mutex(&self) -> &Arc<Mutex> {
        &self.mutex
    }
}

impl Drop for OwnedMutexGuard {
    fn drop(&mut self) {
        if !self.unlocked {
            // Ignore any errors on drop - we're already cleaning up
            let _ = self.mutex.try_unlock();
        }
    }
}

impl Mutex {
    /// Lock with RAII guard (borrowed version)
    pub fn lock_guard(&self) -> MutexGuard<'_> {
        self.lock();
        MutexGuard::new(self)
    }

    /// Lock with RAII guard unless `ctx` triggers first
    ///
    /// Same outcome rules as [`Mutex::lock_with_context`]; no guard is
    /// created when the lock was not taken.
    pub fn lock_guard_with_context<C: Context + ?Sized>(
        &self,
        ctx: &C,
    ) -> Result<MutexGuard<'_>, Cancelled> {
        self.lock_with_context(ctx)?;
        Ok(MutexGuard::new(self))
    }

    /// Lock with RAII guard (owned version)
    pub fn lock_owned(self: &Arc<Self>) -> OwnedMutexGuard {
        self.lock();
        OwnedMutexGuard {
            mutex: self.clone(),
            unlocked: false,
        }
    }
}
