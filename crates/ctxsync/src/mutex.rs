//! Cancellable Mutex implementation
//!
//! The mutex is a single-slot semaphore: acquiring puts a token into a
//! capacity-1 channel, releasing takes it back out. An empty slot is `Free`,
//! a full one is `Held`.

use crate::context::{self, Cancelled, Context};
use crossbeam::channel::{self, Receiver, Sender};
use once_cell::sync::OnceCell;

/// Errors that can occur when using a Mutex
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutexError {
    /// Unlock called on a mutex that is not held
    #[error("Mutex is not locked")]
    NotLocked,
}

struct Slot {
    tx: Sender<()>,
    rx: Receiver<()>,
}

/// A mutual exclusion lock with cancellable acquisition
///
/// A held mutex is not associated with the agent that locked it: one thread
/// may lock it and arrange for another to unlock it. The mutex is not
/// reentrant.
///
/// `Mutex::new()` is `const`, so a `static` mutex is usable without any
/// initialization step.
pub struct Mutex {
    /// Created on first use
    slot: OnceCell<Slot>,
}

impl Mutex {
    /// Create a new, unlocked mutex
    pub const fn new() -> Self {
        Self {
            slot: OnceCell::new(),
        }
    }

    fn slot(&self) -> &Slot {
        self.slot.get_or_init(|| {
            let (tx, rx) = channel::bounded(1);
            Slot { tx, rx }
        })
    }

    /// Lock the mutex, blocking until it is available
    pub fn lock(&self) {
        // Both ends live in `self`, so the slot never disconnects.
        let _ = self.slot().tx.send(());
    }

    /// Lock the mutex unless `ctx` triggers first
    ///
    /// Returns `Ok(())` if the lock was taken, in which case the caller must
    /// eventually unlock it. Returns the context's cause if it was not; the
    /// caller must then *not* unlock.
    ///
    /// The outcome is deterministic at the edges:
    /// - a context that has already triggered always yields `Err`, even if the
    ///   mutex is free
    /// - a free mutex is always taken if the context has not triggered on
    ///   entry, even if it triggers concurrently
    pub fn lock_with_context<C: Context + ?Sized>(&self, ctx: &C) -> Result<(), Cancelled> {
        if let Some(cause) = ctx.err() {
            log::trace!("mutex lock skipped, context already done: {cause}");
            return Err(cause);
        }

        let slot = self.slot();
        if slot.tx.try_send(()).is_ok() {
            return Ok(());
        }

        let done = ctx.done();
        let timer = context::deadline_timer(ctx);
        channel::select! {
            send(slot.tx, ()) -> _ => Ok(()),
            recv(done) -> _ => {
                let cause = context::cause_of(ctx, Cancelled::Canceled);
                log::trace!("mutex lock cancelled: {cause}");
                Err(cause)
            },
            recv(timer) -> _ => {
                let cause = context::cause_of(ctx, Cancelled::DeadlineExceeded);
                log::trace!("mutex lock cancelled: {cause}");
                Err(cause)
            },
        }
    }

    /// Attempt to lock the mutex without blocking
    ///
    /// Returns `true` if the lock was taken.
    pub fn try_lock(&self) -> bool {
        self.slot().tx.try_send(()).is_ok()
    }

    /// Unlock the mutex
    ///
    /// # Panics
    /// Panics if the mutex is not locked. This is a programming error, most
    /// often an unlock after a cancelled [`lock_with_context`](Self::lock_with_context).
    pub fn unlock(&self) {
        if let Err(err) = self.try_unlock() {
            panic!(
                "{err}: have you made sure you actually took the lock if using lock_with_context?"
            );
        }
    }

    /// Unlock the mutex, reporting an error instead of panicking if it is not
    /// locked
    pub fn try_unlock(&self) -> Result<(), MutexError> {
        self.slot()
            .rx
            .try_recv()
            .map_err(|_| MutexError::NotLocked)
    }

    /// Check if the mutex is locked
    pub fn is_locked(&self) -> bool {
        self.slot().tx.is_full()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .finish()
    }
}
