//! Cancellation tokens consumed by the cancellable wait operations
//!
//! A [`Context`] is anything that can answer three questions: has it been
//! triggered (and why), which channel fires when it triggers, and whether it
//! carries a deadline. Waiters race these against their own wake-up channel
//! with `crossbeam::channel::select!`.
//!
//! Two implementations are provided:
//! - [`Background`] never triggers
//! - [`CancelToken`] triggers on demand, at a deadline, or when its parent does

use crossbeam::channel::{self, Receiver, Sender};
use once_cell::sync::OnceCell;
use parking_lot::Mutex as ParkingLotMutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Why a cancellable operation gave up
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Cancelled {
    /// The token was cancelled explicitly
    #[error("context canceled")]
    Canceled,

    /// The token's deadline passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The token was cancelled with a caller-supplied cause
    #[error("context canceled: {0}")]
    Cause(Arc<str>),
}

/// A cancellation token
///
/// Once `err()` returns `Some`, it must keep returning the same cause and
/// `done()` must be disconnected.
pub trait Context: Send + Sync {
    /// Non-blocking query: the trigger cause, if the token has triggered
    fn err(&self) -> Option<Cancelled>;

    /// A receiver that disconnects when the token triggers
    ///
    /// Nothing is ever sent on it; a disconnected receiver wakes every
    /// `recv` and `select!` arm blocked on it at once.
    fn done(&self) -> Receiver<()>;

    /// Deadline after which the token counts as triggered
    fn deadline(&self) -> Option<Instant> {
        None
    }
}

impl<C: Context + ?Sized> Context for &C {
    fn err(&self) -> Option<Cancelled> {
        (**self).err()
    }

    fn done(&self) -> Receiver<()> {
        (**self).done()
    }

    fn deadline(&self) -> Option<Instant> {
        (**self).deadline()
    }
}

impl<C: Context + ?Sized> Context for Arc<C> {
    fn err(&self) -> Option<Cancelled> {
        (**self).err()
    }

    fn done(&self) -> Receiver<()> {
        (**self).done()
    }

    fn deadline(&self) -> Option<Instant> {
        (**self).deadline()
    }
}

/// A context that never triggers
#[derive(Debug, Clone, Copy, Default)]
pub struct Background;

impl Context for Background {
    fn err(&self) -> Option<Cancelled> {
        None
    }

    fn done(&self) -> Receiver<()> {
        channel::never()
    }
}

/// Timer arm for a context's deadline; never fires without one.
pub(crate) fn deadline_timer<C: Context + ?Sized>(ctx: &C) -> Receiver<Instant> {
    match ctx.deadline() {
        Some(deadline) => channel::at(deadline),
        None => channel::never(),
    }
}

/// Cause to report after one of the context's arms fired.
///
/// `fallback` only applies to contexts whose `err()` lags behind their own
/// channels.
pub(crate) fn cause_of<C: Context + ?Sized>(ctx: &C, fallback: Cancelled) -> Cancelled {
    ctx.err().unwrap_or(fallback)
}

struct TokenInner {
    cause: OnceCell<Cancelled>,
    /// Dropped on trigger, which disconnects `done`
    trigger: ParkingLotMutex<Option<Sender<()>>>,
    done: Receiver<()>,
    deadline: Option<Instant>,
    children: ParkingLotMutex<Vec<Weak<TokenInner>>>,
}

impl TokenInner {
    fn new(deadline: Option<Instant>) -> Self {
        let (trigger, done) = channel::bounded(0);
        Self {
            cause: OnceCell::new(),
            trigger: ParkingLotMutex::new(Some(trigger)),
            done,
            deadline,
            children: ParkingLotMutex::new(Vec::new()),
        }
    }

    /// First trigger wins; later calls are no-ops.
    fn fire(&self, cause: Cancelled) {
        if self.cause.set(cause.clone()).is_err() {
            return;
        }
        log::trace!("cancel token triggered: {cause}");
        drop(self.trigger.lock().take());

        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.fire(cause.clone());
        }
    }

    fn err(&self) -> Option<Cancelled> {
        if let Some(cause) = self.cause.get() {
            return Some(cause.clone());
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.fire(Cancelled::DeadlineExceeded);
                self.cause.get().cloned()
            }
            _ => None,
        }
    }
}

/// A clonable, manually or deadline triggered cancellation token
///
/// Clones share state: cancelling one cancels them all. Use [`CancelToken::child`]
/// for a token that can be cancelled independently of its parent.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Create a token that only triggers when cancelled
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner::new(None)),
        }
    }

    /// Create a token that triggers at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            inner: Arc::new(TokenInner::new(Some(deadline))),
        }
    }

    /// Create a token that triggers `timeout` from now
    ///
    /// A timeout too large to represent as an `Instant` means no deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(TokenInner::new(Instant::now().checked_add(timeout))),
        }
    }

    /// Create a token that also triggers whenever this one does
    pub fn child(&self) -> Self {
        self.derive(self.inner.deadline)
    }

    /// Create a child token whose deadline is the earlier of `deadline` and
    /// this token's own
    pub fn child_with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.inner.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };
        self.derive(Some(deadline))
    }

    /// Create a child token that triggers `timeout` from now at the latest
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.child_with_deadline(deadline),
            None => self.child(),
        }
    }

    fn derive(&self, deadline: Option<Instant>) -> Self {
        let child = Arc::new(TokenInner::new(deadline));
        {
            let mut children = self.inner.children.lock();
            // Checked under the children lock so a concurrent `fire` either
            // sees this child in the list or we see its cause here.
            match self.inner.cause.get() {
                Some(cause) => child.fire(cause.clone()),
                None => {
                    children.retain(|weak| weak.strong_count() > 0);
                    children.push(Arc::downgrade(&child));
                }
            }
        }
        Self { inner: child }
    }

    /// Trigger the token with [`Cancelled::Canceled`]
    pub fn cancel(&self) {
        self.inner.fire(Cancelled::Canceled);
    }

    /// Trigger the token with a custom cause
    pub fn cancel_with_cause(&self, cause: impl Into<Arc<str>>) {
        self.inner.fire(Cancelled::Cause(cause.into()));
    }

    /// Whether the token has triggered
    pub fn is_cancelled(&self) -> bool {
        self.inner.err().is_some()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cause", &self.inner.cause.get())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

impl Context for CancelToken {
    fn err(&self) -> Option<Cancelled> {
        self.inner.err()
    }

    fn done(&self) -> Receiver<()> {
        self.inner.done.clone()
    }

    fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }
}
