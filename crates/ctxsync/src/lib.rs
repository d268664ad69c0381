//! Cancellable synchronization primitives
//!
//! This crate provides two blocking primitives whose waits can be bounded by
//! an external cancellation token:
//! - [`Mutex`] - mutual exclusion with blocking or cancellable acquisition
//! - [`Cond`] - a condition variable over any [`Locker`], with blocking or
//!   cancellable waits
//!
//! Cancellation tokens implement [`Context`]. [`CancelToken`] covers manual
//! cancellation, deadlines and parent/child propagation; [`Background`] never
//! triggers.
//!
//! ```
//! use ctxsync::{CancelToken, Cancelled, Mutex};
//! use std::time::Duration;
//!
//! let mutex = Mutex::new();
//! mutex.lock();
//!
//! let token = CancelToken::with_timeout(Duration::from_millis(10));
//! assert_eq!(mutex.lock_with_context(&token), Err(Cancelled::DeadlineExceeded));
//!
//! mutex.unlock();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod cond;
mod context;
mod guard;
mod locker;
mod mutex;

pub use cond::Cond;
pub use context::{Background, CancelToken, Cancelled, Context};
pub use guard::{MutexGuard, OwnedMutexGuard};
pub use locker::Locker;
pub use mutex::{Mutex, MutexError};
