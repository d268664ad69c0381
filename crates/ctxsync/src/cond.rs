//! Condition variable with cancellable waits
//!
//! Every waiter gets its own capacity-1 delivery channel, registered in a
//! waiter table under a fresh id. Signalling is a non-blocking send into one
//! (or every) registered channel, so `signal` and `broadcast` never block.
//!
//! # Locking
//!
//! Unlike `std::sync::Condvar`, the lock `L` must be held when calling
//! [`Cond::signal`] and [`Cond::broadcast`] as well as the waits: `L` is
//! what serializes access to the waiter table.

use crate::context::{self, Background, Cancelled, Context};
use crate::locker::{Locker, Relock};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex as ParkingLotMutex, MutexGuard as ParkingLotMutexGuard};
use rustc_hash::FxHashMap;

/// Waiter id to delivery channel
#[derive(Default)]
struct WaiterTable {
    next_id: u64,
    channels: FxHashMap<u64, Sender<()>>,
}

impl WaiterTable {
    fn enrol(&mut self) -> (u64, Receiver<()>) {
        // Re-probe so a wrapped counter never reuses the id of a waiter that
        // is still parked.
        let id = loop {
            self.next_id = self.next_id.wrapping_add(1);
            if !self.channels.contains_key(&self.next_id) {
                break self.next_id;
            }
        };

        let (tx, rx) = channel::bounded(1);
        self.channels.insert(id, tx);
        (id, rx)
    }

    /// Deliver to the first waiter that can take it.
    fn signal(&mut self) -> bool {
        let delivered = self
            .channels
            .iter()
            .find_map(|(&id, tx)| tx.try_send(()).ok().map(|()| id));

        match delivered {
            Some(id) => {
                self.channels.remove(&id);
                true
            }
            None => false,
        }
    }

    /// Deliver to every waiter that can take it, returning how many did.
    fn broadcast(&mut self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, tx| tx.try_send(()).is_err());
        before - self.channels.len()
    }
}

/// A condition variable over an arbitrary [`Locker`]
///
/// Waiters only wake in response to [`signal`](Cond::signal),
/// [`broadcast`](Cond::broadcast), or cancellation; there are no spurious
/// wake-ups. The order in which waiters are woken is unspecified.
///
/// Because `L` is released while waiting, the caller typically cannot assume
/// the awaited condition holds when a wait returns, and should wait in a loop
/// (see [`wait_while`](Cond::wait_while)).
pub struct Cond<L: Locker> {
    lock: L,
    /// Only ever touched with `lock` held; a failed `try_lock` is misuse.
    waiters: ParkingLotMutex<WaiterTable>,
}

impl<L: Locker> Cond<L> {
    /// Create a condition variable over `lock`
    pub fn new(lock: L) -> Self {
        Self {
            lock,
            waiters: ParkingLotMutex::new(WaiterTable::default()),
        }
    }

    /// The lock this condition variable waits on
    pub fn locker(&self) -> &L {
        &self.lock
    }

    fn table(&self, op: &str) -> ParkingLotMutexGuard<'_, WaiterTable> {
        assert!(
            self.lock.is_locked(),
            "Cond::{op} called without holding the lock"
        );
        match self.waiters.try_lock() {
            Some(table) => table,
            None => panic!("Cond::{op}: waiter table accessed concurrently, lock not held by caller"),
        }
    }

    /// Wake one waiting agent, if there is any
    ///
    /// A signal with no waiter ready to take it is lost, not latched.
    ///
    /// # Panics
    /// Panics if the lock is not held.
    pub fn signal(&self) {
        let woken = self.table("signal").signal();
        log::trace!("cond signal, woke waiter: {woken}");
    }

    /// Wake every agent currently waiting
    ///
    /// Waiters that enrol after `broadcast` returns do not observe it.
    ///
    /// # Panics
    /// Panics if the lock is not held.
    pub fn broadcast(&self) {
        let woken = self.table("broadcast").broadcast();
        log::trace!("cond broadcast, woke {woken} waiters");
    }

    /// Number of agents currently waiting
    ///
    /// # Panics
    /// Panics if the lock is not held.
    pub fn waiters(&self) -> usize {
        self.table("waiters").channels.len()
    }

    /// Release the lock and wait until woken by `signal` or `broadcast`
    ///
    /// The lock is held again when this returns.
    ///
    /// # Panics
    /// Panics if the lock is not held on entry.
    pub fn wait(&self) {
        // Background never triggers, so this only returns once woken.
        let _ = self.wait_with_context(&Background);
    }

    /// Release the lock and wait until woken or until `ctx` triggers
    ///
    /// The lock is held again when this returns, whatever the outcome.
    ///
    /// If `ctx` has already triggered on entry this returns its cause without
    /// releasing the lock. Once enrolled, a wake-up that races with
    /// cancellation wins: the result is `Ok(())`, never both.
    ///
    /// # Panics
    /// Panics if the lock is not held on entry.
    pub fn wait_with_context<C: Context + ?Sized>(&self, ctx: &C) -> Result<(), Cancelled> {
        assert!(
            self.lock.is_locked(),
            "Cond::wait called without holding the lock"
        );
        if let Some(cause) = ctx.err() {
            return Err(cause);
        }

        let (id, delivery) = self.table("wait").enrol();
        log::trace!("cond waiter {id} enrolled");

        let outcome = {
            let _relock = Relock::release(&self.lock);
            park(&delivery, ctx)
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(cause) => {
                // A signaller may have picked us between the cancel and the
                // relock; it already removed our entry.
                if delivery.try_recv().is_ok() {
                    log::debug!("cond waiter {id} cancelled ({cause}) but consumed a wake-up");
                    return Ok(());
                }
                self.table("wait").channels.remove(&id);
                log::trace!("cond waiter {id} cancelled: {cause}");
                Err(cause)
            }
        }
    }

    /// Wait for as long as `condition` returns `true`
    ///
    /// `condition` is evaluated with the lock held.
    ///
    /// # Panics
    /// Panics if the lock is not held on entry.
    pub fn wait_while(&self, mut condition: impl FnMut() -> bool) {
        while condition() {
            self.wait();
        }
    }

    /// Wait for as long as `condition` returns `true`, or until `ctx` triggers
    ///
    /// The lock is held when this returns.
    ///
    /// # Panics
    /// Panics if the lock is not held on entry.
    pub fn wait_while_with_context<C: Context + ?Sized>(
        &self,
        ctx: &C,
        mut condition: impl FnMut() -> bool,
    ) -> Result<(), Cancelled> {
        while condition() {
            self.wait_with_context(ctx)?;
        }
        Ok(())
    }
}

/// Block on the delivery channel until woken or cancelled. The lock is not
/// held here.
fn park<C: Context + ?Sized>(delivery: &Receiver<()>, ctx: &C) -> Result<(), Cancelled> {
    // A wake-up that landed before the lock was released wins over an
    // already triggered context.
    if delivery.try_recv().is_ok() {
        return Ok(());
    }

    let done = ctx.done();
    let timer = context::deadline_timer(ctx);
    channel::select! {
        recv(delivery) -> _ => Ok(()),
        recv(done) -> _ => Err(context::cause_of(ctx, Cancelled::Canceled)),
        recv(timer) -> _ => Err(context::cause_of(ctx, Cancelled::DeadlineExceeded)),
    }
}

impl<L: Locker + std::fmt::Debug> std::fmt::Debug for Cond<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cond").field("lock", &self.lock).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelToken;
    use crate::Mutex;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn new_test_cond() -> Cond<Mutex> {
        Cond::new(Mutex::new())
    }

    /// Spin until `n` waiters are parked. Takes and releases the lock.
    fn await_waiters<L: Locker>(cond: &Cond<L>, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            cond.locker().lock();
            let waiting = cond.waiters();
            cond.locker().unlock();
            if waiting == n {
                return;
            }
            assert!(Instant::now() < deadline, "waiters never reached {n}");
            thread::yield_now();
        }
    }

    #[test]
    fn test_table_ids_are_unique() {
        let mut table = WaiterTable::default();
        let (a, _rx_a) = table.enrol();
        let (b, _rx_b) = table.enrol();
        assert_ne!(a, b);
        assert_eq!(table.channels.len(), 2);
    }

    #[test]
    fn test_table_id_wraps_and_reprobes() {
        let mut table = WaiterTable {
            next_id: u64::MAX - 1,
            ..WaiterTable::default()
        };
        let (_, _rx_parked) = table.enrol();
        assert_eq!(table.next_id, u64::MAX);

        // Occupy 0 and 1 so the wrapped counter has to skip past them.
        let (tx0, _rx0) = channel::bounded(1);
        let (tx1, _rx1) = channel::bounded(1);
        table.channels.insert(0, tx0);
        table.channels.insert(1, tx1);

        let (id, _rx) = table.enrol();
        assert_eq!(id, 2);
    }

    #[test]
    fn test_table_signal_skips_full_channels() {
        let mut table = WaiterTable::default();
        let (first, rx_first) = table.enrol();
        let (_, rx_second) = table.enrol();

        // Fill the first waiter's channel behind the table's back.
        table.channels[&first].try_send(()).unwrap();

        assert!(table.signal());
        assert_eq!(table.channels.len(), 1);
        assert!(table.channels.contains_key(&first));
        assert!(rx_second.try_recv().is_ok());

        // Only the full channel is left: nothing to deliver.
        assert!(!table.signal());
        assert!(rx_first.try_recv().is_ok());
        assert!(rx_first.try_recv().is_err());
    }

    #[test]
    fn test_table_broadcast_skips_full_and_gone() {
        let mut table = WaiterTable::default();
        let (full, _rx_full) = table.enrol();
        let (_, rx_gone) = table.enrol();
        let (_, rx_ready) = table.enrol();

        table.channels[&full].try_send(()).unwrap();
        drop(rx_gone);

        assert_eq!(table.broadcast(), 1);
        assert!(rx_ready.try_recv().is_ok());
        assert_eq!(table.channels.len(), 2);
    }

    #[test]
    fn test_cond_basic_signal() {
        let c = new_test_cond();

        c.locker().lock();
        c.signal();
        c.locker().unlock();
    }

    #[test]
    fn test_cond_basic_broadcast() {
        let c = new_test_cond();

        c.locker().lock();
        c.broadcast();
        c.locker().unlock();
    }

    #[test]
    #[should_panic(expected = "Cond::signal called without holding the lock")]
    fn test_signal_without_lock_panics() {
        new_test_cond().signal();
    }

    #[test]
    #[should_panic(expected = "Cond::broadcast called without holding the lock")]
    fn test_broadcast_without_lock_panics() {
        new_test_cond().broadcast();
    }

    #[test]
    #[should_panic(expected = "Cond::wait called without holding the lock")]
    fn test_wait_without_lock_panics() {
        new_test_cond().wait();
    }

    #[test]
    #[should_panic(expected = "Cond::wait called without holding the lock")]
    fn test_cancelled_wait_without_lock_panics() {
        let token = CancelToken::new();
        token.cancel();
        let _ = new_test_cond().wait_with_context(&token);
    }

    #[test]
    fn test_wait_with_cancelled_context_keeps_lock() {
        let c = new_test_cond();
        let token = CancelToken::new();
        token.cancel();

        c.locker().lock();
        assert_eq!(c.wait_with_context(&token), Err(Cancelled::Canceled));
        assert!(c.locker().is_locked());
        assert_eq!(c.waiters(), 0);
        c.locker().unlock();
    }

    #[test]
    fn test_basic_cond_signal() {
        let c = Arc::new(new_test_cond());

        let waiter = {
            let c = c.clone();
            thread::spawn(move || {
                c.locker().lock();
                c.wait();
                assert!(c.locker().is_locked());
                c.locker().unlock();
            })
        };

        await_waiters(&c, 1);

        c.locker().lock();
        c.signal();
        c.locker().unlock();

        waiter.join().unwrap();
    }

    #[test]
    fn test_wait_with_context_deadline_cleans_up() {
        let c = new_test_cond();
        let token = CancelToken::with_timeout(Duration::from_millis(20));

        c.locker().lock();
        assert_eq!(c.wait_with_context(&token), Err(Cancelled::DeadlineExceeded));
        assert!(c.locker().is_locked());
        assert_eq!(c.waiters(), 0);
        c.locker().unlock();
    }

    #[test]
    fn test_wait_with_context_cancelled_while_parked() {
        let c = Arc::new(new_test_cond());
        let token = CancelToken::new();

        let waiter = {
            let c = c.clone();
            let token = token.clone();
            thread::spawn(move || {
                c.locker().lock();
                let result = c.wait_with_context(&token);
                let still_enrolled = c.waiters();
                c.locker().unlock();
                (result, still_enrolled)
            })
        };

        await_waiters(&c, 1);
        token.cancel_with_cause("stop");

        let (result, still_enrolled) = waiter.join().unwrap();
        assert_eq!(result, Err(Cancelled::Cause("stop".into())));
        assert_eq!(still_enrolled, 0);
    }

    #[test]
    fn test_signal_racing_cancel_is_woken() {
        let c = Arc::new(new_test_cond());
        let token = CancelToken::new();

        let waiter = {
            let c = c.clone();
            let token = token.clone();
            thread::spawn(move || {
                c.locker().lock();
                let result = c.wait_with_context(&token);
                c.locker().unlock();
                result
            })
        };

        await_waiters(&c, 1);

        // Signal and cancel while holding the lock: whichever arm the waiter
        // sees first, it cannot relock before we release, and the delivered
        // wake-up is never lost.
        c.locker().lock();
        c.signal();
        token.cancel();
        c.locker().unlock();

        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_wait_while() {
        let c = Arc::new(new_test_cond());
        let ready = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let waiter = {
            let c = c.clone();
            let ready = ready.clone();
            thread::spawn(move || {
                c.locker().lock();
                c.wait_while(|| !ready.load(std::sync::atomic::Ordering::Relaxed));
                c.locker().unlock();
            })
        };

        await_waiters(&c, 1);

        // A wake-up without the condition puts the waiter straight back.
        c.locker().lock();
        c.signal();
        c.locker().unlock();
        await_waiters(&c, 1);

        c.locker().lock();
        ready.store(true, std::sync::atomic::Ordering::Relaxed);
        c.signal();
        c.locker().unlock();

        waiter.join().unwrap();
    }

    #[test]
    fn test_wait_while_with_context_cancelled() {
        let c = new_test_cond();
        let token = CancelToken::with_timeout(Duration::from_millis(20));

        c.locker().lock();
        assert_eq!(
            c.wait_while_with_context(&token, || true),
            Err(Cancelled::DeadlineExceeded)
        );
        assert_eq!(c.wait_while_with_context(&token, || false), Ok(()));
        c.locker().unlock();
    }
}
