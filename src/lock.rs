//! Per-page shared/exclusive lock, reentrant at the transaction level.
//!
//! The lock is keyed by transaction identity, not by thread: a second
//! thread acting for the same transaction does not block against it.
//! Deadlocks are handled by bounded waiting — every acquire computes a
//! randomized deadline and gives up with `TxnAborted` past it. The jitter
//! matters: with equal deadlines, two mutually blocked transactions abort
//! and retry in lockstep forever.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::errors::{Result, StoreError};
use crate::TransactionId;

/// Minimum wait before a blocked acquire aborts.
const TIMEOUT_MIN: Duration = Duration::from_millis(50);
/// Random extra wait added on top of the minimum, exclusive.
const TIMEOUT_RANGE_MS: u64 = 400;
/// Blocked waiters recheck the grant condition at least this often.
const WAIT_SLICE: Duration = Duration::from_millis(100);

struct LockState {
    /// False while the lock is held exclusively.
    shared: bool,
    holders: HashSet<TransactionId>,
    /// Transactions currently blocked in an acquire. The buffer pool must
    /// not drop a lock from its book while a waiter still references it.
    waiters: usize,
}

pub struct PageLock {
    state: Mutex<LockState>,
    changed: Condvar,
}

impl Default for PageLock {
    fn default() -> Self {
        Self::new()
    }
}

impl PageLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                shared: true,
                holders: HashSet::new(),
                waiters: 0,
            }),
            changed: Condvar::new(),
        }
    }

    fn deadline() -> Instant {
        let jitter = rand::thread_rng().gen_range(0..TIMEOUT_RANGE_MS);
        Instant::now() + TIMEOUT_MIN + Duration::from_millis(jitter)
    }

    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, LockState>,
        deadline: Instant,
    ) -> Result<MutexGuard<'a, LockState>> {
        if Instant::now() > deadline {
            log::warn!("lock wait timed out, aborting transaction");
            return Err(StoreError::TxnAborted);
        }
        let mut guard = guard;
        guard.waiters += 1;
        let (mut guard, _) = self.changed.wait_timeout(guard, WAIT_SLICE).unwrap();
        guard.waiters -= 1;
        Ok(guard)
    }

    /// Acquires the lock in shared mode for `tid`, converting an unheld
    /// exclusive lock back to shared. Blocks while another transaction
    /// holds it exclusively.
    pub fn acquire_shared(&self, tid: TransactionId) -> Result<()> {
        let deadline = Self::deadline();
        let mut state = self.state.lock().unwrap();
        while !state.shared && !state.holders.is_empty() {
            state = self.wait(state, deadline)?;
        }
        state.holders.insert(tid);
        state.shared = true;
        self.changed.notify_all();
        Ok(())
    }

    /// Acquires the lock in exclusive mode for `tid`. Grants immediately if
    /// the lock is unheld or held solely by `tid` (upgrading in place);
    /// blocks while any other transaction holds it in either mode.
    pub fn acquire_exclusive(&self, tid: TransactionId) -> Result<()> {
        let deadline = Self::deadline();
        let mut state = self.state.lock().unwrap();
        while !state.holders.is_empty()
            && !(state.holders.len() == 1 && state.holders.contains(&tid))
        {
            state = self.wait(state, deadline)?;
        }
        state.holders.insert(tid);
        state.shared = false;
        self.changed.notify_all();
        Ok(())
    }

    /// Drops `tid` from the holder set. Waking every waiter is required:
    /// several shared waiters may become jointly grantable.
    pub fn release(&self, tid: TransactionId) {
        let mut state = self.state.lock().unwrap();
        state.holders.remove(&tid);
        self.changed.notify_all();
    }

    pub fn is_held(&self) -> bool {
        !self.state.lock().unwrap().holders.is_empty()
    }

    pub fn is_held_by(&self, tid: TransactionId) -> bool {
        self.state.lock().unwrap().holders.contains(&tid)
    }

    pub fn is_exclusive(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.shared && !state.holders.is_empty()
    }

    pub fn holder_count(&self) -> usize {
        self.state.lock().unwrap().holders.len()
    }

    /// True when no transaction holds the lock and no acquire is blocked
    /// on it; only then may the owner drop it from the lock book.
    pub fn is_removable(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.holders.is_empty() && state.waiters == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn tid(n: u64) -> TransactionId {
        TransactionId(n)
    }

    #[test]
    fn two_shared_holders_coexist() {
        let lock = PageLock::new();
        lock.acquire_shared(tid(1)).unwrap();
        lock.acquire_shared(tid(2)).unwrap();
        assert!(lock.is_held_by(tid(1)));
        assert!(lock.is_held_by(tid(2)));
        assert!(!lock.is_exclusive());
    }

    #[test]
    fn sole_shared_holder_upgrades_without_blocking() {
        let lock = PageLock::new();
        lock.acquire_shared(tid(1)).unwrap();
        lock.acquire_exclusive(tid(1)).unwrap();
        assert!(lock.is_exclusive());
        assert_eq!(lock.holder_count(), 1);
    }

    #[test]
    fn exclusive_reacquire_by_holder_is_immediate() {
        let lock = PageLock::new();
        lock.acquire_exclusive(tid(1)).unwrap();
        lock.acquire_exclusive(tid(1)).unwrap();
        assert!(lock.is_exclusive());
    }

    #[test]
    fn blocked_exclusive_times_out_with_txn_aborted() {
        let lock = Arc::new(PageLock::new());
        lock.acquire_shared(tid(1)).unwrap();

        let contender = Arc::clone(&lock);
        let start = Instant::now();
        let res = thread::spawn(move || contender.acquire_exclusive(tid(2)))
            .join()
            .unwrap();
        assert!(matches!(res, Err(StoreError::TxnAborted)));
        // Deadline is 50ms plus up to 400ms of jitter; the holder was never
        // disturbed.
        assert!(start.elapsed() >= TIMEOUT_MIN);
        assert!(lock.is_held_by(tid(1)));
        assert!(!lock.is_held_by(tid(2)));
    }

    #[test]
    fn release_wakes_a_blocked_writer() {
        let lock = Arc::new(PageLock::new());
        lock.acquire_shared(tid(1)).unwrap();

        let contender = Arc::clone(&lock);
        let writer = thread::spawn(move || contender.acquire_exclusive(tid(2)));
        thread::sleep(Duration::from_millis(20));
        lock.release(tid(1));
        writer.join().unwrap().unwrap();
        assert!(lock.is_held_by(tid(2)));
        assert!(lock.is_exclusive());
    }

    #[test]
    fn exclusive_downgrades_to_shared_after_release() {
        let lock = PageLock::new();
        lock.acquire_exclusive(tid(1)).unwrap();
        lock.release(tid(1));
        assert!(!lock.is_held());
        lock.acquire_shared(tid(2)).unwrap();
        assert!(!lock.is_exclusive());
    }
}
