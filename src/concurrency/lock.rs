//! The lock manager: shared/exclusive page locks under strict 2PL.
//!
//! `try_acquire` is a synchronous try/fail primitive; it never blocks.
//! Waiters park on a per-page condition variable via `wait_for_release`,
//! and every release wakes all of a page's waiters. The retry/deadline
//! policy (and the decision to abort) lives in the buffer pool.

use crate::storage::page::PageId;
use crate::transaction::TransactionId;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// The permission a caller requests when fetching a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    ReadOnly,
    ReadWrite,
}

impl Permission {
    pub fn lock_mode(&self) -> LockMode {
        match self {
            Permission::ReadOnly => LockMode::Shared,
            Permission::ReadWrite => LockMode::Exclusive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn is_compatible_with(&self, other: &LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

/// Granted holders of one page. A page has either any number of shared
/// holders or exactly one exclusive holder, never both.
#[derive(Debug, Default)]
struct LockState {
    holders: Vec<(TransactionId, LockMode)>,
    waiters: usize,
}

#[derive(Debug, Default)]
struct PageLockState {
    state: Mutex<LockState>,
    released: Condvar,
}

/// Tracks, per page, the set of granted holders; and per transaction, the
/// set of locked pages. Both tables are sharded maps so unrelated pages
/// never contend on one global lock.
#[derive(Debug, Default)]
pub struct LockManager {
    page_locks: DashMap<PageId, Arc<PageLockState>>,
    txn_locks: DashMap<TransactionId, HashSet<PageId>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to acquire a lock without blocking.
    ///
    /// Shared succeeds when there is no exclusive holder, or the sole
    /// exclusive holder is `tid`. Exclusive succeeds when there are no
    /// holders, or `tid` is the only holder (upgrading a shared lock in
    /// place, or re-acquiring its own exclusive).
    pub fn try_acquire(&self, tid: TransactionId, pid: PageId, perm: Permission) -> bool {
        let mode = perm.lock_mode();
        let entry = self
            .page_locks
            .entry(pid)
            .or_insert_with(|| Arc::new(PageLockState::default()))
            .clone();

        let granted = {
            let mut state = entry.state.lock();
            match mode {
                LockMode::Shared => {
                    if let Some((holder, _)) = state
                        .holders
                        .iter()
                        .find(|(_, m)| *m == LockMode::Exclusive)
                    {
                        // Our own exclusive lock subsumes shared.
                        *holder == tid
                    } else {
                        if !state.holders.iter().any(|(t, _)| *t == tid) {
                            state.holders.push((tid, LockMode::Shared));
                        }
                        true
                    }
                }
                LockMode::Exclusive => {
                    if state.holders.is_empty() {
                        state.holders.push((tid, LockMode::Exclusive));
                        true
                    } else if state.holders.len() == 1 && state.holders[0].0 == tid {
                        // Sole holder: upgrade in place or already exclusive.
                        state.holders[0].1 = LockMode::Exclusive;
                        true
                    } else {
                        false
                    }
                }
            }
        };

        if granted {
            self.txn_locks.entry(tid).or_default().insert(pid);
            log::trace!("{} acquired {:?} lock on {}", tid, mode, pid);
        } else {
            log::trace!("{} denied {:?} lock on {}", tid, mode, pid);
        }
        granted
    }

    /// Parks the caller until some lock on `pid` is released or `timeout`
    /// elapses. Returns immediately when the page has no lock entry.
    pub fn wait_for_release(&self, pid: PageId, timeout: Duration) {
        let entry = match self.page_locks.get(&pid) {
            Some(e) => e.value().clone(),
            None => return,
        };
        let mut state = entry.state.lock();
        if state.holders.is_empty() {
            return;
        }
        state.waiters += 1;
        let _ = entry.released.wait_for(&mut state, timeout);
        state.waiters -= 1;
    }

    /// Releases `tid`'s lock on one page. Idempotent.
    pub fn release(&self, tid: TransactionId, pid: PageId) {
        self.release_page_side(tid, pid);
        if let Some(mut set) = self.txn_locks.get_mut(&tid) {
            set.remove(&pid);
        }
        self.txn_locks.remove_if(&tid, |_, set| set.is_empty());
    }

    /// Releases every lock held by `tid`. Idempotent.
    pub fn release_all(&self, tid: TransactionId) {
        if let Some((_, pids)) = self.txn_locks.remove(&tid) {
            for pid in pids {
                self.release_page_side(tid, pid);
            }
        }
        log::trace!("{} released all locks", tid);
    }

    fn release_page_side(&self, tid: TransactionId, pid: PageId) {
        let entry = match self.page_locks.get(&pid) {
            Some(e) => e.value().clone(),
            None => return,
        };
        {
            let mut state = entry.state.lock();
            state.holders.retain(|(t, _)| *t != tid);
            entry.released.notify_all();
        }
        self.page_locks.remove_if(&pid, |_, v| {
            let state = v.state.lock();
            state.holders.is_empty() && state.waiters == 0
        });
    }

    pub fn holds_lock(&self, tid: TransactionId, pid: PageId) -> bool {
        self.holding_mode(tid, pid).is_some()
    }

    /// The mode `tid` holds on `pid`, if any.
    pub fn holding_mode(&self, tid: TransactionId, pid: PageId) -> Option<LockMode> {
        let entry = self.page_locks.get(&pid)?.value().clone();
        let state = entry.state.lock();
        state
            .holders
            .iter()
            .find(|(t, _)| *t == tid)
            .map(|(_, m)| *m)
    }

    /// Every page `tid` currently holds a lock on. Drives the commit/abort
    /// walk in the buffer pool.
    pub fn pages_of(&self, tid: TransactionId) -> Vec<PageId> {
        self.txn_locks
            .get(&tid)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageCategory;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Instant;

    fn pid(page_no: u32) -> PageId {
        PageId::new(1, page_no, PageCategory::Leaf)
    }

    fn tid(id: u64) -> TransactionId {
        TransactionId::new(id)
    }

    #[test]
    fn test_mode_compatibility() {
        assert!(LockMode::Shared.is_compatible_with(&LockMode::Shared));
        assert!(!LockMode::Shared.is_compatible_with(&LockMode::Exclusive));
        assert!(!LockMode::Exclusive.is_compatible_with(&LockMode::Shared));
        assert!(!LockMode::Exclusive.is_compatible_with(&LockMode::Exclusive));
    }

    #[test]
    fn test_many_shared_holders() {
        let manager = LockManager::new();
        for id in 1..=5 {
            assert!(manager.try_acquire(tid(id), pid(1), Permission::ReadOnly));
        }
        for id in 1..=5 {
            assert_eq!(
                manager.holding_mode(tid(id), pid(1)),
                Some(LockMode::Shared)
            );
        }
    }

    #[test]
    fn test_exclusive_excludes_everyone_else() {
        let manager = LockManager::new();
        assert!(manager.try_acquire(tid(1), pid(1), Permission::ReadWrite));
        assert!(!manager.try_acquire(tid(2), pid(1), Permission::ReadWrite));
        assert!(!manager.try_acquire(tid(2), pid(1), Permission::ReadOnly));
    }

    #[test]
    fn test_exclusive_subsumes_own_shared_request() {
        let manager = LockManager::new();
        assert!(manager.try_acquire(tid(1), pid(1), Permission::ReadWrite));
        assert!(manager.try_acquire(tid(1), pid(1), Permission::ReadOnly));
        // Still exclusive, not downgraded.
        assert_eq!(
            manager.holding_mode(tid(1), pid(1)),
            Some(LockMode::Exclusive)
        );
    }

    #[test]
    fn test_upgrade_sole_shared_holder() {
        let manager = LockManager::new();
        assert!(manager.try_acquire(tid(1), pid(1), Permission::ReadOnly));
        assert!(manager.try_acquire(tid(1), pid(1), Permission::ReadWrite));
        assert_eq!(
            manager.holding_mode(tid(1), pid(1)),
            Some(LockMode::Exclusive)
        );
    }

    #[test]
    fn test_upgrade_denied_with_other_shared_holders() {
        let manager = LockManager::new();
        assert!(manager.try_acquire(tid(1), pid(1), Permission::ReadOnly));
        assert!(manager.try_acquire(tid(2), pid(1), Permission::ReadOnly));
        assert!(!manager.try_acquire(tid(1), pid(1), Permission::ReadWrite));
        // The shared lock is still held.
        assert_eq!(
            manager.holding_mode(tid(1), pid(1)),
            Some(LockMode::Shared)
        );
    }

    #[test]
    fn test_release_unblocks_exclusive() {
        let manager = LockManager::new();
        assert!(manager.try_acquire(tid(1), pid(1), Permission::ReadOnly));
        assert!(!manager.try_acquire(tid(2), pid(1), Permission::ReadWrite));
        manager.release(tid(1), pid(1));
        assert!(manager.try_acquire(tid(2), pid(1), Permission::ReadWrite));
    }

    #[test]
    fn test_release_is_idempotent() {
        let manager = LockManager::new();
        assert!(manager.try_acquire(tid(1), pid(1), Permission::ReadOnly));
        manager.release(tid(1), pid(1));
        manager.release(tid(1), pid(1));
        manager.release_all(tid(1));
        assert!(!manager.holds_lock(tid(1), pid(1)));
    }

    #[test]
    fn test_release_all() {
        let manager = LockManager::new();
        for page_no in 1..=4 {
            assert!(manager.try_acquire(tid(1), pid(page_no), Permission::ReadWrite));
        }
        assert_eq!(manager.pages_of(tid(1)).len(), 4);

        manager.release_all(tid(1));
        assert!(manager.pages_of(tid(1)).is_empty());
        for page_no in 1..=4 {
            assert!(manager.try_acquire(tid(2), pid(page_no), Permission::ReadWrite));
        }
    }

    #[test]
    fn test_two_exclusive_requests_never_both_succeed() {
        let manager = Arc::new(LockManager::new());
        let barrier = Arc::new(Barrier::new(2));
        let mut handles = vec![];

        for id in 1..=2u64 {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                manager.try_acquire(tid(id), pid(1), Permission::ReadWrite)
            }));
        }

        let grants: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(grants.iter().filter(|g| **g).count(), 1);
    }

    #[test]
    fn test_wait_for_release_wakes_on_notify() {
        let manager = Arc::new(LockManager::new());
        assert!(manager.try_acquire(tid(1), pid(1), Permission::ReadWrite));

        let waiter = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                let start = Instant::now();
                manager.wait_for_release(pid(1), Duration::from_secs(5));
                start.elapsed()
            })
        };

        thread::sleep(Duration::from_millis(50));
        manager.release(tid(1), pid(1));
        let waited = waiter.join().unwrap();
        assert!(
            waited < Duration::from_secs(1),
            "waiter should wake on release, waited {:?}",
            waited
        );
    }

    #[test]
    fn test_wait_for_release_times_out() {
        let manager = LockManager::new();
        assert!(manager.try_acquire(tid(1), pid(1), Permission::ReadWrite));
        let start = Instant::now();
        manager.wait_for_release(pid(1), Duration::from_millis(30));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_wait_for_unlocked_page_returns_immediately() {
        let manager = LockManager::new();
        let start = Instant::now();
        manager.wait_for_release(pid(1), Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
