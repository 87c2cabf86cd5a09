//! The buffer pool: a bounded cache of in-memory pages.
//!
//! Every fetch goes through the lock manager first; the pool owns the
//! retry/deadline policy and aborts the transaction when the deadline
//! passes. This timeout is the system's deadlock breaker: there is no
//! cycle detection, so a transaction can be aborted under load without
//! being truly deadlocked.

pub mod lru;
pub mod replacer;

use crate::catalog::Catalog;
use crate::concurrency::lock::{LockManager, Permission};
use crate::storage::error::{DbError, DbResult};
use crate::storage::page::{Page, PageId};
use crate::storage::wal::WalManager;
use crate::transaction::TransactionId;
use dashmap::DashMap;
use lru::LruReplacer;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use replacer::Replacer;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Whether a dirty page may be written out before its transaction commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Never evict a dirty page; fail when every candidate is dirty.
    NoSteal,
    /// Flush a dirty victim (WAL first) before evicting it.
    Steal,
}

#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    pub capacity: usize,
    pub policy: EvictionPolicy,
    /// Lower bound of the randomized lock-acquisition deadline.
    pub min_timeout: Duration,
    /// Upper bound of the randomized lock-acquisition deadline.
    pub max_timeout: Duration,
    /// How long one wait on the page's condition variable may last.
    pub retry_interval: Duration,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            policy: EvictionPolicy::NoSteal,
            min_timeout: Duration::from_secs(4),
            max_timeout: Duration::from_secs(6),
            retry_interval: Duration::from_millis(10),
        }
    }
}

/// A cache entry, shared by reference with every caller that fetched it.
/// Only the holder of an exclusive page lock may mutate the contents.
pub type PageHandle = Arc<RwLock<Page>>;

pub struct BufferPool {
    catalog: Arc<Catalog>,
    lock_manager: Arc<LockManager>,
    wal: Arc<WalManager>,
    cache: DashMap<PageId, PageHandle>,
    replacer: Mutex<Box<dyn Replacer>>,
    config: BufferPoolConfig,
}

impl BufferPool {
    pub fn new(
        catalog: Arc<Catalog>,
        lock_manager: Arc<LockManager>,
        wal: Arc<WalManager>,
        config: BufferPoolConfig,
    ) -> Self {
        Self::with_replacer(
            catalog,
            lock_manager,
            wal,
            Box::new(LruReplacer::new()),
            config,
        )
    }

    pub fn with_replacer(
        catalog: Arc<Catalog>,
        lock_manager: Arc<LockManager>,
        wal: Arc<WalManager>,
        replacer: Box<dyn Replacer>,
        config: BufferPoolConfig,
    ) -> Self {
        assert!(config.capacity >= 2, "buffer pool needs at least two pages");
        Self {
            catalog,
            lock_manager,
            wal,
            cache: DashMap::new(),
            replacer: Mutex::new(replacer),
            config,
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn config(&self) -> &BufferPoolConfig {
        &self.config
    }

    /// Fetches a page with the given permission, blocking until the lock is
    /// granted or a randomized deadline passes. On timeout the transaction
    /// is aborted: all of its dirty pages are discarded and all of its
    /// locks released before the error is returned.
    pub fn fetch(
        &self,
        tid: TransactionId,
        pid: PageId,
        perm: Permission,
    ) -> DbResult<PageHandle> {
        if !self.lock_manager.try_acquire(tid, pid, perm) {
            // Jitter the deadline so competing transactions do not retry in
            // lockstep.
            let min = self.config.min_timeout.as_millis() as u64;
            let max = self.config.max_timeout.as_millis() as u64;
            let timeout = Duration::from_millis(rand::thread_rng().gen_range(min..=max));
            let deadline = Instant::now() + timeout;
            loop {
                let now = Instant::now();
                if now >= deadline {
                    log::debug!("{} timed out waiting for {:?} on {}", tid, perm, pid);
                    self.abort(tid)?;
                    return Err(DbError::TransactionAborted(tid));
                }
                let wait = self.config.retry_interval.min(deadline - now);
                self.lock_manager.wait_for_release(pid, wait);
                if self.lock_manager.try_acquire(tid, pid, perm) {
                    break;
                }
            }
        }

        if let Some(handle) = self.cache.get(&pid).map(|e| e.value().clone()) {
            self.replacer.lock().touch(pid);
            return Ok(handle);
        }

        let table = self.catalog.resolve(pid.table_id)?;
        let page = table.read_page(pid)?;
        let handle: PageHandle = Arc::new(RwLock::new(page));
        self.evict_if_full()?;
        let handle = self
            .cache
            .entry(pid)
            .or_insert_with(|| handle)
            .value()
            .clone();
        self.replacer.lock().touch(pid);
        Ok(handle)
    }

    /// Registers a page object dirtied by a tree operation, replacing any
    /// cached version so future fetches see the update.
    pub fn put_page(&self, tid: TransactionId, handle: PageHandle) -> DbResult<()> {
        let pid = handle.read().pid();
        handle.write().mark_dirty(tid);
        if !self.cache.contains_key(&pid) {
            self.evict_if_full()?;
        }
        self.cache.insert(pid, handle);
        self.replacer.lock().touch(pid);
        Ok(())
    }

    fn evict_if_full(&self) -> DbResult<()> {
        while self.cache.len() >= self.config.capacity {
            let victim = {
                let mut replacer = self.replacer.lock();
                match self.config.policy {
                    EvictionPolicy::Steal => replacer.evict(&|_| true),
                    EvictionPolicy::NoSteal => replacer.evict(&|pid| {
                        self.cache
                            .get(pid)
                            .map(|h| !h.read().is_dirty())
                            .unwrap_or(true)
                    }),
                }
            };
            let victim = victim.ok_or(DbError::BufferPoolFull)?;
            if let Some((_, handle)) = self.cache.remove(&victim) {
                let dirty = handle.read().is_dirty();
                if dirty {
                    // Steal policy: WAL first, then disk.
                    self.write_out(&handle.read())?;
                    handle.write().mark_clean();
                }
                log::trace!("evicted {} (dirty: {})", victim, dirty);
            }
        }
        Ok(())
    }

    /// Write-ahead discipline: log the before/after images and force the
    /// log before the page overwrites its on-disk predecessor.
    fn write_out(&self, page: &Page) -> DbResult<()> {
        if let Some(dirtier) = page.dirtier() {
            self.wal
                .append_update(dirtier, page.pid(), page.before_image(), &page.serialize())?;
            self.wal.force()?;
        }
        let table = self.catalog.resolve(page.pid().table_id)?;
        table.write_page(page)
    }

    /// Flushes one page if it is cached and dirty.
    pub fn flush_page(&self, pid: PageId) -> DbResult<()> {
        if let Some(handle) = self.cache.get(&pid).map(|e| e.value().clone()) {
            let mut page = handle.write();
            if page.is_dirty() {
                self.write_out(&page)?;
                page.mark_clean();
            }
        }
        Ok(())
    }

    /// Commits a transaction: flush every page it touched, re-capture each
    /// before-image for the next transaction, then release all its locks.
    pub fn commit(&self, tid: TransactionId) -> DbResult<()> {
        for pid in self.lock_manager.pages_of(tid) {
            self.flush_page(pid)?;
            if let Some(handle) = self.cache.get(&pid).map(|e| e.value().clone()) {
                handle.write().set_before_image();
            }
        }
        self.lock_manager.release_all(tid);
        log::debug!("{} committed", tid);
        Ok(())
    }

    /// Aborts a transaction: discard every page it touched (no flush) and
    /// release all its locks. A later fetch reloads clean contents from
    /// disk, so none of the aborted mutations remain visible.
    pub fn abort(&self, tid: TransactionId) -> DbResult<()> {
        for pid in self.lock_manager.pages_of(tid) {
            self.discard(pid);
        }
        self.lock_manager.release_all(tid);
        log::debug!("{} aborted", tid);
        Ok(())
    }

    /// Unconditionally evicts a page without flushing. Used when a page is
    /// freed or about to be re-created from scratch.
    pub fn discard(&self, pid: PageId) {
        self.cache.remove(&pid);
        self.replacer.lock().remove(pid);
    }

    /// Flushes every dirty page. Breaks the no-steal guarantee if invoked
    /// while transactions are in flight.
    pub fn flush_all_pages(&self) -> DbResult<()> {
        let pids: Vec<PageId> = self.cache.iter().map(|e| *e.key()).collect();
        for pid in pids {
            self.flush_page(pid)?;
        }
        Ok(())
    }

    pub fn cached_pages(&self) -> usize {
        self.cache.len()
    }

    pub fn contains(&self, pid: PageId) -> bool {
        self.cache.contains_key(&pid)
    }
}
