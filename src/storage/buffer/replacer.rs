use crate::storage::page::PageId;
use std::fmt::Debug;

pub trait Replacer: Send + Sync + Debug {
    /// Select the least-recently-used page satisfying `evictable` and
    /// remove it from the replacer. Returns None if nothing qualifies.
    fn evict(&mut self, evictable: &dyn Fn(&PageId) -> bool) -> Option<PageId>;

    /// Record a use of the page, making it the most recently used entry.
    fn touch(&mut self, pid: PageId);

    /// Forget the page entirely (it left the cache).
    fn remove(&mut self, pid: PageId);

    /// Number of tracked pages.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
