use super::replacer::Replacer;
use crate::storage::page::PageId;
use std::collections::VecDeque;

/// Least-recently-used replacement: least recent at the front.
#[derive(Debug, Default)]
pub struct LruReplacer {
    lru_list: VecDeque<PageId>,
}

impl LruReplacer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Replacer for LruReplacer {
    fn evict(&mut self, evictable: &dyn Fn(&PageId) -> bool) -> Option<PageId> {
        let index = self.lru_list.iter().position(evictable)?;
        self.lru_list.remove(index)
    }

    fn touch(&mut self, pid: PageId) {
        if let Some(index) = self.lru_list.iter().position(|p| *p == pid) {
            self.lru_list.remove(index);
        }
        self.lru_list.push_back(pid);
    }

    fn remove(&mut self, pid: PageId) {
        if let Some(index) = self.lru_list.iter().position(|p| *p == pid) {
            self.lru_list.remove(index);
        }
    }

    fn len(&self) -> usize {
        self.lru_list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageCategory;

    fn pid(page_no: u32) -> PageId {
        PageId::new(1, page_no, PageCategory::Leaf)
    }

    #[test]
    fn test_evicts_least_recently_used_first() {
        let mut replacer = LruReplacer::new();
        replacer.touch(pid(1));
        replacer.touch(pid(2));
        replacer.touch(pid(3));

        assert_eq!(replacer.evict(&|_| true), Some(pid(1)));
        assert_eq!(replacer.evict(&|_| true), Some(pid(2)));
        assert_eq!(replacer.evict(&|_| true), Some(pid(3)));
        assert_eq!(replacer.evict(&|_| true), None);
    }

    #[test]
    fn test_touch_refreshes_recency() {
        let mut replacer = LruReplacer::new();
        replacer.touch(pid(1));
        replacer.touch(pid(2));
        replacer.touch(pid(1));

        assert_eq!(replacer.evict(&|_| true), Some(pid(2)));
        assert_eq!(replacer.evict(&|_| true), Some(pid(1)));
    }

    #[test]
    fn test_evict_skips_filtered_pages() {
        let mut replacer = LruReplacer::new();
        replacer.touch(pid(1));
        replacer.touch(pid(2));

        let skip_one = |p: &PageId| p.page_no != 1;
        assert_eq!(replacer.evict(&skip_one), Some(pid(2)));
        assert_eq!(replacer.evict(&skip_one), None);
        assert_eq!(replacer.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut replacer = LruReplacer::new();
        replacer.touch(pid(1));
        replacer.touch(pid(2));
        replacer.remove(pid(1));
        assert_eq!(replacer.len(), 1);
        assert_eq!(replacer.evict(&|_| true), Some(pid(2)));
    }
}
