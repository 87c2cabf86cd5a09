//! The B+-tree engine.
//!
//! One sorted index per table, keyed on a fixed field. Every page access
//! goes through the buffer pool with a permission; internal pages are read
//! shared during descent and only the terminal leaf takes the caller's
//! permission. Structural changes (splits, merges, redistribution) walk
//! back up through parent pointers.
//!
//! Each operation keeps a local map of the pages it fetched read-write so
//! repeated fetches return the same in-progress object; on success the map
//! is handed to the buffer pool as the operation's dirty-page set. A lock
//! timeout unwinds the whole operation instead: the pool has already
//! discarded every touched page, so no partial split or merge survives.

pub mod iterator;

use crate::access::predicate::IndexPredicate;
use crate::access::tuple::{Tuple, TupleDesc};
use crate::access::value::Field;
use crate::catalog::Catalog;
use crate::concurrency::lock::Permission;
use crate::storage::buffer::{BufferPool, PageHandle};
use crate::storage::disk::TableFile;
use crate::storage::error::{DbError, DbResult};
use crate::storage::page::{HeaderPage, PageCategory, PageId};
use crate::transaction::TransactionId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub use iterator::{BTreeFileIterator, BTreeSearchIterator};

/// Pages fetched read-write by the operation in progress, keyed by id so a
/// re-fetch returns the same object.
pub(crate) type DirtyPages = HashMap<PageId, PageHandle>;

#[derive(Clone)]
pub struct BTreeFile {
    pool: Arc<BufferPool>,
    file: Arc<TableFile>,
}

impl BTreeFile {
    pub fn new(pool: Arc<BufferPool>, file: Arc<TableFile>) -> Self {
        Self { pool, file }
    }

    /// Convenience constructor resolving the file through the catalog.
    pub fn open(pool: Arc<BufferPool>, catalog: &Catalog, table_id: u32) -> DbResult<Self> {
        Ok(Self::new(pool, catalog.resolve(table_id)?))
    }

    pub fn table_id(&self) -> u32 {
        self.file.table_id()
    }

    pub fn key_field(&self) -> usize {
        self.file.key_field()
    }

    pub fn desc(&self) -> &TupleDesc {
        self.file.desc()
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Fetches through the operation-local cache first, falling back to the
    /// buffer pool. Read-write fetches are remembered as dirtied.
    pub(crate) fn get_page(
        &self,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        pid: PageId,
        perm: Permission,
    ) -> DbResult<PageHandle> {
        if let Some(handle) = dirty.get(&pid) {
            return Ok(handle.clone());
        }
        let handle = self.pool.fetch(tid, pid, perm)?;
        if perm == Permission::ReadWrite {
            dirty.insert(pid, handle.clone());
        }
        Ok(handle)
    }

    /// Read-locks the root-pointer page, creating the file's first pages if
    /// the file is still empty.
    pub(crate) fn get_root_ptr_page(
        &self,
        tid: TransactionId,
        dirty: &mut DirtyPages,
    ) -> DbResult<PageHandle> {
        self.file.ensure_initialized()?;
        self.get_page(
            tid,
            dirty,
            PageId::root_ptr(self.table_id()),
            Permission::ReadOnly,
        )
    }

    /// The current root id for a write path, recording the first leaf as
    /// root if none has been recorded yet.
    fn root_pid_for_write(
        &self,
        tid: TransactionId,
        dirty: &mut DirtyPages,
    ) -> DbResult<PageId> {
        let root_ptr = self.get_root_ptr_page(tid, dirty)?;
        let root = root_ptr.read().as_root_ptr().root();
        match root {
            Some((page_no, category)) => Ok(PageId::new(self.table_id(), page_no, category)),
            None => {
                let first_leaf_no = self.file.num_pages()?.max(1);
                let root_ptr = self.get_page(
                    tid,
                    dirty,
                    PageId::root_ptr(self.table_id()),
                    Permission::ReadWrite,
                )?;
                root_ptr
                    .write()
                    .as_root_ptr_mut()
                    .set_root(first_leaf_no, PageCategory::Leaf);
                Ok(PageId::new(
                    self.table_id(),
                    first_leaf_no,
                    PageCategory::Leaf,
                ))
            }
        }
    }

    /// Descends to the leaf that would contain `key` (the leftmost possibly
    /// containing it; presence is not guaranteed). Internal pages are read
    /// shared; the leaf is fetched with `perm`. `None` descends to the
    /// leftmost leaf.
    pub(crate) fn find_leaf(
        &self,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        mut pid: PageId,
        perm: Permission,
        key: Option<&Field>,
    ) -> DbResult<PageHandle> {
        loop {
            match pid.category {
                PageCategory::Leaf => return self.get_page(tid, dirty, pid, perm),
                PageCategory::Internal => {
                    let handle = self.get_page(tid, dirty, pid, Permission::ReadOnly)?;
                    let page = handle.read();
                    let internal = page.as_internal();
                    if internal.num_entries() == 0 {
                        return Err(DbError::Corrupted(format!(
                            "internal page {} has no entries during descent",
                            pid
                        )));
                    }
                    let child_index = internal.find_child_index(key);
                    pid = PageId::new(
                        self.table_id(),
                        internal.child(child_index),
                        internal.child_category(),
                    );
                }
                _ => panic!("find_leaf: {} is neither leaf nor internal", pid),
            }
        }
    }

    /// Inserts a tuple, splitting the target leaf (and any full ancestors)
    /// first when necessary. Returns the set of pages dirtied.
    pub fn insert(&self, tid: TransactionId, tuple: Tuple) -> DbResult<HashSet<PageId>> {
        self.desc().validate(&tuple)?;
        let mut dirty = DirtyPages::new();

        let root_pid = self.root_pid_for_write(tid, &mut dirty)?;
        let key = tuple.field(self.key_field()).clone();
        let mut leaf = self.find_leaf(tid, &mut dirty, root_pid, Permission::ReadWrite, Some(&key))?;
        if leaf.read().as_leaf().is_full() {
            leaf = self.split_leaf_page(tid, &mut dirty, leaf, &key)?;
        }
        {
            let mut page = leaf.write();
            let pid = page.pid();
            page.as_leaf_mut().insert_tuple(pid, tuple)?;
        }
        self.finish_op(tid, dirty)
    }

    /// Deletes a stored tuple (located by its record id), rebalancing pages
    /// that fall below minimum occupancy. Returns the set of pages dirtied.
    pub fn delete(&self, tid: TransactionId, tuple: &Tuple) -> DbResult<HashSet<PageId>> {
        let rid = tuple
            .rid()
            .ok_or_else(|| DbError::TupleNotFound("tuple has no record id".into()))?;
        assert_eq!(
            rid.pid.table_id,
            self.table_id(),
            "record id names another table"
        );
        let leaf_pid = PageId::new(self.table_id(), rid.pid.page_no, PageCategory::Leaf);
        let mut dirty = DirtyPages::new();

        let leaf = self.get_page(tid, &mut dirty, leaf_pid, Permission::ReadWrite)?;
        {
            let mut page = leaf.write();
            let pid = page.pid();
            page.as_leaf_mut().delete_tuple(pid, tuple)?;
        }
        if leaf.read().as_leaf().below_min() {
            self.handle_min_occupancy_page(tid, &mut dirty, leaf)?;
        }
        self.finish_op(tid, dirty)
    }

    /// All tuples in ascending key order; restartable via `rewind`.
    pub fn iterate(&self, tid: TransactionId) -> DbResult<BTreeFileIterator> {
        BTreeFileIterator::new(self.clone(), tid)
    }

    /// Tuples matching the predicate, using the descent-to-leftmost-leaf
    /// shortcut for predicates anchored at a value.
    pub fn search(
        &self,
        tid: TransactionId,
        predicate: IndexPredicate,
    ) -> DbResult<BTreeSearchIterator> {
        BTreeSearchIterator::new(self.clone(), tid, predicate)
    }

    /// Registers the operation's read-write pages with the buffer pool as
    /// its dirty-page set.
    fn finish_op(&self, tid: TransactionId, dirty: DirtyPages) -> DbResult<HashSet<PageId>> {
        let mut pids = HashSet::with_capacity(dirty.len());
        for (pid, handle) in dirty {
            self.pool.put_page(tid, handle)?;
            pids.insert(pid);
        }
        Ok(pids)
    }

    // ---- splitting ------------------------------------------------------

    /// Splits a full leaf: a new right sibling takes the upper half of the
    /// tuples, the first moved key is copied up as the parent separator, and
    /// the sibling chain and parent pointers are relinked. Returns the half
    /// whose key range contains `key`.
    fn split_leaf_page(
        &self,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        page: PageHandle,
        key: &Field,
    ) -> DbResult<PageHandle> {
        let page_pid = page.read().pid();
        let new_page = self.get_empty_page(tid, dirty, PageCategory::Leaf)?;
        let new_pid = new_page.read().pid();

        let moved = {
            let mut guard = page.write();
            let leaf = guard.as_leaf_mut();
            let num_to_move = leaf.num_tuples() / 2;
            leaf.take_back(num_to_move)
        };
        let split_key = moved
            .first()
            .ok_or_else(|| DbError::Corrupted(format!("split of empty leaf {}", page_pid)))?
            .field(self.key_field())
            .clone();
        {
            let mut guard = new_page.write();
            let leaf = guard.as_leaf_mut();
            for tuple in moved {
                leaf.insert_tuple(new_pid, tuple)?;
            }
        }

        // Parent first: it may itself split, or a new root may be created.
        let parent_pid = page.read().parent_id();
        let parent = self.get_parent_with_empty_slots(tid, dirty, parent_pid, &split_key)?;
        let parent_pid = parent.read().pid();
        {
            let mut guard = parent.write();
            let internal = guard.as_internal_mut();
            internal.set_child_category(PageCategory::Leaf);
            internal.insert_entry(split_key.clone(), page_pid.page_no, new_pid.page_no)?;
        }

        // Splice the new page into the sibling chain.
        let old_right = page.read().as_leaf().right_sibling();
        {
            let mut guard = new_page.write();
            let leaf = guard.as_leaf_mut();
            leaf.set_left_sibling(Some(page_pid.page_no));
            leaf.set_right_sibling(old_right);
        }
        if let Some(right_no) = old_right {
            let old_right_pid = PageId::new(self.table_id(), right_no, PageCategory::Leaf);
            let old_right_page =
                self.get_page(tid, dirty, old_right_pid, Permission::ReadWrite)?;
            old_right_page
                .write()
                .as_leaf_mut()
                .set_left_sibling(Some(new_pid.page_no));
        }
        page.write()
            .as_leaf_mut()
            .set_right_sibling(Some(new_pid.page_no));

        self.update_parent_pointer(tid, dirty, parent_pid, page_pid)?;
        self.update_parent_pointer(tid, dirty, parent_pid, new_pid)?;

        if key.compare(&split_key).is_le() {
            Ok(page)
        } else {
            Ok(new_page)
        }
    }

    /// Splits a full internal page: the upper half of the entries moves to a
    /// new right page and the middle key is pushed up (removed from both
    /// halves). Returns the half whose key range contains `key`.
    fn split_internal_page(
        &self,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        page: PageHandle,
        key: &Field,
    ) -> DbResult<PageHandle> {
        let page_pid = page.read().pid();
        let new_page = self.get_empty_page(tid, dirty, PageCategory::Internal)?;
        let new_pid = new_page.read().pid();

        let (pushed_key, right_keys, right_children, child_category) = {
            let mut guard = page.write();
            let internal = guard.as_internal_mut();
            if internal.num_entries() < 2 {
                return Err(DbError::Corrupted(format!(
                    "split of internal page {} with fewer than two entries",
                    page_pid
                )));
            }
            let category = internal.child_category();
            let (pushed, keys, children) = internal.split_off_upper();
            (pushed, keys, children, category)
        };
        {
            let mut guard = new_page.write();
            let internal = guard.as_internal_mut();
            internal.set_child_category(child_category);
            internal.append_entries(right_keys, right_children)?;
        }

        // The moved children now belong to the new page.
        self.update_parent_pointers(tid, dirty, &new_page)?;

        let parent_pid = page.read().parent_id();
        let parent = self.get_parent_with_empty_slots(tid, dirty, parent_pid, &pushed_key)?;
        let parent_pid = parent.read().pid();
        {
            let mut guard = parent.write();
            let internal = guard.as_internal_mut();
            internal.set_child_category(PageCategory::Internal);
            internal.insert_entry(pushed_key.clone(), page_pid.page_no, new_pid.page_no)?;
        }
        self.update_parent_pointer(tid, dirty, parent_pid, page_pid)?;
        self.update_parent_pointer(tid, dirty, parent_pid, new_pid)?;

        if key.compare(&pushed_key).is_le() {
            Ok(page)
        } else {
            Ok(new_page)
        }
    }

    /// Returns a parent page with at least one empty slot, creating a brand
    /// new root when the page being split was the root, or recursively
    /// splitting a full parent.
    fn get_parent_with_empty_slots(
        &self,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        parent_pid: PageId,
        key: &Field,
    ) -> DbResult<PageHandle> {
        let parent = if parent_pid.category == PageCategory::RootPtr {
            // Splitting the root: a fresh internal page becomes the new root.
            let new_root = self.get_empty_page(tid, dirty, PageCategory::Internal)?;
            let new_root_pid = new_root.read().pid();

            let root_ptr = self.get_page(
                tid,
                dirty,
                PageId::root_ptr(self.table_id()),
                Permission::ReadWrite,
            )?;
            let prev_root = {
                let mut guard = root_ptr.write();
                let root_ptr_page = guard.as_root_ptr_mut();
                let prev = root_ptr_page
                    .root()
                    .expect("a page is being split, so a root must exist");
                root_ptr_page.set_root(new_root_pid.page_no, PageCategory::Internal);
                prev
            };
            let prev_root_pid = PageId::new(self.table_id(), prev_root.0, prev_root.1);
            new_root
                .write()
                .as_internal_mut()
                .set_child_category(prev_root_pid.category);

            let prev_root_page =
                self.get_page(tid, dirty, prev_root_pid, Permission::ReadWrite)?;
            prev_root_page.write().set_parent(new_root_pid);
            new_root
        } else {
            self.get_page(tid, dirty, parent_pid, Permission::ReadWrite)?
        };

        if parent.read().as_internal().num_empty_slots() == 0 {
            self.split_internal_page(tid, dirty, parent, key)
        } else {
            Ok(parent)
        }
    }

    // ---- parent pointers -------------------------------------------------

    fn update_parent_pointer(
        &self,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        parent_pid: PageId,
        child_pid: PageId,
    ) -> DbResult<()> {
        let child = self.get_page(tid, dirty, child_pid, Permission::ReadOnly)?;
        if child.read().parent_id() != parent_pid {
            let child = self.get_page(tid, dirty, child_pid, Permission::ReadWrite)?;
            child.write().set_parent(parent_pid);
        }
        Ok(())
    }

    /// Points every child of `page` back at it.
    fn update_parent_pointers(
        &self,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        page: &PageHandle,
    ) -> DbResult<()> {
        let (pid, children, child_category) = {
            let guard = page.read();
            let internal = guard.as_internal();
            (
                guard.pid(),
                internal.children().to_vec(),
                internal.child_category(),
            )
        };
        for child_no in children {
            let child_pid = PageId::new(self.table_id(), child_no, child_category);
            self.update_parent_pointer(tid, dirty, pid, child_pid)?;
        }
        Ok(())
    }

    // ---- rebalancing -----------------------------------------------------

    /// A page fell below minimum occupancy: find its rebalance partner (a
    /// sibling under the same parent, left preferred) and either
    /// redistribute or merge. The root is exempt.
    fn handle_min_occupancy_page(
        &self,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        page: PageHandle,
    ) -> DbResult<()> {
        let pid = page.read().pid();
        let parent_pid = page.read().parent_id();
        if parent_pid.category == PageCategory::RootPtr {
            return Ok(());
        }

        let parent = self.get_page(tid, dirty, parent_pid, Permission::ReadWrite)?;
        // The partner must share this page's parent, so it is found through
        // the parent's entries.
        let (left_entry, right_entry) = {
            let guard = parent.read();
            let internal = guard.as_internal();
            let mut left = None;
            let mut right = None;
            for i in 0..internal.num_entries() {
                if internal.child(i) == pid.page_no {
                    right = Some((i, internal.child(i + 1)));
                    break;
                }
                if internal.child(i + 1) == pid.page_no {
                    left = Some((i, internal.child(i)));
                }
            }
            (left, right)
        };

        match pid.category {
            PageCategory::Leaf => {
                self.rebalance_leaf(tid, dirty, page, parent, left_entry, right_entry)
            }
            PageCategory::Internal => {
                self.rebalance_internal(tid, dirty, page, parent, left_entry, right_entry)
            }
            _ => panic!("rebalance of {} which is neither leaf nor internal", pid),
        }
    }

    fn rebalance_leaf(
        &self,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        page: PageHandle,
        parent: PageHandle,
        left_entry: Option<(usize, u32)>,
        right_entry: Option<(usize, u32)>,
    ) -> DbResult<()> {
        if let Some((entry_index, sibling_no)) = left_entry {
            let sibling_pid = PageId::new(self.table_id(), sibling_no, PageCategory::Leaf);
            let sibling = self.get_page(tid, dirty, sibling_pid, Permission::ReadWrite)?;
            let sibling_at_min = {
                let guard = sibling.read();
                let leaf = guard.as_leaf();
                leaf.num_tuples() <= leaf.min_occupancy()
            };
            if sibling_at_min {
                self.merge_leaf_pages(tid, dirty, sibling, page, parent, entry_index)
            } else {
                self.steal_from_leaf_page(page, sibling, parent, entry_index, false)
            }
        } else if let Some((entry_index, sibling_no)) = right_entry {
            let sibling_pid = PageId::new(self.table_id(), sibling_no, PageCategory::Leaf);
            let sibling = self.get_page(tid, dirty, sibling_pid, Permission::ReadWrite)?;
            let sibling_at_min = {
                let guard = sibling.read();
                let leaf = guard.as_leaf();
                leaf.num_tuples() <= leaf.min_occupancy()
            };
            if sibling_at_min {
                self.merge_leaf_pages(tid, dirty, page, sibling, parent, entry_index)
            } else {
                self.steal_from_leaf_page(page, sibling, parent, entry_index, true)
            }
        } else {
            Ok(())
        }
    }

    /// Moves tuples from a sibling until both leaves are evenly filled, then
    /// rewrites the shared parent separator to the first key of the
    /// right-hand page.
    fn steal_from_leaf_page(
        &self,
        page: PageHandle,
        sibling: PageHandle,
        parent: PageHandle,
        entry_index: usize,
        is_right_sibling: bool,
    ) -> DbResult<()> {
        let page_pid = page.read().pid();
        let num_in_page = page.read().as_leaf().num_tuples();
        let num_in_sibling = sibling.read().as_leaf().num_tuples();
        let num_to_move = (num_in_page + num_in_sibling) / 2 - num_in_page;
        if num_to_move == 0 {
            return Ok(());
        }

        let moved = {
            let mut guard = sibling.write();
            let leaf = guard.as_leaf_mut();
            if is_right_sibling {
                leaf.take_front(num_to_move)
            } else {
                leaf.take_back(num_to_move)
            }
        };
        {
            let mut guard = page.write();
            let leaf = guard.as_leaf_mut();
            for tuple in moved {
                leaf.insert_tuple(page_pid, tuple)?;
            }
        }

        // The separator must match the first key of the right-hand page.
        let separator = if is_right_sibling {
            sibling.read().as_leaf().first_key().cloned()
        } else {
            page.read().as_leaf().first_key().cloned()
        };
        let separator = separator.ok_or_else(|| {
            DbError::Corrupted("right page empty after leaf redistribution".into())
        })?;
        parent
            .write()
            .as_internal_mut()
            .update_key(entry_index, separator);
        Ok(())
    }

    /// Merges the right leaf into the left: all tuples move left, the right
    /// page leaves the sibling chain and is recycled, and the parent
    /// separator entry is deleted (recursing upward on underflow).
    fn merge_leaf_pages(
        &self,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        left: PageHandle,
        right: PageHandle,
        parent: PageHandle,
        entry_index: usize,
    ) -> DbResult<()> {
        let left_pid = left.read().pid();
        let right_pid = right.read().pid();

        let moved = right.write().as_leaf_mut().take_all();
        {
            let mut guard = left.write();
            let leaf = guard.as_leaf_mut();
            for tuple in moved {
                leaf.insert_tuple(left_pid, tuple)?;
            }
        }

        let next_right_no = right.read().as_leaf().right_sibling();
        left.write().as_leaf_mut().set_right_sibling(next_right_no);
        if let Some(next_no) = next_right_no {
            let next_pid = PageId::new(self.table_id(), next_no, PageCategory::Leaf);
            let next = self.get_page(tid, dirty, next_pid, Permission::ReadWrite)?;
            next.write()
                .as_leaf_mut()
                .set_left_sibling(Some(left_pid.page_no));
        }
        {
            let mut guard = right.write();
            let leaf = guard.as_leaf_mut();
            leaf.set_left_sibling(None);
            leaf.set_right_sibling(None);
        }

        self.set_empty_page(tid, dirty, right_pid.page_no)?;
        self.delete_parent_entry(tid, dirty, left, parent, entry_index)
    }

    fn rebalance_internal(
        &self,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        page: PageHandle,
        parent: PageHandle,
        left_entry: Option<(usize, u32)>,
        right_entry: Option<(usize, u32)>,
    ) -> DbResult<()> {
        if let Some((entry_index, sibling_no)) = left_entry {
            let sibling_pid = PageId::new(self.table_id(), sibling_no, PageCategory::Internal);
            let sibling = self.get_page(tid, dirty, sibling_pid, Permission::ReadWrite)?;
            let sibling_at_min = {
                let guard = sibling.read();
                let internal = guard.as_internal();
                internal.num_entries() <= internal.min_occupancy()
            };
            if sibling_at_min {
                self.merge_internal_pages(tid, dirty, sibling, page, parent, entry_index)
            } else {
                self.steal_from_left_internal_page(tid, dirty, page, sibling, parent, entry_index)
            }
        } else if let Some((entry_index, sibling_no)) = right_entry {
            let sibling_pid = PageId::new(self.table_id(), sibling_no, PageCategory::Internal);
            let sibling = self.get_page(tid, dirty, sibling_pid, Permission::ReadWrite)?;
            let sibling_at_min = {
                let guard = sibling.read();
                let internal = guard.as_internal();
                internal.num_entries() <= internal.min_occupancy()
            };
            if sibling_at_min {
                self.merge_internal_pages(tid, dirty, page, sibling, parent, entry_index)
            } else {
                self.steal_from_right_internal_page(tid, dirty, page, sibling, parent, entry_index)
            }
        } else {
            Ok(())
        }
    }

    /// Internal redistribution from the left sibling. Keys rotate through
    /// the parent: the old separator is pulled down into the recipient and
    /// the sibling's outermost key is pushed up to replace it. Every moved
    /// child gets its parent pointer rewritten.
    fn steal_from_left_internal_page(
        &self,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        page: PageHandle,
        sibling: PageHandle,
        parent: PageHandle,
        entry_index: usize,
    ) -> DbResult<()> {
        let num_in_page = page.read().as_internal().num_entries();
        let num_in_sibling = sibling.read().as_internal().num_entries();
        if num_in_page == 0 || num_in_sibling == 0 {
            return Err(DbError::Corrupted(
                "empty internal page during redistribution".into(),
            ));
        }
        let num_to_move = (num_in_page + num_in_sibling) / 2 - num_in_page;
        if num_to_move == 0 {
            return Ok(());
        }

        let separator = parent.read().as_internal().key(entry_index).clone();
        let (mut moved_keys, moved_children) =
            sibling.write().as_internal_mut().take_back(num_to_move);
        let pushed_up = moved_keys.remove(0);
        moved_keys.push(separator);
        page.write()
            .as_internal_mut()
            .prepend_entries(moved_keys, moved_children)?;
        parent
            .write()
            .as_internal_mut()
            .update_key(entry_index, pushed_up);

        self.update_parent_pointers(tid, dirty, &page)
    }

    /// Mirror image of `steal_from_left_internal_page`.
    fn steal_from_right_internal_page(
        &self,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        page: PageHandle,
        sibling: PageHandle,
        parent: PageHandle,
        entry_index: usize,
    ) -> DbResult<()> {
        let num_in_page = page.read().as_internal().num_entries();
        let num_in_sibling = sibling.read().as_internal().num_entries();
        if num_in_page == 0 || num_in_sibling == 0 {
            return Err(DbError::Corrupted(
                "empty internal page during redistribution".into(),
            ));
        }
        let num_to_move = (num_in_page + num_in_sibling) / 2 - num_in_page;
        if num_to_move == 0 {
            return Ok(());
        }

        let separator = parent.read().as_internal().key(entry_index).clone();
        let (mut moved_keys, moved_children) =
            sibling.write().as_internal_mut().take_front(num_to_move);
        let pushed_up = moved_keys.pop().expect("at least one entry moves");
        moved_keys.insert(0, separator);
        page.write()
            .as_internal_mut()
            .append_entries(moved_keys, moved_children)?;
        parent
            .write()
            .as_internal_mut()
            .update_key(entry_index, pushed_up);

        self.update_parent_pointers(tid, dirty, &page)
    }

    /// Merges the right internal page into the left, pulling the parent
    /// separator down between them, recycling the right page, and deleting
    /// the parent entry (recursing upward on underflow).
    fn merge_internal_pages(
        &self,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        left: PageHandle,
        right: PageHandle,
        parent: PageHandle,
        entry_index: usize,
    ) -> DbResult<()> {
        let right_pid = right.read().pid();
        let separator = parent.read().as_internal().key(entry_index).clone();

        let (right_keys, right_children) = right.write().as_internal_mut().take_all();
        if right_children.is_empty() {
            return Err(DbError::Corrupted(format!(
                "internal page {} has no children during merge",
                right_pid
            )));
        }
        {
            let mut guard = left.write();
            let internal = guard.as_internal_mut();
            let last_child = internal.last_child()?;
            internal.insert_entry(separator, last_child, right_children[0])?;
            internal.append_entries(right_keys, right_children[1..].to_vec())?;
        }

        self.set_empty_page(tid, dirty, right_pid.page_no)?;
        // Adopted children now point at the left page.
        self.update_parent_pointers(tid, dirty, &left)?;
        self.delete_parent_entry(tid, dirty, left, parent, entry_index)
    }

    /// Deletes a separator (key + right child pointer) from a parent. An
    /// emptied parent must be the root: its sole remaining child becomes the
    /// new root and the old root page is recycled. Otherwise an underflowing
    /// parent rebalances recursively.
    fn delete_parent_entry(
        &self,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        remaining_child: PageHandle,
        parent: PageHandle,
        entry_index: usize,
    ) -> DbResult<()> {
        parent
            .write()
            .as_internal_mut()
            .delete_key_and_right_child(entry_index);

        let remaining_entries = parent.read().as_internal().num_entries();
        if remaining_entries == 0 {
            let parent_pid = parent.read().pid();
            let root_ptr_pid = parent.read().parent_id();
            if root_ptr_pid.category != PageCategory::RootPtr {
                return Err(DbError::Corrupted(format!(
                    "emptied non-root internal page {}",
                    parent_pid
                )));
            }
            let child_pid = remaining_child.read().pid();
            let root_ptr = self.get_page(tid, dirty, root_ptr_pid, Permission::ReadWrite)?;
            remaining_child.write().set_parent(root_ptr_pid);
            root_ptr
                .write()
                .as_root_ptr_mut()
                .set_root(child_pid.page_no, child_pid.category);
            self.set_empty_page(tid, dirty, parent_pid.page_no)?;
        } else if parent.read().as_internal().below_min() {
            self.handle_min_occupancy_page(tid, dirty, parent)?;
        }
        Ok(())
    }

    // ---- free-page management --------------------------------------------

    /// The page number of the first free page, scanning the header chain
    /// for a clear bit and appending a fresh page to the file when none is
    /// recorded free.
    fn get_empty_page_no(&self, tid: TransactionId, dirty: &mut DirtyPages) -> DbResult<u32> {
        let root_ptr = self.get_root_ptr_page(tid, dirty)?;
        let first_header = root_ptr.read().as_root_ptr().header();
        let slots_per_page = HeaderPage::slots_per_page(self.file.page_size()) as u32;

        if let Some(mut header_no) = first_header {
            let mut header_index: u32 = 0;
            loop {
                let header_pid = PageId::new(self.table_id(), header_no, PageCategory::Header);
                let header = self.get_page(tid, dirty, header_pid, Permission::ReadOnly)?;
                let (free_slot, next) = {
                    let guard = header.read();
                    let header_page = guard.as_header();
                    (header_page.find_empty_slot(), header_page.next())
                };
                if let Some(slot) = free_slot {
                    let header = self.get_page(tid, dirty, header_pid, Permission::ReadWrite)?;
                    header.write().as_header_mut().mark_slot_used(slot, true);
                    return Ok(header_index * slots_per_page + slot as u32);
                }
                match next {
                    Some(next_no) => {
                        header_no = next_no;
                        header_index += 1;
                    }
                    None => break,
                }
            }
        }
        self.file.append_blank_page()
    }

    /// A recycled or freshly appended page, wiped on disk and in every
    /// cache, locked read-write.
    fn get_empty_page(
        &self,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        category: PageCategory,
    ) -> DbResult<PageHandle> {
        let page_no = self.get_empty_page_no(tid, dirty)?;
        self.file.wipe_page(page_no)?;
        // The number may have been recycled under a different category.
        for stale_category in [
            PageCategory::Header,
            PageCategory::Internal,
            PageCategory::Leaf,
        ] {
            let stale_pid = PageId::new(self.table_id(), page_no, stale_category);
            self.pool.discard(stale_pid);
            dirty.remove(&stale_pid);
        }
        let pid = PageId::new(self.table_id(), page_no, category);
        self.get_page(tid, dirty, pid, Permission::ReadWrite)
    }

    /// Marks a page number free in the header bitmap chain, creating and
    /// linking header pages lazily until the chain covers it.
    fn set_empty_page(
        &self,
        tid: TransactionId,
        dirty: &mut DirtyPages,
        page_no: u32,
    ) -> DbResult<()> {
        let slots_per_page = HeaderPage::slots_per_page(self.file.page_size()) as u32;
        let root_ptr = self.get_root_ptr_page(tid, dirty)?;
        let mut header_no = root_ptr.read().as_root_ptr().header();

        if header_no.is_none() {
            let root_ptr = self.get_page(
                tid,
                dirty,
                PageId::root_ptr(self.table_id()),
                Permission::ReadWrite,
            )?;
            let created = self.get_empty_page(tid, dirty, PageCategory::Header)?;
            let created_no = created.read().pid().page_no;
            created.write().as_header_mut().init();
            root_ptr.write().as_root_ptr_mut().set_header(created_no);
            header_no = Some(created_no);
        }

        let mut header_index: u32 = 0;
        let mut current_no = header_no.expect("header chain exists");
        while page_no >= (header_index + 1) * slots_per_page {
            let current_pid = PageId::new(self.table_id(), current_no, PageCategory::Header);
            let current = self.get_page(tid, dirty, current_pid, Permission::ReadOnly)?;
            let next = current.read().as_header().next();
            match next {
                Some(next_no) => {
                    current_no = next_no;
                }
                None => {
                    let created = self.get_empty_page(tid, dirty, PageCategory::Header)?;
                    let created_no = created.read().pid().page_no;
                    {
                        let mut guard = created.write();
                        let header_page = guard.as_header_mut();
                        header_page.init();
                        header_page.set_prev(Some(current_no));
                    }
                    let current =
                        self.get_page(tid, dirty, current_pid, Permission::ReadWrite)?;
                    current
                        .write()
                        .as_header_mut()
                        .set_next(Some(created_no));
                    current_no = created_no;
                }
            }
            header_index += 1;
        }

        let header_pid = PageId::new(self.table_id(), current_no, PageCategory::Header);
        let header = self.get_page(tid, dirty, header_pid, Permission::ReadWrite)?;
        header
            .write()
            .as_header_mut()
            .mark_slot_used((page_no - header_index * slots_per_page) as usize, false);
        Ok(())
    }
}

impl std::fmt::Debug for BTreeFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTreeFile")
            .field("table_id", &self.table_id())
            .field("key_field", &self.key_field())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::predicate::Op;
    use crate::access::value::{DataType, Field};
    use crate::concurrency::lock::LockManager;
    use crate::storage::buffer::{BufferPoolConfig, EvictionPolicy};
    use crate::storage::wal::WalManager;
    use std::time::Duration;
    use tempfile::tempdir;

    struct Fixture {
        tree: BTreeFile,
        _dir: tempfile::TempDir,
    }

    /// Page size 64 with an (Int32, Int64) schema keyed on the first
    /// field: leaf capacity 4 and internal capacity 6, so a handful of
    /// tuples exercises splits and merges.
    fn small_tree() -> Fixture {
        tree_with_page_size(64)
    }

    fn tree_with_page_size(page_size: usize) -> Fixture {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(Catalog::new());
        let table_id = catalog
            .register_table(
                "t",
                &dir.path().join("t.tbl"),
                TupleDesc::new(vec![DataType::Int32, DataType::Int64]),
                0,
                page_size,
            )
            .unwrap();
        let wal = Arc::new(WalManager::create(&dir.path().join("wal.log")).unwrap());
        let pool = Arc::new(BufferPool::new(
            catalog.clone(),
            Arc::new(LockManager::new()),
            wal,
            BufferPoolConfig {
                capacity: 256,
                policy: EvictionPolicy::NoSteal,
                min_timeout: Duration::from_millis(100),
                max_timeout: Duration::from_millis(200),
                retry_interval: Duration::from_millis(5),
            },
        ));
        let tree = BTreeFile::open(pool, &catalog, table_id).unwrap();
        Fixture { tree, _dir: dir }
    }

    fn tid(id: u64) -> TransactionId {
        TransactionId::new(id)
    }

    fn int_tuple(v: i32) -> Tuple {
        Tuple::new(vec![Field::Int32(v), Field::Int64(v as i64)])
    }

    fn all_keys(tree: &BTreeFile, t: TransactionId) -> Vec<i32> {
        let mut iter = tree.iterate(t).unwrap();
        let mut keys = Vec::new();
        while let Some(tuple) = iter.advance().unwrap() {
            match tuple.field(0) {
                Field::Int32(v) => keys.push(*v),
                other => panic!("unexpected field {other:?}"),
            }
        }
        keys
    }

    fn search_keys(tree: &BTreeFile, t: TransactionId, op: Op, operand: i32) -> Vec<i32> {
        let mut iter = tree
            .search(t, IndexPredicate::new(op, Field::Int32(operand)))
            .unwrap();
        let mut keys = Vec::new();
        while let Some(tuple) = iter.advance().unwrap() {
            match tuple.field(0) {
                Field::Int32(v) => keys.push(*v),
                other => panic!("unexpected field {other:?}"),
            }
        }
        keys
    }

    /// Walks every leaf and checks sortedness plus cross-leaf ordering.
    fn assert_leaves_sorted(tree: &BTreeFile, t: TransactionId) {
        let keys = all_keys(tree, t);
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted, "leaf chain must yield ascending keys");
    }

    #[test]
    fn test_insert_and_search_round_trip() {
        let f = small_tree();
        let t = tid(1);
        f.tree.insert(t, int_tuple(42)).unwrap();

        assert_eq!(search_keys(&f.tree, t, Op::Equals, 42), vec![42]);
        assert_eq!(search_keys(&f.tree, t, Op::Equals, 7), Vec::<i32>::new());
    }

    #[test]
    fn test_delete_round_trip() {
        let f = small_tree();
        let t = tid(1);
        f.tree.insert(t, int_tuple(42)).unwrap();

        let mut iter = f
            .tree
            .search(t, IndexPredicate::new(Op::Equals, Field::Int32(42)))
            .unwrap();
        let stored = iter.advance().unwrap().unwrap();
        f.tree.delete(t, &stored).unwrap();

        assert_eq!(search_keys(&f.tree, t, Op::Equals, 42), Vec::<i32>::new());
    }

    #[test]
    fn test_insert_returns_dirtied_pages() {
        let f = small_tree();
        let t = tid(1);
        let dirtied = f.tree.insert(t, int_tuple(1)).unwrap();
        // At least the root pointer and the first leaf.
        assert!(dirtied.contains(&PageId::root_ptr(f.tree.table_id())));
        assert!(dirtied
            .iter()
            .any(|pid| pid.category == PageCategory::Leaf));
    }

    #[test]
    fn test_schema_mismatch_rejected() {
        let f = small_tree();
        let result = f.tree.insert(tid(1), Tuple::new(vec![Field::Int64(1)]));
        assert!(matches!(result, Err(DbError::SchemaMismatch(_))));
    }

    #[test]
    fn test_split_moves_upper_half_and_copies_separator() {
        // Leaf capacity 4: [1,2,3,4] plus 5 splits into [1,2] | 3 | [3,4,5].
        let f = small_tree();
        let t = tid(1);
        for v in 1..=5 {
            f.tree.insert(t, int_tuple(v)).unwrap();
        }

        let mut dirty = DirtyPages::new();
        let root_ptr = f.tree.get_root_ptr_page(t, &mut dirty).unwrap();
        let (root_no, root_category) = root_ptr.read().as_root_ptr().root().unwrap();
        assert_eq!(root_category, PageCategory::Internal);

        let root_pid = PageId::new(f.tree.table_id(), root_no, root_category);
        let root = f
            .tree
            .get_page(t, &mut dirty, root_pid, Permission::ReadOnly)
            .unwrap();
        let (keys, children) = {
            let guard = root.read();
            let internal = guard.as_internal();
            (internal.keys().to_vec(), internal.children().to_vec())
        };
        assert_eq!(keys, vec![Field::Int32(3)]);
        assert_eq!(children.len(), 2);

        let left = f
            .tree
            .get_page(
                t,
                &mut dirty,
                PageId::new(f.tree.table_id(), children[0], PageCategory::Leaf),
                Permission::ReadOnly,
            )
            .unwrap();
        let right = f
            .tree
            .get_page(
                t,
                &mut dirty,
                PageId::new(f.tree.table_id(), children[1], PageCategory::Leaf),
                Permission::ReadOnly,
            )
            .unwrap();
        let left_keys: Vec<_> = left
            .read()
            .as_leaf()
            .tuples()
            .iter()
            .map(|t| t.field(0).clone())
            .collect();
        let right_keys: Vec<_> = right
            .read()
            .as_leaf()
            .tuples()
            .iter()
            .map(|t| t.field(0).clone())
            .collect();
        assert_eq!(left_keys, vec![Field::Int32(1), Field::Int32(2)]);
        assert_eq!(
            right_keys,
            vec![Field::Int32(3), Field::Int32(4), Field::Int32(5)]
        );

        // Sibling chain links the two halves.
        assert_eq!(
            left.read().as_leaf().right_sibling(),
            Some(right.read().pid().page_no)
        );
        assert_eq!(
            right.read().as_leaf().left_sibling(),
            Some(left.read().pid().page_no)
        );
        // Both halves point back at the new root.
        assert_eq!(left.read().parent_id(), root_pid);
        assert_eq!(right.read().parent_id(), root_pid);
    }

    #[test]
    fn test_many_inserts_stay_sorted() {
        let f = small_tree();
        let t = tid(1);
        for v in (0..60).rev() {
            f.tree.insert(t, int_tuple(v)).unwrap();
        }
        for v in 60..120 {
            f.tree.insert(t, int_tuple(v)).unwrap();
        }
        assert_eq!(all_keys(&f.tree, t), (0..120).collect::<Vec<_>>());
    }

    #[test]
    fn test_occupancy_bounds_after_churn() {
        let f = small_tree();
        let t = tid(1);
        for v in 0..80 {
            f.tree.insert(t, int_tuple(v)).unwrap();
        }
        // Delete every third key.
        for v in (0..80).step_by(3) {
            let mut iter = f
                .tree
                .search(t, IndexPredicate::new(Op::Equals, Field::Int32(v)))
                .unwrap();
            let stored = iter.advance().unwrap().unwrap();
            f.tree.delete(t, &stored).unwrap();
        }
        assert_leaves_sorted(&f.tree, t);

        // Every non-root leaf obeys the occupancy bound.
        let mut dirty = DirtyPages::new();
        let root_ptr = f.tree.get_root_ptr_page(t, &mut dirty).unwrap();
        let (root_no, root_category) = root_ptr.read().as_root_ptr().root().unwrap();
        let root_pid = PageId::new(f.tree.table_id(), root_no, root_category);
        let leftmost = f
            .tree
            .find_leaf(t, &mut dirty, root_pid, Permission::ReadOnly, None)
            .unwrap();
        let mut current = Some(leftmost);
        while let Some(handle) = current {
            let guard = handle.read();
            let leaf = guard.as_leaf();
            let is_root = guard.parent_id().category == PageCategory::RootPtr;
            if !is_root {
                assert!(
                    leaf.num_tuples() >= leaf.min_occupancy(),
                    "leaf {} below minimum occupancy",
                    guard.pid()
                );
            }
            let next = leaf.right_sibling();
            drop(guard);
            current = match next {
                Some(no) => Some(
                    f.tree
                        .get_page(
                            t,
                            &mut dirty,
                            PageId::new(f.tree.table_id(), no, PageCategory::Leaf),
                            Permission::ReadOnly,
                        )
                        .unwrap(),
                ),
                None => None,
            };
        }
    }

    #[test]
    fn test_merge_collapses_root() {
        // [10,20] | 30 | [30,40]: deleting 40 underflows the right leaf
        // while its left sibling sits at minimum, forcing a merge and a
        // root collapse back to a single leaf.
        let f = small_tree();
        let t = tid(1);
        for v in [10, 20, 30, 40, 50] {
            f.tree.insert(t, int_tuple(v)).unwrap();
        }
        // Trim the right leaf [30,40,50] down to minimum first.
        for v in [50, 40] {
            let mut iter = f
                .tree
                .search(t, IndexPredicate::new(Op::Equals, Field::Int32(v)))
                .unwrap();
            let stored = iter.advance().unwrap().unwrap();
            f.tree.delete(t, &stored).unwrap();
        }
        // Left [10,20] and right [30] cannot both exist: 30 merges left.
        assert_eq!(all_keys(&f.tree, t), vec![10, 20, 30]);

        let mut dirty = DirtyPages::new();
        let root_ptr = f.tree.get_root_ptr_page(t, &mut dirty).unwrap();
        let (_, root_category) = root_ptr.read().as_root_ptr().root().unwrap();
        assert_eq!(root_category, PageCategory::Leaf, "root must collapse");
    }

    #[test]
    fn test_redistribution_rewrites_separator() {
        // Leaves [10,20] | 30 | [30,40,50]: deleting 20 underflows the left
        // leaf; the right sibling has spare tuples, so redistribution pulls
        // 30 left and the separator becomes 40.
        let f = small_tree();
        let t = tid(1);
        for v in [10, 20, 30, 40, 50] {
            f.tree.insert(t, int_tuple(v)).unwrap();
        }
        let mut iter = f
            .tree
            .search(t, IndexPredicate::new(Op::Equals, Field::Int32(20)))
            .unwrap();
        let stored = iter.advance().unwrap().unwrap();
        f.tree.delete(t, &stored).unwrap();

        assert_eq!(all_keys(&f.tree, t), vec![10, 30, 40, 50]);

        let mut dirty = DirtyPages::new();
        let root_ptr = f.tree.get_root_ptr_page(t, &mut dirty).unwrap();
        let (root_no, root_category) = root_ptr.read().as_root_ptr().root().unwrap();
        assert_eq!(root_category, PageCategory::Internal);
        let root = f
            .tree
            .get_page(
                t,
                &mut dirty,
                PageId::new(f.tree.table_id(), root_no, root_category),
                Permission::ReadOnly,
            )
            .unwrap();
        assert_eq!(root.read().as_internal().keys(), &[Field::Int32(40)]);
    }

    #[test]
    fn test_freed_pages_are_recycled() {
        let f = small_tree();
        let t = tid(1);
        for v in 0..40 {
            f.tree.insert(t, int_tuple(v)).unwrap();
        }
        // Deleting everything merges pages and populates the free list.
        for v in 0..40 {
            let mut iter = f
                .tree
                .search(t, IndexPredicate::new(Op::Equals, Field::Int32(v)))
                .unwrap();
            let stored = iter.advance().unwrap().unwrap();
            f.tree.delete(t, &stored).unwrap();
        }
        assert_eq!(all_keys(&f.tree, t), Vec::<i32>::new());
        let pages_after_deletes = f.tree.file.num_pages().unwrap();

        // Re-inserting should reuse recycled page numbers, not extend the
        // file.
        for v in 0..40 {
            f.tree.insert(t, int_tuple(v)).unwrap();
        }
        assert_eq!(all_keys(&f.tree, t), (0..40).collect::<Vec<_>>());
        assert_eq!(f.tree.file.num_pages().unwrap(), pages_after_deletes);
    }

    #[test]
    fn test_duplicate_keys() {
        let f = small_tree();
        let t = tid(1);
        for _ in 0..10 {
            f.tree.insert(t, int_tuple(5)).unwrap();
        }
        assert_eq!(search_keys(&f.tree, t, Op::Equals, 5).len(), 10);
    }

    #[test]
    fn test_search_operators() {
        let f = small_tree();
        let t = tid(1);
        for v in 1..=20 {
            f.tree.insert(t, int_tuple(v)).unwrap();
        }
        assert_eq!(
            search_keys(&f.tree, t, Op::GreaterThan, 17),
            vec![18, 19, 20]
        );
        assert_eq!(
            search_keys(&f.tree, t, Op::GreaterThanOrEq, 18),
            vec![18, 19, 20]
        );
        assert_eq!(search_keys(&f.tree, t, Op::LessThan, 4), vec![1, 2, 3]);
        assert_eq!(search_keys(&f.tree, t, Op::LessThanOrEq, 3), vec![1, 2, 3]);
    }

    #[test]
    fn test_iterator_rewind() {
        let f = small_tree();
        let t = tid(1);
        for v in 1..=10 {
            f.tree.insert(t, int_tuple(v)).unwrap();
        }
        let mut iter = f.tree.iterate(t).unwrap();
        for _ in 0..4 {
            iter.advance().unwrap();
        }
        iter.rewind().unwrap();
        let first = iter.advance().unwrap().unwrap();
        assert_eq!(first.field(0), &Field::Int32(1));
    }

    #[test]
    fn test_iterate_empty_tree() {
        let f = small_tree();
        let mut iter = f.tree.iterate(tid(1)).unwrap();
        assert!(iter.advance().unwrap().is_none());
    }

    #[test]
    fn test_delete_missing_tuple_fails() {
        let f = small_tree();
        let t = tid(1);
        f.tree.insert(t, int_tuple(1)).unwrap();
        let mut iter = f
            .tree
            .search(t, IndexPredicate::new(Op::Equals, Field::Int32(1)))
            .unwrap();
        let stored = iter.advance().unwrap().unwrap();
        f.tree.delete(t, &stored).unwrap();
        assert!(matches!(
            f.tree.delete(t, &stored),
            Err(DbError::TupleNotFound(_))
        ));
    }

    #[test]
    fn test_deep_tree_with_larger_pages() {
        let f = tree_with_page_size(128);
        let t = tid(1);
        for v in 0..300 {
            f.tree.insert(t, int_tuple(v)).unwrap();
        }
        assert_eq!(all_keys(&f.tree, t), (0..300).collect::<Vec<_>>());
        assert_eq!(search_keys(&f.tree, t, Op::Equals, 299), vec![299]);
    }
}
