//! Lazy tuple iterators over the leaf sibling chain.
//!
//! Both iterators read pages shared through the buffer pool, so they block
//! (and can abort) like any other page access under 2PL.

use crate::access::btree::{BTreeFile, DirtyPages};
use crate::access::predicate::{IndexPredicate, Op};
use crate::access::tuple::Tuple;
use crate::concurrency::lock::Permission;
use crate::storage::buffer::PageHandle;
use crate::storage::error::DbResult;
use crate::storage::page::{PageCategory, PageId};
use crate::transaction::TransactionId;

/// All tuples in ascending key order. Finite; restartable via `rewind`.
pub struct BTreeFileIterator {
    file: BTreeFile,
    tid: TransactionId,
    current: Option<PageHandle>,
    index: usize,
}

impl BTreeFileIterator {
    pub(crate) fn new(file: BTreeFile, tid: TransactionId) -> DbResult<Self> {
        let mut iter = Self {
            file,
            tid,
            current: None,
            index: 0,
        };
        iter.open()?;
        Ok(iter)
    }

    fn open(&mut self) -> DbResult<()> {
        let mut dirty = DirtyPages::new();
        let root_ptr = self.file.get_root_ptr_page(self.tid, &mut dirty)?;
        let root = root_ptr.read().as_root_ptr().root();
        self.current = match root {
            None => None,
            Some((page_no, category)) => {
                let root_pid = PageId::new(self.file.table_id(), page_no, category);
                Some(self.file.find_leaf(
                    self.tid,
                    &mut dirty,
                    root_pid,
                    Permission::ReadOnly,
                    None,
                )?)
            }
        };
        self.index = 0;
        Ok(())
    }

    /// Restarts the iteration from the smallest key.
    pub fn rewind(&mut self) -> DbResult<()> {
        self.open()
    }

    /// The next tuple, following right-sibling pointers across leaves.
    pub fn advance(&mut self) -> DbResult<Option<Tuple>> {
        while let Some(leaf) = self.current.clone() {
            let guard = leaf.read();
            let leaf_page = guard.as_leaf();
            if self.index < leaf_page.num_tuples() {
                let tuple = leaf_page.tuple(self.index).clone();
                self.index += 1;
                return Ok(Some(tuple));
            }
            let next = leaf_page.right_sibling();
            drop(guard);
            self.step_to(next)?;
        }
        Ok(None)
    }

    fn step_to(&mut self, next: Option<u32>) -> DbResult<()> {
        self.current = match next {
            Some(page_no) => {
                let pid = PageId::new(self.file.table_id(), page_no, PageCategory::Leaf);
                let mut dirty = DirtyPages::new();
                Some(self.file.get_page(self.tid, &mut dirty, pid, Permission::ReadOnly)?)
            }
            None => None,
        };
        self.index = 0;
        Ok(())
    }
}

impl Iterator for BTreeFileIterator {
    type Item = DbResult<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}

/// Tuples matching an index predicate, in ascending key order.
///
/// Equality and greater-than predicates start at the leftmost leaf that
/// could contain the operand; the others scan from the smallest key. The
/// sorted order lets the scan stop as soon as no later key can match.
pub struct BTreeSearchIterator {
    file: BTreeFile,
    tid: TransactionId,
    predicate: IndexPredicate,
    current: Option<PageHandle>,
    index: usize,
}

impl BTreeSearchIterator {
    pub(crate) fn new(
        file: BTreeFile,
        tid: TransactionId,
        predicate: IndexPredicate,
    ) -> DbResult<Self> {
        let mut iter = Self {
            file,
            tid,
            predicate,
            current: None,
            index: 0,
        };
        iter.open()?;
        Ok(iter)
    }

    fn open(&mut self) -> DbResult<()> {
        let mut dirty = DirtyPages::new();
        let root_ptr = self.file.get_root_ptr_page(self.tid, &mut dirty)?;
        let root = root_ptr.read().as_root_ptr().root();
        self.current = match root {
            None => None,
            Some((page_no, category)) => {
                let root_pid = PageId::new(self.file.table_id(), page_no, category);
                let anchor = match self.predicate.op() {
                    Op::Equals | Op::GreaterThan | Op::GreaterThanOrEq => {
                        Some(self.predicate.operand())
                    }
                    Op::LessThan | Op::LessThanOrEq => None,
                };
                Some(self.file.find_leaf(
                    self.tid,
                    &mut dirty,
                    root_pid,
                    Permission::ReadOnly,
                    anchor,
                )?)
            }
        };
        self.index = 0;
        Ok(())
    }

    pub fn rewind(&mut self) -> DbResult<()> {
        self.open()
    }

    /// The next matching tuple, or None once no later key can match.
    pub fn advance(&mut self) -> DbResult<Option<Tuple>> {
        let key_field = self.file.key_field();
        while let Some(leaf) = self.current.clone() {
            let guard = leaf.read();
            let leaf_page = guard.as_leaf();
            while self.index < leaf_page.num_tuples() {
                let tuple = leaf_page.tuple(self.index);
                self.index += 1;
                let key = tuple.field(key_field);
                if self.predicate.matches(key) {
                    return Ok(Some(tuple.clone()));
                }
                match self.predicate.op() {
                    // Keys ascend: once a less-than predicate fails it
                    // fails for every later key.
                    Op::LessThan | Op::LessThanOrEq => return Ok(None),
                    Op::Equals if key.compare(self.predicate.operand()).is_gt() => {
                        return Ok(None)
                    }
                    _ => {}
                }
            }
            let next = leaf_page.right_sibling();
            drop(guard);
            self.step_to(next)?;
        }
        Ok(None)
    }

    fn step_to(&mut self, next: Option<u32>) -> DbResult<()> {
        self.current = match next {
            Some(page_no) => {
                let pid = PageId::new(self.file.table_id(), page_no, PageCategory::Leaf);
                let mut dirty = DirtyPages::new();
                Some(self.file.get_page(self.tid, &mut dirty, pid, Permission::ReadOnly)?)
            }
            None => None,
        };
        self.index = 0;
        Ok(())
    }
}

impl Iterator for BTreeSearchIterator {
    type Item = DbResult<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}
