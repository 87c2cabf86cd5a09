//! Page identifiers and the in-memory page representation.
//!
//! A page's on-disk category is implied by its id, not stored in the page
//! bytes; the body is decoded once at load time into a tagged variant.

pub mod header_page;
pub mod internal_page;
pub mod leaf_page;
pub mod root_ptr_page;

use crate::access::tuple::TupleDesc;
use crate::storage::error::DbResult;
use crate::transaction::TransactionId;

pub use header_page::HeaderPage;
pub use internal_page::InternalPage;
pub use leaf_page::LeafPage;
pub use root_ptr_page::{RootPtrPage, ROOT_PTR_PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageCategory {
    RootPtr = 0,
    Internal = 1,
    Leaf = 2,
    Header = 3,
}

impl PageCategory {
    pub fn from_u8(value: u8) -> Option<PageCategory> {
        match value {
            0 => Some(PageCategory::RootPtr),
            1 => Some(PageCategory::Internal),
            2 => Some(PageCategory::Leaf),
            3 => Some(PageCategory::Header),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// The cache and lock key: table, page number, and category.
///
/// The root-pointer page is page number 0 of every table; ordinary pages are
/// numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub table_id: u32,
    pub page_no: u32,
    pub category: PageCategory,
}

impl PageId {
    pub fn new(table_id: u32, page_no: u32, category: PageCategory) -> Self {
        Self {
            table_id,
            page_no,
            category,
        }
    }

    pub fn root_ptr(table_id: u32) -> Self {
        Self::new(table_id, 0, PageCategory::RootPtr)
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}:{}/{}",
            self.category, self.table_id, self.page_no
        )
    }
}

/// Typed page contents, decoded once when the page is materialized.
#[derive(Debug)]
pub enum PageBody {
    RootPtr(RootPtrPage),
    Header(HeaderPage),
    Internal(InternalPage),
    Leaf(LeafPage),
}

/// An in-memory page: typed body plus transaction bookkeeping.
///
/// The before-image snapshot is captured when the page is materialized and
/// re-captured at commit, for the next transaction that dirties it.
#[derive(Debug)]
pub struct Page {
    pid: PageId,
    pub body: PageBody,
    dirtier: Option<TransactionId>,
    before_image: Vec<u8>,
}

impl Page {
    pub fn new(pid: PageId, body: PageBody) -> Self {
        let mut page = Self {
            pid,
            body,
            dirtier: None,
            before_image: Vec::new(),
        };
        page.before_image = page.serialize();
        page
    }

    /// Decodes raw page bytes according to the id's category.
    pub fn decode(pid: PageId, data: &[u8], desc: &TupleDesc, key_field: usize) -> DbResult<Page> {
        let body = match pid.category {
            PageCategory::RootPtr => PageBody::RootPtr(RootPtrPage::decode(data)?),
            PageCategory::Header => PageBody::Header(HeaderPage::decode(data)?),
            PageCategory::Internal => PageBody::Internal(InternalPage::decode(
                data,
                desc.field_type(key_field),
            )?),
            PageCategory::Leaf => PageBody::Leaf(LeafPage::decode(pid, data, desc, key_field)?),
        };
        Ok(Page::new(pid, body))
    }

    pub fn pid(&self) -> PageId {
        self.pid
    }

    pub fn serialize(&self) -> Vec<u8> {
        match &self.body {
            PageBody::RootPtr(p) => p.encode(),
            PageBody::Header(p) => p.encode(),
            PageBody::Internal(p) => p.encode(),
            PageBody::Leaf(p) => p.encode(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirtier.is_some()
    }

    pub fn dirtier(&self) -> Option<TransactionId> {
        self.dirtier
    }

    pub fn mark_dirty(&mut self, tid: TransactionId) {
        self.dirtier = Some(tid);
    }

    pub fn mark_clean(&mut self) {
        self.dirtier = None;
    }

    pub fn before_image(&self) -> &[u8] {
        &self.before_image
    }

    /// Re-captures the before-image from the current contents, for the next
    /// transaction that modifies this page. Called at commit.
    pub fn set_before_image(&mut self) {
        self.before_image = self.serialize();
    }

    pub fn as_root_ptr(&self) -> &RootPtrPage {
        match &self.body {
            PageBody::RootPtr(p) => p,
            _ => panic!("page {} is not a root-pointer page", self.pid),
        }
    }

    pub fn as_root_ptr_mut(&mut self) -> &mut RootPtrPage {
        match &mut self.body {
            PageBody::RootPtr(p) => p,
            _ => panic!("page {} is not a root-pointer page", self.pid),
        }
    }

    pub fn as_header(&self) -> &HeaderPage {
        match &self.body {
            PageBody::Header(p) => p,
            _ => panic!("page {} is not a header page", self.pid),
        }
    }

    pub fn as_header_mut(&mut self) -> &mut HeaderPage {
        match &mut self.body {
            PageBody::Header(p) => p,
            _ => panic!("page {} is not a header page", self.pid),
        }
    }

    pub fn as_internal(&self) -> &InternalPage {
        match &self.body {
            PageBody::Internal(p) => p,
            _ => panic!("page {} is not an internal page", self.pid),
        }
    }

    pub fn as_internal_mut(&mut self) -> &mut InternalPage {
        match &mut self.body {
            PageBody::Internal(p) => p,
            _ => panic!("page {} is not an internal page", self.pid),
        }
    }

    pub fn as_leaf(&self) -> &LeafPage {
        match &self.body {
            PageBody::Leaf(p) => p,
            _ => panic!("page {} is not a leaf page", self.pid),
        }
    }

    pub fn as_leaf_mut(&mut self) -> &mut LeafPage {
        match &mut self.body {
            PageBody::Leaf(p) => p,
            _ => panic!("page {} is not a leaf page", self.pid),
        }
    }

    /// The id of the internal page (or root-pointer page) that currently
    /// references this leaf/internal page.
    pub fn parent_id(&self) -> PageId {
        let parent_no = match &self.body {
            PageBody::Leaf(p) => p.parent_no(),
            PageBody::Internal(p) => p.parent_no(),
            _ => panic!("page {} has no parent pointer", self.pid),
        };
        if parent_no == 0 {
            PageId::root_ptr(self.pid.table_id)
        } else {
            PageId::new(self.pid.table_id, parent_no, PageCategory::Internal)
        }
    }

    pub fn set_parent(&mut self, parent: PageId) {
        let parent_no = match parent.category {
            PageCategory::RootPtr => 0,
            PageCategory::Internal => parent.page_no,
            _ => panic!("{} cannot be a parent page", parent),
        };
        match &mut self.body {
            PageBody::Leaf(p) => p.set_parent_no(parent_no),
            PageBody::Internal(p) => p.set_parent_no(parent_no),
            _ => panic!("page {} has no parent pointer", self.pid),
        }
    }
}
