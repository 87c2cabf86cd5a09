//! The page store: one file per B+-tree table.
//!
//! File layout: a 9-byte root-pointer page at offset 0, then fixed-size
//! pages numbered from 1. Pure codec plus offset arithmetic; eviction,
//! locking and dirty tracking live above this layer.

use crate::access::tuple::TupleDesc;
use crate::storage::error::{DbError, DbResult};
use crate::storage::page::{Page, PageCategory, PageId, ROOT_PTR_PAGE_SIZE};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const DEFAULT_PAGE_SIZE: usize = 4096;

pub struct TableFile {
    table_id: u32,
    file: Mutex<File>,
    path: PathBuf,
    desc: TupleDesc,
    key_field: usize,
    page_size: usize,
}

impl TableFile {
    /// Opens the backing file, creating it if absent. A brand-new file stays
    /// empty until the first write touches it (`ensure_initialized`).
    pub fn open(
        table_id: u32,
        path: &Path,
        desc: TupleDesc,
        key_field: usize,
        page_size: usize,
    ) -> DbResult<Self> {
        assert!(key_field < desc.num_fields(), "key field out of range");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self {
            table_id,
            file: Mutex::new(file),
            path: path.to_path_buf(),
            desc,
            key_field,
            page_size,
        })
    }

    pub fn table_id(&self) -> u32 {
        self.table_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn desc(&self) -> &TupleDesc {
        &self.desc
    }

    pub fn key_field(&self) -> usize {
        self.key_field
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of ordinary pages in the file (the root pointer not counted).
    pub fn num_pages(&self) -> DbResult<u32> {
        let len = self.file.lock().metadata()?.len();
        Ok(((len.saturating_sub(ROOT_PTR_PAGE_SIZE as u64)) / self.page_size as u64) as u32)
    }

    /// Lazily writes an empty root-pointer page and an empty leaf page 1 the
    /// first time the file is touched.
    pub fn ensure_initialized(&self) -> DbResult<()> {
        let mut file = self.file.lock();
        if file.metadata()?.len() > 0 {
            return Ok(());
        }
        let root_ptr = Page::new(
            PageId::root_ptr(self.table_id),
            crate::storage::page::PageBody::RootPtr(crate::storage::page::RootPtrPage::new()),
        );
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&root_ptr.serialize())?;
        file.write_all(&vec![0u8; self.page_size])?;
        file.sync_all()?;
        Ok(())
    }

    fn page_offset(&self, page_no: u32) -> u64 {
        assert!(page_no >= 1, "ordinary pages are numbered from 1");
        ROOT_PTR_PAGE_SIZE as u64 + (page_no as u64 - 1) * self.page_size as u64
    }

    /// Reads and decodes one page. The id's category directs the decoding;
    /// it is not stored in the page bytes.
    pub fn read_page(&self, pid: PageId) -> DbResult<Page> {
        assert_eq!(pid.table_id, self.table_id, "page id names another table");
        let mut file = self.file.lock();
        if pid.category == PageCategory::RootPtr {
            let mut buf = vec![0u8; ROOT_PTR_PAGE_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            return Page::decode(pid, &buf, &self.desc, self.key_field);
        }

        let offset = self.page_offset(pid.page_no);
        let len = file.metadata()?.len();
        if offset + self.page_size as u64 > len {
            return Err(DbError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read past end of table file: page {}", pid),
            )));
        }
        let mut buf = vec![0u8; self.page_size];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Page::decode(pid, &buf, &self.desc, self.key_field)
    }

    /// Serializes and writes one page at its offset.
    pub fn write_page(&self, page: &Page) -> DbResult<()> {
        let pid = page.pid();
        assert_eq!(pid.table_id, self.table_id, "page id names another table");
        let data = page.serialize();
        let mut file = self.file.lock();
        let offset = if pid.category == PageCategory::RootPtr {
            0
        } else {
            self.page_offset(pid.page_no)
        };
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&data)?;
        file.sync_all()?;
        Ok(())
    }

    /// Extends the file by one zeroed page and returns its page number.
    pub fn append_blank_page(&self) -> DbResult<u32> {
        self.ensure_initialized()?;
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        file.seek(SeekFrom::Start(len))?;
        file.write_all(&vec![0u8; self.page_size])?;
        file.sync_all()?;
        let new_len = len + self.page_size as u64;
        Ok(((new_len - ROOT_PTR_PAGE_SIZE as u64) / self.page_size as u64) as u32)
    }

    /// Zeroes a page on disk, leaving its number allocated. Used when a
    /// recycled page is about to be re-created from scratch.
    pub fn wipe_page(&self, page_no: u32) -> DbResult<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.page_offset(page_no)))?;
        file.write_all(&vec![0u8; self.page_size])?;
        file.sync_all()?;
        Ok(())
    }

    /// Leaf tuple slots per page under this file's schema.
    pub fn leaf_capacity(&self) -> usize {
        crate::storage::page::LeafPage::capacity_for(self.page_size, self.desc.tuple_size())
    }

    /// Internal entry slots per page under this file's key type.
    pub fn internal_capacity(&self) -> usize {
        crate::storage::page::InternalPage::capacity_for(
            self.page_size,
            self.desc.field_type(self.key_field).size(),
        )
    }
}

impl std::fmt::Debug for TableFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableFile")
            .field("table_id", &self.table_id)
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .finish()
    }
}
