//! The database context: catalog, lock manager, WAL, and buffer pool wired
//! together as one explicit object. Multiple independent instances can
//! coexist in a process; nothing here is a process-wide singleton.

use crate::access::btree::BTreeFile;
use crate::access::tuple::TupleDesc;
use crate::catalog::Catalog;
use crate::concurrency::lock::LockManager;
use crate::storage::buffer::{BufferPool, BufferPoolConfig};
use crate::storage::disk::DEFAULT_PAGE_SIZE;
use crate::storage::error::{DbError, DbResult};
use crate::storage::wal::WalManager;
use crate::transaction::{TransactionId, TransactionIdGenerator};
use std::path::Path;
use std::sync::Arc;

pub struct Database {
    catalog: Arc<Catalog>,
    lock_manager: Arc<LockManager>,
    buffer_pool: Arc<BufferPool>,
    txn_ids: TransactionIdGenerator,
}

impl Database {
    /// Creates a database context whose WAL lives at `wal_path`.
    pub fn new(wal_path: &Path, config: BufferPoolConfig) -> DbResult<Self> {
        let catalog = Arc::new(Catalog::new());
        let lock_manager = Arc::new(LockManager::new());
        let wal = Arc::new(WalManager::create(wal_path)?);
        let buffer_pool = Arc::new(BufferPool::new(
            catalog.clone(),
            lock_manager.clone(),
            wal,
            config,
        ));
        Ok(Self {
            catalog,
            lock_manager,
            buffer_pool,
            txn_ids: TransactionIdGenerator::new(),
        })
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    /// Registers a B+-tree table and returns its index handle.
    pub fn create_btree_table(
        &self,
        name: &str,
        path: &Path,
        desc: TupleDesc,
        key_field: usize,
    ) -> DbResult<BTreeFile> {
        self.create_btree_table_with_page_size(name, path, desc, key_field, DEFAULT_PAGE_SIZE)
    }

    /// Same as `create_btree_table` with an explicit page size. Tiny pages
    /// force small fan-outs, which tests use to exercise splits and merges.
    pub fn create_btree_table_with_page_size(
        &self,
        name: &str,
        path: &Path,
        desc: TupleDesc,
        key_field: usize,
        page_size: usize,
    ) -> DbResult<BTreeFile> {
        let table_id = self
            .catalog
            .register_table(name, path, desc, key_field, page_size)?;
        BTreeFile::open(self.buffer_pool.clone(), &self.catalog, table_id)
    }

    /// The index handle of a registered table.
    pub fn open_btree_table(&self, name: &str) -> DbResult<BTreeFile> {
        let table_id = self
            .catalog
            .table_id(name)
            .ok_or_else(|| DbError::SchemaMismatch(format!("no table named {name:?}")))?;
        BTreeFile::open(self.buffer_pool.clone(), &self.catalog, table_id)
    }

    /// Mints a fresh transaction id.
    pub fn begin(&self) -> TransactionId {
        self.txn_ids.next()
    }

    /// Commits: flushes the transaction's pages and releases its locks.
    pub fn commit(&self, tid: TransactionId) -> DbResult<()> {
        self.buffer_pool.commit(tid)
    }

    /// Aborts: discards the transaction's pages and releases its locks.
    /// The transaction must not be resumed, only retried from scratch.
    pub fn abort(&self, tid: TransactionId) -> DbResult<()> {
        self.buffer_pool.abort(tid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::tuple::Tuple;
    use crate::access::value::{DataType, Field};
    use tempfile::tempdir;

    #[test]
    fn test_create_table_and_insert() {
        let dir = tempdir().unwrap();
        let db = Database::new(&dir.path().join("wal.log"), BufferPoolConfig::default()).unwrap();
        let tree = db
            .create_btree_table(
                "users",
                &dir.path().join("users.tbl"),
                TupleDesc::new(vec![DataType::Int32, DataType::Text]),
                0,
            )
            .unwrap();

        let tid = db.begin();
        tree.insert(
            tid,
            Tuple::new(vec![Field::Int32(1), Field::Text("ada".into())]),
        )
        .unwrap();
        db.commit(tid).unwrap();

        let tid = db.begin();
        let mut iter = tree.iterate(tid).unwrap();
        let tuple = iter.advance().unwrap().unwrap();
        assert_eq!(tuple.field(1), &Field::Text("ada".into()));
    }

    #[test]
    fn test_open_btree_table_by_name() {
        let dir = tempdir().unwrap();
        let db = Database::new(&dir.path().join("wal.log"), BufferPoolConfig::default()).unwrap();
        db.create_btree_table(
            "t",
            &dir.path().join("t.tbl"),
            TupleDesc::new(vec![DataType::Int32]),
            0,
        )
        .unwrap();

        assert!(db.open_btree_table("t").is_ok());
        assert!(db.open_btree_table("missing").is_err());
    }

    #[test]
    fn test_independent_instances() {
        let dir = tempdir().unwrap();
        let db1 = Database::new(&dir.path().join("wal1.log"), BufferPoolConfig::default()).unwrap();
        let db2 = Database::new(&dir.path().join("wal2.log"), BufferPoolConfig::default()).unwrap();

        // Transaction ids and catalogs are per instance.
        assert_eq!(db1.begin(), db2.begin());
        db1.create_btree_table(
            "t",
            &dir.path().join("a.tbl"),
            TupleDesc::new(vec![DataType::Int32]),
            0,
        )
        .unwrap();
        assert!(db2.open_btree_table("t").is_err());
    }
}
