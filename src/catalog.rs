//! The catalog: maps table ids to their storage files.
//!
//! The buffer pool and the B+-tree resolve a table id here to reach the
//! file handle, key field, and schema. Registration is in-memory; the
//! durable state is the table files themselves.

use crate::access::tuple::TupleDesc;
use crate::storage::disk::TableFile;
use crate::storage::error::{DbError, DbResult};
use dashmap::DashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct Catalog {
    tables: DashMap<u32, Arc<TableFile>>,
    names: DashMap<String, u32>,
    next_table_id: AtomicU32,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            names: DashMap::new(),
            next_table_id: AtomicU32::new(1),
        }
    }

    /// Registers a table backed by `path`, creating the file if absent.
    /// Returns the new table id.
    pub fn register_table(
        &self,
        name: &str,
        path: &Path,
        desc: TupleDesc,
        key_field: usize,
        page_size: usize,
    ) -> DbResult<u32> {
        if self.names.contains_key(name) {
            return Err(DbError::SchemaMismatch(format!(
                "table {name:?} is already registered"
            )));
        }
        let table_id = self.next_table_id.fetch_add(1, Ordering::SeqCst);
        let file = TableFile::open(table_id, path, desc, key_field, page_size)?;
        self.tables.insert(table_id, Arc::new(file));
        self.names.insert(name.to_string(), table_id);
        Ok(table_id)
    }

    /// Resolves a table id to its storage file.
    pub fn resolve(&self, table_id: u32) -> DbResult<Arc<TableFile>> {
        self.tables
            .get(&table_id)
            .map(|e| e.value().clone())
            .ok_or(DbError::UnknownTable(table_id))
    }

    pub fn table_id(&self, name: &str) -> Option<u32> {
        self.names.get(name).map(|e| *e.value())
    }

    pub fn table_names(&self) -> Vec<String> {
        self.names.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::value::DataType;
    use tempfile::tempdir;

    fn int_desc() -> TupleDesc {
        TupleDesc::new(vec![DataType::Int32])
    }

    #[test]
    fn test_register_and_resolve() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new();
        let table_id = catalog
            .register_table("users", &dir.path().join("users.tbl"), int_desc(), 0, 64)
            .unwrap();

        let file = catalog.resolve(table_id).unwrap();
        assert_eq!(file.table_id(), table_id);
        assert_eq!(catalog.table_id("users"), Some(table_id));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new();
        catalog
            .register_table("t", &dir.path().join("a.tbl"), int_desc(), 0, 64)
            .unwrap();
        let result = catalog.register_table("t", &dir.path().join("b.tbl"), int_desc(), 0, 64);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_table() {
        let catalog = Catalog::new();
        assert!(matches!(
            catalog.resolve(99),
            Err(DbError::UnknownTable(99))
        ));
    }
}
