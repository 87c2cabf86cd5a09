//! Storage layer error types.

use crate::storage::page::PageId;
use crate::transaction::TransactionId;
use thiserror::Error;

/// Errors that can occur in the storage engine.
///
/// Structural-contract violations (e.g. handing a header-page id to a tree
/// descent) are caller bugs and panic instead of returning a variant.
#[derive(Error, Debug)]
pub enum DbError {
    /// The transaction could not acquire a page lock within its timeout
    /// window and has been aborted. All of its dirty pages were discarded
    /// and all of its locks released before this error was raised.
    #[error("{0} aborted: lock acquisition timed out")]
    TransactionAborted(TransactionId),

    #[error("page {0} is full")]
    PageFull(PageId),

    #[error("tuple not found: {0}")]
    TupleNotFound(String),

    #[error("tuple does not match table schema: {0}")]
    SchemaMismatch(String),

    #[error("buffer pool is full: every evictable page is dirty")]
    BufferPoolFull,

    #[error("unknown table id {0}")]
    UnknownTable(u32),

    #[error("corrupted tree structure: {0}")]
    Corrupted(String),

    #[error("wal encoding failed: {0}")]
    WalEncode(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage engine operations.
pub type DbResult<T> = std::result::Result<T, DbError>;
