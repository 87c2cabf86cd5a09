//! Write-ahead log collaborator.
//!
//! The buffer pool appends a before/after image pair and forces the log
//! before any dirty page overwrites its on-disk predecessor. Replay and
//! checkpointing are outside this crate; the log is append-only here.

use crate::storage::error::{DbError, DbResult};
use crate::storage::page::PageId;
use crate::transaction::TransactionId;
use byteorder::{LittleEndian, WriteBytesExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Log sequence number; monotonically increasing per WalManager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lsn{}", self.0)
    }
}

/// An update record: the page images bracketing one mutation episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub lsn: u64,
    pub tid: TransactionId,
    pub table_id: u32,
    pub page_no: u32,
    pub category: u8,
    pub before_image: Vec<u8>,
    pub after_image: Vec<u8>,
}

pub struct WalManager {
    file: Mutex<BufWriter<File>>,
    next_lsn: AtomicU64,
}

impl WalManager {
    pub fn create(path: &Path) -> DbResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(BufWriter::new(file)),
            next_lsn: AtomicU64::new(1),
        })
    }

    /// Appends an update record. Buffered; not durable until `force`.
    pub fn append_update(
        &self,
        tid: TransactionId,
        pid: PageId,
        before_image: &[u8],
        after_image: &[u8],
    ) -> DbResult<Lsn> {
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        let record = UpdateRecord {
            lsn,
            tid,
            table_id: pid.table_id,
            page_no: pid.page_no,
            category: pid.category.as_u8(),
            before_image: before_image.to_vec(),
            after_image: after_image.to_vec(),
        };
        let payload = bincode::serialize(&record).map_err(|e| DbError::WalEncode(e.to_string()))?;

        let mut file = self.file.lock();
        file.write_u32::<LittleEndian>(payload.len() as u32)?;
        file.write_all(&payload)?;
        log::trace!("wal: appended update {} for {} on {}", Lsn(lsn), tid, pid);
        Ok(Lsn(lsn))
    }

    /// Flushes buffered records and fsyncs the log file.
    pub fn force(&self) -> DbResult<()> {
        let mut file = self.file.lock();
        file.flush()?;
        file.get_ref().sync_all()?;
        Ok(())
    }
}

impl std::fmt::Debug for WalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalManager")
            .field("next_lsn", &self.next_lsn.load(Ordering::SeqCst))
            .finish()
    }
}
