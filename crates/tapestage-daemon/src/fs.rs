//! File objects and migration attributes.
//!
//! The recall core never touches managed files directly; it goes through
//! [`FsFile`] objects handed out by the connector. A file object knows
//! its stat data, its migration state, the tapes holding its data, and
//! how to write recalled content back at an offset.
//!
//! Per-file advisory locks serialise recall against concurrent migration
//! or a second recall of the same inode. The lock is purely in-process;
//! the connector is the only component operating on managed files.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use tapestage_core::types::{FileState, FileUid};

/// Errors from file-object operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// Underlying filesystem failure.
    #[error("file operation failed: {0}")]
    Io(#[from] std::io::Error),

    /// The file has no migration attribute.
    #[error("migration attribute missing")]
    AttrMissing,

    /// The migration attribute exists but does not parse.
    #[error("migration attribute malformed: {0}")]
    AttrFormat(String),

    /// The connector cannot map the event onto a file object.
    #[error("file object cannot be resolved")]
    Unresolvable,
}

/// Subset of stat data the recall core needs.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    /// Size in bytes.
    pub size: u64,
    /// Modification time, seconds part.
    pub mtime_sec: i64,
    /// Modification time, nanoseconds part.
    pub mtime_nsec: i64,
    /// Whether this is a regular file.
    pub regular: bool,
}

/// Migration attribute of a managed file.
#[derive(Debug, Clone)]
pub struct MigAttr {
    /// Tapes holding the file's data, in replica order. Transparent
    /// recall always reads from the first entry.
    pub tape_ids: Vec<String>,
}

/// A managed file as seen by the recall core.
#[async_trait]
pub trait FsFile: Send + Sync {
    /// Stats the file.
    fn stat(&self) -> Result<FileStat, FsError>;

    /// Current migration state.
    fn mig_state(&self) -> Result<FileState, FsError>;

    /// Migration attribute with the tape list.
    fn attributes(&self) -> Result<MigAttr, FsError>;

    /// Takes the per-file advisory lock.
    async fn lock(&self) -> OwnedMutexGuard<()>;

    /// Called before streaming data back into the file.
    fn prepare_recall(&self) -> Result<(), FsError>;

    /// Writes `data` at `offset`, returning the number of bytes written.
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize, FsError>;

    /// Finalises the file into `state` after a recall.
    fn finish_recall(&self, state: FileState) -> Result<(), FsError>;

    /// Drops the migration attributes of a now-resident file.
    fn remove_attributes(&self) -> Result<(), FsError>;
}

/// Hands out one advisory lock per file uid.
///
/// Entries are never removed; the map is bounded by the number of
/// distinct files recalled over the connector's lifetime.
#[derive(Debug, Default)]
pub struct FileLockRegistry {
    locks: std::sync::Mutex<HashMap<FileUid, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileLockRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock belonging to `uid`, creating it on first use.
    ///
    /// # Panics
    ///
    /// Panics if the registry mutex is poisoned; the registry is only
    /// touched from lock acquisition paths that cannot panic themselves.
    #[must_use]
    pub fn lock_for(&self, uid: FileUid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("file lock registry poisoned");
        Arc::clone(locks.entry(uid).or_default())
    }
}
