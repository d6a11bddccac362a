//! POSIX file objects.
//!
//! Migration metadata lives in a single `user.` extended attribute on
//! the managed file: a small JSON record with the migration state and
//! the tape list. A file without the attribute is resident.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use tapestage_core::types::{FileState, FileUid, RecallEvent};

use crate::fs::{FileLockRegistry, FileStat, FsError, FsFile, MigAttr};

/// Extended attribute holding the migration record.
const MIG_ATTR_NAME: &str = "user.tapestage.mig";

/// Upper bound for the attribute value; the record is a few hundred
/// bytes even with the maximum number of replicas.
const MIG_ATTR_MAX: usize = 4096;

/// On-disk form of the migration attribute.
#[derive(Debug, Serialize, Deserialize)]
struct MigRecord {
    state: i64,
    tapes: Vec<String>,
}

/// A managed file resolved from a recall event.
pub struct PosixFile {
    uid: FileUid,
    path: PathBuf,
    cpath: CString,
    lock: Arc<tokio::sync::Mutex<()>>,
    write_handle: std::sync::Mutex<Option<std::fs::File>>,
}

impl PosixFile {
    /// Resolves the file object for `event`.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Unresolvable`] when the event carries no
    /// filename; this connector has no other way to reach the inode.
    pub fn open(event: &RecallEvent, locks: Arc<FileLockRegistry>) -> Result<Self, FsError> {
        let Some(filename) = event.filename.as_deref() else {
            return Err(FsError::Unresolvable);
        };

        let path = PathBuf::from(filename);
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| FsError::Unresolvable)?;

        Ok(Self {
            uid: event.uid,
            path,
            cpath,
            lock: locks.lock_for(event.uid),
            write_handle: std::sync::Mutex::new(None),
        })
    }

    /// Writes the migration attribute.
    ///
    /// Used by migration tooling when staging a file out, and by tests
    /// to construct migrated fixtures.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Io`] when the attribute cannot be written.
    pub fn set_attributes(&self, state: FileState, tapes: &[String]) -> Result<(), FsError> {
        let record = MigRecord {
            state: state.as_db(),
            tapes: tapes.to_vec(),
        };
        self.write_record(&record)
    }

    fn read_record(&self) -> Result<Option<MigRecord>, FsError> {
        let Some(raw) = getxattr(&self.cpath, MIG_ATTR_NAME)? else {
            return Ok(None);
        };
        let record: MigRecord = serde_json::from_slice(&raw)
            .map_err(|e| FsError::AttrFormat(e.to_string()))?;
        Ok(Some(record))
    }

    fn write_record(&self, record: &MigRecord) -> Result<(), FsError> {
        let raw = serde_json::to_vec(record)
            .map_err(|e| FsError::AttrFormat(e.to_string()))?;
        setxattr(&self.cpath, MIG_ATTR_NAME, &raw)?;
        Ok(())
    }
}

#[async_trait]
impl FsFile for PosixFile {
    fn stat(&self) -> Result<FileStat, FsError> {
        let meta = std::fs::symlink_metadata(&self.path)?;
        Ok(FileStat {
            size: meta.size(),
            mtime_sec: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
            regular: meta.file_type().is_file(),
        })
    }

    fn mig_state(&self) -> Result<FileState, FsError> {
        match self.read_record()? {
            // No migration record means the data never left disk.
            None => Ok(FileState::Resident),
            Some(record) => FileState::from_db(record.state)
                .map_err(|e| FsError::AttrFormat(e.to_string())),
        }
    }

    fn attributes(&self) -> Result<MigAttr, FsError> {
        match self.read_record()? {
            None => Err(FsError::AttrMissing),
            Some(record) => Ok(MigAttr {
                tape_ids: record.tapes,
            }),
        }
    }

    async fn lock(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.lock).lock_owned().await
    }

    fn prepare_recall(&self) -> Result<(), FsError> {
        let file = std::fs::OpenOptions::new().write(true).open(&self.path)?;
        *self
            .write_handle
            .lock()
            .expect("write handle poisoned") = Some(file);
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        let mut handle = self.write_handle.lock().expect("write handle poisoned");
        if handle.is_none() {
            *handle = Some(std::fs::OpenOptions::new().write(true).open(&self.path)?);
        }
        let file = handle.as_ref().expect("write handle just populated");
        Ok(file.write_at(data, offset)?)
    }

    fn finish_recall(&self, state: FileState) -> Result<(), FsError> {
        let mut record = self.read_record()?.unwrap_or(MigRecord {
            state: state.as_db(),
            tapes: Vec::new(),
        });
        record.state = state.as_db();
        self.write_record(&record)?;
        debug!(uid = %self.uid, state = %state, "recall finished");
        Ok(())
    }

    fn remove_attributes(&self) -> Result<(), FsError> {
        removexattr(&self.cpath, MIG_ATTR_NAME)?;
        Ok(())
    }
}

fn attr_name(name: &str) -> CString {
    CString::new(name).expect("attribute name contains no NUL")
}

#[allow(unsafe_code)]
fn getxattr(path: &CString, name: &str) -> Result<Option<Vec<u8>>, FsError> {
    let name = attr_name(name);
    let mut buf = vec![0u8; MIG_ATTR_MAX];

    // SAFETY: `path` and `name` are valid NUL-terminated strings and the
    // buffer pointer/length pair describes owned, writable memory that
    // outlives the call.
    let rc = unsafe {
        libc::getxattr(
            path.as_ptr(),
            name.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    };

    if rc < 0 {
        let err = std::io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::ENODATA) => Ok(None),
            _ => Err(FsError::Io(err)),
        };
    }

    #[allow(clippy::cast_sign_loss)] // rc >= 0 checked above
    buf.truncate(rc as usize);
    Ok(Some(buf))
}

#[allow(unsafe_code)]
fn setxattr(path: &CString, name: &str, value: &[u8]) -> Result<(), FsError> {
    let name = attr_name(name);

    // SAFETY: `path` and `name` are valid NUL-terminated strings; the
    // value pointer/length pair describes initialised memory that
    // outlives the call.
    let rc = unsafe {
        libc::setxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
        )
    };

    if rc < 0 {
        return Err(FsError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[allow(unsafe_code)]
fn removexattr(path: &CString, name: &str) -> Result<(), FsError> {
    let name = attr_name(name);

    // SAFETY: `path` and `name` are valid NUL-terminated strings.
    let rc = unsafe { libc::removexattr(path.as_ptr(), name.as_ptr()) };

    if rc < 0 {
        let err = std::io::Error::last_os_error();
        // Removing an attribute that is already gone is not an error.
        if err.raw_os_error() == Some(libc::ENODATA) {
            return Ok(());
        }
        return Err(FsError::Io(err));
    }
    Ok(())
}
