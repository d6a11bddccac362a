//! Domain types shared by the recall core.
//!
//! These map one-to-one onto the columns of the `JOB_QUEUE` and
//! `REQUEST_QUEUE` tables, so every enum carries a stable integer
//! discriminant. Changing a discriminant is a schema change.

use thiserror::Error;

/// Replica slot used for rows that are not replica-specific.
///
/// Transparent recall always recalls from the first listed tape, so its
/// job rows carry the unset marker in `REPL_NUM`.
pub const REPL_NUM_UNSET: i64 = -1;

/// Error for integer values read from the store that do not map onto a
/// known discriminant.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    /// `FILE_STATE` or `TARGET_STATE` column held an unknown value.
    #[error("unknown file state {0}")]
    UnknownFileState(i64),

    /// `STATE` column of `REQUEST_QUEUE` held an unknown value.
    #[error("unknown request state {0}")]
    UnknownRequestState(i64),

    /// `OPERATION` column held an unknown value.
    #[error("unknown operation {0}")]
    UnknownOperation(i64),
}

/// Migration state of a file, as tracked both in file attributes and in
/// the `FILE_STATE` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum FileState {
    /// Data on disk only.
    Resident = 0,
    /// Data on disk and on tape.
    Premigrated = 1,
    /// Data on tape only; a stub remains on disk.
    Migrated = 2,
    /// A migrated file currently being recalled.
    RecallingMig = 3,
    /// A premigrated file currently being recalled.
    RecallingPremig = 4,
}

impl FileState {
    /// Integer form stored in the queue tables.
    #[must_use]
    pub const fn as_db(self) -> i64 {
        self as i64
    }

    /// Parses the integer form read back from the queue tables.
    pub const fn from_db(value: i64) -> Result<Self, StateError> {
        match value {
            0 => Ok(Self::Resident),
            1 => Ok(Self::Premigrated),
            2 => Ok(Self::Migrated),
            3 => Ok(Self::RecallingMig),
            4 => Ok(Self::RecallingPremig),
            other => Err(StateError::UnknownFileState(other)),
        }
    }

    /// The state a recall transitions out of, for a claimed job.
    ///
    /// Returns `None` for states that are not recalling flavours.
    #[must_use]
    pub const fn recalling_source(self) -> Option<Self> {
        match self {
            Self::RecallingMig => Some(Self::Migrated),
            Self::RecallingPremig => Some(Self::Premigrated),
            _ => None,
        }
    }

    /// Human-readable name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Resident => "resident",
            Self::Premigrated => "premigrated",
            Self::Migrated => "migrated",
            Self::RecallingMig => "recalling (migrated)",
            Self::RecallingPremig => "recalling (premigrated)",
        }
    }
}

impl std::fmt::Display for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling state of a request row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum RequestState {
    /// Waiting for tape and drive resources.
    New = 0,
    /// Handed to an executor; at most one per `(req_num, tape_id)`.
    InProgress = 1,
    /// Finished; kept only transiently before deletion.
    Completed = 2,
}

impl RequestState {
    /// Integer form stored in `REQUEST_QUEUE.STATE`.
    #[must_use]
    pub const fn as_db(self) -> i64 {
        self as i64
    }

    /// Parses the integer form read back from the store.
    pub const fn from_db(value: i64) -> Result<Self, StateError> {
        match value {
            0 => Ok(Self::New),
            1 => Ok(Self::InProgress),
            2 => Ok(Self::Completed),
            other => Err(StateError::UnknownRequestState(other)),
        }
    }

    /// Human-readable name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::InProgress => "in progress",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work a queue row belongs to.
///
/// The queue tables are shared with the migration and selective-recall
/// planners, so all three kinds are representable even though this crate
/// only ever writes [`Operation::TransparentRecall`] rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum Operation {
    /// Migration to tape.
    Migration = 0,
    /// Recall explicitly requested by an administrator.
    SelectiveRecall = 1,
    /// Recall triggered by an application touching a migrated file.
    TransparentRecall = 2,
}

impl Operation {
    /// Integer form stored in the `OPERATION` columns.
    #[must_use]
    pub const fn as_db(self) -> i64 {
        self as i64
    }

    /// Parses the integer form read back from the store.
    pub const fn from_db(value: i64) -> Result<Self, StateError> {
        match value {
            0 => Ok(Self::Migration),
            1 => Ok(Self::SelectiveRecall),
            2 => Ok(Self::TransparentRecall),
            other => Err(StateError::UnknownOperation(other)),
        }
    }

    /// Human-readable name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Migration => "migration",
            Self::SelectiveRecall => "selective recall",
            Self::TransparentRecall => "transparent recall",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a file within its managed filesystem.
///
/// The filesystem id arrives from the connector as two 32-bit halves and
/// is stored packed into the single `FS_ID` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileUid {
    /// High half of the filesystem id.
    pub fsid_hi: u32,
    /// Low half of the filesystem id.
    pub fsid_lo: u32,
    /// Inode generation number.
    pub igen: u32,
    /// Inode number.
    pub inum: u64,
}

impl FileUid {
    /// Builds a uid from its four components.
    #[must_use]
    pub const fn new(fsid_hi: u32, fsid_lo: u32, igen: u32, inum: u64) -> Self {
        Self {
            fsid_hi,
            fsid_lo,
            igen,
            inum,
        }
    }

    /// Packed filesystem id as stored in the `FS_ID` column.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)] // round-trips through unpack_fs_id
    pub const fn fs_id(&self) -> i64 {
        (((self.fsid_hi as u64) << 32) | self.fsid_lo as u64) as i64
    }

    /// Splits a packed `FS_ID` column value back into its halves.
    #[must_use]
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub const fn unpack_fs_id(fs_id: i64) -> (u32, u32) {
        let raw = fs_id as u64;
        ((raw >> 32) as u32, raw as u32)
    }

    /// Rebuilds a uid from the `FS_ID`, `I_GEN`, and `I_NUM` columns.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn from_db(fs_id: i64, i_gen: i64, i_num: i64) -> Self {
        let (fsid_hi, fsid_lo) = Self::unpack_fs_id(fs_id);
        Self {
            fsid_hi,
            fsid_lo,
            igen: i_gen as u32,
            inum: i_num as u64,
        }
    }
}

impl std::fmt::Display for FileUid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.fsid_hi, self.fsid_lo, self.igen, self.inum
        )
    }
}

/// Opaque handle correlating an event with the connector context that
/// must receive its response.
///
/// The core never interprets the value; it is stored in `CONN_INFO` and
/// handed back verbatim when responding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(i64);

impl ConnHandle {
    /// Wraps a raw connector handle value.
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Raw value as stored in the `CONN_INFO` column.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A recall event as handed from the connector to the receiver.
///
/// Transient: events live only between arrival and the delivery of their
/// response (or their persistence into a job row).
#[derive(Debug, Clone)]
pub struct RecallEvent {
    /// Identity of the touched file.
    pub uid: FileUid,
    /// Path of the touched file, when the connector knows it.
    pub filename: Option<String>,
    /// Recall to resident (true) or premigrated (false).
    pub to_resident: bool,
    /// Connector correlation handle; `None` is the termination sentinel.
    pub handle: Option<ConnHandle>,
}

impl RecallEvent {
    /// Target state requested by the event.
    #[must_use]
    pub const fn target_state(&self) -> FileState {
        if self.to_resident {
            FileState::Resident
        } else {
            FileState::Premigrated
        }
    }
}
