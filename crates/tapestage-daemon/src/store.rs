//! Embedded queue store backed by `SQLite`.
//!
//! Holds the two tables every planner in the server shares:
//!
//! - `JOB_QUEUE` — one row per outstanding piece of per-file work
//! - `REQUEST_QUEUE` — one row per scheduleable per-tape request
//!
//! The connection is opened with the full mutex so statements from
//! concurrent tasks serialise inside `SQLite`; on top of that the store
//! offers [`QueueStore::begin`] for the few places that need
//! multi-statement atomicity. The guard rolls the transaction back when
//! dropped without [`StoreTransaction::commit`].
//!
//! The column sets are shared with the migration planner and must not be
//! changed independently of it. The same goes for the `FITS` SQL
//! function: transparent recall never calls it, but the store registers
//! it so migration statements prepared against this database resolve.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;
use tracing::debug;

use tapestage_core::types::StateError;

/// Errors surfaced by store operations.
///
/// Store errors are fatal to the operation that hit them; callers log
/// and unwind their task rather than retrying.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another task panicked while holding a store lock.
    #[error("store lock poisoned")]
    LockPoisoned,

    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A column value did not decode into its domain type.
    #[error(transparent)]
    State(#[from] StateError),
}

/// Where the store lives.
#[derive(Debug, Clone)]
pub enum StoreLocation {
    /// File-backed database at the given path.
    File(PathBuf),
    /// Private in-memory database; used by tests and diagnostics.
    Memory,
}

/// Accounting state behind the `FITS` SQL function.
///
/// The migration planner seeds `free` with the free capacity of a
/// candidate tape and then lets its job-selection statement call
/// `FITS(inode, size, ...)` per row; rows that fit decrement the pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct FitsCounters {
    /// Remaining capacity of the candidate tape, in bytes.
    pub free: i64,
    /// Number of rows accepted so far.
    pub num_found: i64,
    /// Number of rows inspected so far.
    pub total: i64,
}

const CREATE_JOB_QUEUE: &str = "CREATE TABLE IF NOT EXISTS JOB_QUEUE(
    OPERATION INT NOT NULL,
    FILE_NAME CHAR(4096),
    REQ_NUM INT NOT NULL,
    TARGET_STATE INT NOT NULL,
    REPL_NUM INT,
    TAPE_POOL VARCHAR,
    FILE_SIZE BIGINT NOT NULL,
    FS_ID BIGINT NOT NULL,
    I_GEN INT NOT NULL,
    I_NUM BIGINT NOT NULL,
    MTIME_SEC BIGINT NOT NULL,
    MTIME_NSEC BIGINT NOT NULL,
    LAST_UPD INT NOT NULL,
    TAPE_ID CHAR(9),
    FILE_STATE INT NOT NULL,
    START_BLOCK INT,
    CONN_INFO BIGINT,
    CONSTRAINT JOB_QUEUE_UNIQUE_FILE_NAME UNIQUE (FILE_NAME, REPL_NUM),
    CONSTRAINT JOB_QUEUE_UNIQUE_UID UNIQUE (FS_ID, I_GEN, I_NUM, REPL_NUM))";

const CREATE_REQUEST_QUEUE: &str = "CREATE TABLE IF NOT EXISTS REQUEST_QUEUE(
    OPERATION INT NOT NULL,
    REQ_NUM INT NOT NULL,
    TARGET_STATE INT,
    NUM_REPL INT,
    REPL_NUM INT,
    TAPE_POOL VARCHAR,
    TAPE_ID CHAR(9),
    TIME_ADDED INT NOT NULL,
    STATE INT NOT NULL,
    CONSTRAINT REQUEST_QUEUE_UNIQUE UNIQUE(REQ_NUM, REPL_NUM, TAPE_POOL, TAPE_ID))";

/// Embedded transactional store for job and request queues.
pub struct QueueStore {
    conn: Mutex<Connection>,
    tx_lock: Mutex<()>,
    fits: Arc<Mutex<FitsCounters>>,
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore").finish_non_exhaustive()
    }
}

impl QueueStore {
    /// Opens (and creates if missing) the queue store.
    ///
    /// The database is opened read-write with the full `SQLite` mutex and
    /// extended result codes, and switched to exclusive locking so a
    /// second server process fails on first access instead of silently
    /// interleaving.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] when the database cannot be opened
    /// or the schema cannot be created.
    pub fn open(location: &StoreLocation) -> Result<Self, StoreError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_EXRESCODE;

        let conn = match location {
            StoreLocation::File(path) => Connection::open_with_flags(path, flags)?,
            StoreLocation::Memory => Connection::open_with_flags("file::memory:", flags)?,
        };

        if matches!(location, StoreLocation::File(_)) {
            // The pragma echoes the new mode back as a result row.
            let _mode: String =
                conn.query_row("PRAGMA locking_mode = exclusive", [], |row| row.get(0))?;
        }

        let fits = Arc::new(Mutex::new(FitsCounters::default()));
        register_fits(&conn, Arc::clone(&fits))?;

        conn.execute(CREATE_JOB_QUEUE, [])?;
        conn.execute(CREATE_REQUEST_QUEUE, [])?;

        debug!(?location, "queue store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            tx_lock: Mutex::new(()),
            fits,
        })
    }

    /// Locks the connection for statement execution.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockPoisoned`] when a previous holder
    /// panicked.
    pub fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Begins a serialised multi-statement transaction.
    ///
    /// The serialising lock is held until the guard commits or drops;
    /// dropping without commit rolls back.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the lock is poisoned or `BEGIN` fails.
    pub fn begin(&self) -> Result<StoreTransaction<'_>, StoreError> {
        let serial = self.tx_lock.lock().map_err(|_| StoreError::LockPoisoned)?;
        self.conn()?.execute_batch("BEGIN TRANSACTION")?;
        Ok(StoreTransaction {
            store: self,
            _serial: serial,
            committed: false,
        })
    }

    /// Rows changed by the most recent statement.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockPoisoned`] when the connection lock is
    /// poisoned.
    pub fn last_updates(&self) -> Result<u64, StoreError> {
        Ok(self.conn()?.changes())
    }

    /// Seeds the `FITS` accounting state with a tape's free capacity.
    pub fn reset_fits(&self, free: i64) {
        if let Ok(mut counters) = self.fits.lock() {
            *counters = FitsCounters {
                free,
                num_found: 0,
                total: 0,
            };
        }
    }

    /// Current `FITS` accounting state.
    #[must_use]
    pub fn fits_counters(&self) -> FitsCounters {
        self.fits.lock().map(|c| *c).unwrap_or_default()
    }

    /// Removes the store file and its rollback journal.
    ///
    /// Missing files are not an error; the server calls this on startup
    /// to discard queues left behind by a previous run.
    ///
    /// # Errors
    ///
    /// Returns the first I/O error other than `NotFound`.
    pub fn cleanup(db_path: &Path) -> std::io::Result<()> {
        let mut journal = db_path.as_os_str().to_os_string();
        journal.push("-journal");

        for path in [db_path.to_path_buf(), PathBuf::from(journal)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Guard for a `BEGIN`/`END TRANSACTION` pair.
pub struct StoreTransaction<'a> {
    store: &'a QueueStore,
    _serial: MutexGuard<'a, ()>,
    committed: bool,
}

impl StoreTransaction<'_> {
    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when `END TRANSACTION` fails; the guard is
    /// consumed either way.
    pub fn commit(mut self) -> Result<(), StoreError> {
        self.store.conn()?.execute_batch("END TRANSACTION")?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StoreTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            if let Ok(conn) = self.store.conn() {
                let _ = conn.execute_batch("ROLLBACK TRANSACTION");
            }
        }
    }
}

/// Registers the `FITS(inode, size, free, num_found, total)` function.
///
/// The signature keeps five arguments for statement compatibility, but
/// the accounting lives in the store rather than behind the raw pointers
/// the SQL arguments used to smuggle; only `size` is read.
fn register_fits(conn: &Connection, state: Arc<Mutex<FitsCounters>>) -> rusqlite::Result<()> {
    conn.create_scalar_function("FITS", 5, FunctionFlags::SQLITE_UTF8, move |ctx| {
        let size = ctx.get::<i64>(1)?;
        let mut counters = state.lock().map_err(|_| {
            rusqlite::Error::UserFunctionError("FITS counters poisoned".into())
        })?;

        counters.total += 1;
        if counters.free >= size {
            counters.free -= size;
            counters.num_found += 1;
            Ok(1i64)
        } else {
            Ok(0i64)
        }
    })
}

/// Seconds since the Unix epoch, for `LAST_UPD` and `TIME_ADDED` stamps.
#[must_use]
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
