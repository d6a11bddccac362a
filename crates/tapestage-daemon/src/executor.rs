//! Recall request execution.
//!
//! Given a scheduled `(req_num, tape_id)` pair, the executor runs four
//! phases:
//!
//! - **A — claim.** Under the scheduler mutex, flip every `MIGRATED` job
//!   of the request to `RECALLING_MIG` and every `PREMIGRATED` one to
//!   `RECALLING_PREMIG`. Jobs inserted afterwards belong to the next
//!   execution.
//! - **B — process.** Stream each claimed file off tape in ascending
//!   start-block order, collecting one response per job.
//! - **C — finalise.** Under the scheduler mutex again: reset any jobs a
//!   forced shutdown left unprocessed, delete the claimed rows, release
//!   the tape reservation, and either requeue or delete the request.
//! - **D — respond.** Deliver the collected responses. Responses go out
//!   only after the store mutations committed; undelivered ones are
//!   turned into failures by shutdown cleanup.
//!
//! Per-job failures ([`JobError`]) are swallowed into the response list;
//! only store failures unwind the execution.

use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::params;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use tapestage_core::types::{ConnHandle, FileState, FileUid, RecallEvent, RequestState};

use crate::connector::{Connector, ConnectorError};
use crate::fs::FsError;
use crate::inventory::{Inventory, InventoryError};
use crate::scheduler::SchedulerShared;
use crate::store::{QueueStore, StoreError};

const CLAIM_JOBS: &str = "UPDATE JOB_QUEUE SET FILE_STATE = ?1
     WHERE REQ_NUM = ?2 AND FILE_STATE = ?3 AND TAPE_ID = ?4";

const SELECT_CLAIMED: &str = "SELECT FS_ID, I_GEN, I_NUM, FILE_NAME, FILE_STATE, TARGET_STATE, CONN_INFO
     FROM JOB_QUEUE
     WHERE REQ_NUM = ?1 AND FILE_STATE IN (?2, ?3) AND TAPE_ID = ?4
     ORDER BY START_BLOCK ASC, ROWID ASC";

const RESET_JOB: &str = "UPDATE JOB_QUEUE SET FILE_STATE = ?1
     WHERE REQ_NUM = ?2 AND TAPE_ID = ?3 AND FS_ID = ?4 AND I_GEN = ?5 AND I_NUM = ?6";

const DELETE_CLAIMED: &str = "DELETE FROM JOB_QUEUE
     WHERE REQ_NUM = ?1 AND FILE_STATE IN (?2, ?3) AND TAPE_ID = ?4";

const COUNT_JOBS: &str = "SELECT count(*) FROM JOB_QUEUE WHERE REQ_NUM = ?1 AND TAPE_ID = ?2";

const REQUEUE_REQUEST: &str =
    "UPDATE REQUEST_QUEUE SET STATE = ?1 WHERE REQ_NUM = ?2 AND TAPE_ID = ?3";

const DELETE_REQUEST: &str = "DELETE FROM REQUEST_QUEUE WHERE REQ_NUM = ?1 AND TAPE_ID = ?2";

/// Recoverable failure of a single recall job.
#[derive(Debug, Error)]
pub enum JobError {
    /// The tape object could not be opened.
    #[error("failed to open tape object {path}: {source}")]
    TapeOpen {
        /// Tape object path.
        path: PathBuf,
        /// Underlying open failure.
        #[source]
        source: std::io::Error,
    },

    /// Reading from the tape object failed.
    #[error("tape read failed: {0}")]
    TapeRead(#[source] std::io::Error),

    /// The target file accepted fewer bytes than were read off tape.
    #[error("short write at offset {offset}: {written} of {expected} bytes")]
    ShortWrite {
        /// Offset of the failed chunk.
        offset: u64,
        /// Bytes read from tape.
        expected: usize,
        /// Bytes the target accepted.
        written: usize,
    },

    /// Forced shutdown aborted the copy.
    #[error("recall aborted by forced shutdown")]
    Terminated,

    /// File-object operation failed.
    #[error(transparent)]
    Fs(#[from] FsError),

    /// The connector could not resolve the file.
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// Inventory lookup failed.
    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

/// A job claimed by Phase A, in processing order.
#[derive(Debug, Clone)]
struct ClaimedJob {
    uid: FileUid,
    filename: Option<String>,
    file_state: FileState,
    target_state: FileState,
    handle: Option<ConnHandle>,
}

impl ClaimedJob {
    fn event(&self) -> RecallEvent {
        RecallEvent {
            uid: self.uid,
            filename: self.filename.clone(),
            to_resident: matches!(self.target_state, FileState::Resident),
            handle: self.handle,
        }
    }
}

/// Result of Phase B for one request execution.
struct ExecutionBatch {
    responses: Vec<(RecallEvent, bool)>,
    /// Jobs a forced shutdown left untouched; populated only on abort.
    unprocessed: Vec<ClaimedJob>,
}

/// Executes one scheduled recall request.
pub struct RecallExecutor {
    store: Arc<QueueStore>,
    shared: Arc<SchedulerShared>,
    connector: Arc<dyn Connector>,
    inventory: Arc<dyn Inventory>,
    read_buffer_size: usize,
}

impl RecallExecutor {
    /// Creates an executor over the shared server state.
    #[must_use]
    pub fn new(
        store: Arc<QueueStore>,
        shared: Arc<SchedulerShared>,
        connector: Arc<dyn Connector>,
        inventory: Arc<dyn Inventory>,
        read_buffer_size: usize,
    ) -> Self {
        Self {
            store,
            shared,
            connector,
            inventory,
            read_buffer_size: read_buffer_size.max(1),
        }
    }

    /// Runs all four phases for `(req_num, tape_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when a queue operation fails. The tape
    /// reservation is released either way; the request row is left
    /// `REQ_INPROGRESS` on fatal failure so it is not rescheduled
    /// against a store that just failed.
    pub async fn exec_request(&self, req_num: i64, tape_id: &str) -> Result<(), StoreError> {
        debug!(req_num, tape_id, "executing recall request");

        let batch = match self.process_files(req_num, tape_id).await {
            Ok(batch) => batch,
            Err(e) => {
                self.inventory.release(tape_id);
                return Err(e);
            }
        };

        if let Err(e) = self.finalize(req_num, tape_id, &batch).await {
            self.inventory.release(tape_id);
            return Err(e);
        }

        // Phase D: respond only after the store mutations committed.
        for (event, success) in &batch.responses {
            self.connector.respond(event, *success).await;
        }

        Ok(())
    }

    /// Phases A and B.
    async fn process_files(&self, req_num: i64, tape_id: &str) -> Result<ExecutionBatch, StoreError> {
        {
            let _guard = self.shared.lock().await;
            let conn = self.store.conn()?;
            conn.execute(
                CLAIM_JOBS,
                params![
                    FileState::RecallingMig.as_db(),
                    req_num,
                    FileState::Migrated.as_db(),
                    tape_id
                ],
            )?;
            conn.execute(
                CLAIM_JOBS,
                params![
                    FileState::RecallingPremig.as_db(),
                    req_num,
                    FileState::Premigrated.as_db(),
                    tape_id
                ],
            )?;
        }

        let jobs = self.select_claimed(req_num, tape_id)?;
        debug!(req_num, tape_id, jobs = jobs.len(), "jobs claimed");

        let mut responses = Vec::with_capacity(jobs.len());
        let mut processed = 0usize;
        let mut aborted = false;

        for job in &jobs {
            if self.shared.forced() {
                aborted = true;
                break;
            }

            // Claimed rows are always in a recalling flavour.
            let from_state = job
                .file_state
                .recalling_source()
                .unwrap_or(FileState::Resident);
            let event = job.event();
            processed += 1;

            match self
                .recall_file(&event, tape_id, from_state, job.target_state)
                .await
            {
                Ok(copied) => {
                    debug!(uid = %event.uid, copied, "file recalled");
                    responses.push((event, true));
                }
                Err(e) => {
                    warn!(uid = %event.uid, error = %e, "recall job failed");
                    responses.push((event, false));
                }
            }
        }

        let unprocessed = if aborted {
            jobs[processed..].to_vec()
        } else {
            Vec::new()
        };

        Ok(ExecutionBatch {
            responses,
            unprocessed,
        })
    }

    fn select_claimed(&self, req_num: i64, tape_id: &str) -> Result<Vec<ClaimedJob>, StoreError> {
        let raw: Vec<(i64, i64, i64, Option<String>, i64, i64, Option<i64>)> = {
            let conn = self.store.conn()?;
            let mut stmt = conn.prepare(SELECT_CLAIMED)?;
            let rows = stmt.query_map(
                params![
                    req_num,
                    FileState::RecallingMig.as_db(),
                    FileState::RecallingPremig.as_db(),
                    tape_id
                ],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut jobs = Vec::with_capacity(raw.len());
        for (fs_id, i_gen, i_num, filename, file_state, target_state, conn_info) in raw {
            jobs.push(ClaimedJob {
                uid: FileUid::from_db(fs_id, i_gen, i_num),
                filename,
                file_state: FileState::from_db(file_state)?,
                target_state: FileState::from_db(target_state)?,
                handle: conn_info.map(ConnHandle::new),
            });
        }
        Ok(jobs)
    }

    /// Recalls one file, honouring drift, size mismatches, and the
    /// forced-terminate flag.
    async fn recall_file(
        &self,
        event: &RecallEvent,
        tape_id: &str,
        from_state: FileState,
        target: FileState,
    ) -> Result<u64, JobError> {
        let file = self.connector.open_file(event)?;
        let _file_lock = file.lock().await;

        let state = {
            let observed = file.mig_state()?;
            if observed != from_state {
                info!(
                    uid = %event.uid,
                    observed = %observed,
                    expected = %from_state,
                    "migration state drifted, using observed state"
                );
            }
            observed
        };

        // A concurrent recall already brought the data back.
        if state == FileState::Resident {
            return Ok(0);
        }

        let mut to_state = target;
        let mut copied = 0u64;

        if state == FileState::Migrated {
            let tape_path = self.inventory.tape_path(&event.uid, tape_id)?;
            let mut tape = tokio::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_CLOEXEC)
                .open(&tape_path)
                .await
                .map_err(|source| JobError::TapeOpen {
                    path: tape_path.clone(),
                    source,
                })?;

            let stat = file.stat()?;
            let tape_size = tape.metadata().await.map_err(JobError::TapeRead)?.len();
            let mut expected = stat.size;
            if tape_size != stat.size {
                warn!(
                    uid = %event.uid,
                    file_size = stat.size,
                    tape_size,
                    "size mismatch between file and tape object, trusting tape"
                );
                expected = tape_size;
                // Do not leave a premigrated file whose sizes disagree.
                to_state = FileState::Resident;
            }

            file.prepare_recall()?;

            let mut buffer = vec![0u8; self.read_buffer_size];
            while copied < expected {
                if self.shared.forced() {
                    return Err(JobError::Terminated);
                }

                let n = tape.read(&mut buffer).await.map_err(JobError::TapeRead)?;
                if n == 0 {
                    // EOF ends the copy successfully.
                    break;
                }

                let written = file.write_at(copied, &buffer[..n]).await?;
                if written != n {
                    return Err(JobError::ShortWrite {
                        offset: copied,
                        expected: n,
                        written,
                    });
                }
                copied += n as u64;
            }
        }

        file.finish_recall(to_state)?;
        if to_state == FileState::Resident {
            file.remove_attributes()?;
        }

        Ok(copied)
    }

    /// Phase C.
    async fn finalize(
        &self,
        req_num: i64,
        tape_id: &str,
        batch: &ExecutionBatch,
    ) -> Result<(), StoreError> {
        let _guard = self.shared.lock().await;

        {
            let tx = self.store.begin()?;
            {
                let conn = self.store.conn()?;

                // A forced shutdown left these claimed but untouched;
                // put them back so cleanup responds failure for them.
                for job in &batch.unprocessed {
                    let Some(prior) = job.file_state.recalling_source() else {
                        continue;
                    };
                    conn.execute(
                        RESET_JOB,
                        params![
                            prior.as_db(),
                            req_num,
                            tape_id,
                            job.uid.fs_id(),
                            i64::from(job.uid.igen),
                            to_i64(job.uid.inum)
                        ],
                    )?;
                }

                conn.execute(
                    DELETE_CLAIMED,
                    params![
                        req_num,
                        FileState::RecallingMig.as_db(),
                        FileState::RecallingPremig.as_db(),
                        tape_id
                    ],
                )?;
            }
            tx.commit()?;
        }

        // Cartridge back to mounted-idle, drive freed.
        self.inventory.release(tape_id);

        let remaining: i64 = {
            let conn = self.store.conn()?;
            conn.query_row(COUNT_JOBS, params![req_num, tape_id], |row| row.get(0))?
        };

        {
            let conn = self.store.conn()?;
            if remaining > 0 {
                conn.execute(
                    REQUEUE_REQUEST,
                    params![RequestState::New.as_db(), req_num, tape_id],
                )?;
                info!(req_num, tape_id, remaining, "request requeued for late jobs");
            } else {
                conn.execute(DELETE_REQUEST, params![req_num, tape_id])?;
                debug!(req_num, tape_id, "request complete");
            }
        }

        self.shared.signal();
        Ok(())
    }
}

#[allow(clippy::cast_possible_wrap)] // inode numbers fit i64 on every supported fs
const fn to_i64(value: u64) -> i64 {
    value as i64
}
