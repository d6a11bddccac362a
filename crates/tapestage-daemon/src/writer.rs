//! Job writer pool.
//!
//! The event receiver must never stall on store work, so per-event job
//! creation runs on a bounded pool of writer workers. Each task stats
//! the file, resolves its place on tape, inserts the job row, and then,
//! under the scheduler mutex, creates or re-activates the per-tape
//! request before signalling the scheduler.
//!
//! The mutex held across the request upsert and the signal is what makes
//! invariant "a `REQ_NEW` request has jobs" hold: the job row exists
//! before the request becomes visible as `REQ_NEW`, and the scheduler
//! cannot observe the request in between.

use std::sync::Arc;

use rusqlite::{OptionalExtension, params};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use tapestage_core::types::{
    FileState, Operation, RecallEvent, REPL_NUM_UNSET, RequestState,
};

use crate::connector::Connector;
use crate::inventory::Inventory;
use crate::scheduler::SchedulerShared;
use crate::store::{QueueStore, StoreError, unix_now};

const INSERT_JOB: &str = "INSERT INTO JOB_QUEUE (OPERATION, FILE_NAME, REQ_NUM, TARGET_STATE,
     REPL_NUM, FILE_SIZE, FS_ID, I_GEN, I_NUM, MTIME_SEC, MTIME_NSEC,
     LAST_UPD, TAPE_ID, FILE_STATE, START_BLOCK, CONN_INFO)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)";

const REQUEST_EXISTS: &str = "SELECT 1 FROM REQUEST_QUEUE WHERE REQ_NUM = ?1";

const REACTIVATE_REQUEST: &str =
    "UPDATE REQUEST_QUEUE SET STATE = ?1 WHERE REQ_NUM = ?2 AND TAPE_ID = ?3";

const INSERT_REQUEST: &str = "INSERT INTO REQUEST_QUEUE (OPERATION, REQ_NUM, TAPE_ID, TIME_ADDED, STATE)
     VALUES (?1, ?2, ?3, ?4, ?5)";

/// One unit of work for a writer worker.
#[derive(Debug)]
pub struct WriterTask {
    /// The accepted recall event.
    pub event: RecallEvent,
    /// Tape the recall will read from.
    pub tape_id: String,
    /// Request number bound to that tape.
    pub req_num: i64,
}

/// Dependencies shared by all writer workers.
pub struct WriterContext {
    store: Arc<QueueStore>,
    shared: Arc<SchedulerShared>,
    connector: Arc<dyn Connector>,
    inventory: Arc<dyn Inventory>,
}

impl WriterContext {
    /// Bundles the shared server state for the pool.
    #[must_use]
    pub fn new(
        store: Arc<QueueStore>,
        shared: Arc<SchedulerShared>,
        connector: Arc<dyn Connector>,
        inventory: Arc<dyn Inventory>,
    ) -> Self {
        Self {
            store,
            shared,
            connector,
            inventory,
        }
    }

    /// Creates the job and request rows for one event.
    ///
    /// Failures before the job insert are logged and swallowed; where a
    /// response obligation exists it is honoured first. Store failures
    /// in the request upsert propagate, leaving an orphaned job that
    /// shutdown cleanup will answer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the request upsert fails.
    pub async fn add_job(&self, task: WriterTask) -> Result<(), StoreError> {
        let event = &task.event;
        let Some(handle) = event.handle else {
            return Ok(());
        };

        let file = match self.connector.open_file(event) {
            Ok(file) => file,
            Err(e) => {
                warn!(uid = %event.uid, error = %e, "cannot open file for recall job");
                self.connector.respond(event, false).await;
                return Ok(());
            }
        };

        let stat = match file.stat() {
            Ok(stat) => stat,
            Err(e) => {
                warn!(uid = %event.uid, error = %e, "cannot stat file for recall job");
                self.connector.respond(event, false).await;
                return Ok(());
            }
        };

        if !stat.regular {
            warn!(uid = %event.uid, "recall event for non-regular file dropped");
            return Ok(());
        }

        let state = match file.mig_state() {
            Ok(state) => state,
            Err(e) => {
                warn!(uid = %event.uid, error = %e, "cannot read migration state");
                return Ok(());
            }
        };

        if state == FileState::Resident {
            info!(uid = %event.uid, "file already resident, no job needed");
            self.connector.respond(event, true).await;
            return Ok(());
        }

        if let Err(e) = file.attributes() {
            warn!(uid = %event.uid, error = %e, "cannot read migration attribute");
            return Ok(());
        }

        let tape_path = match self.inventory.tape_path(&event.uid, &task.tape_id) {
            Ok(path) => path,
            Err(e) => {
                warn!(uid = %event.uid, tape_id = %task.tape_id, error = %e, "cannot resolve tape object");
                return Ok(());
            }
        };
        let start_block = self.inventory.start_block(&tape_path);

        let inserted = {
            let conn = self.store.conn()?;
            conn.execute(
                INSERT_JOB,
                params![
                    Operation::TransparentRecall.as_db(),
                    event.filename,
                    task.req_num,
                    event.target_state().as_db(),
                    REPL_NUM_UNSET,
                    to_i64(stat.size),
                    event.uid.fs_id(),
                    i64::from(event.uid.igen),
                    to_i64(event.uid.inum),
                    stat.mtime_sec,
                    stat.mtime_nsec,
                    unix_now(),
                    task.tape_id,
                    state.as_db(),
                    start_block,
                    handle.as_i64()
                ],
            )
        };
        if let Err(e) = inserted {
            // Usually a second event raced in for a file that already
            // has an outstanding job; the first event's job answers it.
            warn!(uid = %event.uid, error = %e, "job insert failed, dropping event");
            return Ok(());
        }

        debug!(
            uid = %event.uid,
            tape_id = %task.tape_id,
            req_num = task.req_num,
            start_block,
            "recall job added"
        );

        let _guard = self.shared.lock().await;

        let exists: bool = {
            let conn = self.store.conn()?;
            conn.query_row(REQUEST_EXISTS, params![task.req_num], |_| Ok(true))
                .optional()?
                .unwrap_or(false)
        };

        {
            let conn = self.store.conn()?;
            if exists {
                conn.execute(
                    REACTIVATE_REQUEST,
                    params![RequestState::New.as_db(), task.req_num, task.tape_id],
                )?;
            } else {
                conn.execute(
                    INSERT_REQUEST,
                    params![
                        Operation::TransparentRecall.as_db(),
                        task.req_num,
                        task.tape_id,
                        unix_now(),
                        RequestState::New.as_db()
                    ],
                )?;
            }
        }

        self.shared.signal();
        Ok(())
    }
}

/// Bounded pool of writer workers.
pub struct JobWriterPool {
    tx: mpsc::Sender<WriterTask>,
    workers: JoinSet<()>,
}

impl JobWriterPool {
    /// Spawns `workers` workers sharing one bounded task channel.
    #[must_use]
    pub fn spawn(ctx: Arc<WriterContext>, workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<WriterTask>(workers);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut set = JoinSet::new();
        for worker in 0..workers {
            let ctx = Arc::clone(&ctx);
            let rx = Arc::clone(&rx);
            set.spawn(async move {
                loop {
                    let task = rx.lock().await.recv().await;
                    let Some(task) = task else { break };
                    if let Err(e) = ctx.add_job(task).await {
                        error!(worker, error = %e, "job writer hit a store failure");
                    }
                }
            });
        }

        Self { tx, workers: set }
    }

    /// Hands a task to the pool, waiting while all workers are busy and
    /// the channel is full.
    ///
    /// # Errors
    ///
    /// Returns the task when the pool has already been drained.
    pub async fn enqueue(&self, task: WriterTask) -> Result<(), SendError<WriterTask>> {
        self.tx.send(task).await
    }

    /// Closes the channel and waits for every worker to finish its
    /// remaining tasks.
    pub async fn drain(self) {
        let Self { tx, mut workers } = self;
        drop(tx);
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "job writer worker panicked");
            }
        }
    }
}

#[allow(clippy::cast_possible_wrap)] // sizes and inode numbers fit i64
const fn to_i64(value: u64) -> i64 {
    value as i64
}
