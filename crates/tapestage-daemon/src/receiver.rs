//! Recall event receiver.
//!
//! One long-running loop owns the connector: it initialises transparent
//! recalls, registers the managed filesystems, and then pulls events
//! until graceful shutdown. Trivially satisfiable events (already
//! resident) and malformed ones are settled inline; everything else is
//! bound to its tape's request number and handed to the writer pool.
//!
//! Shutdown cleanup lives here too: after the writer pool and every
//! executor drained, any job row still present represents an event that
//! never got its response, and gets a failure response now.

use std::sync::Arc;

use rusqlite::params;
use tracing::{debug, info, warn};

use tapestage_core::DaemonConfig;
use tapestage_core::types::{ConnHandle, FileState, FileUid, Operation, RecallEvent};

use crate::connector::{Connector, ConnectorError};
use crate::inventory::Inventory;
use crate::scheduler::SchedulerShared;
use crate::store::{QueueStore, StoreError};
use crate::writer::{JobWriterPool, WriterContext, WriterTask};

const REMAINING_JOBS: &str = "SELECT FS_ID, I_GEN, I_NUM, FILE_NAME, TARGET_STATE, CONN_INFO
     FROM JOB_QUEUE WHERE OPERATION = ?1";

const DELETE_JOBS: &str = "DELETE FROM JOB_QUEUE WHERE OPERATION = ?1";

const DELETE_REQUESTS: &str = "DELETE FROM REQUEST_QUEUE WHERE OPERATION = ?1";

/// How the receiver settled the tape lookup for an event.
enum TapeResolution {
    /// Recall proceeds from this tape.
    Tape(String),
    /// The event is answered immediately with this outcome.
    Respond(bool),
}

/// The event-ingestion loop.
pub struct EventReceiver {
    store: Arc<QueueStore>,
    shared: Arc<SchedulerShared>,
    connector: Arc<dyn Connector>,
    inventory: Arc<dyn Inventory>,
    config: DaemonConfig,
}

impl EventReceiver {
    /// Creates the receiver over the shared server state.
    #[must_use]
    pub fn new(
        store: Arc<QueueStore>,
        shared: Arc<SchedulerShared>,
        connector: Arc<dyn Connector>,
        inventory: Arc<dyn Inventory>,
        config: DaemonConfig,
    ) -> Self {
        Self {
            store,
            shared,
            connector,
            inventory,
            config,
        }
    }

    /// Runs the event loop until shutdown, then drains the writer pool.
    ///
    /// # Errors
    ///
    /// Never fails today; the signature leaves room for store-backed
    /// admission checks.
    pub async fn run(&self) -> Result<(), StoreError> {
        if let Err(e) = self.connector.init_recalls().await {
            warn!(error = %e, "connector failed to initialise transparent recalls");
            return Ok(());
        }

        for fs in &self.config.managed_filesystems {
            match self.connector.manage_filesystem(fs).await {
                Ok(()) => info!(path = %fs.display(), "filesystem managed"),
                Err(e) => {
                    warn!(path = %fs.display(), error = %e, "cannot manage filesystem, skipping");
                }
            }
        }

        let ctx = Arc::new(WriterContext::new(
            Arc::clone(&self.store),
            Arc::clone(&self.shared),
            Arc::clone(&self.connector),
            Arc::clone(&self.inventory),
        ));
        let pool = JobWriterPool::spawn(ctx, self.config.recall_workers);

        loop {
            let event = match self.connector.next_event().await {
                Ok(event) => event,
                Err(ConnectorError::Closed) => {
                    warn!("connector event stream closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "failed to read recall event");
                    continue;
                }
            };

            // A handle-less event is the termination sentinel.
            if event.handle.is_none() {
                if self.shared.terminating() {
                    break;
                }
                debug!(uid = %event.uid, "spurious termination sentinel ignored");
                continue;
            }

            if self.shared.terminating() {
                self.connector.respond(&event, false).await;
                continue;
            }

            if event.uid.inum == 0 {
                debug!(uid = %event.uid, "malformed recall event ignored");
                continue;
            }

            let tape_id = match self.resolve_tape(&event) {
                TapeResolution::Tape(tape_id) => tape_id,
                TapeResolution::Respond(success) => {
                    self.connector.respond(&event, success).await;
                    continue;
                }
            };

            let req_num = self.shared.request_number_for(&tape_id);
            debug!(uid = %event.uid, %tape_id, req_num, "queueing recall job");

            let task = WriterTask {
                event: event.clone(),
                tape_id,
                req_num,
            };
            if pool.enqueue(task).await.is_err() {
                warn!(uid = %event.uid, "writer pool gone, failing event");
                self.connector.respond(&event, false).await;
            }
        }

        info!("recall event loop stopped");
        pool.drain().await;
        Ok(())
    }

    /// Settles the already-resident fast path and picks the event's
    /// tape: always the first one listed in the migration attribute.
    fn resolve_tape(&self, event: &RecallEvent) -> TapeResolution {
        let file = match self.connector.open_file(event) {
            Ok(file) => file,
            Err(e) => {
                warn!(uid = %event.uid, error = %e, "cannot open file object");
                return TapeResolution::Respond(false);
            }
        };

        let state = match file.mig_state() {
            Ok(state) => state,
            Err(e) => {
                warn!(uid = %event.uid, error = %e, "cannot read migration state");
                return TapeResolution::Respond(false);
            }
        };

        if state == FileState::Resident {
            if let Err(e) = file.finish_recall(FileState::Resident) {
                warn!(uid = %event.uid, error = %e, "resident finalisation failed");
            }
            info!(uid = %event.uid, "file already resident");
            return TapeResolution::Respond(true);
        }

        match file.attributes() {
            Ok(attr) => match attr.tape_ids.into_iter().next() {
                Some(tape_id) => TapeResolution::Tape(tape_id),
                None => {
                    warn!(uid = %event.uid, "migration attribute lists no tapes");
                    TapeResolution::Respond(false)
                }
            },
            Err(e) => {
                warn!(uid = %event.uid, error = %e, "cannot read migration attribute");
                TapeResolution::Respond(false)
            }
        }
    }
}

/// Answers every transparent-recall job still present with a failure
/// response, then clears the recall queues.
///
/// Runs after the writer pool and scheduler drained, so no job row can
/// receive a second response.
///
/// # Errors
///
/// Returns [`StoreError`] when the remaining jobs cannot be read or
/// deleted.
pub async fn cleanup_events(
    store: &QueueStore,
    connector: &dyn Connector,
) -> Result<(), StoreError> {
    let rows: Vec<(i64, i64, i64, Option<String>, i64, Option<i64>)> = {
        let conn = store.conn()?;
        let mut stmt = conn.prepare(REMAINING_JOBS)?;
        let rows = stmt.query_map(params![Operation::TransparentRecall.as_db()], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        })?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let unanswered = rows.len();
    for (fs_id, i_gen, i_num, filename, target_state, conn_info) in rows {
        let event = RecallEvent {
            uid: FileUid::from_db(fs_id, i_gen, i_num),
            filename,
            to_resident: FileState::from_db(target_state)
                .is_ok_and(|s| s == FileState::Resident),
            handle: conn_info.map(ConnHandle::new),
        };
        warn!(uid = %event.uid, "failing unanswered recall event at shutdown");
        connector.respond(&event, false).await;
    }

    {
        let conn = store.conn()?;
        conn.execute(DELETE_JOBS, params![Operation::TransparentRecall.as_db()])?;
        conn.execute(DELETE_REQUESTS, params![Operation::TransparentRecall.as_db()])?;
    }

    if unanswered > 0 {
        info!(unanswered, "event cleanup complete");
    }
    Ok(())
}
