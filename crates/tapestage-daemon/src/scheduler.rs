//! Request scheduling.
//!
//! [`SchedulerShared`] bundles the process-wide pieces every component
//! touches: the scheduler mutex guarding request-state transitions in
//! the store, the condition used to signal new work, the tape→request
//! map with its number counter, and the two termination flags. The
//! server owns one instance and threads it through the receiver, the
//! writer pool, the dispatch loop, and the executors.
//!
//! [`RequestScheduler`] is the dispatch loop: it wakes on the condition,
//! picks `REQ_NEW` transparent-recall requests whose tape and drive are
//! available, marks them `REQ_INPROGRESS`, and hands them to a
//! [`RecallExecutor`](crate::executor::RecallExecutor). The inventory
//! reservation guarantees at most one in-flight execution per tape even
//! when a request is re-activated mid-flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use rusqlite::params;
use tokio::sync::futures::Notified;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use tapestage_core::types::{Operation, RequestState};

use crate::connector::Connector;
use crate::executor::RecallExecutor;
use crate::inventory::Inventory;
use crate::store::{QueueStore, StoreError};

const SELECT_NEW_REQUESTS: &str = "SELECT REQ_NUM, TAPE_ID FROM REQUEST_QUEUE
     WHERE STATE = ?1 AND OPERATION = ?2 ORDER BY TIME_ADDED ASC, ROWID ASC";

const SET_REQUEST_STATE: &str =
    "UPDATE REQUEST_QUEUE SET STATE = ?1 WHERE REQ_NUM = ?2 AND TAPE_ID = ?3";

/// Process-wide scheduling state.
#[derive(Debug, Default)]
pub struct SchedulerShared {
    lock: Mutex<()>,
    notify: Notify,
    req_numbers: std::sync::Mutex<HashMap<String, i64>>,
    next_req_num: AtomicI64,
    terminate: AtomicBool,
    forced: AtomicBool,
}

impl SchedulerShared {
    /// Creates fresh scheduling state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the scheduler mutex.
    ///
    /// Held while request rows transition state and while the paired
    /// notify fires; never held across tape I/O.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// Signals the scheduler condition.
    pub fn signal(&self) {
        self.notify.notify_one();
    }

    /// Future completing on the next [`SchedulerShared::signal`].
    ///
    /// Create the future before scanning for work so a signal landing
    /// between scan and wait is not lost.
    #[must_use]
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Request number bound to `tape_id`, assigning the next free number
    /// on first use.
    ///
    /// Entries live for the process lifetime, so every job targeting one
    /// tape shares a request number. The map grows with the number of
    /// distinct tapes touched, which is bounded by the library size.
    ///
    /// # Panics
    ///
    /// Panics when the map mutex is poisoned.
    pub fn request_number_for(&self, tape_id: &str) -> i64 {
        let mut map = self.req_numbers.lock().expect("request map poisoned");
        *map.entry(tape_id.to_string())
            .or_insert_with(|| self.next_req_num.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Whether graceful shutdown has begun.
    #[must_use]
    pub fn terminating(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    /// Whether forced shutdown has begun.
    #[must_use]
    pub fn forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    /// Starts graceful shutdown: in-flight requests finish, no new work
    /// is scheduled.
    pub fn request_shutdown(&self) {
        self.terminate.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Starts forced shutdown: the current tape copy aborts and no
    /// further jobs are started. Implies graceful shutdown.
    pub fn force_shutdown(&self) {
        self.forced.store(true, Ordering::SeqCst);
        self.request_shutdown();
    }
}

/// Dispatch loop binding requests to tape resources.
pub struct RequestScheduler {
    store: Arc<QueueStore>,
    shared: Arc<SchedulerShared>,
    connector: Arc<dyn Connector>,
    inventory: Arc<dyn Inventory>,
    read_buffer_size: usize,
}

impl RequestScheduler {
    /// Creates the dispatch loop.
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
            read_buffer_size,
        }
    }

    /// Runs until graceful shutdown has begun and the last in-flight
    /// execution finished.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when a request scan or state transition
    /// fails; the store is the scheduler's source of truth, so it cannot
    /// continue without it.
    pub async fn run(self) -> Result<(), StoreError> {
        let mut executions: JoinSet<()> = JoinSet::new();

        loop {
            let wakeup = self.shared.notified();

            if !self.shared.terminating() {
                self.dispatch_ready(&mut executions).await?;
            }

            if self.shared.terminating() && executions.is_empty() {
                break;
            }

            tokio::select! {
                () = wakeup => {}
                Some(result) = executions.join_next(), if !executions.is_empty() => {
                    if let Err(e) = result {
                        error!(error = %e, "recall execution task panicked");
                    }
                }
            }
        }

        while let Some(result) = executions.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "recall execution task panicked");
            }
        }

        debug!("request scheduler drained");
        Ok(())
    }

    /// Scans for `REQ_NEW` requests and dispatches those whose tape and
    /// drive resources are available.
    ///
    /// Runs under the scheduler mutex so a request cannot change state
    /// between being selected and being marked `REQ_INPROGRESS`.
    async fn dispatch_ready(&self, executions: &mut JoinSet<()>) -> Result<(), StoreError> {
        let _guard = self.shared.lock().await;

        let candidates: Vec<(i64, String)> = {
            let conn = self.store.conn()?;
            let mut stmt = conn.prepare(SELECT_NEW_REQUESTS)?;
            let rows = stmt.query_map(
                params![
                    RequestState::New.as_db(),
                    Operation::TransparentRecall.as_db()
                ],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        for (req_num, tape_id) in candidates {
            if !self.inventory.try_reserve(&tape_id) {
                debug!(req_num, %tape_id, "tape or drive busy, request stays queued");
                continue;
            }

            let transition = {
                let conn = self.store.conn()?;
                conn.execute(
                    SET_REQUEST_STATE,
                    params![RequestState::InProgress.as_db(), req_num, tape_id],
                )
            };
            if let Err(e) = transition {
                self.inventory.release(&tape_id);
                return Err(e.into());
            }

            info!(req_num, %tape_id, "recall request scheduled");

            let executor = RecallExecutor::new(
                Arc::clone(&self.store),
                Arc::clone(&self.shared),
                Arc::clone(&self.connector),
                Arc::clone(&self.inventory),
                self.read_buffer_size,
            );
            executions.spawn(async move {
                if let Err(e) = executor.exec_request(req_num, &tape_id).await {
                    error!(req_num, %tape_id, error = %e, "recall request failed fatally");
                }
            });
        }

        Ok(())
    }
}
