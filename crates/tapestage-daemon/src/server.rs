//! Server assembly.
//!
//! [`RecallServer`] owns the shared scheduler state and wires the event
//! receiver, the dispatch loop, and shutdown cleanup together.
//! [`ServerHandle`] is the outside view: signal handlers and tests use
//! it to drive graceful or forced shutdown.

use std::sync::Arc;

use tracing::error;

use tapestage_core::DaemonConfig;

use crate::connector::Connector;
use crate::inventory::Inventory;
use crate::receiver::{EventReceiver, cleanup_events};
use crate::scheduler::{RequestScheduler, SchedulerShared};
use crate::store::{QueueStore, StoreError};

/// The transparent recall server.
pub struct RecallServer {
    config: DaemonConfig,
    store: Arc<QueueStore>,
    shared: Arc<SchedulerShared>,
    connector: Arc<dyn Connector>,
    inventory: Arc<dyn Inventory>,
}

impl RecallServer {
    /// Assembles a server over its collaborators.
    #[must_use]
    pub fn new(
        config: DaemonConfig,
        store: Arc<QueueStore>,
        connector: Arc<dyn Connector>,
        inventory: Arc<dyn Inventory>,
    ) -> Self {
        Self {
            config,
            store,
            shared: Arc::new(SchedulerShared::new()),
            connector,
            inventory,
        }
    }

    /// Handle for driving shutdown from outside the server task.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
            connector: Arc::clone(&self.connector),
        }
    }

    /// Runs receiver and scheduler to completion, then settles every
    /// unanswered event.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when a queue operation fails outside a
    /// recoverable per-event path.
    pub async fn run(self) -> Result<(), StoreError> {
        let scheduler = RequestScheduler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.shared),
            Arc::clone(&self.connector),
            Arc::clone(&self.inventory),
            self.config.read_buffer_size,
        );
        let scheduler_task = tokio::spawn(scheduler.run());

        let receiver = EventReceiver::new(
            Arc::clone(&self.store),
            Arc::clone(&self.shared),
            Arc::clone(&self.connector),
            Arc::clone(&self.inventory),
            self.config.clone(),
        );
        receiver.run().await?;

        // The receiver may have stopped on its own (connector gone);
        // make sure the scheduler winds down either way.
        self.shared.request_shutdown();

        match scheduler_task.await {
            Ok(result) => result?,
            Err(e) => error!(error = %e, "scheduler task panicked"),
        }

        // Executors are drained; every job row left is an unanswered
        // event.
        cleanup_events(&self.store, self.connector.as_ref()).await?;
        Ok(())
    }
}

/// Shutdown interface to a running [`RecallServer`].
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<SchedulerShared>,
    connector: Arc<dyn Connector>,
}

impl ServerHandle {
    /// Sets the graceful-shutdown flag and wakes the scheduler.
    ///
    /// In-flight requests finish; new events are answered with failure.
    pub fn request_shutdown(&self) {
        self.shared.request_shutdown();
    }

    /// Sets the forced-shutdown flag: the current tape copy aborts and
    /// no further jobs start.
    pub fn request_forced_shutdown(&self) {
        self.shared.force_shutdown();
    }

    /// Full graceful shutdown: flag, then stop the connector so the
    /// event loop observes it.
    pub async fn shutdown(&self) {
        self.shared.request_shutdown();
        self.connector.end_recalls().await;
    }

    /// Full forced shutdown.
    pub async fn shutdown_forced(&self) {
        self.shared.force_shutdown();
        self.connector.end_recalls().await;
    }

    /// Wakes the scheduler after an external resource-state change,
    /// e.g. a drive freed by another subsystem or a finished mount.
    pub fn notify_resources_changed(&self) {
        self.shared.signal();
    }
}
