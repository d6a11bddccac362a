//! Connector interface.
//!
//! The connector is the component that watches managed filesystems and
//! turns application accesses to migrated files into recall events. The
//! recall core owns exactly one connector, pulls events from it, and
//! promises one response per accepted event.
//!
//! [`SocketConnector`] is the production implementation: events arrive
//! as length-prefixed protobuf frames on a Unix socket, file objects are
//! [`PosixFile`]s resolving migration attributes from extended
//! attributes. Tests substitute their own implementation.

mod posix;
mod socket;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use tapestage_core::types::RecallEvent;

use crate::fs::{FsError, FsFile};

pub use posix::PosixFile;
pub use socket::SocketConnector;

/// Errors from connector operations.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The connector transport failed.
    #[error("connector transport failure: {0}")]
    Transport(String),

    /// The connector has stopped delivering events.
    #[error("connector closed")]
    Closed,

    /// A file object operation failed.
    #[error(transparent)]
    Fs(#[from] FsError),
}

/// The filesystem connector as seen by the recall core.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Prepares the connector for delivering recall events.
    async fn init_recalls(&self) -> Result<(), ConnectorError>;

    /// Registers a filesystem as managed.
    async fn manage_filesystem(&self, path: &Path) -> Result<(), ConnectorError>;

    /// Waits for the next recall event.
    ///
    /// An event whose handle is `None` is the termination sentinel: the
    /// caller re-checks its termination flag and otherwise ignores it.
    async fn next_event(&self) -> Result<RecallEvent, ConnectorError>;

    /// Delivers the response for `event`.
    ///
    /// Must be called exactly once per accepted event over the event's
    /// lifetime. Delivery failures are the connector's to log; the core
    /// cannot do anything useful with them.
    async fn respond(&self, event: &RecallEvent, success: bool);

    /// Stops event delivery and wakes [`Connector::next_event`] with the
    /// termination sentinel.
    async fn end_recalls(&self);

    /// Opens the file object named by `event`.
    fn open_file(&self, event: &RecallEvent) -> Result<Box<dyn FsFile>, ConnectorError>;
}
