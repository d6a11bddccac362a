//! # tapestage-core
//!
//! Shared foundation for the tapestage hierarchical storage manager:
//! the domain types the queue tables are built from, the length-prefixed
//! protobuf protocol spoken on the recall socket, and the daemon
//! configuration schema.
//!
//! The daemon crate (`tapestage-daemon`) layers the queue store, event
//! receiver, scheduler, and recall executor on top of these types.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod protocol;
pub mod types;

pub use config::DaemonConfig;
pub use types::{ConnHandle, FileState, FileUid, Operation, RecallEvent, RequestState};
