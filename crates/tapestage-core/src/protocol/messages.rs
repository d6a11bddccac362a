//! Protobuf messages carried inside recall frames.
//!
//! The messages are written by hand with `prost` derives rather than
//! generated from `.proto` files; the schema is small and stable. Tag
//! numbers are wire format, do not renumber them.
//!
//! A request carries the four uid components, the requested target state,
//! and optionally the filename the application touched. The response
//! echoes the uid so clients can correlate without connection-local
//! bookkeeping.

use bytes::Bytes;
use prost::Message;

use super::error::{ProtocolError, ProtocolResult};
use crate::types::{FileUid, RecallEvent};

/// Recall request sent by the connector client when an application
/// touches a migrated or premigrated file.
#[derive(Clone, PartialEq, Message)]
pub struct RecallRequest {
    /// High half of the filesystem id.
    #[prost(uint32, tag = "1")]
    pub fsid_hi: u32,

    /// Low half of the filesystem id.
    #[prost(uint32, tag = "2")]
    pub fsid_lo: u32,

    /// Inode generation number.
    #[prost(uint32, tag = "3")]
    pub igen: u32,

    /// Inode number.
    #[prost(uint64, tag = "4")]
    pub inum: u64,

    /// Recall to resident (true) or premigrated (false).
    #[prost(bool, tag = "5")]
    pub to_resident: bool,

    /// Path of the touched file, when known to the client.
    #[prost(string, optional, tag = "6")]
    pub filename: Option<String>,
}

/// Recall response delivered once per accepted request.
#[derive(Clone, PartialEq, Message)]
pub struct RecallResponse {
    /// High half of the filesystem id.
    #[prost(uint32, tag = "1")]
    pub fsid_hi: u32,

    /// Low half of the filesystem id.
    #[prost(uint32, tag = "2")]
    pub fsid_lo: u32,

    /// Inode generation number.
    #[prost(uint32, tag = "3")]
    pub igen: u32,

    /// Inode number.
    #[prost(uint64, tag = "4")]
    pub inum: u64,

    /// Whether the file reached its requested state.
    #[prost(bool, tag = "5")]
    pub success: bool,
}

impl RecallRequest {
    /// Uid of the file this request names.
    #[must_use]
    pub const fn uid(&self) -> FileUid {
        FileUid::new(self.fsid_hi, self.fsid_lo, self.igen, self.inum)
    }

    /// Decodes a request from a frame payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Decode`] when the payload is not a valid
    /// request message.
    pub fn decode_frame(payload: &Bytes) -> ProtocolResult<Self> {
        Self::decode(payload.as_ref()).map_err(ProtocolError::from)
    }
}

impl RecallResponse {
    /// Builds the response for `event` with the given outcome.
    #[must_use]
    pub fn for_event(event: &RecallEvent, success: bool) -> Self {
        Self {
            fsid_hi: event.uid.fsid_hi,
            fsid_lo: event.uid.fsid_lo,
            igen: event.uid.igen,
            inum: event.uid.inum,
            success,
        }
    }

    /// Encodes the response into a frame payload.
    #[must_use]
    pub fn encode_frame(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }
}
