//! Wire protocol error types.

use thiserror::Error;

/// Largest frame the recall protocol accepts.
///
/// A recall request is a handful of integers plus an optional filename of
/// at most 4096 bytes, so 64 KiB leaves generous headroom while keeping
/// a hostile length prefix from forcing a large allocation.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Errors produced by the framing codec and message parsing.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A length prefix exceeded [`MAX_FRAME_SIZE`].
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Size announced by the length prefix.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The payload did not decode as the expected protobuf message.
    #[error("message decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Transport-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
