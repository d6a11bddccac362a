//! Recall socket protocol.
//!
//! Layers, bottom up: a Unix domain socket transport, 4-byte big-endian
//! length-prefixed framing ([`FrameCodec`]), and protobuf payloads
//! ([`RecallRequest`] / [`RecallResponse`]). The daemon owns the
//! listening side; connector clients send one request per touched file
//! and read responses off the same connection.

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{MAX_FRAME_SIZE, ProtocolError, ProtocolResult};
pub use framing::FrameCodec;
pub use messages::{RecallRequest, RecallResponse};
