//! Provider communication stack: connection pool, request/reply
//! communicator, and replayable outbound streams.

pub mod communicator;
pub mod pool;
pub mod stream;

pub use communicator::Communicator;
pub use pool::{ErrorPolicy, HandshakeBuilder, HandshakeResponder, HandshakeVerdict, PoolConfig};
pub use stream::{OutboundStream, RawSink, StreamManager};

use remora_proto::HandshakeStatus;

/// Protocol major version this client speaks. A provider advertising a
/// different major version is rejected at handshake time.
pub const PROTOCOL_MAJOR: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("handshake rejected: {0:?}")]
    HandshakeRejected(HandshakeStatus),
    #[error("provider speaks protocol {major}.{minor}, client speaks {PROTOCOL_MAJOR}.x")]
    VersionMismatch { major: u32, minor: u32 },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timed out waiting for reply")]
    Timeout,
    #[error("communicator shut down")]
    Closed,
}

impl CommError {
    /// True for failures of the authentication/handshake path, which map to
    /// exit code 1 rather than 2.
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            CommError::Connect(_) | CommError::HandshakeRejected(_)
        )
    }
}
