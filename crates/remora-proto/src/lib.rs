// remora-proto: Provider wire protocol types and serialization.
//
// All WebSocket frames are JSON text. Each direction is an envelope with an
// optional correlation id, an optional stream header, and a body whose
// variant is selected by a top-level `kind` field.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Stream header stamped onto every message that belongs to a logical
/// message stream.
///
/// Sequence numbers are per-stream, strictly increasing, and restart at 0
/// after a session reset. The receiving side reconstructs the original order
/// by sequence even when physical arrival is reordered across the
/// connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeader {
    pub stream_id: u64,
    pub sequence_number: u64,
}

/// A client-to-provider message.
///
/// `message_id` correlates request/reply exchanges: replies echo it back
/// verbatim. Fire-and-forget messages omit it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_stream: Option<StreamHeader>,
    #[serde(flatten)]
    pub body: ClientBody,
}

impl ClientMessage {
    /// Wrap a body into a bare message (no correlation id, no stream header).
    pub fn from_body(body: ClientBody) -> Self {
        ClientMessage {
            message_id: None,
            message_stream: None,
            body,
        }
    }
}

/// A provider-to-client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(flatten)]
    pub body: ServerBody,
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Authentication material carried in the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme")]
#[serde(rename_all = "snake_case")]
pub enum HandshakeAuth {
    /// Token-based session: `base64(sha256(access_token))`.
    Token { token_hash: String },
    /// Certificate-based session; the identity itself travels at the TLS
    /// layer. `confirmation` is present only on the re-handshake that
    /// follows a `CertConfirmationRequired` response.
    Certificate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confirmation: Option<CertificateConfirmation>,
    },
}

/// User confirmation payload for certificate sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateConfirmation {
    pub username: String,
}

/// First message on every new connection (and re-issued after a token
/// refresh or certificate confirmation).
///
/// `session_id` is absent on the very first connect; the provider assigns
/// one in the response and subsequent connections carry it back.
/// `env_vars` is the client environment filtered to the configured prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    pub auth: HandshakeAuth,
}

/// Handshake outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeStatus {
    Ok,
    NoUserFound,
    CertConfirmationRequired,
    InvalidSession,
}

/// Protocol version advertised by the provider in the handshake response.
/// A major-version mismatch is fatal for the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

/// Provider's reply to a `HandshakeRequest`.
///
/// `session_id` is present iff `status` is `ok`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: HandshakeStatus,
    pub protocol_version: ProtocolVersion,
}

// ---------------------------------------------------------------------------
// Events (client -> provider)
// ---------------------------------------------------------------------------

/// A half-open byte range `[offset, offset + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBlock {
    pub offset: u64,
    pub size: u64,
}

/// Aggregated read activity for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadEventWire {
    pub file_uuid: String,
    /// Number of read operations folded into this event. Always >= 1.
    pub counter: u64,
    /// Total bytes read.
    pub size: u64,
    /// Disjoint, normalized byte ranges touched by the reads.
    pub blocks: Vec<FileBlock>,
}

/// Aggregated write activity for one file.
///
/// Truncates fold into write events client-side; `blocks` never extends past
/// `file_size`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteEventWire {
    pub file_uuid: String,
    pub counter: u64,
    pub size: u64,
    /// File size after the last folded operation.
    pub file_size: u64,
    pub blocks: Vec<FileBlock>,
}

/// A truncate reported as its own message kind.
///
/// Clients that aggregate (remora does) emit truncates merged into
/// `write_event`; this variant is part of the frozen surface for peers that
/// report them raw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncateEventWire {
    pub file_uuid: String,
    pub counter: u64,
    pub file_size: u64,
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Client-requested subscription, sent with a `message_id`; the provider
/// answers with `subscribe_reply` carrying the server-assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "subscription")]
#[serde(rename_all = "snake_case")]
pub enum SubscribeRequest {
    /// Time-bounded interest in attribute changes of one file.
    FileAttr {
        file_uuid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time_threshold_ms: Option<u64>,
    },
    FileLocation { file_uuid: String },
    PermissionChanged { file_uuid: String },
    ReadEvents {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        counter_threshold: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time_threshold_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size_threshold: Option<u64>,
    },
    WriteEvents {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        counter_threshold: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time_threshold_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size_threshold: Option<u64>,
    },
}

/// Server-directed event subscription pushed to the client.
///
/// Absent thresholds mean "not constrained by this dimension".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSubscriptionWire {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter_threshold: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_threshold_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_threshold: Option<u64>,
}

/// One entry of the post-handshake `configuration` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum ConfiguredSubscription {
    ReadEventSubscription(EventSubscriptionWire),
    WriteEventSubscription(EventSubscriptionWire),
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// File attribute record as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttrWire {
    pub file_uuid: String,
    pub mode: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

/// File location mapping: which storage holds the bytes and under what
/// storage-relative id, plus the helper description needed to reach it
/// directly.
///
/// `valid_for_ms` is a relative lease; the client computes the absolute
/// deadline against its own clock on receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLocationWire {
    pub file_uuid: String,
    pub storage_id: String,
    /// Storage-relative file id (commonly a path relative to the storage
    /// root).
    pub file_id: String,
    pub helper_name: String,
    #[serde(default)]
    pub helper_args: BTreeMap<String, String>,
    pub valid_for_ms: u64,
}

/// Storage access probe payload: a file the client should try to read
/// directly, and the content the provider expects it to see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageTestFileWire {
    pub storage_id: String,
    pub helper_name: String,
    #[serde(default)]
    pub helper_args: BTreeMap<String, String>,
    pub file_id: String,
    pub expected_content: String,
}

// ---------------------------------------------------------------------------
// Remote operation status
// ---------------------------------------------------------------------------

/// Outcome codes for remote operations.
///
/// | Code             | POSIX mapping |
/// |------------------|---------------|
/// | ok               | 0             |
/// | not_found        | ENOENT        |
/// | permission       | EACCES        |
/// | quota_exceeded   | EDQUOT        |
/// | invalid_argument | EINVAL        |
/// | internal         | EIO           |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    NotFound,
    Permission,
    QuotaExceeded,
    InvalidArgument,
    Internal,
}

// ---------------------------------------------------------------------------
// Client -> provider bodies
// ---------------------------------------------------------------------------

/// All client-to-provider message kinds.
///
/// Serializes using the `kind` field as a tag:
///
/// ```json
/// { "kind": "handshake_request", ... }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum ClientBody {
    HandshakeRequest(HandshakeRequest),
    ReadEvent(ReadEventWire),
    WriteEvent(WriteEventWire),
    TruncateEvent(TruncateEventWire),
    Subscribe(SubscribeRequest),
    SubscribeCancel { id: i64 },
    /// Terminates a message stream; consumes the stream's next sequence.
    EndOfStream {},
    /// Ask the peer to retransmit `[lower, upper]` of one of its streams.
    MessageRequest {
        stream_id: u64,
        lower_sequence_number: u64,
        upper_sequence_number: u64,
    },
    /// Everything up to and including `sequence_number` was processed.
    MessageAcknowledgement { stream_id: u64, sequence_number: u64 },
    GetFileLocation { path: String },
    GetStorageTestFile { storage_id: String },
    /// Probe verdict report; fire-and-forget.
    StorageTestFileVerification { storage_id: String, ok: bool },
    ProxyRead {
        storage_id: String,
        file_id: String,
        offset: u64,
        size: u64,
    },
    ProxyWrite {
        storage_id: String,
        file_id: String,
        offset: u64,
        data_base64: String,
    },
}

// ---------------------------------------------------------------------------
// Provider -> client bodies
// ---------------------------------------------------------------------------

/// All provider-to-client message kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum ServerBody {
    HandshakeResponse(HandshakeResponse),
    /// Initial subscription set, pushed right after a successful handshake.
    Configuration {
        subscriptions: Vec<ConfiguredSubscription>,
    },
    ReadEventSubscription(EventSubscriptionWire),
    WriteEventSubscription(EventSubscriptionWire),
    EventSubscriptionCancellation { id: i64 },
    SubscribeReply { id: i64 },
    Status { code: StatusCode },
    FileLocation(FileLocationWire),
    FileAttrChanged { attr: FileAttrWire },
    PermissionChanged { file_uuid: String },
    StorageTestFile(StorageTestFileWire),
    ProxyData { data_base64: String },
    ProxyWritten { written: u64 },
    MessageRequest {
        stream_id: u64,
        lower_sequence_number: u64,
        upper_sequence_number: u64,
    },
    MessageAcknowledgement { stream_id: u64, sequence_number: u64 },
}
