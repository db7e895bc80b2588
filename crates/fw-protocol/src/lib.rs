// fw-protocol: wire envelope types and framing codec.
//
// Every message on the wire is one envelope:
//
// ```text
// <decimal-ascii-len> <SP> <header-json-bytes> <payload-bytes>
// ```
//
// The decimal prefix is the byte length of the JSON header (base-10 ASCII,
// no leading zeros, terminated by a single 0x20). The header is UTF-8 JSON
// with case-sensitive PascalCase keys; readers ignore unknown keys. The
// payload is exactly `Len` bytes and may be empty.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod codec;

pub use codec::{read_header, write_frame, write_frame_from_reader};

/// Hard cap on the JSON header size. Prefixes above this are rejected
/// before any header bytes are read.
pub const MAX_HEADER_BYTES: u64 = 16 * 1024 * 1024;

/// Required byte length of a preshared key when one is configured.
pub const PRESHARED_KEY_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Frame status, transmitted as the enumerator name so numeric
/// reassignments cannot break peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Normal,
    Success,
    Failure,
    AuthRequired,
    AuthRequested,
    AuthSuccess,
    AuthFailure,
    Removed,
    Shutdown,
    Timeout,
    Heartbeat,
}

impl Status {
    pub fn as_name(self) -> &'static str {
        match self {
            Status::Normal => "Normal",
            Status::Success => "Success",
            Status::Failure => "Failure",
            Status::AuthRequired => "AuthRequired",
            Status::AuthRequested => "AuthRequested",
            Status::AuthSuccess => "AuthSuccess",
            Status::AuthFailure => "AuthFailure",
            Status::Removed => "Removed",
            Status::Shutdown => "Shutdown",
            Status::Timeout => "Timeout",
            Status::Heartbeat => "Heartbeat",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "Normal" => Status::Normal,
            "Success" => Status::Success,
            "Failure" => Status::Failure,
            "AuthRequired" => Status::AuthRequired,
            "AuthRequested" => Status::AuthRequested,
            "AuthSuccess" => Status::AuthSuccess,
            "AuthFailure" => Status::AuthFailure,
            "Removed" => Status::Removed,
            "Shutdown" => Status::Shutdown,
            "Timeout" => Status::Timeout,
            "Heartbeat" => Status::Heartbeat,
            _ => return None,
        })
    }

    /// True for the four statuses that belong to the preshared-key exchange.
    pub fn is_auth(self) -> bool {
        matches!(
            self,
            Status::AuthRequired
                | Status::AuthRequested
                | Status::AuthSuccess
                | Status::AuthFailure
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_name())
    }
}

// ---------------------------------------------------------------------------
// MessageHeader
// ---------------------------------------------------------------------------

/// Arbitrary application metadata carried alongside a payload.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// The parsed JSON header of one envelope.
///
/// `len` describes the payload that follows the header on the wire.
/// `conv_guid` is unique per message; a synchronous response reuses the
/// request's guid. `sync_req` and `sync_resp` are mutually exclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageHeader {
    pub len: u64,
    pub conv_guid: Uuid,
    pub expiration: Option<DateTime<Utc>>,
    pub sender_time: Option<DateTime<Utc>>,
    pub status: Status,
    pub sync_req: bool,
    pub sync_resp: bool,
    pub preshared_key: Option<String>,
    pub metadata: Option<Metadata>,
}

impl MessageHeader {
    /// A `Normal` data frame with a fresh conversation guid and the current
    /// wall-clock as `SenderTime`.
    pub fn data(len: u64) -> Self {
        Self::with_status(Status::Normal, len)
    }

    /// A zero-payload control frame (`AuthRequired`, `Removed`, ...).
    pub fn control(status: Status) -> Self {
        Self::with_status(status, 0)
    }

    pub fn with_status(status: Status, len: u64) -> Self {
        MessageHeader {
            len,
            conv_guid: Uuid::new_v4(),
            expiration: None,
            sender_time: Some(Utc::now()),
            status,
            sync_req: false,
            sync_resp: false,
            preshared_key: None,
            metadata: None,
        }
    }

    /// Serialize to header JSON bytes (no prefix, no payload).
    pub fn to_json(&self) -> Vec<u8> {
        let wire = WireHeader {
            len: self.len,
            conv_guid: self.conv_guid,
            expiration: self.expiration,
            sender_time: self.sender_time,
            status: self.status,
            sync_req: self.sync_req,
            sync_resp: self.sync_resp,
            preshared_key: self.preshared_key.clone(),
            metadata: self.metadata.clone(),
        };
        // A struct of scalars and maps cannot fail to serialize.
        serde_json::to_vec(&wire).expect("header serialization")
    }

    /// Full envelope prefix: `<len> <json>` ready to be followed by the
    /// payload bytes.
    pub fn encode(&self) -> Vec<u8> {
        let json = self.to_json();
        let mut out = Vec::with_capacity(json.len() + 10);
        out.extend_from_slice(json.len().to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(&json);
        out
    }

    /// Parse and validate header JSON bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let raw: RawHeader = serde_json::from_slice(bytes)?;
        let len = raw.len.ok_or(FrameError::MissingField("Len"))?;
        let conv = raw.conv_guid.ok_or(FrameError::MissingField("ConvGuid"))?;
        let conv_guid = Uuid::parse_str(&conv).map_err(|_| FrameError::InvalidGuid(conv))?;
        let status_name = raw.status.ok_or(FrameError::MissingField("Status"))?;
        let status = Status::from_name(&status_name)
            .ok_or_else(|| FrameError::InvalidStatus(status_name))?;
        if raw.sync_req && raw.sync_resp {
            return Err(FrameError::ConflictingSyncFlags);
        }
        Ok(MessageHeader {
            len,
            conv_guid,
            expiration: raw.expiration,
            sender_time: raw.sender_time,
            status,
            sync_req: raw.sync_req,
            sync_resp: raw.sync_resp,
            preshared_key: raw.preshared_key,
            metadata: raw.metadata,
        })
    }

    /// True when `expiration` is set and lies in the past.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|e| e < now)
    }
}

/// Serialized shape of the header. Options and false booleans are omitted
/// from the JSON entirely.
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireHeader {
    len: u64,
    conv_guid: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    expiration: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sender_time: Option<DateTime<Utc>>,
    status: Status,
    #[serde(skip_serializing_if = "is_false")]
    sync_req: bool,
    #[serde(skip_serializing_if = "is_false")]
    sync_resp: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    preshared_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<Metadata>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(b: &bool) -> bool {
    !*b
}

/// Permissive deserialization shape; required fields are enforced in
/// [`MessageHeader::parse`] so their absence maps to a distinct error kind
/// rather than a generic JSON error. Unknown keys are ignored.
#[derive(Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct RawHeader {
    len: Option<u64>,
    conv_guid: Option<String>,
    expiration: Option<DateTime<Utc>>,
    sender_time: Option<DateTime<Utc>>,
    status: Option<String>,
    sync_req: bool,
    sync_resp: bool,
    preshared_key: Option<String>,
    metadata: Option<Metadata>,
}

// ---------------------------------------------------------------------------
// FrameError
// ---------------------------------------------------------------------------

/// Everything that can go wrong while encoding or decoding one envelope.
///
/// All variants except `ConnectionClosed` leave the byte stream in an
/// unknown position and are fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed length prefix")]
    MalformedPrefix,
    #[error("header length {0} exceeds the {MAX_HEADER_BYTES} byte cap")]
    HeaderTooLarge(u64),
    #[error("invalid header JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("missing required header field `{0}`")]
    MissingField(&'static str),
    #[error("unrecognized status `{0}`")]
    InvalidStatus(String),
    #[error("invalid conversation guid `{0}`")]
    InvalidGuid(String),
    #[error("SyncReq and SyncResp are mutually exclusive")]
    ConflictingSyncFlags,
    #[error("payload source ended after {got} of {expected} bytes")]
    ContentLengthMismatch { expected: u64, got: u64 },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection closed mid-frame")]
    UnexpectedEof,
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// True when the peer closed the connection cleanly at a frame boundary.
    pub fn is_orderly_close(&self) -> bool {
        matches!(self, FrameError::ConnectionClosed)
    }
}
