//! Event payloads and the callback registry.
//!
//! Handlers are stored boxed async closures. Connected and auth
//! notifications are awaited inline on the session task so their order is
//! deterministic; disconnect and exception notifications run on their own
//! tasks. Message delivery goes through a per-connection FIFO queue;
//! stream delivery holds the receive task until the handler returns.

use crate::frame_stream::FrameStream;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use fw_protocol::Metadata;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Event payloads
// ---------------------------------------------------------------------------

/// The remote end of one session. The guid is minted by the server at
/// accept for inbound sessions and locally on the client side; it is stable
/// for the session's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub guid: Uuid,
    pub addr: SocketAddr,
}

/// Why a session ended. Exactly one disconnect event fires per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Orderly close at a frame boundary.
    Normal,
    /// Removed from the server registry by application request.
    Removed,
    /// Forcibly disconnected by the server operator.
    Kicked,
    /// Idle timeout elapsed.
    Timeout,
    /// Preshared-key exchange failed or never completed.
    AuthFailure,
    /// Endpoint is shutting down.
    Shutdown,
    /// Transport or protocol fault.
    UnknownError,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DisconnectReason::Normal => "Normal",
            DisconnectReason::Removed => "Removed",
            DisconnectReason::Kicked => "Kicked",
            DisconnectReason::Timeout => "Timeout",
            DisconnectReason::AuthFailure => "AuthFailure",
            DisconnectReason::Shutdown => "Shutdown",
            DisconnectReason::UnknownError => "UnknownError",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub peer: Peer,
}

#[derive(Debug, Clone)]
pub struct DisconnectionEvent {
    pub peer: Peer,
    pub reason: DisconnectReason,
}

/// A whole buffered message. `data` is an owned copy; the connection's read
/// buffer is reused immediately after delivery is queued.
#[derive(Debug, Clone)]
pub struct MessageReceived {
    pub peer: Peer,
    pub metadata: Option<Metadata>,
    pub data: Vec<u8>,
}

/// A payload too large to buffer, delivered as a live bounded stream.
/// The receive loop is held until the handler returns; an undrained
/// remainder is discarded by the library to restore frame sync.
#[derive(Debug)]
pub struct StreamReceived {
    pub peer: Peer,
    pub metadata: Option<Metadata>,
    pub content_length: u64,
    pub stream: FrameStream,
}

/// An inbound synchronous request awaiting a response.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub peer: Peer,
    pub conv_guid: Uuid,
    pub expiration: Option<DateTime<Utc>>,
    pub metadata: Option<Metadata>,
    pub data: Vec<u8>,
}

/// The application's answer to a [`SyncRequest`], and what a
/// `send_and_wait` caller gets back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncResponse {
    pub metadata: Option<Metadata>,
    pub data: Vec<u8>,
}

impl SyncResponse {
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        SyncResponse {
            metadata: None,
            data: data.into(),
        }
    }
}

/// A user handler fault or a non-fatal internal error worth surfacing.
#[derive(Debug, Clone)]
pub struct ExceptionEvent {
    pub peer: Option<Peer>,
    pub detail: String,
}

// ---------------------------------------------------------------------------
// Handler types
// ---------------------------------------------------------------------------

pub type ConnectionHandler = Arc<dyn Fn(ConnectionEvent) -> BoxFuture<'static, ()> + Send + Sync>;
pub type DisconnectionHandler =
    Arc<dyn Fn(DisconnectionEvent) -> BoxFuture<'static, ()> + Send + Sync>;
pub type MessageHandler = Arc<dyn Fn(MessageReceived) -> BoxFuture<'static, ()> + Send + Sync>;
/// The handler owns the stream; the receive task pumps payload bytes to it
/// and does not read the next header until the handler returns.
pub type StreamHandler =
    Arc<dyn Fn(StreamReceived) -> BoxFuture<'static, std::io::Result<()>> + Send + Sync>;
pub type SyncRequestHandler =
    Arc<dyn Fn(SyncRequest) -> BoxFuture<'static, SyncResponse> + Send + Sync>;
/// Client-side: produce the preshared key when the server demands auth and
/// no key is configured.
pub type AuthKeyHandler = Arc<dyn Fn() -> BoxFuture<'static, String> + Send + Sync>;
pub type AuthNotifyHandler = Arc<dyn Fn(Peer) -> BoxFuture<'static, ()> + Send + Sync>;
pub type ExceptionHandler = Arc<dyn Fn(ExceptionEvent) -> BoxFuture<'static, ()> + Send + Sync>;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// All handlers an endpoint may register. Cloning shares the underlying
/// closures.
#[derive(Clone, Default)]
pub(crate) struct Callbacks {
    pub connected: Option<ConnectionHandler>,
    pub disconnected: Option<DisconnectionHandler>,
    pub message_received: Option<MessageHandler>,
    pub stream_received: Option<StreamHandler>,
    pub sync_request: Option<SyncRequestHandler>,
    pub auth_requested: Option<AuthKeyHandler>,
    pub auth_succeeded: Option<AuthNotifyHandler>,
    pub auth_failed: Option<AuthNotifyHandler>,
    pub exception: Option<ExceptionHandler>,
}

impl Callbacks {
    /// Awaited inline so a connected event is always observed before any
    /// auth or delivery event for the same session.
    pub async fn fire_connected(&self, peer: Peer) {
        if let Some(cb) = &self.connected {
            cb(ConnectionEvent { peer }).await;
        }
    }

    /// Spawned: fired from teardown paths where a handler calling back
    /// into the endpoint must not deadlock. Sync waiters are always
    /// resolved before this is invoked.
    pub fn fire_disconnected(&self, peer: Peer, reason: DisconnectReason) {
        if let Some(cb) = &self.disconnected {
            tokio::spawn(cb(DisconnectionEvent { peer, reason }));
        }
    }

    /// Awaited inline on the receive task: auth outcomes are strictly
    /// ordered before the disconnect event that may follow them.
    pub async fn fire_auth_succeeded(&self, peer: Peer) {
        if let Some(cb) = &self.auth_succeeded {
            cb(peer).await;
        }
    }

    pub async fn fire_auth_failed(&self, peer: Peer) {
        if let Some(cb) = &self.auth_failed {
            cb(peer).await;
        }
    }

    pub fn fire_exception(&self, peer: Option<Peer>, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::warn!(detail = %detail, "handler exception");
        if let Some(cb) = &self.exception {
            tokio::spawn(cb(ExceptionEvent { peer, detail }));
        }
    }
}
