//! Library error taxonomy.
//!
//! Transport and protocol failures on a fire-and-forget send are surfaced
//! through the disconnect event and the logger, never through the send
//! caller; only addressing problems (`NotFound`, `NotConnected`) fail a
//! plain send synchronously. `send_and_wait` callers additionally see the
//! sync outcomes (`Timeout`, `PeerDisconnected`, `Cancelled`).

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The endpoint has no live connection to send on.
    #[error("not connected")]
    NotConnected,
    /// No client with this guid exists in the server registry.
    #[error("no client with guid {0}")]
    NotFound(Uuid),
    /// No response arrived before the request's expiration.
    #[error("synchronous request timed out")]
    Timeout,
    /// The connection tore down before the response arrived.
    #[error("peer disconnected before responding")]
    PeerDisconnected,
    /// The endpoint shut down while the request was outstanding.
    #[error("request cancelled by endpoint shutdown")]
    Cancelled,
    /// TCP dial, TLS negotiation, or the auth exchange exceeded the
    /// connect budget.
    #[error("connect timed out")]
    ConnectTimeout,
    /// The preshared-key exchange was rejected by the server.
    #[error("authentication failed")]
    AuthFailed,
    /// Mutual TLS is enabled but no client certificate is configured.
    /// Raised before any connection attempt is made.
    #[error("mutual authentication requires a client certificate")]
    ClientCertificateRequired,
    #[error("server is already listening")]
    AlreadyRunning,
    #[error("server is not listening")]
    NotRunning,
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("TLS: {0}")]
    Tls(String),
    #[error("framing: {0}")]
    Frame(#[from] fw_protocol::FrameError),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the failure kinds a `send_and_wait` caller can observe
    /// without the connection itself being at fault.
    pub fn is_sync_outcome(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::PeerDisconnected | Error::Cancelled
        )
    }
}
