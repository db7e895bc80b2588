//! Endpoint settings.
//!
//! All knobs are runtime values; there is no config file and no persisted
//! state. Timeouts of `0` disable the corresponding mechanism.

use crate::tls::{TlsClientSettings, TlsServerSettings};
use fw_protocol::PRESHARED_KEY_LEN;

/// Payload sizes at or below this default are buffered and delivered as
/// whole messages; larger payloads arrive as live bounded streams.
pub const DEFAULT_MAX_PROXIED_STREAM_SIZE: u64 = 64 * 1024 * 1024;

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 4_096;
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_RETRIES: u32 = 5;

// ---------------------------------------------------------------------------
// Keepalive
// ---------------------------------------------------------------------------

/// Socket-layer TCP keepalive knobs, applied per accepted/connected socket
/// (never on the listener).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveSettings {
    pub enable: bool,
    /// Idle seconds before the first probe.
    pub time_secs: u32,
    /// Seconds between probes.
    pub interval_secs: u32,
    /// Unanswered probes before the connection is declared dead. Inert on
    /// platforms without a retry-count API.
    pub retry_count: u32,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        KeepaliveSettings {
            enable: true,
            time_secs: 5,
            interval_secs: 5,
            retry_count: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ServerSettings {
    /// Host to bind: an address literal or a wildcard (`0.0.0.0`, `::`).
    pub host: String,
    pub port: u16,
    /// When set (exactly 16 bytes), unauthenticated clients are evicted
    /// after a bounded grace period.
    pub preshared_key: Option<String>,
    /// Inbound inactivity bound in milliseconds; 0 disables eviction.
    pub idle_client_timeout_ms: u64,
    /// Delivery-mode boundary: payloads ≤ this arrive buffered, larger
    /// payloads arrive as bounded streams.
    pub max_proxied_stream_size: u64,
    /// Accepted sockets beyond this cap are closed immediately; 0 removes
    /// the cap.
    pub max_connections: usize,
    pub keepalive: KeepaliveSettings,
    /// Disable Nagle on accepted sockets.
    pub no_delay: bool,
    /// Per-frame verbose logging.
    pub debug_messages: bool,
    pub tls: Option<TlsServerSettings>,
}

impl ServerSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ServerSettings {
            host: host.into(),
            port,
            preshared_key: None,
            idle_client_timeout_ms: 0,
            max_proxied_stream_size: DEFAULT_MAX_PROXIED_STREAM_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            keepalive: KeepaliveSettings::default(),
            no_delay: false,
            debug_messages: false,
            tls: None,
        }
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        validate_preshared_key(self.preshared_key.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ClientSettings {
    pub host: String,
    pub port: u16,
    /// Sent in response to `AuthRequired`; must be exactly 16 bytes when
    /// set. When absent, the authentication-requested callback supplies
    /// the key on demand.
    pub preshared_key: Option<String>,
    /// Inbound inactivity bound in milliseconds; 0 disables.
    pub idle_server_timeout_ms: u64,
    pub max_proxied_stream_size: u64,
    /// Budget for TCP dial + TLS negotiation + (when a key is expected)
    /// the auth exchange.
    pub connect_timeout_ms: u64,
    pub auto_reconnect: bool,
    pub reconnect_max_retries: u32,
    pub reconnect_interval_ms: u64,
    pub keepalive: KeepaliveSettings,
    pub no_delay: bool,
    pub debug_messages: bool,
    pub tls: Option<TlsClientSettings>,
}

impl ClientSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ClientSettings {
            host: host.into(),
            port,
            preshared_key: None,
            idle_server_timeout_ms: 0,
            max_proxied_stream_size: DEFAULT_MAX_PROXIED_STREAM_SIZE,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            auto_reconnect: false,
            reconnect_max_retries: DEFAULT_RECONNECT_MAX_RETRIES,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            keepalive: KeepaliveSettings::default(),
            no_delay: false,
            debug_messages: false,
            tls: None,
        }
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        validate_preshared_key(self.preshared_key.as_deref())?;
        if let Some(tls) = &self.tls {
            if tls.mutually_authenticate && tls.client_certificate.is_none() {
                // Fail fast here rather than at first TLS verification.
                return Err(crate::Error::ClientCertificateRequired);
            }
        }
        Ok(())
    }
}

fn validate_preshared_key(key: Option<&str>) -> Result<(), crate::Error> {
    match key {
        Some(k) if k.len() != PRESHARED_KEY_LEN => Err(crate::Error::InvalidSettings(format!(
            "preshared key must be exactly {PRESHARED_KEY_LEN} bytes, got {}",
            k.len()
        ))),
        _ => Ok(()),
    }
}
