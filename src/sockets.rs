//! Per-socket option application.
//!
//! Keepalive and Nagle knobs are set on each accepted/connected socket,
//! never on the listener. Failures here are logged and tolerated; a socket
//! without keepalives is degraded, not broken.

use crate::settings::KeepaliveSettings;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::warn;

/// Whether this build can actually arm TCP keepalives.
pub fn keepalives_supported() -> bool {
    cfg!(any(unix, windows))
}

pub(crate) fn apply_socket_options(
    stream: &TcpStream,
    keepalive: &KeepaliveSettings,
    no_delay: bool,
) {
    if no_delay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY");
        }
    }
    if keepalive.enable && keepalives_supported() {
        let sock_ref = socket2::SockRef::from(stream);
        let ka = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(u64::from(keepalive.time_secs)))
            .with_interval(Duration::from_secs(u64::from(keepalive.interval_secs)));
        #[cfg(not(windows))]
        let ka = ka.with_retries(keepalive.retry_count);
        if let Err(e) = sock_ref.set_tcp_keepalive(&ka) {
            warn!(error = %e, "failed to set TCP keepalive");
        }
    }
}
