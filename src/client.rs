//! TCP client endpoint: one outbound session plus optional auto-reconnect.
//!
//! `connect` performs the TCP dial and TLS negotiation under the connect
//! budget; when a preshared key is expected the auth exchange is waited on
//! under the same budget. A single supervisor task runs the session's
//! receive loop to completion, tears it down, and — unless the disconnect
//! was manual — replays the whole connect sequence up to the configured
//! retry count.

use crate::error::Error;
use crate::events::{
    Callbacks, DisconnectReason, MessageReceived, Peer, StreamReceived, SyncRequest, SyncResponse,
};
use crate::router::ResponseRouter;
use crate::session::{
    self, ReceiveContext, ReceiveSettings, Role, Session, run_receive_loop,
};
use crate::settings::ClientSettings;
use crate::sockets::apply_socket_options;
use crate::stats::{Statistics, StatisticsSnapshot};
use crate::tls::{Transport, build_connector, server_name_for};
use futures_util::FutureExt;
use fw_protocol::{MessageHeader, Metadata};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

struct ClientShared {
    session: Mutex<Option<Arc<Session>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    sweeper_shutdown: StdMutex<Option<watch::Sender<bool>>>,
    manual_disconnect: AtomicBool,
}

pub struct Client {
    settings: ClientSettings,
    callbacks: Callbacks,
    stats: Arc<Statistics>,
    router: Arc<ResponseRouter>,
    shared: Arc<ClientShared>,
}

impl Client {
    pub fn new(settings: ClientSettings) -> Self {
        Client {
            settings,
            callbacks: Callbacks::default(),
            stats: Arc::new(Statistics::new()),
            router: ResponseRouter::new(),
            shared: Arc::new(ClientShared {
                session: Mutex::new(None),
                supervisor: Mutex::new(None),
                sweeper_shutdown: StdMutex::new(None),
                manual_disconnect: AtomicBool::new(false),
            }),
        }
    }

    // -- handler registration (before `connect`) -----------------------------

    pub fn on_server_connected<F, Fut>(&mut self, f: F)
    where
        F: Fn(crate::events::ConnectionEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.callbacks.connected = Some(Arc::new(move |ev| f(ev).boxed()));
    }

    pub fn on_server_disconnected<F, Fut>(&mut self, f: F)
    where
        F: Fn(crate::events::DisconnectionEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.callbacks.disconnected = Some(Arc::new(move |ev| f(ev).boxed()));
    }

    pub fn on_message_received<F, Fut>(&mut self, f: F)
    where
        F: Fn(MessageReceived) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.callbacks.message_received = Some(Arc::new(move |ev| f(ev).boxed()));
    }

    /// The handler owns the bounded stream; the connection's receive loop
    /// does not read the next header until the handler returns.
    pub fn on_stream_received<F, Fut>(&mut self, f: F)
    where
        F: Fn(StreamReceived) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::io::Result<()>> + Send + 'static,
    {
        self.callbacks.stream_received = Some(Arc::new(move |ev| f(ev).boxed()));
    }

    pub fn on_sync_request<F, Fut>(&mut self, f: F)
    where
        F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = SyncResponse> + Send + 'static,
    {
        self.callbacks.sync_request = Some(Arc::new(move |req| f(req).boxed()));
    }

    /// Produce the preshared key when the server demands authentication and
    /// no key is configured in settings.
    pub fn on_authentication_requested<F, Fut>(&mut self, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = String> + Send + 'static,
    {
        self.callbacks.auth_requested = Some(Arc::new(move || f().boxed()));
    }

    pub fn on_authentication_succeeded<F, Fut>(&mut self, f: F)
    where
        F: Fn(Peer) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.callbacks.auth_succeeded = Some(Arc::new(move |peer| f(peer).boxed()));
    }

    pub fn on_authentication_failed<F, Fut>(&mut self, f: F)
    where
        F: Fn(Peer) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.callbacks.auth_failed = Some(Arc::new(move |peer| f(peer).boxed()));
    }

    pub fn on_exception<F, Fut>(&mut self, f: F)
    where
        F: Fn(crate::events::ExceptionEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.callbacks.exception = Some(Arc::new(move |ev| f(ev).boxed()));
    }

    // -- lifecycle -----------------------------------------------------------

    /// Connect within the configured budget. The budget covers the TCP
    /// dial, the TLS handshake, and — when a preshared key or auth callback
    /// is configured — the auth exchange.
    pub async fn connect(&self) -> Result<(), Error> {
        self.settings.validate()?;
        if self.shared.session.lock().await.is_some() {
            return Err(Error::AlreadyRunning);
        }
        // Reap a finished supervisor from a previous life.
        {
            let mut supervisor = self.shared.supervisor.lock().await;
            match supervisor.take() {
                Some(handle) if !handle.is_finished() => {
                    *supervisor = Some(handle);
                    return Err(Error::AlreadyRunning);
                }
                _ => {}
            }
        }
        self.shared.manual_disconnect.store(false, Ordering::Release);

        let started = Instant::now();
        let budget = Duration::from_millis(self.settings.connect_timeout_ms);
        let parts = SupervisorParts {
            settings: self.settings.clone(),
            callbacks: Arc::new(self.callbacks.clone()),
            router: self.router.clone(),
            stats: self.stats.clone(),
            shared: self.shared.clone(),
        };

        let (conn, established_rx) = establish(&parts).await?;
        let session = conn.session.clone();
        *self.shared.session.lock().await = Some(session.clone());

        // Router expiry sweeper, one per client lifetime.
        {
            let mut stored = self.shared.sweeper_shutdown.lock().expect("sweeper lock");
            if stored.is_none() {
                let (tx, rx) = watch::channel(false);
                let _ = self.router.spawn_expiry_sweeper(rx);
                *stored = Some(tx);
            }
        }

        // The supervisor handle is published only once the handshake gate
        // below has passed; until then the attempt owns it.
        let supervisor = tokio::spawn(run_supervisor(conn, parts));

        if expects_auth(&self.settings, &self.callbacks) {
            let remaining = budget
                .checked_sub(started.elapsed())
                .unwrap_or(Duration::from_millis(1));
            let outcome = match tokio::time::timeout(remaining, established_rx).await {
                Ok(Ok(Ok(()))) => Ok(()),
                Ok(Ok(Err(e))) => Err(e),
                Ok(Err(_)) => Err(Error::PeerDisconnected),
                Err(_) => {
                    // Suppress reconnects before signalling the close so
                    // the supervisor cannot observe the torn-down session
                    // as a reconnectable loss.
                    self.shared.manual_disconnect.store(true, Ordering::Release);
                    session.request_close(DisconnectReason::Timeout);
                    Err(Error::ConnectTimeout)
                }
            };
            if let Err(e) = outcome {
                // The handshake never completed, so this is a failed
                // connect, not an established session lost. The supervisor
                // tears the half-open session down and exits without
                // reconnecting; wait for it so the caller sees a clean,
                // immediately-retryable failure. The next `connect` resets
                // the suppression flag.
                self.shared.manual_disconnect.store(true, Ordering::Release);
                let _ = supervisor.await;
                {
                    let mut active = self.shared.session.lock().await;
                    if active.as_ref().map(|s| s.guid) == Some(session.guid) {
                        *active = None;
                    }
                }
                return Err(e);
            }
        }
        *self.shared.supervisor.lock().await = Some(supervisor);
        Ok(())
    }

    /// Disconnect and disable auto-reconnect. Pending synchronous requests
    /// resolve before this returns.
    pub async fn disconnect(&self) -> Result<(), Error> {
        self.shared.manual_disconnect.store(true, Ordering::Release);
        let session = self.shared.session.lock().await.clone();
        let supervisor = self.shared.supervisor.lock().await.take();
        if session.is_none() && supervisor.is_none() {
            return Err(Error::NotConnected);
        }
        if let Some(session) = session {
            session.request_close(DisconnectReason::Normal);
        }
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        if let Some(tx) = self
            .shared
            .sweeper_shutdown
            .lock()
            .expect("sweeper lock")
            .take()
        {
            let _ = tx.send(true);
        }
        self.router.drain_all();
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.session.lock().await.is_some()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    // -- sending -------------------------------------------------------------

    pub async fn send(&self, data: impl AsRef<[u8]>) -> Result<(), Error> {
        self.send_with_metadata(data, None).await
    }

    pub async fn send_with_metadata(
        &self,
        data: impl AsRef<[u8]>,
        metadata: Option<Metadata>,
    ) -> Result<(), Error> {
        let session = self.active_session().await?;
        let data = data.as_ref();
        let mut header = MessageHeader::data(data.len() as u64);
        header.metadata = metadata;
        session::send_fire_and_forget(&session, &header, data).await
    }

    /// Stream `content_length` bytes from `source` as one message payload.
    pub async fn send_stream<R>(&self, content_length: u64, source: &mut R) -> Result<(), Error>
    where
        R: AsyncRead + Unpin,
    {
        self.send_stream_with_metadata(content_length, source, None)
            .await
    }

    pub async fn send_stream_with_metadata<R>(
        &self,
        content_length: u64,
        source: &mut R,
        metadata: Option<Metadata>,
    ) -> Result<(), Error>
    where
        R: AsyncRead + Unpin,
    {
        let session = self.active_session().await?;
        let mut header = MessageHeader::data(content_length);
        header.metadata = metadata;
        session::send_stream_fire_and_forget(&session, &header, source).await
    }

    pub async fn send_and_wait(
        &self,
        timeout_ms: u64,
        data: impl AsRef<[u8]>,
    ) -> Result<SyncResponse, Error> {
        self.send_and_wait_with_metadata(timeout_ms, data, None).await
    }

    pub async fn send_and_wait_with_metadata(
        &self,
        timeout_ms: u64,
        data: impl AsRef<[u8]>,
        metadata: Option<Metadata>,
    ) -> Result<SyncResponse, Error> {
        let session = self.active_session().await?;
        session::send_and_wait(&session, &self.router, timeout_ms, data.as_ref(), metadata).await
    }

    async fn active_session(&self) -> Result<Arc<Session>, Error> {
        self.shared
            .session
            .lock()
            .await
            .clone()
            .ok_or(Error::NotConnected)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.manual_disconnect.store(true, Ordering::Release);
        if let Ok(mut stored) = self.shared.sweeper_shutdown.lock() {
            if let Some(tx) = stored.take() {
                let _ = tx.send(true);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connection establishment & supervision
// ---------------------------------------------------------------------------

struct SupervisorParts {
    settings: ClientSettings,
    callbacks: Arc<Callbacks>,
    router: Arc<ResponseRouter>,
    stats: Arc<Statistics>,
    shared: Arc<ClientShared>,
}

struct EstablishedConnection {
    session: Arc<Session>,
    ctx: ReceiveContext,
    reader: crate::session::SessionReader,
    shutdown_rx: watch::Receiver<bool>,
}

fn expects_auth(settings: &ClientSettings, callbacks: &Callbacks) -> bool {
    settings.preshared_key.is_some() || callbacks.auth_requested.is_some()
}

/// Dial, negotiate TLS, and stand up the session state. The TCP + TLS part
/// runs under the connect budget; the server-connected event fires here so
/// reconnects carry first-connect semantics.
async fn establish(
    parts: &SupervisorParts,
) -> Result<(EstablishedConnection, oneshot::Receiver<Result<(), Error>>), Error> {
    let settings = &parts.settings;
    let connector = match &settings.tls {
        Some(tls) => Some((build_connector(tls)?, server_name_for(tls, &settings.host)?)),
        None => None,
    };

    let budget = Duration::from_millis(settings.connect_timeout_ms);
    let dial = async {
        let stream = TcpStream::connect((settings.host.as_str(), settings.port)).await?;
        apply_socket_options(&stream, &settings.keepalive, settings.no_delay);
        let peer_addr = stream.peer_addr()?;
        let transport = match connector {
            Some((connector, name)) => {
                let tls = connector
                    .connect(name, stream)
                    .await
                    .map_err(|e| Error::Tls(e.to_string()))?;
                Transport::Tls(Box::new(tokio_rustls::TlsStream::Client(tls)))
            }
            None => Transport::Plain(stream),
        };
        Ok::<_, Error>((transport, peer_addr))
    };
    let (transport, peer_addr) = tokio::time::timeout(budget, dial)
        .await
        .map_err(|_| Error::ConnectTimeout)??;

    let guid = Uuid::new_v4();
    let (session, reader, shutdown_rx) =
        Session::new(transport, guid, peer_addr, parts.stats.clone());
    info!(server = %peer_addr, "connected");
    parts.callbacks.fire_connected(session.peer()).await;

    let (established_tx, established_rx) = oneshot::channel();
    let ctx = ReceiveContext {
        session: session.clone(),
        callbacks: parts.callbacks.clone(),
        router: parts.router.clone(),
        settings: ReceiveSettings {
            idle_timeout_ms: settings.idle_server_timeout_ms,
            max_proxied_stream_size: settings.max_proxied_stream_size,
            debug_messages: settings.debug_messages,
        },
        role: Role::Client {
            preshared_key: settings.preshared_key.clone(),
            established_tx: StdMutex::new(Some(established_tx)),
        },
    };
    Ok((
        EstablishedConnection {
            session,
            ctx,
            reader,
            shutdown_rx,
        },
        established_rx,
    ))
}

/// Run sessions to completion, tearing each down and reconnecting while
/// allowed. Exactly one disconnect event fires per session.
async fn run_supervisor(mut conn: EstablishedConnection, parts: SupervisorParts) {
    loop {
        let session = conn.session.clone();
        let peer = session.peer();
        let reason = run_receive_loop(conn.ctx, conn.reader, conn.shutdown_rx).await;

        if session.mark_closed() {
            {
                let mut active = parts.shared.session.lock().await;
                if active.as_ref().map(|s| s.guid) == Some(session.guid) {
                    *active = None;
                }
            }
            parts.router.drain_for_connection(session.guid);
            session.shutdown_transport().await;
            info!(server = %peer.addr, reason = %reason, "disconnected");
            parts.callbacks.fire_disconnected(peer, reason);
        }

        // Auto-reconnect covers the abrupt loss of an established session.
        // A session whose handshake never completed is a failed connect,
        // surfaced to the connect caller, and is not retried here.
        let established = !expects_auth(&parts.settings, &parts.callbacks)
            || session.authenticated.load(Ordering::Acquire);
        if !established
            || parts.shared.manual_disconnect.load(Ordering::Acquire)
            || !parts.settings.auto_reconnect
        {
            return;
        }
        match reconnect_with_retries(&parts).await {
            Some(next) => conn = next,
            None => return,
        }
    }
}

async fn reconnect_with_retries(parts: &SupervisorParts) -> Option<EstablishedConnection> {
    let interval = Duration::from_millis(parts.settings.reconnect_interval_ms);
    for attempt in 1..=parts.settings.reconnect_max_retries {
        tokio::time::sleep(interval).await;
        if parts.shared.manual_disconnect.load(Ordering::Acquire) {
            return None;
        }
        match establish(parts).await {
            Ok((conn, _established_rx)) => {
                info!(attempt, "reconnected");
                *parts.shared.session.lock().await = Some(conn.session.clone());
                return Some(conn);
            }
            Err(e) => {
                warn!(attempt, error = %e, "reconnect attempt failed");
            }
        }
    }
    warn!(
        retries = parts.settings.reconnect_max_retries,
        "reconnect retries exhausted"
    );
    None
}
