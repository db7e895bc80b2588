//! TCP server endpoint: listener, client registry, idle sweeper.
//!
//! The accept loop never blocks on session setup; each accepted socket gets
//! its own setup-and-run task in a `JoinSet`. Sessions remove themselves
//! from the registry on teardown, so `stop` only has to signal everyone and
//! wait for the set to drain.

use crate::error::Error;
use crate::events::{Callbacks, DisconnectReason, MessageReceived, Peer, StreamReceived, SyncRequest, SyncResponse};
use crate::router::ResponseRouter;
use crate::session::{
    self, ReceiveContext, ReceiveSettings, Role, Session, run_receive_loop,
};
use crate::settings::ServerSettings;
use crate::sockets::apply_socket_options;
use crate::stats::{Statistics, StatisticsSnapshot};
use crate::tls::{Transport, build_acceptor};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use fw_protocol::{MessageHeader, Metadata, Status};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use uuid::Uuid;

const IDLE_SWEEP_PERIOD: Duration = Duration::from_secs(1);
const TLS_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// One entry in [`Server::list_clients`].
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub guid: Uuid,
    pub ip_port: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryInner {
    by_guid: HashMap<Uuid, Arc<Session>>,
    by_addr: HashMap<SocketAddr, Uuid>,
}

/// Accepted-client registry: primary index by guid, secondary by address.
/// All mutations go through the single lock; `draining` refuses inserts
/// that race a server shutdown.
#[derive(Default)]
pub(crate) struct Registry {
    inner: RwLock<RegistryInner>,
    draining: AtomicBool,
}

impl Registry {
    async fn insert(&self, session: Arc<Session>) -> bool {
        if self.draining.load(Ordering::Acquire) {
            return false;
        }
        let mut inner = self.inner.write().await;
        inner.by_addr.insert(session.peer_addr, session.guid);
        inner.by_guid.insert(session.guid, session);
        true
    }

    async fn remove(&self, guid: Uuid) -> Option<Arc<Session>> {
        let mut inner = self.inner.write().await;
        let session = inner.by_guid.remove(&guid)?;
        inner.by_addr.remove(&session.peer_addr);
        Some(session)
    }

    async fn get(&self, guid: Uuid) -> Option<Arc<Session>> {
        self.inner.read().await.by_guid.get(&guid).cloned()
    }

    async fn guid_for_addr(&self, addr: SocketAddr) -> Option<Uuid> {
        self.inner.read().await.by_addr.get(&addr).copied()
    }

    async fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.read().await.by_guid.values().cloned().collect()
    }

    async fn len(&self) -> usize {
        self.inner.read().await.by_guid.len()
    }

    fn set_draining(&self) {
        self.draining.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

struct ServerRuntime {
    local_addr: SocketAddr,
    registry: Arc<Registry>,
    router: Arc<ResponseRouter>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    sweeper_task: Option<JoinHandle<()>>,
    expiry_task: JoinHandle<()>,
}

pub struct Server {
    settings: ServerSettings,
    callbacks: Callbacks,
    stats: Arc<Statistics>,
    runtime: Mutex<Option<ServerRuntime>>,
}

impl Server {
    pub fn new(settings: ServerSettings) -> Self {
        Server {
            settings,
            callbacks: Callbacks::default(),
            stats: Arc::new(Statistics::new()),
            runtime: Mutex::new(None),
        }
    }

    // -- handler registration (before `start`) ------------------------------

    pub fn on_client_connected<F, Fut>(&mut self, f: F)
    where
        F: Fn(crate::events::ConnectionEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.callbacks.connected = Some(Arc::new(move |ev| f(ev).boxed()));
    }

    pub fn on_client_disconnected<F, Fut>(&mut self, f: F)
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

    /// Bind and start accepting. Rejected while already listening; allowed
    /// again after `stop`.
    pub async fn start(&self) -> Result<(), Error> {
        self.settings.validate()?;
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let acceptor = match &self.settings.tls {
            Some(tls) => Some(build_acceptor(tls)?),
            None => None,
        };
        let listener =
            TcpListener::bind((self.settings.host.as_str(), self.settings.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, tls = acceptor.is_some(), "server listening");

        let registry = Arc::new(Registry::default());
        let router = ResponseRouter::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let expiry_task = router.spawn_expiry_sweeper(shutdown_rx.clone());
        let sweeper_task = if self.settings.idle_client_timeout_ms > 0 {
            Some(spawn_idle_sweeper(
                registry.clone(),
                self.settings.idle_client_timeout_ms,
                shutdown_rx.clone(),
            ))
        } else {
            None
        };

        let accept_task = tokio::spawn(run_accept_loop(AcceptLoop {
            listener,
            acceptor,
            settings: self.settings.clone(),
            callbacks: Arc::new(self.callbacks.clone()),
            registry: registry.clone(),
            router: router.clone(),
            stats: self.stats.clone(),
            shutdown_rx,
        }));

        *runtime = Some(ServerRuntime {
            local_addr,
            registry,
            router,
            shutdown_tx,
            accept_task,
            sweeper_task,
            expiry_task,
        });
        Ok(())
    }

    /// Stop listening and tear down every session. Each session fires its
    /// disconnect event (reason `Shutdown`) with its sync waiters resolved
    /// first.
    pub async fn stop(&self) -> Result<(), Error> {
        let runtime = {
            let mut guard = self.runtime.lock().await;
            guard.take().ok_or(Error::NotRunning)?
        };
        info!(addr = %runtime.local_addr, "server stopping");

        runtime.registry.set_draining();
        for session in runtime.registry.sessions().await {
            let _ = session
                .write_frame(&MessageHeader::control(Status::Shutdown), &[])
                .await;
            session.request_close(DisconnectReason::Shutdown);
        }

        let _ = runtime.shutdown_tx.send(true);
        let _ = runtime.accept_task.await;
        if let Some(task) = runtime.sweeper_task {
            let _ = task.await;
        }
        let _ = runtime.expiry_task.await;
        // Per-connection drains already resolved everything; this catches
        // waiters registered in the closing race.
        runtime.router.drain_all();
        Ok(())
    }

    pub async fn is_listening(&self) -> bool {
        self.runtime.lock().await.is_some()
    }

    /// The bound address, useful with port 0.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().await.as_ref().map(|r| r.local_addr)
    }

    // -- sending -------------------------------------------------------------

    pub async fn send(&self, client: Uuid, data: impl AsRef<[u8]>) -> Result<(), Error> {
        self.send_with_metadata(client, data, None).await
    }

    pub async fn send_with_metadata(
        &self,
        client: Uuid,
        data: impl AsRef<[u8]>,
        metadata: Option<Metadata>,
    ) -> Result<(), Error> {
        let session = self.session_for(client).await?;
        let data = data.as_ref();
        let mut header = MessageHeader::data(data.len() as u64);
        header.metadata = metadata;
        session::send_fire_and_forget(&session, &header, data).await
    }

    /// Stream `content_length` bytes from `source` as one message payload.
    pub async fn send_stream<R>(
        &self,
        client: Uuid,
        content_length: u64,
        source: &mut R,
    ) -> Result<(), Error>
    where
        R: AsyncRead + Unpin,
    {
        self.send_stream_with_metadata(client, content_length, source, None)
            .await
    }

    pub async fn send_stream_with_metadata<R>(
        &self,
        client: Uuid,
        content_length: u64,
        source: &mut R,
        metadata: Option<Metadata>,
    ) -> Result<(), Error>
    where
        R: AsyncRead + Unpin,
    {
        let session = self.session_for(client).await?;
        let mut header = MessageHeader::data(content_length);
        header.metadata = metadata;
        session::send_stream_fire_and_forget(&session, &header, source).await
    }

    pub async fn send_and_wait(
        &self,
        client: Uuid,
        timeout_ms: u64,
        data: impl AsRef<[u8]>,
    ) -> Result<SyncResponse, Error> {
        self.send_and_wait_with_metadata(client, timeout_ms, data, None)
            .await
    }

    pub async fn send_and_wait_with_metadata(
        &self,
        client: Uuid,
        timeout_ms: u64,
        data: impl AsRef<[u8]>,
        metadata: Option<Metadata>,
    ) -> Result<SyncResponse, Error> {
        let (session, router) = {
            let guard = self.runtime.lock().await;
            let runtime = guard.as_ref().ok_or(Error::NotRunning)?;
            (runtime.registry.get(client).await, runtime.router.clone())
        };
        let session = session.ok_or(Error::NotFound(client))?;
        session::send_and_wait(&session, &router, timeout_ms, data.as_ref(), metadata).await
    }

    /// Best-effort send to every connected client; returns how many sends
    /// were attempted.
    pub async fn broadcast(&self, data: impl AsRef<[u8]>) -> Result<usize, Error> {
        let registry = self.registry().await?;
        let data = data.as_ref();
        let sessions = registry.sessions().await;
        let mut attempted = 0;
        for session in sessions {
            let header = MessageHeader::data(data.len() as u64);
            let _ = session::send_fire_and_forget(&session, &header, data).await;
            attempted += 1;
        }
        Ok(attempted)
    }

    // -- registry queries ----------------------------------------------------

    pub async fn list_clients(&self) -> Vec<ClientInfo> {
        match self.registry().await {
            Ok(registry) => registry
                .sessions()
                .await
                .into_iter()
                .map(|s| ClientInfo {
                    guid: s.guid,
                    ip_port: s.peer_addr,
                    connected_at: s.connected_at,
                    last_activity: s.last_activity(),
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn is_client_connected(&self, client: Uuid) -> bool {
        match self.registry().await {
            Ok(registry) => registry.get(client).await.is_some(),
            Err(_) => false,
        }
    }

    /// Secondary-index lookup by remote address.
    pub async fn client_by_address(&self, addr: SocketAddr) -> Option<Uuid> {
        self.registry().await.ok()?.guid_for_addr(addr).await
    }

    // -- disconnects ---------------------------------------------------------

    /// Disconnect one client. Graceful reasons notify the peer with a
    /// status frame before the close.
    pub async fn disconnect_client(
        &self,
        client: Uuid,
        reason: DisconnectReason,
    ) -> Result<(), Error> {
        let session = self.session_for(client).await?;
        let notify = match reason {
            DisconnectReason::Removed | DisconnectReason::Kicked => Some(Status::Removed),
            DisconnectReason::Shutdown => Some(Status::Shutdown),
            DisconnectReason::Timeout => Some(Status::Timeout),
            _ => None,
        };
        if let Some(status) = notify {
            let _ = session
                .write_frame(&MessageHeader::control(status), &[])
                .await;
        }
        session.request_close(reason);
        Ok(())
    }

    /// Kick every connected client.
    pub async fn disconnect_clients(&self) -> Result<(), Error> {
        let registry = self.registry().await?;
        for session in registry.sessions().await {
            let _ = session
                .write_frame(&MessageHeader::control(Status::Removed), &[])
                .await;
            session.request_close(DisconnectReason::Removed);
        }
        Ok(())
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    // -- internals -----------------------------------------------------------

    async fn registry(&self) -> Result<Arc<Registry>, Error> {
        let guard = self.runtime.lock().await;
        guard
            .as_ref()
            .map(|r| r.registry.clone())
            .ok_or(Error::NotRunning)
    }

    async fn session_for(&self, client: Uuid) -> Result<Arc<Session>, Error> {
        self.registry()
            .await?
            .get(client)
            .await
            .ok_or(Error::NotFound(client))
    }
}

// ---------------------------------------------------------------------------
// Accept loop
// ---------------------------------------------------------------------------

struct AcceptLoop {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    settings: ServerSettings,
    callbacks: Arc<Callbacks>,
    registry: Arc<Registry>,
    router: Arc<ResponseRouter>,
    stats: Arc<Statistics>,
    shutdown_rx: watch::Receiver<bool>,
}

async fn run_accept_loop(mut ctx: AcceptLoop) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            changed = ctx.shutdown_rx.changed() => {
                if changed.is_err() || *ctx.shutdown_rx.borrow() {
                    break;
                }
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            accepted = ctx.listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        if ctx.settings.max_connections > 0
                            && ctx.registry.len().await >= ctx.settings.max_connections
                        {
                            warn!(addr = %addr, "connection cap reached; rejecting");
                            continue;
                        }
                        // Setup (TLS handshake included) must never stall
                        // the accept loop.
                        sessions.spawn(setup_and_run(
                            stream,
                            addr,
                            ctx.acceptor.clone(),
                            ctx.settings.clone(),
                            ctx.callbacks.clone(),
                            ctx.registry.clone(),
                            ctx.router.clone(),
                            ctx.stats.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
    // Sessions were told to close by `stop`; wait for their teardowns so
    // every disconnect event has fired when `stop` returns.
    while sessions.join_next().await.is_some() {}
}

#[allow(clippy::too_many_arguments)]
async fn setup_and_run(
    stream: TcpStream,
    addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    settings: ServerSettings,
    callbacks: Arc<Callbacks>,
    registry: Arc<Registry>,
    router: Arc<ResponseRouter>,
    stats: Arc<Statistics>,
) {
    apply_socket_options(&stream, &settings.keepalive, settings.no_delay);

    let transport = match acceptor {
        Some(acceptor) => {
            match tokio::time::timeout(TLS_ACCEPT_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => Transport::Tls(Box::new(tokio_rustls::TlsStream::Server(tls))),
                Ok(Err(e)) => {
                    warn!(addr = %addr, error = %e, "TLS accept failed");
                    return;
                }
                Err(_) => {
                    warn!(addr = %addr, "TLS accept timed out");
                    return;
                }
            }
        }
        None => Transport::Plain(stream),
    };

    let guid = Uuid::new_v4();
    let (session, reader, shutdown_rx) = Session::new(transport, guid, addr, stats);
    if !registry.insert(session.clone()).await {
        debug!(addr = %addr, "registry draining; dropping fresh connection");
        return;
    }
    info!(client = %guid, addr = %addr, "client connected");
    let peer = session.peer();
    callbacks.fire_connected(peer).await;

    if settings.preshared_key.is_some() {
        if session
            .write_frame(&MessageHeader::control(Status::AuthRequired), &[])
            .await
            .is_err()
        {
            session.request_close(DisconnectReason::UnknownError);
        }
    }

    let ctx = ReceiveContext {
        session: session.clone(),
        callbacks: callbacks.clone(),
        router: router.clone(),
        settings: ReceiveSettings {
            idle_timeout_ms: settings.idle_client_timeout_ms,
            max_proxied_stream_size: settings.max_proxied_stream_size,
            debug_messages: settings.debug_messages,
        },
        role: Role::Server {
            expected_key: settings.preshared_key.clone(),
        },
    };
    let reason = run_receive_loop(ctx, reader, shutdown_rx).await;

    // Teardown: exactly once, waiters before the event.
    if session.mark_closed() {
        registry.remove(guid).await;
        router.drain_for_connection(guid);
        session.shutdown_transport().await;
        info!(client = %guid, reason = %reason, "client disconnected");
        callbacks.fire_disconnected(peer, reason);
    }
}

fn spawn_idle_sweeper(
    registry: Arc<Registry>,
    idle_timeout_ms: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(IDLE_SWEEP_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    for session in registry.sessions().await {
                        if session.idle_for_ms() > idle_timeout_ms {
                            info!(client = %session.guid, "evicting idle client");
                            session.request_close(DisconnectReason::Timeout);
                        }
                    }
                }
            }
        }
    })
}
