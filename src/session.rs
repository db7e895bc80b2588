//! Per-connection session state and the receive loop.
//!
//! Each session owns exactly one receive task. Writers may call in from any
//! task; the write half sits behind a mutex held across the whole envelope
//! so concurrent sends never interleave on the wire. Inbound frames are
//! classified in arrival order: auth frames feed the handshake, sync
//! responses feed the router, heartbeats refresh activity and vanish,
//! everything else is delivered to the application.
//!
//! Delivery of buffered messages goes through a bounded per-connection
//! queue with a dedicated dispatcher task: callbacks run in receive order
//! and a slow handler stalls only its own connection. Stream delivery holds
//! the receive task: the loop pumps exactly the declared payload length off
//! the socket while the handler consumes it, so frame sync survives even a
//! handler that returns early or panics.

use crate::error::Error;
use crate::events::{
    Callbacks, DisconnectReason, MessageReceived, Peer, StreamReceived, SyncRequest, SyncResponse,
};
use crate::frame_stream::{FrameStream, STREAM_CHANNEL_DEPTH, STREAM_CHUNK};
use crate::router::{ResponseRouter, SyncOutcome, SyncResponseFrame};
use crate::stats::Statistics;
use crate::tls::Transport;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use futures_util::FutureExt;
use fw_protocol::{FrameError, MessageHeader, Metadata, Status};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

const DELIVERY_QUEUE_DEPTH: usize = 64;
/// Server-side bound on the AuthRequired -> AuthRequested exchange.
const AUTH_GRACE_MS: u64 = 10_000;

pub(crate) type SessionReader = BufReader<ReadHalf<Transport>>;

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub(crate) struct Session {
    pub guid: Uuid,
    pub peer_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub stats: Arc<Statistics>,
    pub authenticated: AtomicBool,
    writer: Mutex<WriteHalf<Transport>>,
    last_activity_ms: AtomicI64,
    closed: AtomicBool,
    close_reason: StdMutex<Option<DisconnectReason>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Session {
    pub fn new(
        transport: Transport,
        guid: Uuid,
        peer_addr: SocketAddr,
        stats: Arc<Statistics>,
    ) -> (Arc<Self>, SessionReader, watch::Receiver<bool>) {
        let (read_half, write_half) = tokio::io::split(transport);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = Arc::new(Session {
            guid,
            peer_addr,
            connected_at: Utc::now(),
            stats,
            authenticated: AtomicBool::new(false),
            writer: Mutex::new(write_half),
            last_activity_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            closed: AtomicBool::new(false),
            close_reason: StdMutex::new(None),
            shutdown_tx,
        });
        (session, BufReader::new(read_half), shutdown_rx)
    }

    pub fn peer(&self) -> Peer {
        Peer {
            guid: self.guid,
            addr: self.peer_addr,
        }
    }

    /// Inbound activity only; sending never refreshes the idle clock.
    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let ms = self.last_activity_ms.load(Ordering::Acquire);
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }

    pub fn idle_for_ms(&self) -> u64 {
        let ms = self.last_activity_ms.load(Ordering::Acquire);
        (Utc::now().timestamp_millis() - ms).max(0) as u64
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Ask the receive loop to wind down. The first requested reason wins;
    /// teardown itself happens exactly once, on the receive task.
    pub fn request_close(&self, reason: DisconnectReason) {
        {
            let mut stored = self.close_reason.lock().expect("close_reason lock");
            stored.get_or_insert(reason);
        }
        let _ = self.shutdown_tx.send(true);
    }

    /// Resolve the final disconnect reason: an explicitly requested reason
    /// beats whatever the loop derived on its way out.
    pub fn take_close_reason(&self, fallback: DisconnectReason) -> DisconnectReason {
        let stored = self.close_reason.lock().expect("close_reason lock");
        stored.unwrap_or(fallback)
    }

    /// First caller wins; everyone else sees an already-closed session.
    pub fn mark_closed(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub async fn shutdown_transport(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Write one envelope under the send lock. The lock spans prefix,
    /// header, and payload, which is what keeps concurrent sends whole on
    /// the wire.
    pub async fn write_frame(&self, header: &MessageHeader, payload: &[u8]) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        fw_protocol::write_frame(&mut *writer, header, payload).await?;
        self.stats.record_sent(header.len);
        Ok(())
    }

    /// Streaming variant: the payload comes from an async reader and must
    /// yield exactly `header.len` bytes.
    pub async fn write_frame_from_reader<R>(
        &self,
        header: &MessageHeader,
        source: &mut R,
    ) -> Result<(), Error>
    where
        R: AsyncRead + Unpin,
    {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        fw_protocol::write_frame_from_reader(&mut *writer, header, source).await?;
        self.stats.record_sent(header.len);
        Ok(())
    }
}

/// Fire-and-forget send policy: addressing failures surface to the caller,
/// transport faults close the session and surface via the disconnect event.
pub(crate) async fn send_fire_and_forget(
    session: &Arc<Session>,
    header: &MessageHeader,
    payload: &[u8],
) -> Result<(), Error> {
    match session.write_frame(header, payload).await {
        Ok(()) => Ok(()),
        Err(Error::NotConnected) => Err(Error::NotConnected),
        Err(e) => {
            warn!(peer = %session.guid, error = %e, "send failed; closing session");
            session.request_close(DisconnectReason::UnknownError);
            Ok(())
        }
    }
}

pub(crate) async fn send_stream_fire_and_forget<R>(
    session: &Arc<Session>,
    header: &MessageHeader,
    source: &mut R,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    match session.write_frame_from_reader(header, source).await {
        Ok(()) => Ok(()),
        Err(Error::NotConnected) => Err(Error::NotConnected),
        Err(e) => {
            warn!(peer = %session.guid, error = %e, "stream send failed; closing session");
            session.request_close(DisconnectReason::UnknownError);
            Ok(())
        }
    }
}

/// Send a synchronous request and park until the response, the expiration,
/// or connection teardown resolves it. The waiter is removed on every path.
pub(crate) async fn send_and_wait(
    session: &Arc<Session>,
    router: &Arc<ResponseRouter>,
    timeout_ms: u64,
    data: &[u8],
    metadata: Option<Metadata>,
) -> Result<SyncResponse, Error> {
    if session.is_closed() {
        return Err(Error::NotConnected);
    }
    let conv_guid = Uuid::new_v4();
    let deadline = Utc::now() + ChronoDuration::milliseconds(timeout_ms as i64);
    let rx = router.register(conv_guid, deadline, session.guid);

    let mut header = MessageHeader::with_status(Status::Normal, data.len() as u64);
    header.conv_guid = conv_guid;
    header.sync_req = true;
    header.expiration = Some(deadline);
    header.metadata = metadata;

    if let Err(e) = session.write_frame(&header, data).await {
        router.unregister(&conv_guid);
        return Err(e);
    }
    match rx.await {
        Ok(SyncOutcome::Response(frame)) => Ok(frame.into()),
        Ok(SyncOutcome::Timeout) => Err(Error::Timeout),
        Ok(SyncOutcome::PeerDisconnected) => Err(Error::PeerDisconnected),
        Ok(SyncOutcome::Cancelled) | Err(_) => Err(Error::Cancelled),
    }
}

// ---------------------------------------------------------------------------
// Receive loop
// ---------------------------------------------------------------------------

pub(crate) struct ReceiveSettings {
    /// 0 disables the read deadline entirely.
    pub idle_timeout_ms: u64,
    pub max_proxied_stream_size: u64,
    pub debug_messages: bool,
}

pub(crate) enum Role {
    Server {
        expected_key: Option<String>,
    },
    Client {
        preshared_key: Option<String>,
        /// Signalled once the auth exchange settles; `connect` waits on
        /// this when a key is expected.
        established_tx: StdMutex<Option<oneshot::Sender<Result<(), Error>>>>,
    },
}

pub(crate) struct ReceiveContext {
    pub session: Arc<Session>,
    pub callbacks: Arc<Callbacks>,
    pub router: Arc<ResponseRouter>,
    pub settings: ReceiveSettings,
    pub role: Role,
}

enum ReadOutcome {
    Frame(MessageHeader),
    IdleTimeout,
    AuthDeadline,
    OrderlyClose,
    Fatal(FrameError),
}

enum AuthFlow {
    Continue,
    Close(DisconnectReason),
}

enum Delivery {
    Message(MessageReceived),
    /// Barrier: resolves once every earlier item has been dispatched, so a
    /// stream handler never runs ahead of queued message callbacks.
    Flush(oneshot::Sender<()>),
}

/// Run one connection's receive loop to completion and return the final
/// disconnect reason. The caller performs registry/event teardown.
pub(crate) async fn run_receive_loop(
    ctx: ReceiveContext,
    mut reader: SessionReader,
    mut shutdown_rx: watch::Receiver<bool>,
) -> DisconnectReason {
    let peer = ctx.session.peer();
    let (delivery_tx, delivery_rx) = mpsc::channel::<Delivery>(DELIVERY_QUEUE_DEPTH);
    let dispatcher = tokio::spawn(run_delivery_queue(delivery_rx, ctx.callbacks.clone()));

    let loop_reason = loop {
        let header = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break ctx.session.take_close_reason(DisconnectReason::Normal);
                }
                continue;
            }
            outcome = read_header_with_deadline(&mut reader, &ctx) => match outcome {
                ReadOutcome::Frame(header) => header,
                ReadOutcome::IdleTimeout => {
                    info!(peer = %peer.guid, "idle timeout elapsed");
                    break DisconnectReason::Timeout;
                }
                ReadOutcome::AuthDeadline => {
                    warn!(peer = %peer.guid, "authentication grace period elapsed");
                    let _ = ctx
                        .session
                        .write_frame(&MessageHeader::control(Status::AuthFailure), &[])
                        .await;
                    ctx.callbacks.fire_auth_failed(peer).await;
                    break DisconnectReason::AuthFailure;
                }
                ReadOutcome::OrderlyClose => break DisconnectReason::Normal,
                ReadOutcome::Fatal(e) => {
                    warn!(peer = %peer.guid, error = %e, "fatal frame error");
                    break DisconnectReason::UnknownError;
                }
            }
        };

        ctx.session.touch();
        if ctx.settings.debug_messages {
            debug!(
                peer = %peer.guid,
                status = %header.status,
                len = header.len,
                conv_guid = %header.conv_guid,
                sync_req = header.sync_req,
                sync_resp = header.sync_resp,
                "frame received"
            );
        }
        let payload_len = header.len;

        // An unauthenticated client gets exactly one kind of traffic
        // through: the auth exchange itself.
        if let Role::Server {
            expected_key: Some(_),
        } = &ctx.role
        {
            if !ctx.session.authenticated.load(Ordering::Acquire) && !header.status.is_auth() {
                warn!(peer = %peer.guid, "frame before authentication; discarding");
                if discard_payload(&mut reader, payload_len).await.is_err() {
                    break DisconnectReason::UnknownError;
                }
                continue;
            }
        }

        if header.status.is_auth() {
            // Auth frames carry their key in the header; any payload is
            // unexpected but must still leave the stream.
            if discard_payload(&mut reader, payload_len).await.is_err() {
                break DisconnectReason::UnknownError;
            }
            match handle_auth_frame(&ctx, &header).await {
                AuthFlow::Continue => continue,
                AuthFlow::Close(reason) => break reason,
            }
        }

        if header.sync_resp {
            let mut data = vec![0u8; payload_len as usize];
            if read_payload(&mut reader, &mut data).await.is_err() {
                break DisconnectReason::UnknownError;
            }
            ctx.session.stats.record_received(payload_len);
            // The frame is already off the wire; the router decides
            // between delivery and a logged drop.
            ctx.router.deliver(
                header.conv_guid,
                SyncResponseFrame {
                    status: header.status,
                    metadata: header.metadata,
                    data,
                },
            );
            continue;
        }

        match header.status {
            Status::Heartbeat => {
                if discard_payload(&mut reader, payload_len).await.is_err() {
                    break DisconnectReason::UnknownError;
                }
                continue;
            }
            Status::Removed => {
                let _ = discard_payload(&mut reader, payload_len).await;
                break DisconnectReason::Removed;
            }
            Status::Shutdown => {
                let _ = discard_payload(&mut reader, payload_len).await;
                break DisconnectReason::Shutdown;
            }
            Status::Timeout => {
                let _ = discard_payload(&mut reader, payload_len).await;
                break DisconnectReason::Timeout;
            }
            _ => {}
        }

        let deliver_as_stream = payload_len > ctx.settings.max_proxied_stream_size
            && ctx.callbacks.stream_received.is_some()
            && !header.sync_req;

        if deliver_as_stream {
            // Keep callback order: everything queued before this frame
            // must be dispatched before the stream handler runs.
            let (flush_tx, flush_rx) = oneshot::channel();
            if delivery_tx.send(Delivery::Flush(flush_tx)).await.is_ok() {
                let _ = flush_rx.await;
            }

            let handler = ctx
                .callbacks
                .stream_received
                .clone()
                .expect("checked above");
            let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>(STREAM_CHANNEL_DEPTH);
            let event = StreamReceived {
                peer,
                metadata: header.metadata.clone(),
                content_length: payload_len,
                stream: FrameStream::new(chunk_rx, payload_len),
            };

            // The pump advances the socket by exactly `payload_len` bytes
            // no matter what the handler does; an abandoned stream simply
            // turns the tail of the pump into a discard.
            let pump = pump_payload(&mut reader, chunk_tx, payload_len);
            let handler_fut = AssertUnwindSafe(handler(event)).catch_unwind();
            let (pump_result, handler_result) = tokio::join!(pump, handler_fut);

            match handler_result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => ctx
                    .callbacks
                    .fire_exception(Some(peer), format!("stream handler failed: {e}")),
                Err(_) => ctx
                    .callbacks
                    .fire_exception(Some(peer), "stream handler panicked"),
            }
            if pump_result.is_err() {
                break DisconnectReason::UnknownError;
            }
            ctx.session.stats.record_received(payload_len);
            // A long transfer is inbound activity; don't let the idle
            // deadline count it against the peer.
            ctx.session.touch();
            continue;
        }

        let mut data = vec![0u8; payload_len as usize];
        if read_payload(&mut reader, &mut data).await.is_err() {
            break DisconnectReason::UnknownError;
        }
        ctx.session.stats.record_received(payload_len);
        ctx.session.touch();

        if header.sync_req {
            if header.is_expired(Utc::now()) {
                debug!(peer = %peer.guid, conv_guid = %header.conv_guid, "expired sync request dropped");
                continue;
            }
            spawn_sync_responder(&ctx, header, data);
            continue;
        }

        if ctx.callbacks.message_received.is_none() {
            debug!(peer = %peer.guid, "message received with no handler registered; dropped");
            continue;
        }
        let event = MessageReceived {
            peer,
            metadata: header.metadata,
            data,
        };
        if delivery_tx.send(Delivery::Message(event)).await.is_err() {
            break DisconnectReason::UnknownError;
        }
    };

    // Let queued deliveries drain before the disconnect event can fire.
    drop(delivery_tx);
    let _ = dispatcher.await;

    ctx.session.take_close_reason(loop_reason)
}

async fn read_header_with_deadline(
    reader: &mut SessionReader,
    ctx: &ReceiveContext,
) -> ReadOutcome {
    let mut deadline: Option<(Duration, bool)> = None;
    if ctx.settings.idle_timeout_ms > 0 {
        let remaining = ctx
            .settings
            .idle_timeout_ms
            .saturating_sub(ctx.session.idle_for_ms())
            .max(1);
        deadline = Some((Duration::from_millis(remaining), false));
    }
    if let Role::Server {
        expected_key: Some(_),
    } = &ctx.role
    {
        if !ctx.session.authenticated.load(Ordering::Acquire) {
            let elapsed = (Utc::now() - ctx.session.connected_at)
                .num_milliseconds()
                .max(0) as u64;
            let remaining = AUTH_GRACE_MS.saturating_sub(elapsed).max(1);
            let auth = (Duration::from_millis(remaining), true);
            deadline = match deadline {
                Some(idle) if idle.0 <= auth.0 => Some(idle),
                _ => Some(auth),
            };
        }
    }

    match deadline {
        None => classify_read(fw_protocol::read_header(reader).await),
        Some((limit, is_auth)) => {
            match tokio::time::timeout(limit, fw_protocol::read_header(reader)).await {
                Ok(res) => classify_read(res),
                Err(_) if is_auth => ReadOutcome::AuthDeadline,
                Err(_) => ReadOutcome::IdleTimeout,
            }
        }
    }
}

fn classify_read(res: Result<MessageHeader, FrameError>) -> ReadOutcome {
    match res {
        Ok(header) => ReadOutcome::Frame(header),
        Err(e) if e.is_orderly_close() => ReadOutcome::OrderlyClose,
        Err(e) => ReadOutcome::Fatal(e),
    }
}

async fn handle_auth_frame(ctx: &ReceiveContext, header: &MessageHeader) -> AuthFlow {
    let peer = ctx.session.peer();
    match (&ctx.role, header.status) {
        (Role::Server { expected_key }, Status::AuthRequested) => {
            let Some(expected) = expected_key else {
                debug!(peer = %peer.guid, "auth response but no preshared key configured; ignoring");
                return AuthFlow::Continue;
            };
            let presented = header.preshared_key.as_deref().unwrap_or("");
            if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
                ctx.session.authenticated.store(true, Ordering::Release);
                info!(peer = %peer.guid, "client authenticated");
                let _ = ctx
                    .session
                    .write_frame(&MessageHeader::control(Status::AuthSuccess), &[])
                    .await;
                ctx.callbacks.fire_auth_succeeded(peer).await;
                AuthFlow::Continue
            } else {
                warn!(peer = %peer.guid, "preshared key mismatch");
                let _ = ctx
                    .session
                    .write_frame(&MessageHeader::control(Status::AuthFailure), &[])
                    .await;
                ctx.callbacks.fire_auth_failed(peer).await;
                AuthFlow::Close(DisconnectReason::AuthFailure)
            }
        }
        (
            Role::Client {
                preshared_key,
                established_tx: _,
            },
            Status::AuthRequired,
        ) => {
            let key = match preshared_key {
                Some(k) => Some(k.clone()),
                None => match &ctx.callbacks.auth_requested {
                    Some(cb) => Some(cb().await),
                    None => None,
                },
            };
            match key {
                Some(key) => {
                    let mut response = MessageHeader::control(Status::AuthRequested);
                    response.preshared_key = Some(key);
                    if ctx.session.write_frame(&response, &[]).await.is_err() {
                        return AuthFlow::Close(DisconnectReason::UnknownError);
                    }
                    AuthFlow::Continue
                }
                None => {
                    ctx.callbacks.fire_exception(
                        Some(peer),
                        "server requires a preshared key but none is configured",
                    );
                    // The server's grace period will evict us.
                    AuthFlow::Continue
                }
            }
        }
        (Role::Client { established_tx, .. }, Status::AuthSuccess) => {
            ctx.session.authenticated.store(true, Ordering::Release);
            info!(peer = %peer.guid, "authenticated with server");
            ctx.callbacks.fire_auth_succeeded(peer).await;
            if let Some(tx) = established_tx.lock().expect("established lock").take() {
                let _ = tx.send(Ok(()));
            }
            AuthFlow::Continue
        }
        (Role::Client { established_tx, .. }, Status::AuthFailure) => {
            warn!(peer = %peer.guid, "server rejected authentication");
            ctx.callbacks.fire_auth_failed(peer).await;
            if let Some(tx) = established_tx.lock().expect("established lock").take() {
                let _ = tx.send(Err(Error::AuthFailed));
            }
            AuthFlow::Close(DisconnectReason::AuthFailure)
        }
        _ => {
            debug!(peer = %peer.guid, status = %header.status, "unexpected auth frame; ignoring");
            AuthFlow::Continue
        }
    }
}

fn spawn_sync_responder(ctx: &ReceiveContext, header: MessageHeader, data: Vec<u8>) {
    let session = ctx.session.clone();
    let callbacks = ctx.callbacks.clone();
    let peer = session.peer();
    tokio::spawn(async move {
        let Some(handler) = callbacks.sync_request.clone() else {
            warn!(peer = %peer.guid, conv_guid = %header.conv_guid, "sync request with no handler registered");
            return;
        };
        let request = SyncRequest {
            peer,
            conv_guid: header.conv_guid,
            expiration: header.expiration,
            metadata: header.metadata,
            data,
        };
        let (status, response) = match AssertUnwindSafe(handler(request)).catch_unwind().await {
            Ok(response) => (Status::Success, response),
            Err(_) => {
                callbacks.fire_exception(Some(peer), "sync request handler panicked");
                (Status::Failure, SyncResponse::default())
            }
        };
        // Sent even past the request's expiration: the requester's router
        // consumes and drops late responses, keeping its stream in sync.
        let mut reply = MessageHeader::with_status(status, response.data.len() as u64);
        reply.conv_guid = header.conv_guid;
        reply.sync_resp = true;
        reply.metadata = response.metadata;
        if let Err(e) = session.write_frame(&reply, &response.data).await {
            warn!(peer = %peer.guid, error = %e, "failed to send sync response");
        }
    });
}

async fn run_delivery_queue(mut rx: mpsc::Receiver<Delivery>, callbacks: Arc<Callbacks>) {
    while let Some(item) = rx.recv().await {
        match item {
            Delivery::Message(event) => {
                if let Some(handler) = callbacks.message_received.clone() {
                    let peer = event.peer;
                    if AssertUnwindSafe(handler(event)).catch_unwind().await.is_err() {
                        callbacks.fire_exception(Some(peer), "message handler panicked");
                    }
                }
            }
            Delivery::Flush(tx) => {
                let _ = tx.send(());
            }
        }
    }
}

/// Pump exactly `len` payload bytes from the socket into the handler's
/// channel. Once the handler drops its end, the rest is read and discarded;
/// either way the socket lands on the next frame boundary.
async fn pump_payload(
    reader: &mut SessionReader,
    chunk_tx: mpsc::Sender<Vec<u8>>,
    len: u64,
) -> Result<(), std::io::Error> {
    let mut left = len;
    let mut receiver_gone = false;
    while left > 0 {
        let take = left.min(STREAM_CHUNK as u64) as usize;
        let mut buf = vec![0u8; take];
        reader.read_exact(&mut buf).await?;
        left -= take as u64;
        if !receiver_gone && chunk_tx.send(buf).await.is_err() {
            receiver_gone = true;
        }
    }
    Ok(())
}

async fn read_payload(reader: &mut SessionReader, buf: &mut [u8]) -> Result<(), std::io::Error> {
    if buf.is_empty() {
        return Ok(());
    }
    reader.read_exact(buf).await.map(|_| ())
}

async fn discard_payload(reader: &mut SessionReader, len: u64) -> Result<(), std::io::Error> {
    if len == 0 {
        return Ok(());
    }
    let mut limited = (&mut *reader).take(len);
    let copied = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
    if copied < len {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
    Ok(())
}

/// Equal-length comparison without early exit; length mismatch returns
/// immediately (the lengths are not secret).
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
