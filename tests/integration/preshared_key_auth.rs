//! Preshared-key authentication lanes.
//!
//! # Coverage
//! - Success with the key in client settings: events fire in order
//!   (connected, then authentication succeeded) and messaging works after.
//! - Success with the key supplied by the authentication-requested
//!   callback.
//! - Failure: wrong key closes the session with `AuthFailure` on both
//!   sides and `connect` reports the rejection.
//! - A failed handshake is a failed connect, not an abrupt disconnect:
//!   auto-reconnect stays out of it, the client reports disconnected
//!   immediately, and a retry starts a fresh attempt.
//! - Frames from an unauthenticated client are discarded.

use framewire::{Client, ClientSettings, DisconnectReason, Error, Server, ServerSettings};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;

const KEY: &str = "0123456789ABCDEF";

#[derive(Debug, PartialEq, Eq)]
enum ClientEvent {
    Connected,
    AuthSucceeded,
    AuthFailed,
    Disconnected(DisconnectReason),
}

fn wire_client_events(client: &mut Client) -> mpsc::UnboundedReceiver<ClientEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    let connected_tx = tx.clone();
    client.on_server_connected(move |_| {
        let tx = connected_tx.clone();
        async move {
            let _ = tx.send(ClientEvent::Connected);
        }
    });
    let success_tx = tx.clone();
    client.on_authentication_succeeded(move |_| {
        let tx = success_tx.clone();
        async move {
            let _ = tx.send(ClientEvent::AuthSucceeded);
        }
    });
    let failed_tx = tx.clone();
    client.on_authentication_failed(move |_| {
        let tx = failed_tx.clone();
        async move {
            let _ = tx.send(ClientEvent::AuthFailed);
        }
    });
    client.on_server_disconnected(move |ev| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(ClientEvent::Disconnected(ev.reason));
        }
    });
    rx
}

async fn recv_event(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_millis(3_000), rx.recv())
        .await
        .expect("event within deadline")
        .expect("channel open")
}

async fn start_auth_server() -> (Server, SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let mut settings = ServerSettings::new("127.0.0.1", 0);
    settings.preshared_key = Some(KEY.to_owned());
    let mut server = Server::new(settings);
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    server.on_message_received(move |ev| {
        let msg_tx = msg_tx.clone();
        async move {
            let _ = msg_tx.send(ev.data);
        }
    });
    server.start().await.expect("server start");
    let addr = server.local_addr().await.expect("bound address");
    (server, addr, msg_rx)
}

#[tokio::test]
async fn auth_succeeds_with_configured_key() {
    let (server, addr, mut msg_rx) = start_auth_server().await;

    let mut settings = ClientSettings::new("127.0.0.1", addr.port());
    settings.preshared_key = Some(KEY.to_owned());
    let mut client = Client::new(settings);
    let mut events = wire_client_events(&mut client);

    client.connect().await.expect("connect with auth");
    assert_eq!(recv_event(&mut events).await, ClientEvent::Connected);
    assert_eq!(recv_event(&mut events).await, ClientEvent::AuthSucceeded);

    client.send(b"after-auth").await.expect("send");
    let data = tokio::time::timeout(Duration::from_millis(2_000), msg_rx.recv())
        .await
        .expect("delivered")
        .expect("channel open");
    assert_eq!(data, b"after-auth");

    client.disconnect().await.expect("disconnect");
    server.stop().await.expect("stop");
}

#[tokio::test]
async fn auth_succeeds_via_callback() {
    let (server, addr, mut msg_rx) = start_auth_server().await;

    let mut client = Client::new(ClientSettings::new("127.0.0.1", addr.port()));
    client.on_authentication_requested(|| async move { KEY.to_owned() });
    let mut events = wire_client_events(&mut client);

    client.connect().await.expect("connect with callback key");
    assert_eq!(recv_event(&mut events).await, ClientEvent::Connected);
    assert_eq!(recv_event(&mut events).await, ClientEvent::AuthSucceeded);

    client.send(b"cb").await.expect("send");
    let data = tokio::time::timeout(Duration::from_millis(2_000), msg_rx.recv())
        .await
        .expect("delivered")
        .expect("channel open");
    assert_eq!(data, b"cb");

    client.disconnect().await.expect("disconnect");
    server.stop().await.expect("stop");
}

#[tokio::test]
async fn wrong_key_closes_with_auth_failure() {
    let mut settings = ServerSettings::new("127.0.0.1", 0);
    settings.preshared_key = Some(KEY.to_owned());
    let mut server = Server::new(settings);
    let (reason_tx, mut reason_rx) = mpsc::unbounded_channel();
    server.on_client_disconnected(move |ev| {
        let reason_tx = reason_tx.clone();
        async move {
            let _ = reason_tx.send(ev.reason);
        }
    });
    server.start().await.expect("server start");
    let addr = server.local_addr().await.expect("bound address");

    let mut client_settings = ClientSettings::new("127.0.0.1", addr.port());
    client_settings.preshared_key = Some("wrong-key-000000".to_owned());
    let mut client = Client::new(client_settings);
    let mut events = wire_client_events(&mut client);

    let result = client.connect().await;
    assert!(matches!(result, Err(Error::AuthFailed)), "got {result:?}");
    assert!(
        !client.is_connected().await,
        "a failed connect leaves no live session behind"
    );

    assert_eq!(recv_event(&mut events).await, ClientEvent::Connected);
    assert_eq!(recv_event(&mut events).await, ClientEvent::AuthFailed);
    assert_eq!(
        recv_event(&mut events).await,
        ClientEvent::Disconnected(DisconnectReason::AuthFailure)
    );

    let reason = tokio::time::timeout(Duration::from_millis(3_000), reason_rx.recv())
        .await
        .expect("server event")
        .expect("channel open");
    assert_eq!(reason, DisconnectReason::AuthFailure);

    server.stop().await.expect("stop");
}

#[tokio::test]
async fn failed_handshake_with_auto_reconnect_stays_down() {
    let mut settings = ServerSettings::new("127.0.0.1", 0);
    settings.preshared_key = Some(KEY.to_owned());
    let server = Server::new(settings);
    server.start().await.expect("server start");
    let addr = server.local_addr().await.expect("bound address");

    let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
    let mut client_settings = ClientSettings::new("127.0.0.1", addr.port());
    client_settings.preshared_key = Some("wrong-key-000000".to_owned());
    client_settings.auto_reconnect = true;
    client_settings.reconnect_max_retries = 3;
    client_settings.reconnect_interval_ms = 200;
    let mut client = Client::new(client_settings);
    client.on_server_connected(move |_| {
        let tx = connected_tx.clone();
        async move {
            let _ = tx.send(());
        }
    });

    let result = client.connect().await;
    assert!(matches!(result, Err(Error::AuthFailed)), "got {result:?}");
    assert!(
        !client.is_connected().await,
        "failed connect leaves no live session"
    );

    // One connected event fired during the attempt (transport-up)...
    let _ = tokio::time::timeout(Duration::from_millis(1_000), connected_rx.recv())
        .await
        .expect("attempt's connected event")
        .expect("channel open");
    // ...and none after: a failed handshake is not an abrupt disconnect,
    // so no background reconnect runs.
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert!(
        connected_rx.try_recv().is_err(),
        "no unsolicited reconnect after a failed handshake"
    );
    assert!(!client.is_connected().await);

    // The failed attempt is fully unwound; a retry is a fresh attempt, not
    // AlreadyRunning.
    let retry = client.connect().await;
    assert!(matches!(retry, Err(Error::AuthFailed)), "got {retry:?}");

    server.stop().await.expect("stop");
}

#[tokio::test]
async fn unauthenticated_frames_are_discarded() {
    let (server, addr, mut msg_rx) = start_auth_server().await;

    // No key and no callback: the client never answers AuthRequired.
    let client = Client::new(ClientSettings::new("127.0.0.1", addr.port()));
    client.connect().await.expect("transport-level connect");

    client.send(b"sneaky").await.expect("send enqueued");
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert!(
        msg_rx.try_recv().is_err(),
        "unauthenticated traffic must not be delivered"
    );

    let _ = client.disconnect().await;
    server.stop().await.expect("stop");
}
