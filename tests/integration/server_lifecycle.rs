//! Server lifecycle, registry, and reconnect lanes.
//!
//! # Coverage
//! - `start` is rejected while listening and allowed again after `stop`.
//! - `stop` notifies clients: both sides observe `Shutdown`.
//! - Kicking a client: server records the kick reason, the peer observes
//!   the removal frame.
//! - Registry queries: list, address lookup, liveness.
//! - Connection cap: sockets beyond `max_connections` are closed.
//! - Broadcast reaches every client.
//! - Auto-reconnect: a kicked client with reconnect enabled comes back and
//!   fires a fresh connected event.

use framewire::{Client, ClientSettings, DisconnectReason, Error, Server, ServerSettings};
use std::time::Duration;
use tokio::sync::mpsc;

fn connected_guid_channel(server: &mut Server) -> mpsc::UnboundedReceiver<uuid::Uuid> {
    let (tx, rx) = mpsc::unbounded_channel();
    server.on_client_connected(move |ev| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(ev.peer.guid);
        }
    });
    rx
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>, millis: u64) -> T {
    tokio::time::timeout(Duration::from_millis(millis), rx.recv())
        .await
        .expect("value within deadline")
        .expect("channel open")
}

#[tokio::test]
async fn start_stop_start_again() {
    let server = Server::new(ServerSettings::new("127.0.0.1", 0));
    server.start().await.expect("first start");
    assert!(server.is_listening().await);
    assert!(matches!(
        server.start().await,
        Err(Error::AlreadyRunning)
    ));

    server.stop().await.expect("stop");
    assert!(!server.is_listening().await);
    assert!(matches!(server.stop().await, Err(Error::NotRunning)));

    server.start().await.expect("second start");
    assert!(server.is_listening().await);
    server.stop().await.expect("stop again");
}

#[tokio::test]
async fn stop_notifies_connected_clients() {
    let mut server = Server::new(ServerSettings::new("127.0.0.1", 0));
    let (server_reason_tx, mut server_reason_rx) = mpsc::unbounded_channel();
    server.on_client_disconnected(move |ev| {
        let tx = server_reason_tx.clone();
        async move {
            let _ = tx.send(ev.reason);
        }
    });
    server.start().await.expect("start");
    let addr = server.local_addr().await.expect("bound address");

    let (client_reason_tx, mut client_reason_rx) = mpsc::unbounded_channel();
    let mut client = Client::new(ClientSettings::new("127.0.0.1", addr.port()));
    client.on_server_disconnected(move |ev| {
        let tx = client_reason_tx.clone();
        async move {
            let _ = tx.send(ev.reason);
        }
    });
    client.connect().await.expect("connect");

    server.stop().await.expect("stop");
    assert_eq!(
        recv(&mut server_reason_rx, 3_000).await,
        DisconnectReason::Shutdown
    );
    assert_eq!(
        recv(&mut client_reason_rx, 3_000).await,
        DisconnectReason::Shutdown
    );
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn kicked_client_sees_the_removal() {
    let mut server = Server::new(ServerSettings::new("127.0.0.1", 0));
    let mut guids = connected_guid_channel(&mut server);
    let (server_reason_tx, mut server_reason_rx) = mpsc::unbounded_channel();
    server.on_client_disconnected(move |ev| {
        let tx = server_reason_tx.clone();
        async move {
            let _ = tx.send(ev.reason);
        }
    });
    server.start().await.expect("start");
    let addr = server.local_addr().await.expect("bound address");

    let (client_reason_tx, mut client_reason_rx) = mpsc::unbounded_channel();
    let mut client = Client::new(ClientSettings::new("127.0.0.1", addr.port()));
    client.on_server_disconnected(move |ev| {
        let tx = client_reason_tx.clone();
        async move {
            let _ = tx.send(ev.reason);
        }
    });
    client.connect().await.expect("connect");

    let guid = recv(&mut guids, 2_000).await;
    server
        .disconnect_client(guid, DisconnectReason::Kicked)
        .await
        .expect("kick");

    assert_eq!(
        recv(&mut server_reason_rx, 3_000).await,
        DisconnectReason::Kicked
    );
    assert_eq!(
        recv(&mut client_reason_rx, 3_000).await,
        DisconnectReason::Removed
    );
    assert!(!server.is_client_connected(guid).await);

    server.stop().await.expect("stop");
}

#[tokio::test]
async fn registry_queries_see_the_connection() {
    let mut server = Server::new(ServerSettings::new("127.0.0.1", 0));
    let mut guids = connected_guid_channel(&mut server);
    server.start().await.expect("start");
    let addr = server.local_addr().await.expect("bound address");

    let client = Client::new(ClientSettings::new("127.0.0.1", addr.port()));
    client.connect().await.expect("connect");
    let guid = recv(&mut guids, 2_000).await;

    let clients = server.list_clients().await;
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].guid, guid);
    assert!(server.is_client_connected(guid).await);
    assert_eq!(
        server.client_by_address(clients[0].ip_port).await,
        Some(guid),
        "secondary index resolves the address"
    );

    // Unknown targets fail synchronously.
    let ghost = uuid::Uuid::new_v4();
    assert!(matches!(
        server.send(ghost, b"nope").await,
        Err(Error::NotFound(g)) if g == ghost
    ));

    client.disconnect().await.expect("disconnect");
    server.stop().await.expect("stop");
}

#[tokio::test]
async fn connection_cap_closes_excess_sockets() {
    let mut settings = ServerSettings::new("127.0.0.1", 0);
    settings.max_connections = 1;
    let server = Server::new(settings);
    server.start().await.expect("start");
    let addr = server.local_addr().await.expect("bound address");

    let first = Client::new(ClientSettings::new("127.0.0.1", addr.port()));
    first.connect().await.expect("first connect");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (reason_tx, mut reason_rx) = mpsc::unbounded_channel();
    let mut second = Client::new(ClientSettings::new("127.0.0.1", addr.port()));
    second.on_server_disconnected(move |ev| {
        let tx = reason_tx.clone();
        async move {
            let _ = tx.send(ev.reason);
        }
    });
    // TCP accept succeeds via the backlog, then the server closes the
    // socket without registering a session.
    let _ = second.connect().await;
    let _ = recv(&mut reason_rx, 3_000).await;
    assert_eq!(server.list_clients().await.len(), 1);

    first.disconnect().await.expect("disconnect");
    server.stop().await.expect("stop");
}

#[tokio::test]
async fn broadcast_reaches_every_client() {
    let server = {
        let mut server = Server::new(ServerSettings::new("127.0.0.1", 0));
        server.on_client_connected(|_| async {});
        server
    };
    server.start().await.expect("start");
    let addr = server.local_addr().await.expect("bound address");

    let mut receivers = Vec::new();
    let mut clients = Vec::new();
    for _ in 0..3 {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut client = Client::new(ClientSettings::new("127.0.0.1", addr.port()));
        client.on_message_received(move |ev| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(ev.data);
            }
        });
        client.connect().await.expect("connect");
        receivers.push(rx);
        clients.push(client);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let attempted = server.broadcast(b"all-hands").await.expect("broadcast");
    assert_eq!(attempted, 3);
    for rx in &mut receivers {
        let data = recv(rx, 3_000).await;
        assert_eq!(data, b"all-hands");
    }

    for client in &clients {
        client.disconnect().await.expect("disconnect");
    }
    server.stop().await.expect("stop");
}

#[tokio::test]
async fn kicked_client_auto_reconnects() {
    let mut server = Server::new(ServerSettings::new("127.0.0.1", 0));
    let mut guids = connected_guid_channel(&mut server);
    server.start().await.expect("start");
    let addr = server.local_addr().await.expect("bound address");

    let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
    let mut settings = ClientSettings::new("127.0.0.1", addr.port());
    settings.auto_reconnect = true;
    settings.reconnect_max_retries = 5;
    settings.reconnect_interval_ms = 200;
    let mut client = Client::new(settings);
    client.on_server_connected(move |_| {
        let tx = connected_tx.clone();
        async move {
            let _ = tx.send(());
        }
    });
    client.connect().await.expect("connect");
    let first_guid = recv(&mut guids, 2_000).await;
    let _ = recv(&mut connected_rx, 2_000).await;

    server
        .disconnect_client(first_guid, DisconnectReason::Kicked)
        .await
        .expect("kick");

    // The reconnect mints a fresh server-side identity and replays the
    // connected event.
    let second_guid = recv(&mut guids, 5_000).await;
    assert_ne!(first_guid, second_guid);
    let _ = recv(&mut connected_rx, 5_000).await;
    assert!(client.is_connected().await);

    // Manual disconnect stops the reconnect loop for good.
    client.disconnect().await.expect("disconnect");
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(server.list_clients().await.len(), 0);
    assert!(!client.is_connected().await);

    server.stop().await.expect("stop");
}
