//! Concurrent-send serialization on a single connection.
//!
//! # Coverage
//! - Two tasks each send 10 000 distinct 64-byte messages on the same
//!   client connection. The server receives exactly 20 000 deliveries, no
//!   framing error occurs, and every payload decodes to one of the expected
//!   values exactly once.

use framewire::{Client, ClientSettings, Server, ServerSettings};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const LANES: usize = 2;
const PER_LANE: usize = 10_000;

/// A fixed-width 64-byte payload, distinct per (lane, index).
fn payload(lane: usize, index: usize) -> Vec<u8> {
    let mut bytes = format!("lane-{lane}-msg-{index:06}-").into_bytes();
    bytes.resize(64, b'x');
    bytes
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interleaved_senders_never_corrupt_frames() {
    let mut server = Server::new(ServerSettings::new("127.0.0.1", 0));
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    server.on_message_received(move |ev| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(ev.data);
        }
    });
    let (err_tx, mut err_rx) = mpsc::unbounded_channel::<String>();
    server.on_exception(move |ev| {
        let err_tx = err_tx.clone();
        async move {
            let _ = err_tx.send(ev.detail);
        }
    });
    server.start().await.expect("server start");
    let addr = server.local_addr().await.expect("bound address");

    let client = Arc::new(Client::new(ClientSettings::new("127.0.0.1", addr.port())));
    client.connect().await.expect("connect");

    let mut senders = Vec::new();
    for lane in 0..LANES {
        let client = client.clone();
        senders.push(tokio::spawn(async move {
            for index in 0..PER_LANE {
                client
                    .send(payload(lane, index))
                    .await
                    .expect("send must not fail mid-run");
            }
        }));
    }
    for task in senders {
        task.await.expect("sender task");
    }

    let mut seen: HashSet<Vec<u8>> = HashSet::with_capacity(LANES * PER_LANE);
    for _ in 0..LANES * PER_LANE {
        let data = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("all messages delivered")
            .expect("channel open");
        assert_eq!(data.len(), 64, "frame boundaries held");
        assert!(seen.insert(data), "no duplicate delivery");
    }

    let mut expected: HashSet<Vec<u8>> = HashSet::with_capacity(LANES * PER_LANE);
    for lane in 0..LANES {
        for index in 0..PER_LANE {
            expected.insert(payload(lane, index));
        }
    }
    assert_eq!(seen, expected, "every payload decodes to a sent value");
    assert!(err_rx.try_recv().is_err(), "no exception events fired");
    assert_eq!(server.list_clients().await.len(), 1, "connection survived");

    client.disconnect().await.expect("disconnect");
    server.stop().await.expect("stop");
}
