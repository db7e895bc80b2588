//! Large-payload stream delivery lanes.
//!
//! # Coverage
//! - A 10 MiB payload over a 512 KiB proxy threshold arrives as a live
//!   bounded stream; the digest of the handler's reads equals the digest of
//!   the sent bytes.
//! - Boundary: exactly `max_proxied_stream_size` is buffered, one byte more
//!   streams.
//! - A handler that abandons the stream early does not desynchronize the
//!   connection; the next message arrives intact.

use framewire::{Client, ClientSettings, Server, ServerSettings};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

const PROXY_THRESHOLD: u64 = 524_288;
const TEN_MIB: usize = 10 * 1024 * 1024;

/// Deterministic payload so sender and receiver can agree on a digest.
fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn ten_mib_payload_streams_with_matching_digest() {
    let mut settings = ServerSettings::new("127.0.0.1", 0);
    settings.max_proxied_stream_size = PROXY_THRESHOLD;
    let mut server = Server::new(settings);

    let (digest_tx, mut digest_rx) = mpsc::unbounded_channel::<(u64, Vec<u8>)>();
    server.on_stream_received(move |mut ev| {
        let digest_tx = digest_tx.clone();
        async move {
            let content_length = ev.content_length;
            let mut hasher = Sha256::new();
            let mut buf = vec![0u8; 64 * 1024];
            let mut total = 0u64;
            loop {
                let n = ev.stream.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                total += n as u64;
            }
            assert_eq!(total, content_length, "handler must see every byte");
            let _ = digest_tx.send((content_length, hasher.finalize().to_vec()));
            Ok(())
        }
    });
    server.start().await.expect("server start");
    let addr = server.local_addr().await.expect("bound address");

    let client = Client::new(ClientSettings::new("127.0.0.1", addr.port()));
    client.connect().await.expect("connect");

    let payload = patterned(TEN_MIB);
    let expected_digest = Sha256::digest(&payload).to_vec();
    client
        .send_stream(TEN_MIB as u64, &mut payload.as_slice())
        .await
        .expect("stream send");

    let (content_length, digest) = tokio::time::timeout(Duration::from_secs(30), digest_rx.recv())
        .await
        .expect("stream delivered")
        .expect("channel open");
    assert_eq!(content_length, 10_485_760);
    assert_eq!(digest, expected_digest);

    client.disconnect().await.expect("disconnect");
    server.stop().await.expect("stop");
}

#[tokio::test]
async fn proxy_threshold_boundary_selects_the_delivery_mode() {
    let mut settings = ServerSettings::new("127.0.0.1", 0);
    settings.max_proxied_stream_size = PROXY_THRESHOLD;
    let mut server = Server::new(settings);

    #[derive(Debug, PartialEq)]
    enum Mode {
        Buffered(usize),
        Streamed(u64),
    }
    let (mode_tx, mut mode_rx) = mpsc::unbounded_channel::<Mode>();

    let buffered_tx = mode_tx.clone();
    server.on_message_received(move |ev| {
        let tx = buffered_tx.clone();
        async move {
            let _ = tx.send(Mode::Buffered(ev.data.len()));
        }
    });
    server.on_stream_received(move |mut ev| {
        let tx = mode_tx.clone();
        async move {
            let mut sink = tokio::io::sink();
            tokio::io::copy(&mut ev.stream, &mut sink).await?;
            let _ = tx.send(Mode::Streamed(ev.content_length));
            Ok(())
        }
    });
    server.start().await.expect("server start");
    let addr = server.local_addr().await.expect("bound address");

    let client = Client::new(ClientSettings::new("127.0.0.1", addr.port()));
    client.connect().await.expect("connect");

    client
        .send(patterned(PROXY_THRESHOLD as usize))
        .await
        .expect("send at threshold");
    let at = tokio::time::timeout(Duration::from_secs(10), mode_rx.recv())
        .await
        .expect("delivery")
        .expect("channel open");
    assert_eq!(at, Mode::Buffered(PROXY_THRESHOLD as usize));

    client
        .send(patterned(PROXY_THRESHOLD as usize + 1))
        .await
        .expect("send past threshold");
    let past = tokio::time::timeout(Duration::from_secs(10), mode_rx.recv())
        .await
        .expect("delivery")
        .expect("channel open");
    assert_eq!(past, Mode::Streamed(PROXY_THRESHOLD + 1));

    client.disconnect().await.expect("disconnect");
    server.stop().await.expect("stop");
}

#[tokio::test]
async fn abandoned_stream_is_drained_and_the_connection_survives() {
    let mut settings = ServerSettings::new("127.0.0.1", 0);
    settings.max_proxied_stream_size = 1_024;
    let mut server = Server::new(settings);

    let (stream_tx, mut stream_rx) = mpsc::unbounded_channel::<u64>();
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    server.on_stream_received(move |mut ev| {
        let stream_tx = stream_tx.clone();
        async move {
            // Read a token amount and walk away.
            let mut buf = [0u8; 10];
            ev.stream.read_exact(&mut buf).await?;
            let _ = stream_tx.send(ev.content_length);
            Ok(())
        }
    });
    server.on_message_received(move |ev| {
        let msg_tx = msg_tx.clone();
        async move {
            let _ = msg_tx.send(ev.data);
        }
    });
    server.start().await.expect("server start");
    let addr = server.local_addr().await.expect("bound address");

    let client = Client::new(ClientSettings::new("127.0.0.1", addr.port()));
    client.connect().await.expect("connect");

    client.send(patterned(100_000)).await.expect("big send");
    let content_length = tokio::time::timeout(Duration::from_secs(5), stream_rx.recv())
        .await
        .expect("stream event")
        .expect("channel open");
    assert_eq!(content_length, 100_000);

    // The library drained the abandoned remainder; the next frame parses.
    client.send(b"follow-up").await.expect("small send");
    let data = tokio::time::timeout(Duration::from_secs(5), msg_rx.recv())
        .await
        .expect("follow-up delivered")
        .expect("channel open");
    assert_eq!(data, b"follow-up");

    client.disconnect().await.expect("disconnect");
    server.stop().await.expect("stop");
}
