//! TLS transport lanes.
//!
//! # Coverage
//! - Echo and synchronous round trips over TLS with a self-signed server
//!   certificate and a permissive client verifier.
//! - A strict client (default roots) refuses the self-signed certificate.

use framewire::{
    Client, ClientSettings, PemIdentity, Server, ServerSettings, TlsClientSettings,
    TlsServerSettings, SyncResponse,
};
use std::io::Write;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

fn write_self_signed(dir: &tempfile::TempDir) -> PemIdentity {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(vec!["localhost".to_owned()]).unwrap();
    let cert = params.self_signed(&key_pair).unwrap();

    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    let mut f = std::fs::File::create(&cert_path).unwrap();
    f.write_all(cert.pem().as_bytes()).unwrap();
    let mut f = std::fs::File::create(&key_path).unwrap();
    f.write_all(key_pair.serialize_pem().as_bytes()).unwrap();
    PemIdentity {
        cert_path,
        key_path,
    }
}

async fn start_tls_server(
    identity: PemIdentity,
) -> (Server, SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let mut settings = ServerSettings::new("127.0.0.1", 0);
    settings.tls = Some(TlsServerSettings {
        certificate: Some(identity),
        ..TlsServerSettings::default()
    });
    let mut server = Server::new(settings);
    let (tx, rx) = mpsc::unbounded_channel();
    server.on_message_received(move |ev| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(ev.data);
        }
    });
    server.on_sync_request(|req| async move {
        let mut answer = b"tls-".to_vec();
        answer.extend_from_slice(&req.data);
        SyncResponse::from_bytes(answer)
    });
    server.start().await.expect("server start");
    let addr = server.local_addr().await.expect("bound address");
    (server, addr, rx)
}

fn permissive_client(port: u16) -> ClientSettings {
    let mut settings = ClientSettings::new("localhost", port);
    settings.tls = Some(TlsClientSettings {
        accept_invalid_certificates: true,
        ..TlsClientSettings::default()
    });
    settings
}

#[tokio::test]
async fn echo_over_tls() {
    let dir = tempfile::tempdir().unwrap();
    let (server, addr, mut server_rx) = start_tls_server(write_self_signed(&dir)).await;

    let client = Client::new(permissive_client(addr.port()));
    client.connect().await.expect("TLS connect");

    client.send(b"encrypted-hello").await.expect("send");
    let data = tokio::time::timeout(Duration::from_secs(5), server_rx.recv())
        .await
        .expect("delivered")
        .expect("channel open");
    assert_eq!(data, b"encrypted-hello");

    client.disconnect().await.expect("disconnect");
    server.stop().await.expect("stop");
}

#[tokio::test]
async fn sync_round_trip_over_tls() {
    let dir = tempfile::tempdir().unwrap();
    let (server, addr, _server_rx) = start_tls_server(write_self_signed(&dir)).await;

    let client = Client::new(permissive_client(addr.port()));
    client.connect().await.expect("TLS connect");

    let response = client
        .send_and_wait(5_000, b"ping")
        .await
        .expect("sync over TLS");
    assert_eq!(response.data, b"tls-ping");

    client.disconnect().await.expect("disconnect");
    server.stop().await.expect("stop");
}

#[tokio::test]
async fn strict_client_rejects_self_signed_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let (server, addr, _server_rx) = start_tls_server(write_self_signed(&dir)).await;

    let mut settings = ClientSettings::new("localhost", addr.port());
    settings.tls = Some(TlsClientSettings::default());
    settings.connect_timeout_ms = 3_000;
    let client = Client::new(settings);

    let result = client.connect().await;
    assert!(result.is_err(), "untrusted certificate must be rejected");
    assert!(!client.is_connected().await);

    server.stop().await.expect("stop");
}
