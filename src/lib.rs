//! framewire: message-framed, bidirectional TCP transport.
//!
//! Raw TCP is a byte stream with no message boundaries. framewire imposes
//! a self-describing envelope — a decimal length prefix, a JSON header, and
//! a binary payload — so application code always receives whole messages,
//! or whole streams of a known length, never fragments.
//!
//! The [`Server`] accepts connections and tracks clients by guid; the
//! [`Client`] maintains one outbound session with optional auto-reconnect.
//! Both sides share the same session machinery: a per-connection receive
//! loop, a send lock that keeps concurrent writes whole on the wire,
//! optional TLS, preshared-key authentication, idle eviction, and
//! guid-correlated synchronous request/response (`send_and_wait`).
//!
//! ```no_run
//! use framewire::{Client, ClientSettings, Server, ServerSettings};
//!
//! # async fn demo() -> Result<(), framewire::Error> {
//! let mut server = Server::new(ServerSettings::new("127.0.0.1", 9000));
//! server.on_message_received(|ev| async move {
//!     println!("{} sent {} bytes", ev.peer.guid, ev.data.len());
//! });
//! server.start().await?;
//!
//! let client = Client::new(ClientSettings::new("127.0.0.1", 9000));
//! client.connect().await?;
//! client.send(b"hello").await?;
//! let pong = client.send_and_wait(5_000, b"ping").await?;
//! println!("response: {} bytes", pong.data.len());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod events;
pub mod frame_stream;
mod router;
pub mod server;
mod session;
pub mod settings;
pub mod sockets;
pub mod stats;
pub mod tls;

pub use client::Client;
pub use error::Error;
pub use events::{
    ConnectionEvent, DisconnectReason, DisconnectionEvent, ExceptionEvent, MessageReceived, Peer,
    StreamReceived, SyncRequest, SyncResponse,
};
pub use frame_stream::FrameStream;
pub use server::{ClientInfo, Server};
pub use settings::{ClientSettings, KeepaliveSettings, ServerSettings};
pub use sockets::keepalives_supported;
pub use stats::{Statistics, StatisticsSnapshot};
pub use tls::{PemIdentity, TlsClientSettings, TlsServerSettings};

// Wire-level types, re-exported for applications that build metadata maps
// or inspect statuses.
pub use fw_protocol::{FrameError, MessageHeader, Metadata, Status};
