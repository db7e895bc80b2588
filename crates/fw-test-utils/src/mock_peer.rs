//! Scripted envelope peers over raw TCP.
//!
//! Each test spins up its own isolated [`MockPeerServer`] on a random port,
//! or dials a real server with [`MockPeerClient`]. Both ends expose
//! frame-level send/receive plus raw byte injection for malformed-input
//! lanes.

use fw_protocol::{FrameError, MessageHeader};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A listener that hands out scripted connections; the test drives every
/// accept explicitly rather than running a background loop.
pub struct MockPeerServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl MockPeerServer {
    /// Bind to a random available loopback port.
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        Ok(MockPeerServer { listener, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn accept(&self) -> std::io::Result<MockPeerConnection> {
        let (stream, peer) = self.listener.accept().await?;
        Ok(MockPeerConnection { stream, peer })
    }
}

/// One accepted scripted connection.
pub struct MockPeerConnection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl MockPeerConnection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send_frame(
        &mut self,
        header: &MessageHeader,
        payload: &[u8],
    ) -> Result<(), FrameError> {
        fw_protocol::write_frame(&mut self.stream, header, payload).await?;
        Ok(())
    }

    pub async fn recv_frame(&mut self) -> Result<(MessageHeader, Vec<u8>), FrameError> {
        recv_frame(&mut self.stream).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// A scripted outbound peer for driving a real server by hand.
pub struct MockPeerClient {
    stream: TcpStream,
}

impl MockPeerClient {
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(MockPeerClient { stream })
    }

    pub async fn send_frame(
        &mut self,
        header: &MessageHeader,
        payload: &[u8],
    ) -> Result<(), FrameError> {
        fw_protocol::write_frame(&mut self.stream, header, payload).await?;
        Ok(())
    }

    pub async fn recv_frame(&mut self) -> Result<(MessageHeader, Vec<u8>), FrameError> {
        recv_frame(&mut self.stream).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

async fn recv_frame(stream: &mut TcpStream) -> Result<(MessageHeader, Vec<u8>), FrameError> {
    let header = fw_protocol::read_header(stream).await?;
    let mut payload = vec![0u8; header.len as usize];
    if !payload.is_empty() {
        stream.read_exact(&mut payload).await?;
    }
    Ok((header, payload))
}
