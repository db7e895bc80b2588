//! Bounded read-only view over one message's payload.
//!
//! A `FrameStream` exposes exactly the declared content length of a single
//! message. The receive loop pumps payload bytes off the socket into a
//! bounded channel — so the socket position always advances by exactly
//! `Len` bytes regardless of what the handler does — while the handler
//! consumes them here. Reads past the bound return end-of-stream, dropping
//! the stream never closes the connection, and a handler that walks away
//! early simply leaves the pump discarding the remainder.

use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

/// Chunk size used by the receive loop when pumping payload bytes.
pub(crate) const STREAM_CHUNK: usize = 64 * 1024;
/// Channel depth between the pump and the consumer. Small on purpose: the
/// pump may run at most one chunk ahead of the handler.
pub(crate) const STREAM_CHANNEL_DEPTH: usize = 1;

pub struct FrameStream {
    rx: mpsc::Receiver<Vec<u8>>,
    current: Vec<u8>,
    offset: usize,
    remaining: u64,
}

impl FrameStream {
    pub(crate) fn new(rx: mpsc::Receiver<Vec<u8>>, content_length: u64) -> Self {
        FrameStream {
            rx,
            current: Vec::new(),
            offset: 0,
            remaining: content_length,
        }
    }

    /// Payload bytes this reader has not yet handed out.
    pub fn bytes_remaining(&self) -> u64 {
        self.remaining
    }
}

impl AsyncRead for FrameStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = &mut *self;
        loop {
            if me.offset < me.current.len() {
                let available = &me.current[me.offset..];
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                me.offset += n;
                me.remaining = me.remaining.saturating_sub(n as u64);
                return Poll::Ready(Ok(()));
            }
            match me.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    me.current = chunk;
                    me.offset = 0;
                }
                // Pump finished (or the frame was fully consumed): EOF at
                // the bound, with the connection untouched.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl std::fmt::Debug for FrameStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStream")
            .field("remaining", &self.remaining)
            .finish()
    }
}
