//! Framed TCP connection to one peer.

use std::io;
use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use roster_core::wire::{encode_frame, FrameDecoder};

/// Upper bound on bytes pulled in by one non-blocking sweep, in frames.
const SWEEP_LIMIT_FRAMES: usize = 16;

/// A TCP stream plus the read buffer and decoder that turn it into frames.
///
/// Owned by exactly one `Session` (or by the acceptor while the handshake
/// is in flight). Dropping it closes the socket.
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    buffer: BytesMut,
    decoder: FrameDecoder,
}

impl Connection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, max_frame: usize) -> Self {
        let decoder = FrameDecoder::new(max_frame);
        Self {
            stream,
            peer_addr,
            buffer: BytesMut::with_capacity(decoder.max_frame()),
            decoder,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Read the next frame. `Ok(None)` means the peer closed the stream.
    pub async fn read_frame(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buffer) {
                return Ok(Some(frame));
            }
            // At most one frame's worth per read, like a bounded recv().
            let max = self.decoder.max_frame();
            self.buffer.reserve(max);
            let n = (&mut self.stream)
                .take(max as u64)
                .read_buf(&mut self.buffer)
                .await?;
            if n == 0 {
                return Ok(None);
            }
        }
    }

    pub async fn write_frame(&mut self, text: &str) -> io::Result<()> {
        self.stream.write_all(&encode_frame(text)).await?;
        self.stream.flush().await
    }

    /// Pull in whatever is already readable without waiting.
    ///
    /// Returns `true` if the peer has closed the stream or the socket is in
    /// an error state. Bytes read along the way stay buffered.
    ///
    /// A peer that has only shut down its write half also counts as closed,
    /// since it can no longer answer a ping.
    pub fn sweep(&mut self) -> bool {
        let limit = self.decoder.max_frame() * SWEEP_LIMIT_FRAMES;
        while self.buffer.len() < limit {
            self.buffer.reserve(self.decoder.max_frame());
            match self.stream.try_read_buf(&mut self.buffer) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(_) => return true,
            }
        }
        false
    }

    /// Drop everything buffered so far. Returns `true` if the peer closed.
    pub fn discard_pending(&mut self) -> bool {
        let closed = self.sweep();
        self.buffer.clear();
        self.decoder = FrameDecoder::new(self.decoder.max_frame());
        closed
    }

    /// Best-effort FIN to the peer. The socket itself closes on drop.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}
