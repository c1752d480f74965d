//! Outbound transport link and wire framing.
//!
//! A [`TransportLink`] is one persistent outbound TCP connection from a
//! sampling registry to the collector. Every payload is written as a single
//! length-prefixed frame (4-byte big-endian length, then the payload), so
//! the receiving side can delimit messages without any in-band markers.
//!
//! Failures are terminal: a link that cannot connect or that fails a send is
//! released by its owner, never retried.

use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Upper bound on a single frame payload (1 MiB). A peer announcing more is
/// treated as a corrupt stream.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Errors produced by the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The collector is unreachable.
    #[error("failed to connect to collector at {addr}: {source}")]
    Connect {
        /// Collector address that refused the connection.
        addr: SocketAddr,
        /// Underlying socket error.
        source: std::io::Error,
    },

    /// A write failed part-way (reset, broken pipe).
    #[error("send failed: {0}")]
    Send(#[from] std::io::Error),

    /// Payload exceeds [`MAX_FRAME_LEN`].
    #[error("payload of {0} bytes exceeds maximum frame length")]
    Oversize(usize),

    /// The link was already closed.
    #[error("transport link is closed")]
    Closed,
}

/// Persistent outbound connection to the collector.
pub struct TransportLink {
    stream: Option<TcpStream>,
    peer: SocketAddr,
}

impl TransportLink {
    /// Establish the outbound connection.
    pub async fn open(addr: SocketAddr) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Connect { addr, source })?;
        tracing::debug!(collector = %addr, "Transport link established");
        Ok(Self {
            stream: Some(stream),
            peer: addr,
        })
    }

    /// Collector address this link is connected to.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Write one payload as a length-prefixed frame.
    ///
    /// Any error leaves the link unusable; callers release the link rather
    /// than retrying.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        write_frame(stream, payload).await
    }

    /// Close the link. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!(collector = %self.peer, error = %e, "Error shutting down link");
            }
        }
    }
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink")
            .field("peer", &self.peer)
            .field("open", &self.stream.is_some())
            .finish()
    }
}

/// Write `payload` as one length-prefixed frame.
pub async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<(), TransportError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(TransportError::Oversize(payload.len()));
    }
    let len = (payload.len() as u32).to_be_bytes();
    stream.write_all(&len).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly between
/// frames. EOF in the middle of a frame, or a length above
/// [`MAX_FRAME_LEN`], is an error.
pub async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    // Only EOF before the first prefix byte counts as a clean disconnect;
    // EOF inside the prefix is a truncated frame, like EOF mid-payload.
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = stream.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed inside frame prefix",
            ));
        }
        filled += n;
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds maximum"),
        ));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;
    use tokio::net::TcpListener;

    async fn bind_ephemeral() -> Option<(TcpListener, SocketAddr)> {
        match TcpListener::bind("127.0.0.1:0").await {
            Ok(l) => {
                let addr = l.local_addr().unwrap();
                Some((l, addr))
            }
            // Some sandboxed environments disallow binding; skip the test.
            Err(e) if e.kind() == ErrorKind::PermissionDenied => None,
            Err(e) => panic!("Failed to bind test listener: {e}"),
        }
    }

    #[tokio::test]
    async fn test_open_send_and_read_back() {
        let Some((listener, addr)) = bind_ephemeral().await else {
            return;
        };

        let mut link = TransportLink::open(addr).await.unwrap();
        let (mut server_side, _) = listener.accept().await.unwrap();

        link.send(b"hello").await.unwrap();
        link.send(b"").await.unwrap();

        let first = read_frame(&mut server_side).await.unwrap();
        assert_eq!(first.as_deref(), Some(&b"hello"[..]));
        let second = read_frame(&mut server_side).await.unwrap();
        assert_eq!(second.as_deref(), Some(&b""[..]));

        link.close().await;
        let eof = read_frame(&mut server_side).await.unwrap();
        assert!(eof.is_none(), "clean close should read as EOF");
    }

    #[tokio::test]
    async fn test_open_unreachable_is_connect_error() {
        // Port 1 on loopback is essentially never listening.
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = TransportLink::open(addr).await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_send_after_close_is_closed_error() {
        let Some((listener, addr)) = bind_ephemeral().await else {
            return;
        };
        let mut link = TransportLink::open(addr).await.unwrap();
        let _accepted = listener.accept().await.unwrap();

        link.close().await;
        link.close().await; // idempotent
        assert!(matches!(
            link.send(b"x").await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_oversize_payload_rejected() {
        let Some((listener, addr)) = bind_ephemeral().await else {
            return;
        };
        let mut link = TransportLink::open(addr).await.unwrap();
        let _accepted = listener.accept().await.unwrap();

        let payload = vec![0u8; MAX_FRAME_LEN + 1];
        assert!(matches!(
            link.send(&payload).await,
            Err(TransportError::Oversize(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let Some((listener, addr)) = bind_ephemeral().await else {
            return;
        };
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut server_side, _) = listener.accept().await.unwrap();

        // Announce 100 bytes but send only 3, then close.
        client.write_all(&100u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        assert!(read_frame(&mut server_side).await.is_err());
    }

    #[tokio::test]
    async fn test_eof_inside_prefix_is_error() {
        let Some((listener, addr)) = bind_ephemeral().await else {
            return;
        };
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut server_side, _) = listener.accept().await.unwrap();

        // Two of the four prefix bytes, then close: a truncated frame, not
        // a clean disconnect.
        client.write_all(&[0x00, 0x00]).await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        let result = read_frame(&mut server_side).await;
        assert!(result.is_err(), "partial prefix must not read as clean EOF");
    }
}
