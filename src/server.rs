//! Collector server.
//!
//! Accepts inbound monitor connections and ingests their snapshot streams.
//! One task runs the accept loop; each accepted connection gets its own
//! handler task that reads length-prefixed frames and forwards them to a
//! pluggable [`DeliverySink`]. Per-connection failures never affect other
//! connections or the accept loop.
//!
//! Shutdown is cooperative: [`CollectorServer::stop`] flips a watch channel
//! that every handler selects on, so stopping completes even when a
//! connected peer is idle and never sends a byte.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::transport::read_frame;

/// Errors produced by the collector server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening address could not be bound.
    #[error("failed to bind collector on {addr}: {source}")]
    Bind {
        /// Requested bind address.
        addr: SocketAddr,
        /// Underlying socket error.
        source: std::io::Error,
    },

    /// The accept loop task failed to join.
    #[error("accept loop failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// One raw frame received from a connected monitor, attributed to the
/// connection it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Peer address of the sending connection.
    pub peer: SocketAddr,
    /// Raw frame payload.
    pub payload: Vec<u8>,
}

/// Consumer of received frames.
///
/// The reference consumer just logs payloads; tests and embedding
/// applications typically use the [`mpsc::Sender`] implementation to drain
/// deliveries through a channel.
#[async_trait]
pub trait DeliverySink: Send + Sync + 'static {
    /// Accept one received frame. Called from the connection's handler
    /// task, in the order frames arrived on that connection.
    async fn deliver(&self, delivery: Delivery);
}

#[async_trait]
impl DeliverySink for mpsc::Sender<Delivery> {
    async fn deliver(&self, delivery: Delivery) {
        if self.send(delivery).await.is_err() {
            tracing::warn!("Delivery receiver dropped, discarding frame");
        }
    }
}

/// Live connections, keyed by peer address. Locked only for list mutation;
/// reads on the sockets happen outside the lock.
type ConnectionTable = Mutex<HashMap<SocketAddr, JoinHandle<()>>>;

/// Collector accepting monitor connections and ingesting snapshot streams.
///
/// Lifecycle is `start -> stop`; a stopped server is not restarted, a new
/// one is created.
pub struct CollectorServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    connections: Arc<ConnectionTable>,
}

impl CollectorServer {
    /// Bind `addr` and start accepting connections.
    ///
    /// Binding port 0 picks an ephemeral port; the effective address is
    /// available through [`CollectorServer::local_addr`].
    pub async fn start(
        addr: SocketAddr,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let connections: Arc<ConnectionTable> = Arc::new(Mutex::new(HashMap::new()));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            shutdown_rx,
            Arc::clone(&connections),
            sink,
        ));

        tracing::info!(addr = %local_addr, "Collector listening");
        Ok(Self {
            local_addr,
            shutdown,
            accept_task,
            connections,
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of currently connected monitors.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Stop accepting, then wait for the accept loop and every connection
    /// handler to exit. Idle connections are interrupted by the shutdown
    /// signal, so this does not hang on a silent peer.
    pub async fn stop(self) -> Result<(), ServerError> {
        let _ = self.shutdown.send(true);
        self.accept_task.await?;

        let handles: Vec<(SocketAddr, JoinHandle<()>)> = match self.connections.lock() {
            Ok(mut table) => table.drain().collect(),
            Err(_) => Vec::new(),
        };
        for (peer, handle) in handles {
            if let Err(e) = handle.await {
                tracing::warn!(%peer, error = %e, "Connection handler did not exit cleanly");
            }
        }
        tracing::info!("Collector stopped");
        Ok(())
    }
}

impl std::fmt::Debug for CollectorServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorServer")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

/// Accept connections until shutdown is signalled, spawning one handler
/// task per connection.
async fn accept_loop(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    connections: Arc<ConnectionTable>,
    sink: Arc<dyn DeliverySink>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::info!(%peer, "Monitor connected");
                    let handler = tokio::spawn(handle_connection(
                        stream,
                        peer,
                        shutdown.clone(),
                        Arc::clone(&connections),
                        Arc::clone(&sink),
                    ));
                    if let Ok(mut table) = connections.lock() {
                        table.insert(peer, handler);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                }
            }
        }
    }
    tracing::debug!("Accept loop exited");
}

/// Read frames from one connection and forward them to the sink until the
/// peer disconnects, a read fails, or shutdown is signalled. End-of-stream
/// is normal termination; a read error gets the same cleanup.
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
    connections: Arc<ConnectionTable>,
    sink: Arc<dyn DeliverySink>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::debug!(%peer, "Handler interrupted by shutdown");
                break;
            }
            frame = read_frame(&mut stream) => match frame {
                Ok(Some(payload)) => sink.deliver(Delivery { peer, payload }).await,
                Ok(None) => {
                    tracing::info!(%peer, "Monitor disconnected");
                    break;
                }
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "Read failed, dropping connection");
                    break;
                }
            }
        }
    }
    if let Ok(mut table) = connections.lock() {
        table.remove(&peer);
    }
}
