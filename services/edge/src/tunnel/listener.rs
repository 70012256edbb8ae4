//! Tunnel accept loop and per-connection handling.
//!
//! One `SocketTunnel` owns one listening socket. Each accepted connection
//! is counted, paired with exactly one dial to the destination port, and
//! relayed until either side goes away.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::activation::{ActivationError, InheritedListeners};
use super::relay::relay;
use crate::stats::ConnectionCounter;

/// Pause after a failed accept so persistent failures cannot spin.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Statistics for one tunnel.
#[derive(Debug, Default)]
pub struct TunnelStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Failed accept calls.
    pub accept_errors: AtomicU64,
    /// Dials to the destination port that failed.
    pub dial_failed: AtomicU64,
    /// Relays that ended with an I/O error.
    pub relay_errors: AtomicU64,
    /// Bytes relayed to the destination port.
    pub bytes_to_destination: AtomicU64,
    /// Bytes relayed back to clients.
    pub bytes_from_destination: AtomicU64,
}

/// Relays every connection accepted on one listening socket to a local port.
pub struct SocketTunnel {
    listener: TcpListener,
    destination: SocketAddr,
    counter: Arc<ConnectionCounter>,
    stats: Arc<TunnelStats>,
}

impl SocketTunnel {
    /// Tunnel connections from `listener` to `127.0.0.1:<destination_port>`.
    pub fn new(
        listener: TcpListener,
        destination_port: u16,
        counter: Arc<ConnectionCounter>,
    ) -> Self {
        Self {
            listener,
            destination: SocketAddr::from((Ipv4Addr::LOCALHOST, destination_port)),
            counter,
            stats: Arc::new(TunnelStats::default()),
        }
    }

    /// Tunnel the supervisor-provided listener at `index`.
    pub fn from_inherited(
        inherited: &mut InheritedListeners,
        index: usize,
        destination_port: u16,
        counter: Arc<ConnectionCounter>,
    ) -> Result<Self, ActivationError> {
        let listener = inherited.take(index)?;
        Ok(Self::new(listener, destination_port, counter))
    }

    /// Address of the listening socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Destination every connection is relayed to.
    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// Get tunnel statistics.
    pub fn stats(&self) -> Arc<TunnelStats> {
        Arc::clone(&self.stats)
    }

    /// Run the accept loop on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(Arc::new(self).run())
    }

    /// Accept and relay connections for the life of the process.
    pub async fn run(self: Arc<Self>) {
        let local_addr = self.listener.local_addr().ok();
        info!(
            listen_addr = ?local_addr,
            destination = %self.destination,
            "Tunnel started"
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let guard = self.counter.track();
                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);

                    let tunnel = Arc::clone(&self);
                    tokio::spawn(
                        async move {
                            tunnel.handle_connection(stream, peer_addr).await;
                            drop(guard);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    self.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "Tunnel accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Relay a single accepted connection.
    async fn handle_connection(&self, client: TcpStream, peer_addr: SocketAddr) {
        let accepted_at = Instant::now();

        let destination = match TcpStream::connect(self.destination).await {
            Ok(stream) => stream,
            Err(e) => {
                self.stats.dial_failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    destination = %self.destination,
                    error = %e,
                    "Failed to open tunnel"
                );
                return;
            }
        };

        for (side, stream) in [("client", &client), ("destination", &destination)] {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(side, error = %e, "Failed to set TCP_NODELAY");
            }
        }

        let outcome = relay(client, destination).await;

        self.stats
            .bytes_to_destination
            .fetch_add(outcome.bytes_to_destination, Ordering::Relaxed);
        self.stats
            .bytes_from_destination
            .fetch_add(outcome.bytes_from_destination, Ordering::Relaxed);

        if let Some(e) = &outcome.error {
            self.stats.relay_errors.fetch_add(1, Ordering::Relaxed);
            let closed_by = outcome.closed_by;
            if is_disconnect(e) {
                debug!(?closed_by, error = %e, "Tunnel peer disconnected");
            } else {
                warn!(?closed_by, error = %e, "Tunnel relay error");
            }
        }

        debug!(
            peer_addr = %peer_addr,
            closed_by = ?outcome.closed_by,
            bytes_to_destination = outcome.bytes_to_destination,
            bytes_from_destination = outcome.bytes_from_destination,
            duration_ms = accepted_at.elapsed().as_millis() as u64,
            "Tunnel connection closed"
        );
    }
}

/// Errors that just mean the other end hung up.
fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
