//! TCP listener and connection handling.
//!
//! Accepts connections, hands each one to the pairer in its own task, then
//! splices the resulting pair.
//!
//! - Concurrency is bounded by a semaphore; connections over the budget are
//!   closed immediately rather than queued
//! - A slow handshake never blocks the accept loop
//! - On shutdown the loop stops accepting, in-flight handshakes are aborted,
//!   established pairs get `shutdown_timeout` to drain and are then
//!   force-closed

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::pairer::Pairer;
use super::splice::{splice, PairOutcome, SpliceConfig};
use super::stats::TunnelStats;
use crate::config::DEFAULT_MAX_CONCURRENT_CONNS;
use crate::error::TunnelError;

/// Default time allowed for pairs to drain after shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(300);

/// Grace period for force-closed pairs to unwind.
const ABORT_GRACE: Duration = Duration::from_secs(1);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to (`host:port`).
    pub bind_addr: String,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Splice settings for every pair.
    pub splice: SpliceConfig,
    /// Drain budget on shutdown.
    pub shutdown_timeout: Duration,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            max_connections: DEFAULT_MAX_CONCURRENT_CONNS,
            splice: SpliceConfig::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// How the listener finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every pair finished within the shutdown timeout.
    Drained,
    /// Some pairs were force-closed at the deadline.
    ForceClosed,
}

/// State shared by every connection task.
struct ConnectionContext {
    pairer: Pairer,
    splice: SpliceConfig,
    stats: Arc<TunnelStats>,
}

/// The accepting side of the tunnel.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    context: Arc<ConnectionContext>,
    conn_semaphore: Arc<Semaphore>,
    abort_tx: watch::Sender<bool>,
}

impl Listener {
    /// Bind the listen socket.
    pub async fn bind(
        config: ListenerConfig,
        pairer: Pairer,
        stats: Arc<TunnelStats>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            mode = pairer.mode(),
            max_connections = config.max_connections,
            "Listener bound"
        );

        let (abort_tx, _) = watch::channel(false);

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            context: Arc::new(ConnectionContext {
                pairer,
                splice: config.splice.clone(),
                stats,
            }),
            listener,
            config,
            abort_tx,
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `shutdown` flips to true, then drain.
    ///
    /// The listen socket is released when this returns.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> io::Result<DrainOutcome> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.dispatch(stream, peer_addr, &shutdown),
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        // Brief sleep to avoid tight loop on persistent errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = signalled(&mut shutdown) => {
                    info!(bind_addr = %local_addr, "Listener stopped accepting");
                    break;
                }
            }
        }

        let outcome = self.drain().await;
        drop(self.listener);
        info!(bind_addr = %local_addr, ?outcome, "Listener closed");
        Ok(outcome)
    }

    fn dispatch(&self, stream: TcpStream, peer_addr: SocketAddr, shutdown: &watch::Receiver<bool>) {
        let stats = &self.context.stats;

        // Try to acquire a permit
        let permit = match self.conn_semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                stats.record_reject();
                warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                return;
            }
        };

        stats.record_accept();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let context = Arc::clone(&self.context);
        let shutdown = shutdown.clone();
        let abort = self.abort_tx.subscribe();

        tokio::spawn(
            async move {
                context.handle_connection(stream, peer_addr, shutdown, abort).await;
                context.stats.record_close();
                drop(permit);
            }
            .instrument(tracing::info_span!("connection", peer = %peer_addr)),
        );
    }

    async fn drain(&self) -> DrainOutcome {
        let active = self.context.stats.active();
        if active > 0 {
            info!(
                active,
                shutdown_timeout = ?self.config.shutdown_timeout,
                "Waiting for pairs to drain"
            );
        }

        // Every permit back means every connection task has finished.
        let all = self.config.max_connections as u32;
        let drained =
            tokio::time::timeout(self.config.shutdown_timeout, self.conn_semaphore.acquire_many(all))
                .await;
        if drained.is_ok() {
            return DrainOutcome::Drained;
        }

        warn!(
            active = self.context.stats.active(),
            "Shutdown timeout reached, force-closing pairs"
        );
        let _ = self.abort_tx.send(true);
        let _ = tokio::time::timeout(ABORT_GRACE, self.conn_semaphore.acquire_many(all)).await;
        DrainOutcome::ForceClosed
    }
}

impl ConnectionContext {
    /// Pair and splice a single connection.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
        mut abort: watch::Receiver<bool>,
    ) {
        debug!(peer_addr = %peer_addr, "Handling connection");

        let paired = tokio::select! {
            result = self.pairer.pair(stream, peer_addr) => result,
            _ = signalled(&mut shutdown) => Err(TunnelError::Aborted),
        };

        let pair = match paired {
            Ok(pair) => pair,
            Err(e) => {
                self.stats.record_pair_error(&e);
                match &e {
                    TunnelError::Aborted => debug!("Pairing aborted by shutdown"),
                    _ => warn!(reason = e.reason_code(), error = %e, "Pairing failed"),
                }
                return;
            }
        };

        self.stats
            .pairs_established
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        debug!(credential_version = pair.credential_version, "Pair established");

        let report = tokio::select! {
            report = splice(pair.inbound, pair.outbound, &self.splice, &self.stats) => report,
            _ = signalled(&mut abort) => {
                self.stats.record_splice_error();
                warn!("Pair force-closed at shutdown deadline");
                return;
            }
        };

        if report.outcome == PairOutcome::ClosedError {
            self.stats.record_splice_error();
        }

        debug!(
            bytes_upstream = report.bytes_upstream,
            bytes_downstream = report.bytes_downstream,
            first_closed = %report.first_closed,
            outcome = ?report.outcome,
            "Connection closed"
        );
    }
}

/// Resolve once the flag is set; never resolves if the sender is gone.
async fn signalled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|set| *set).await.is_err() {
        std::future::pending::<()>().await;
    }
}
