//! Tunnel assembly and lifecycle.
//!
//! [`start`] wires the certificate provider, pairer, listener, status server
//! and metrics bridge together and returns a [`RunningTunnel`] handle. The
//! handle drives reloads and shutdown; the status server and metrics bridge
//! are stopped only after the listener has finished draining.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use ferry_credentials::CertificateProvider;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{Config, ModeConfig};
use crate::error::TunnelError;
use crate::status::metrics::MetricsBridge;
use crate::status::{server, Lifecycle, ProcessStatus, StatusReporter};
use crate::tunnel::{
    DrainOutcome, Listener, ListenerConfig, OriginateTls, Pairer, SpliceConfig, TerminateTls,
    TunnelStats,
};

/// Handle to a started tunnel.
pub struct RunningTunnel {
    listen_addr: SocketAddr,
    status_addr: Option<SocketAddr>,
    reporter: StatusReporter,
    credentials: Arc<CertificateProvider>,
    process: Arc<ProcessStatus>,
    shutdown_tx: watch::Sender<bool>,
    listener_task: JoinHandle<io::Result<DrainOutcome>>,
    aux_tx: watch::Sender<bool>,
    aux_tasks: Vec<JoinHandle<()>>,
}

/// Load credentials, bind sockets and start accepting.
///
/// Every error returned here is a startup failure: bad configuration,
/// unreadable credentials or an address that cannot be bound.
pub async fn start(config: Config) -> Result<RunningTunnel, TunnelError> {
    let mode = config.mode.name();
    let credentials = Arc::new(CertificateProvider::load(config.credentials.clone())?);

    let target = config.target.address();
    let pairer = match &config.mode {
        ModeConfig::Client { server_name } => Pairer::Originate(OriginateTls::new(
            target,
            server_name,
            Arc::clone(&credentials),
            config.connect_timeout,
        )?),
        ModeConfig::Server { policy } => Pairer::Terminate(TerminateTls::new(
            target,
            policy.clone(),
            Arc::clone(&credentials),
            config.connect_timeout,
        )?),
    };

    let stats = Arc::new(TunnelStats::default());
    let process = Arc::new(ProcessStatus::default());
    let reporter = StatusReporter::new(
        mode,
        Arc::clone(&stats),
        Arc::clone(&process),
        Arc::clone(&credentials),
    );

    // Bind and build everything that can fail before any task is spawned, so
    // a startup error leaves nothing running.
    let status_listener = match config.status_addr {
        Some(addr) => Some(TcpListener::bind(addr).await.map_err(|e| {
            TunnelError::Config(format!("failed to bind status address {addr}: {e}"))
        })?),
        None => None,
    };
    let status_addr = status_listener
        .as_ref()
        .map(TcpListener::local_addr)
        .transpose()?;

    let mut listener_config = ListenerConfig::new(config.listen.address());
    listener_config.max_connections = config.max_concurrent_conns;
    listener_config.splice = SpliceConfig::new(config.close_timeout);
    listener_config.shutdown_timeout = config.shutdown_timeout;

    let listener = Listener::bind(listener_config, pairer, stats)
        .await
        .map_err(|e| TunnelError::Config(format!("failed to bind {}: {e}", config.listen)))?;
    let listen_addr = listener.local_addr()?;

    let bridge = config
        .metrics
        .clone()
        .map(|metrics| MetricsBridge::new(metrics, reporter.clone()))
        .transpose()
        .map_err(|e| TunnelError::Config(format!("{e:#}")))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (aux_tx, aux_rx) = watch::channel(false);
    let mut aux_tasks = Vec::new();

    if let Some(status_listener) = status_listener {
        let task_reporter = reporter.clone();
        let prefix = config.metrics_prefix.clone();
        let stop = aux_rx.clone();
        aux_tasks.push(tokio::spawn(async move {
            if let Err(e) = server::serve(status_listener, task_reporter, prefix, stop).await {
                error!(error = %e, "Status server failed");
            }
        }));
    }

    process.set(Lifecycle::Listening);

    if let Some(bridge) = bridge {
        aux_tasks.push(tokio::spawn(bridge.run(aux_rx)));
    }

    let listener_task = tokio::spawn(listener.run(shutdown_rx));

    info!(
        mode,
        listen = %listen_addr,
        target = %config.target,
        status = ?status_addr,
        credential_version = credentials.current().version(),
        "Tunnel started"
    );

    Ok(RunningTunnel {
        listen_addr,
        status_addr,
        reporter,
        credentials,
        process,
        shutdown_tx,
        listener_task,
        aux_tx,
        aux_tasks,
    })
}

impl RunningTunnel {
    /// Address the data listener is bound to.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Address the status server is bound to, if enabled.
    pub fn status_addr(&self) -> Option<SocketAddr> {
        self.status_addr
    }

    pub fn reporter(&self) -> &StatusReporter {
        &self.reporter
    }

    pub fn credential_version(&self) -> u64 {
        self.credentials.current().version()
    }

    /// Reload credentials: listening -> reloading -> listening.
    ///
    /// Established pairs keep the credential they were paired with. On
    /// failure the previous credential stays active. Returns the active
    /// version afterwards.
    pub fn reload(&self) -> Result<u64, TunnelError> {
        if !self
            .process
            .transition(Lifecycle::Listening, Lifecycle::Reloading)
        {
            let status = self.process.get();
            warn!(status = status.as_str(), "Reload skipped");
            return Err(TunnelError::ReloadSkipped(status.as_str()));
        }

        let result = self.credentials.reload();
        self.process.record_reload(result.is_ok());
        // A shutdown that landed mid-reload keeps "stopping".
        self.process
            .transition(Lifecycle::Reloading, Lifecycle::Listening);

        match result {
            Ok(credential) => Ok(credential.version()),
            Err(e) => {
                error!(reason = "credentials_invalid", error = %e, "Reload failed");
                Err(e.into())
            }
        }
    }

    /// Stop accepting and start draining. Returns immediately.
    pub fn shutdown(&self) {
        self.process.set(Lifecycle::Stopping);
        info!(active = self.reporter.stats().active(), "Shutting down");
        self.shutdown_tx.send_replace(true);
    }

    /// Wait for the drain to finish, then stop the status server and metrics.
    pub async fn wait(self) -> Result<DrainOutcome, TunnelError> {
        let joined = self.listener_task.await;

        self.aux_tx.send_replace(true);
        for task in self.aux_tasks {
            let _ = task.await;
        }

        let outcome = joined.map_err(io::Error::other)??;
        info!(?outcome, "Tunnel stopped");
        Ok(outcome)
    }
}
