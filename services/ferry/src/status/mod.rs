//! Process health and metrics.
//!
//! The status reporter reads the tunnel counters, the lifecycle state and
//! the current credential; it never touches the data plane. Two consumers
//! sit on top of it:
//! - the status HTTP server (`/_status`, `/_metrics`, `/livez`)
//! - the metrics bridge, which pushes a JSON array to a collector

pub mod metrics;
pub mod server;

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ferry_credentials::CertificateProvider;
use serde::Serialize;

use crate::tunnel::TunnelStats;

/// Lifecycle of the process as reported to probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Starting,
    Listening,
    Reloading,
    Stopping,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Lifecycle::Listening,
            2 => Lifecycle::Reloading,
            3 => Lifecycle::Stopping,
            _ => Lifecycle::Starting,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Lifecycle::Starting => 0,
            Lifecycle::Listening => 1,
            Lifecycle::Reloading => 2,
            Lifecycle::Stopping => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Starting => "starting",
            Lifecycle::Listening => "listening",
            Lifecycle::Reloading => "reloading",
            Lifecycle::Stopping => "stopping",
        }
    }

    /// Whether new connections are being accepted in this state.
    pub fn is_accepting(self) -> bool {
        matches!(self, Lifecycle::Listening | Lifecycle::Reloading)
    }
}

/// Lifecycle state plus reload counters.
#[derive(Debug, Default)]
pub struct ProcessStatus {
    state: AtomicU8,
    reloads: AtomicU64,
    reload_failures: AtomicU64,
}

impl ProcessStatus {
    pub fn set(&self, state: Lifecycle) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub fn get(&self) -> Lifecycle {
        Lifecycle::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; false if the state was not `from`.
    pub fn transition(&self, from: Lifecycle, to: Lifecycle) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn record_reload(&self, succeeded: bool) {
        if succeeded {
            self.reloads.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reload_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn reloads(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }

    pub fn reload_failures(&self) -> u64 {
        self.reload_failures.load(Ordering::Relaxed)
    }
}

/// Credential freshness as reported to probes.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct CertificateStatus {
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    pub last_reload: DateTime<Utc>,
    /// False once the identity is outside its validity window.
    pub valid: bool,
}

/// Connection counters as reported to probes.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ConnectionCounters {
    pub active: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub closed: u64,
    pub errors: u64,
    pub handshake_errors: u64,
    pub dial_errors: u64,
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
}

/// Point-in-time view of process health.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct StatusSnapshot {
    /// True when accepting with a currently valid identity.
    pub ok: bool,
    pub status: Lifecycle,
    pub accepting: bool,
    pub mode: String,
    pub message: String,
    pub certificate: CertificateStatus,
    pub connections: ConnectionCounters,
    pub reloads: u64,
    pub reload_failures: u64,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

/// Read-only accessor over process-wide state.
#[derive(Clone)]
pub struct StatusReporter {
    inner: Arc<StatusReporterInner>,
}

struct StatusReporterInner {
    mode: &'static str,
    stats: Arc<TunnelStats>,
    process: Arc<ProcessStatus>,
    credentials: Arc<CertificateProvider>,
}

impl StatusReporter {
    pub fn new(
        mode: &'static str,
        stats: Arc<TunnelStats>,
        process: Arc<ProcessStatus>,
        credentials: Arc<CertificateProvider>,
    ) -> Self {
        Self {
            inner: Arc::new(StatusReporterInner {
                mode,
                stats,
                process,
                credentials,
            }),
        }
    }

    pub fn mode(&self) -> &'static str {
        self.inner.mode
    }

    pub fn stats(&self) -> &TunnelStats {
        &self.inner.stats
    }

    pub fn process(&self) -> &ProcessStatus {
        &self.inner.process
    }

    pub fn credentials(&self) -> &CertificateProvider {
        &self.inner.credentials
    }

    /// Build a snapshot from atomics; never blocks writers.
    pub fn snapshot(&self) -> StatusSnapshot {
        let now = Utc::now();
        let status = self.inner.process.get();
        let accepting = status.is_accepting();

        let credential = self.inner.credentials.current();
        let identity = credential.identity();
        let valid = identity.map(|i| i.is_valid_at(now)).unwrap_or(true);

        let message = match (status, valid) {
            (_, false) => "certificate outside its validity window",
            (Lifecycle::Starting, _) => "starting up",
            (Lifecycle::Listening, _) => "listening",
            (Lifecycle::Reloading, _) => "reloading credentials",
            (Lifecycle::Stopping, _) => "shutting down",
        };

        let stats = &self.inner.stats;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        StatusSnapshot {
            ok: accepting && valid,
            status,
            accepting,
            mode: self.inner.mode.to_string(),
            message: message.to_string(),
            certificate: CertificateStatus {
                version: credential.version(),
                subject: identity.map(|i| i.subject.clone()),
                not_before: identity.map(|i| i.not_before),
                not_after: identity.map(|i| i.not_after),
                last_reload: credential.loaded_at(),
                valid,
            },
            connections: ConnectionCounters {
                active: load(&stats.connections_active),
                accepted: load(&stats.connections_accepted),
                rejected: load(&stats.connections_rejected),
                closed: load(&stats.connections_closed),
                errors: load(&stats.errors),
                handshake_errors: load(&stats.handshake_errors),
                dial_errors: load(&stats.dial_errors),
                bytes_upstream: load(&stats.bytes_upstream),
                bytes_downstream: load(&stats.bytes_downstream),
            },
            reloads: self.inner.process.reloads(),
            reload_failures: self.inner.process.reload_failures(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestPki;

    #[test]
    fn test_lifecycle_roundtrip_through_atomic() {
        let process = ProcessStatus::default();
        assert_eq!(process.get(), Lifecycle::Starting);

        for state in [Lifecycle::Listening, Lifecycle::Reloading, Lifecycle::Stopping] {
            process.set(state);
            assert_eq!(process.get(), state);
        }
        assert!(!process.transition(Lifecycle::Listening, Lifecycle::Reloading));
        assert_eq!(process.get(), Lifecycle::Stopping);

        assert_eq!(Lifecycle::Reloading.as_str(), "reloading");
        assert!(!Lifecycle::Stopping.is_accepting());
        assert!(Lifecycle::Reloading.is_accepting());
    }

    #[test]
    fn test_snapshot_reflects_state() {
        let pki = TestPki::new();
        let reporter = StatusReporter::new(
            "server",
            Arc::new(TunnelStats::default()),
            Arc::new(ProcessStatus::default()),
            Arc::new(pki.provider("server")),
        );

        let starting = reporter.snapshot();
        assert!(!starting.ok);
        assert_eq!(starting.status, Lifecycle::Starting);

        reporter.process().set(Lifecycle::Listening);
        reporter
            .stats()
            .connections_accepted
            .fetch_add(3, Ordering::Relaxed);

        let listening = reporter.snapshot();
        assert!(listening.ok);
        assert!(listening.accepting);
        assert_eq!(listening.mode, "server");
        assert_eq!(listening.connections.accepted, 3);
        assert_eq!(listening.certificate.version, 1);
        assert!(listening.certificate.not_after.is_some());
    }

    #[test]
    fn test_snapshot_json_fields() {
        let pki = TestPki::new();
        let reporter = StatusReporter::new(
            "client",
            Arc::new(TunnelStats::default()),
            Arc::new(ProcessStatus::default()),
            Arc::new(pki.provider("client")),
        );
        reporter.process().set(Lifecycle::Stopping);

        let json = serde_json::to_value(reporter.snapshot()).unwrap();
        assert_eq!(json["status"], "stopping");
        assert_eq!(json["accepting"], false);
        assert!(json["certificate"]["not_before"].is_string());
        assert!(json["certificate"]["not_after"].is_string());
    }
}
