//! Connection counters shared by the data plane and the status reporter.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::TunnelError;

/// Process-wide connection counters.
///
/// Many writers (one per pair), read on demand by the status reporter.
#[derive(Debug, Default)]
pub struct TunnelStats {
    /// Total connections accepted under the concurrency budget.
    pub connections_accepted: AtomicU64,
    /// Connections currently pairing or splicing.
    pub connections_active: AtomicU64,
    /// Total connections finished, successfully or not.
    pub connections_closed: AtomicU64,
    /// Connections closed immediately because the budget was exhausted.
    pub connections_rejected: AtomicU64,
    /// Pairs established and handed to the splicer.
    pub pairs_established: AtomicU64,
    /// Pairing or splicing failures of any kind.
    pub errors: AtomicU64,
    /// TLS handshake, policy and pairing timeout failures.
    pub handshake_errors: AtomicU64,
    /// Target dial failures.
    pub dial_errors: AtomicU64,
    /// Bytes copied from the inbound leg to the outbound leg.
    pub bytes_upstream: AtomicU64,
    /// Bytes copied from the outbound leg to the inbound leg.
    pub bytes_downstream: AtomicU64,
}

impl TunnelStats {
    pub(crate) fn record_accept(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_close(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reject(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pair_error(&self, error: &TunnelError) {
        if matches!(error, TunnelError::Aborted) {
            return;
        }
        self.errors.fetch_add(1, Ordering::Relaxed);
        if error.is_handshake() {
            self.handshake_errors.fetch_add(1, Ordering::Relaxed);
        } else if matches!(error, TunnelError::Dial { .. }) {
            self.dial_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_splice_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }
}
