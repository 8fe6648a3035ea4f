//! Error types for the tunnel.

use std::time::Duration;

use ferry_credentials::CredentialError;
use thiserror::Error;

/// Tunnel errors with standardized reason codes.
///
/// Only `Config` and `Credentials` at startup are fatal; everything else is
/// scoped to one pairing attempt or one pair.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Invalid endpoint, flag combination or unusable setting.
    #[error("config_invalid: {0}")]
    Config(String),

    /// Credential material could not be loaded.
    #[error("credentials_invalid: {0}")]
    Credentials(#[from] CredentialError),

    /// TLS handshake failed (chain invalid, name mismatch, protocol error).
    #[error("handshake_failed: {0}")]
    Handshake(#[source] std::io::Error),

    /// Peer presented a valid chain but is not allowed by the access policy.
    #[error("peer_denied: {0}")]
    PeerDenied(String),

    /// Could not connect to the target.
    #[error("dial_failed: {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Dial plus handshake did not finish within the connect timeout.
    #[error("pairing_timeout: exceeded {0:?}")]
    Timeout(Duration),

    /// Pairing was interrupted by shutdown.
    #[error("aborted: shutting down")]
    Aborted,

    /// Credential reload refused because the tunnel is not listening.
    #[error("reload_skipped: tunnel is {0}")]
    ReloadSkipped(&'static str),

    /// Data-plane or socket error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            TunnelError::Config(_) => "config_invalid",
            TunnelError::Credentials(_) => "credentials_invalid",
            TunnelError::Handshake(_) => "handshake_failed",
            TunnelError::PeerDenied(_) => "peer_denied",
            TunnelError::Dial { .. } => "dial_failed",
            TunnelError::Timeout(_) => "pairing_timeout",
            TunnelError::Aborted => "aborted",
            TunnelError::ReloadSkipped(_) => "reload_skipped",
            TunnelError::Io(_) => "io_error",
        }
    }

    /// Whether the failure happened while negotiating TLS or authorizing the peer.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            TunnelError::Handshake(_) | TunnelError::PeerDenied(_) | TunnelError::Timeout(_)
        )
    }
}
