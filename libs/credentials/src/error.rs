//! Error types for credential loading.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading or building TLS credentials.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// A credential file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file contained no PEM certificates.
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    /// The file contained no PEM private key.
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    /// A certificate could not be parsed as X.509.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// rustls rejected the material while building a config.
    #[error("tls config error: {0}")]
    Tls(#[from] rustls::Error),

    /// The client certificate verifier could not be built.
    #[error("client verifier error: {0}")]
    Verifier(String),
}

impl CredentialError {
    /// Returns true if the error came from the filesystem rather than the material itself.
    pub fn is_io(&self) -> bool {
        matches!(self, CredentialError::Read { .. })
    }
}
