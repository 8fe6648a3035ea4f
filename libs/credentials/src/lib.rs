//! # ferry-credentials
//!
//! TLS credential material for the ferry tunnel.
//!
//! ## Design Principles
//!
//! - A [`Credential`] is immutable once built; reloads replace it, never mutate it
//! - Readers take an `Arc<Credential>` snapshot, so an in-flight handshake keeps
//!   the version it started with even if a reload lands mid-handshake
//! - TLS configs are built once per credential version, not per connection
//! - A failed reload leaves the previous credential in place
//!
//! ## Files
//!
//! Material is read from PEM files. An identity is either a keystore bundle
//! (certificate chain and private key in one file) or a separate certificate
//! and key pair. Trusted roots always come from a CA bundle.

mod error;
mod identity;
mod pem;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::{debug, info, warn};

pub use error::CredentialError;
pub use identity::{IdentityInfo, PeerIdentity};

/// Where the local identity comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySource {
    /// One PEM file containing the certificate chain and private key.
    Keystore(PathBuf),
    /// Separate certificate chain and private key files.
    CertAndKey { cert: PathBuf, key: PathBuf },
    /// No local identity (client mode with authentication disabled).
    Anonymous,
}

/// File locations for a credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSource {
    pub identity: IdentitySource,
    /// PEM bundle of trusted roots used to verify the peer.
    pub cacert: PathBuf,
}

/// One immutable version of the TLS credential material.
pub struct Credential {
    version: u64,
    loaded_at: DateTime<Utc>,
    identity: Option<IdentityInfo>,
    client_config: Arc<ClientConfig>,
    server_config: Option<Arc<ServerConfig>>,
}

impl Credential {
    /// Read and validate the material described by `source`.
    pub fn build(source: &CredentialSource, version: u64) -> Result<Self, CredentialError> {
        let roots = Arc::new(load_roots(source)?);
        let identity = load_identity(&source.identity)?;
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let client_config = build_client_config(&provider, &roots, identity.as_ref())?;
        let server_config = match &identity {
            Some((chain, key)) => Some(build_server_config(&provider, &roots, chain, key)?),
            None => None,
        };

        let identity = match &identity {
            Some((chain, _)) => Some(IdentityInfo::from_der(&chain[0])?),
            None => None,
        };

        Ok(Self {
            version,
            loaded_at: Utc::now(),
            identity,
            client_config: Arc::new(client_config),
            server_config: server_config.map(Arc::new),
        })
    }

    /// Monotonic version, starting at 1 for the initial load.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// When this version was read from disk.
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Metadata for the local identity, if one is configured.
    pub fn identity(&self) -> Option<&IdentityInfo> {
        self.identity.as_ref()
    }

    /// Config for originating TLS: verifies the server against the trusted
    /// roots and presents the identity when one is loaded.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.client_config)
    }

    /// Config for terminating TLS: requires a client certificate chaining to
    /// the trusted roots. `None` when no identity is loaded.
    pub fn server_config(&self) -> Option<Arc<ServerConfig>> {
        self.server_config.clone()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("version", &self.version)
            .field("loaded_at", &self.loaded_at)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Owner of the current credential.
///
/// Many handshakes read, one reload task writes.
pub struct CertificateProvider {
    source: CredentialSource,
    current: ArcSwap<Credential>,
    next_version: AtomicU64,
}

impl CertificateProvider {
    /// Initial load. Any failure here is a configuration error.
    pub fn load(source: CredentialSource) -> Result<Self, CredentialError> {
        let credential = Credential::build(&source, 1)?;
        info!(
            version = credential.version(),
            subject = credential.identity().map(|i| i.subject.as_str()).unwrap_or("-"),
            "Credentials loaded"
        );

        Ok(Self {
            source,
            current: ArcSwap::from_pointee(credential),
            next_version: AtomicU64::new(2),
        })
    }

    /// Snapshot of the current credential.
    pub fn current(&self) -> Arc<Credential> {
        self.current.load_full()
    }

    /// Re-read the files and swap in a new version.
    ///
    /// Handshakes holding an older snapshot are unaffected.
    pub fn reload(&self) -> Result<Arc<Credential>, CredentialError> {
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        debug!(version, "Reloading credentials");

        let credential = match Credential::build(&self.source, version) {
            Ok(credential) => Arc::new(credential),
            Err(e) => {
                warn!(
                    error = %e,
                    active_version = self.current.load().version(),
                    "Credential reload failed, keeping previous version"
                );
                return Err(e);
            }
        };

        self.current.store(Arc::clone(&credential));
        info!(version, "Credentials reloaded");
        Ok(credential)
    }

    /// The file locations this provider reads.
    pub fn source(&self) -> &CredentialSource {
        &self.source
    }
}

type Identity = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

fn load_roots(source: &CredentialSource) -> Result<RootCertStore, CredentialError> {
    let pem = pem::read_file(&source.cacert)?;
    let certs = pem::parse_certs(&pem, &source.cacert)?;

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        warn!(path = %source.cacert.display(), ignored, "Skipped unparsable CA certificates");
    }
    if added == 0 {
        return Err(CredentialError::NoCertificates(source.cacert.clone()));
    }

    Ok(roots)
}

fn load_identity(source: &IdentitySource) -> Result<Option<Identity>, CredentialError> {
    match source {
        IdentitySource::Keystore(path) => {
            let pem = pem::read_file(path)?;
            let chain = pem::parse_certs(&pem, path)?;
            let key = pem::parse_key(&pem, path)?;
            Ok(Some((chain, key)))
        }
        IdentitySource::CertAndKey { cert, key } => {
            let chain = pem::parse_certs(&pem::read_file(cert)?, cert)?;
            let key = pem::parse_key(&pem::read_file(key)?, key)?;
            Ok(Some((chain, key)))
        }
        IdentitySource::Anonymous => Ok(None),
    }
}

fn build_client_config(
    provider: &Arc<CryptoProvider>,
    roots: &Arc<RootCertStore>,
    identity: Option<&Identity>,
) -> Result<ClientConfig, CredentialError> {
    let builder = ClientConfig::builder_with_provider(Arc::clone(provider))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(Arc::clone(roots));

    let config = match identity {
        Some((chain, key)) => builder.with_client_auth_cert(chain.clone(), key.clone_key())?,
        None => builder.with_no_client_auth(),
    };

    Ok(config)
}

fn build_server_config(
    provider: &Arc<CryptoProvider>,
    roots: &Arc<RootCertStore>,
    chain: &[CertificateDer<'static>],
    key: &PrivateKeyDer<'static>,
) -> Result<ServerConfig, CredentialError> {
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::clone(roots), Arc::clone(provider))
        .build()
        .map_err(|e| CredentialError::Verifier(e.to_string()))?;

    let config = ServerConfig::builder_with_provider(Arc::clone(provider))
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain.to_vec(), key.clone_key())?;

    Ok(config)
}
