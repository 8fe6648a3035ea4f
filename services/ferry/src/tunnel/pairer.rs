//! Connection pairing.
//!
//! Turns one accepted inbound connection into a [`ConnectionPair`]: the TLS
//! handshake happens on the outbound leg in client mode and on the inbound
//! leg in server mode. Both modes share the same splicer afterwards.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ferry_credentials::{CertificateProvider, PeerIdentity};
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::debug;

use super::leg::Leg;
use super::policy::AccessPolicy;
use crate::error::TunnelError;

/// An inbound and outbound leg bound together for splicing.
#[derive(Debug)]
pub struct ConnectionPair {
    pub inbound: Leg,
    pub outbound: Leg,
    pub peer_addr: SocketAddr,
    /// Credential version used for the handshake.
    pub credential_version: u64,
}

/// Mode-specific pairing behaviour, chosen at configuration time.
pub enum Pairer {
    /// Client mode: plaintext in, TLS out.
    Originate(OriginateTls),
    /// Server mode: TLS in, plaintext out.
    Terminate(TerminateTls),
}

impl Pairer {
    /// Negotiate and dial, bounded by the connect timeout.
    ///
    /// On failure the inbound connection is dropped before any bytes are
    /// forwarded.
    pub async fn pair(
        &self,
        inbound: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<ConnectionPair, TunnelError> {
        let connect_timeout = self.connect_timeout();
        let negotiate = async {
            match self {
                Pairer::Originate(originate) => originate.pair(inbound, peer_addr).await,
                Pairer::Terminate(terminate) => terminate.pair(inbound, peer_addr).await,
            }
        };

        match tokio::time::timeout(connect_timeout, negotiate).await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::Timeout(connect_timeout)),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        match self {
            Pairer::Originate(originate) => originate.connect_timeout,
            Pairer::Terminate(terminate) => terminate.connect_timeout,
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Pairer::Originate(_) => "client",
            Pairer::Terminate(_) => "server",
        }
    }
}

/// Dial the target and perform a TLS client handshake.
pub struct OriginateTls {
    target: String,
    server_name: ServerName<'static>,
    credentials: Arc<CertificateProvider>,
    connect_timeout: Duration,
}

impl OriginateTls {
    pub fn new(
        target: String,
        server_name: &str,
        credentials: Arc<CertificateProvider>,
        connect_timeout: Duration,
    ) -> Result<Self, TunnelError> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| TunnelError::Config(format!("invalid server name '{server_name}': {e}")))?;

        Ok(Self {
            target,
            server_name,
            credentials,
            connect_timeout,
        })
    }

    async fn pair(
        &self,
        inbound: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<ConnectionPair, TunnelError> {
        // Captured once so a concurrent reload cannot change it mid-handshake.
        let credential = self.credentials.current();

        let outbound = dial(&self.target).await?;
        let connector = TlsConnector::from(credential.client_config());
        let tls = connector
            .connect(self.server_name.clone(), outbound)
            .await
            .map_err(TunnelError::Handshake)?;

        debug!(
            target = %self.target,
            credential_version = credential.version(),
            "TLS established to target"
        );

        Ok(ConnectionPair {
            inbound: Leg::from(inbound),
            outbound: Leg::from(TlsStream::Client(tls)),
            peer_addr,
            credential_version: credential.version(),
        })
    }
}

/// Accept a TLS client handshake, authorize the peer, dial the backend.
pub struct TerminateTls {
    target: String,
    policy: AccessPolicy,
    credentials: Arc<CertificateProvider>,
    connect_timeout: Duration,
}

impl TerminateTls {
    pub fn new(
        target: String,
        policy: AccessPolicy,
        credentials: Arc<CertificateProvider>,
        connect_timeout: Duration,
    ) -> Result<Self, TunnelError> {
        if credentials.current().server_config().is_none() {
            return Err(TunnelError::Config(
                "server mode requires a certificate and private key".to_string(),
            ));
        }

        Ok(Self {
            target,
            policy,
            credentials,
            connect_timeout,
        })
    }

    async fn pair(
        &self,
        inbound: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<ConnectionPair, TunnelError> {
        let credential = self.credentials.current();
        let config = credential.server_config().ok_or_else(|| {
            TunnelError::Config("server identity missing from credential".to_string())
        })?;

        let tls = TlsAcceptor::from(config)
            .accept(inbound)
            .await
            .map_err(TunnelError::Handshake)?;

        let peer_cert = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| TunnelError::PeerDenied("no client certificate".to_string()))?;
        let identity = PeerIdentity::from_der(peer_cert.as_ref())
            .map_err(|e| TunnelError::PeerDenied(e.to_string()))?;

        if !self.policy.allows(&identity) {
            return Err(TunnelError::PeerDenied(format!(
                "cn={:?} ou={:?} dns={:?} uri={:?} not allowed",
                identity.common_names,
                identity.organizational_units,
                identity.dns_names,
                identity.uris
            )));
        }

        debug!(
            peer_cn = ?identity.common_names,
            credential_version = credential.version(),
            "Client authenticated"
        );

        let outbound = dial(&self.target).await?;

        Ok(ConnectionPair {
            inbound: Leg::from(TlsStream::Server(tls)),
            outbound: Leg::from(outbound),
            peer_addr,
            credential_version: credential.version(),
        })
    }
}

async fn dial(target: &str) -> Result<TcpStream, TunnelError> {
    let stream = TcpStream::connect(target)
        .await
        .map_err(|source| TunnelError::Dial {
            addr: target.to_string(),
            source,
        })?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
