//! Test harness for ferry integration tests.
//!
//! Provides a throwaway PKI, mutual-TLS and plaintext test servers, TLS
//! clients, and helpers to start tunnels in-process.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

use clap::Parser;
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::{client, TlsAcceptor, TlsConnector};

use ferry::config::{Cli, Config};
use ferry::{RunningTunnel, TunnelError};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A CA plus leaf certificates, written to a temp directory.
pub struct TestPki {
    dir: TempDir,
    ca: Certificate,
    ca_key: KeyPair,
}

/// A leaf certificate in both PEM and DER form.
pub struct Issued {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
}

#[allow(dead_code)]
impl TestPki {
    pub fn new() -> Self {
        init_crypto_provider();

        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, "ferry test root");
        let ca_key = KeyPair::generate().unwrap();
        let ca = params.self_signed(&ca_key).unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("root.crt"), ca.pem()).unwrap();

        Self { dir, ca, ca_key }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn cacert(&self) -> PathBuf {
        self.path("root.crt")
    }

    /// Issue a leaf for `cn` with a `localhost` DNS SAN.
    pub fn issue(&self, cn: &str, ou: Option<&str>) -> Issued {
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        if let Some(ou) = ou {
            params
                .distinguished_name
                .push(DnType::OrganizationalUnitName, ou);
        }
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.ca, &self.ca_key).unwrap();

        Issued {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            cert_der: cert.der().clone(),
            key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        }
    }

    /// Write `<cn>.pem` holding the certificate and key; returns its path.
    pub fn write_keystore(&self, cn: &str) -> PathBuf {
        let issued = self.issue(cn, None);
        let path = self.path(&format!("{cn}.pem"));
        std::fs::write(&path, format!("{}{}", issued.cert_pem, issued.key_pem)).unwrap();
        path
    }

    fn roots(&self) -> Arc<RootCertStore> {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca.der().clone()).unwrap();
        Arc::new(roots)
    }

    /// Server config that requires a client certificate from this CA.
    pub fn server_config(&self, cn: &str) -> Arc<ServerConfig> {
        let issued = self.issue(cn, None);
        let verifier = WebPkiClientVerifier::builder(self.roots()).build().unwrap();
        let config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(vec![issued.cert_der], issued.key_der)
            .unwrap();
        Arc::new(config)
    }

    /// Client config trusting this CA, optionally presenting a certificate.
    pub fn client_config(&self, cn: Option<&str>, ou: Option<&str>) -> Arc<ClientConfig> {
        let builder = ClientConfig::builder().with_root_certificates(self.roots());
        let config = match cn {
            Some(cn) => {
                let issued = self.issue(cn, ou);
                builder
                    .with_client_auth_cert(vec![issued.cert_der], issued.key_der)
                    .unwrap()
            }
            None => builder.with_no_client_auth(),
        };
        Arc::new(config)
    }
}

/// What a [`TlsTestServer`] does with each connection.
#[derive(Debug, Clone, Copy)]
pub enum ServerBehavior {
    /// Echo until the client closes.
    Echo,
    /// Read `hello world`, answer `hello world`, then close.
    HelloThenClose,
    /// Send `hello world` before reading anything, read `hello world`, then close.
    SpeakFirstThenClose,
    /// Read until the client half-closes, answer `final-response`, then close.
    ReplyAfterEof,
}

/// Mutual-TLS server standing in for the remote peer in client mode.
#[allow(dead_code)]
pub struct TlsTestServer {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub received: Arc<Mutex<Vec<u8>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TlsTestServer {
    pub async fn spawn(pki: &TestPki, behavior: ServerBehavior) -> io::Result<Self> {
        let acceptor = TlsAcceptor::from(pki.server_config("server"));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let connections = Arc::new(AtomicU64::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));

        let conn_clone = Arc::clone(&connections);
        let received_clone = Arc::clone(&received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        let Ok((stream, _)) = accept_result else { break };
                        let acceptor = acceptor.clone();
                        let connections = Arc::clone(&conn_clone);
                        let received = Arc::clone(&received_clone);
                        tokio::spawn(async move {
                            let Ok(mut tls) = acceptor.accept(stream).await else { return };
                            connections.fetch_add(1, Ordering::Relaxed);

                            match behavior {
                                ServerBehavior::Echo => {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match tls.read(&mut buf).await {
                                            Ok(0) | Err(_) => break,
                                            Ok(n) => {
                                                received.lock().unwrap().extend_from_slice(&buf[..n]);
                                                if tls.write_all(&buf[..n]).await.is_err()
                                                    || tls.flush().await.is_err()
                                                {
                                                    break;
                                                }
                                            }
                                        }
                                    }
                                    let _ = tls.shutdown().await;
                                }
                                ServerBehavior::HelloThenClose => {
                                    let mut buf = [0u8; 11];
                                    if tls.read_exact(&mut buf).await.is_ok() {
                                        received.lock().unwrap().extend_from_slice(&buf);
                                        let _ = tls.write_all(b"hello world").await;
                                        let _ = tls.flush().await;
                                    }
                                    let _ = tls.shutdown().await;
                                }
                                ServerBehavior::SpeakFirstThenClose => {
                                    if tls.write_all(b"hello world").await.is_ok()
                                        && tls.flush().await.is_ok()
                                    {
                                        let mut buf = [0u8; 11];
                                        if tls.read_exact(&mut buf).await.is_ok() {
                                            received.lock().unwrap().extend_from_slice(&buf);
                                        }
                                    }
                                    let _ = tls.shutdown().await;
                                }
                                ServerBehavior::ReplyAfterEof => {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match tls.read(&mut buf).await {
                                            Ok(0) | Err(_) => break,
                                            Ok(n) => {
                                                received.lock().unwrap().extend_from_slice(&buf[..n]);
                                            }
                                        }
                                    }
                                    let _ = tls.write_all(b"final-response").await;
                                    let _ = tls.flush().await;
                                    let _ = tls.shutdown().await;
                                }
                            }
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for TlsTestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Plaintext echo backend standing in for the local service in server mode.
#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let conn_clone = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        let Ok((mut stream, _)) = accept_result else { break };
                        conn_clone.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(async move {
                            let mut buf = vec![0u8; 8192];
                            loop {
                                match stream.read(&mut buf).await {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => {
                                        if stream.write_all(&buf[..n]).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Connect to a server-mode tunnel as a TLS client.
#[allow(dead_code)]
pub async fn tls_client_connect(
    addr: SocketAddr,
    config: Arc<ClientConfig>,
) -> io::Result<client::TlsStream<TcpStream>> {
    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from("localhost").map_err(io::Error::other)?;
    TlsConnector::from(config).connect(server_name, stream).await
}

/// Start a tunnel from command-line style arguments (without the binary name).
pub async fn spawn_tunnel(args: &[String]) -> RunningTunnel {
    try_spawn_tunnel(args).await.unwrap()
}

/// Like [`spawn_tunnel`], but hands back startup errors.
pub async fn try_spawn_tunnel(args: &[String]) -> Result<RunningTunnel, TunnelError> {
    let argv = std::iter::once("ferry".to_string()).chain(args.iter().cloned());
    let cli = Cli::try_parse_from(argv).map_err(|e| TunnelError::Config(e.to_string()))?;
    let config = Config::from_cli(cli)?;
    ferry::start(config).await
}

/// Arguments for a client-mode tunnel towards `target`.
#[allow(dead_code)]
pub fn client_args(pki: &TestPki, target: SocketAddr) -> Vec<String> {
    vec![
        "client".to_string(),
        "--listen=127.0.0.1:0".to_string(),
        format!("--target={target}"),
        format!("--keystore={}", pki.write_keystore("client").display()),
        format!("--cacert={}", pki.cacert().display()),
        "--override-server-name=localhost".to_string(),
    ]
}

/// Arguments for a server-mode tunnel in front of `target`.
#[allow(dead_code)]
pub fn server_args(pki: &TestPki, target: SocketAddr) -> Vec<String> {
    vec![
        "server".to_string(),
        "--listen=127.0.0.1:0".to_string(),
        format!("--target={target}"),
        format!("--keystore={}", pki.write_keystore("server").display()),
        format!("--cacert={}", pki.cacert().display()),
    ]
}

/// Write `payload`, then read back exactly as many bytes.
#[allow(dead_code)]
pub async fn round_trip<S>(stream: &mut S, payload: &[u8]) -> io::Result<Vec<u8>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream.write_all(payload).await?;
    stream.flush().await?;
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Whether the peer closed the stream (EOF or reset) within the test timeout.
#[allow(dead_code)]
pub async fn closed_by_peer<S>(stream: &mut S) -> bool
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; 64];
    matches!(
        tokio::time::timeout(TEST_TIMEOUT, stream.read(&mut buf)).await,
        Ok(Ok(0)) | Ok(Err(_))
    )
}

/// Poll `condition` until it holds or the test timeout passes.
#[allow(dead_code)]
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
