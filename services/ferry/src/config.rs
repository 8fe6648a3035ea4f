//! Command line and configuration.
//!
//! Every flag can also be supplied through a `FERRY_*` environment variable.
//! [`Config::from_cli`] validates the flag combination and produces the
//! immutable configuration the tunnel runs with.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use ferry_credentials::{CredentialSource, IdentitySource};

use crate::error::TunnelError;
use crate::tunnel::{AccessPolicy, AccessRules};

/// Default ceiling on simultaneous in-flight pairs.
pub const DEFAULT_MAX_CONCURRENT_CONNS: usize = 10000;

/// ferry - wrap plaintext TCP in mutually authenticated TLS.
#[derive(Debug, Parser)]
#[command(name = "ferry")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub mode: ModeCommand,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Address for the status HTTP endpoint (/_status, /_metrics).
    #[arg(long, global = true, env = "FERRY_STATUS")]
    pub status: Option<SocketAddr>,

    /// Collector URL that receives a JSON array of metrics via POST.
    #[arg(long, global = true, env = "FERRY_METRICS_URL")]
    pub metrics_url: Option<String>,

    /// Seconds between metrics pushes.
    #[arg(long, global = true, env = "FERRY_METRICS_INTERVAL", default_value_t = 30)]
    pub metrics_interval: u64,

    /// Prefix for metric names.
    #[arg(long, global = true, env = "FERRY_METRICS_PREFIX", default_value = "ferry")]
    pub metrics_prefix: String,

    /// Seconds allowed for dialing the target plus the TLS handshake.
    #[arg(long, global = true, env = "FERRY_CONNECT_TIMEOUT", default_value_t = 10)]
    pub connect_timeout: u64,

    /// Seconds to keep the other direction open after one side half-closes.
    #[arg(long, global = true, env = "FERRY_CLOSE_TIMEOUT", default_value_t = 10)]
    pub close_timeout: u64,

    /// Seconds to wait for pairs to drain on shutdown before force-closing.
    #[arg(long, global = true, env = "FERRY_SHUTDOWN_TIMEOUT", default_value_t = 300)]
    pub shutdown_timeout: u64,

    /// Maximum simultaneous connections; extra connections are closed immediately.
    #[arg(long, global = true, env = "FERRY_MAX_CONCURRENT_CONNS", default_value_t = DEFAULT_MAX_CONCURRENT_CONNS)]
    pub max_concurrent_conns: usize,

    /// Reload credentials every N seconds in addition to SIGUSR1.
    #[arg(long, global = true, env = "FERRY_TIMED_RELOAD")]
    pub timed_reload: Option<u64>,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, global = true, env = "FERRY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Subcommand)]
pub enum ModeCommand {
    /// Accept plaintext, originate TLS to the target.
    Client(ClientArgs),

    /// Terminate TLS with client authentication, forward plaintext to the target.
    Server(ServerArgs),
}

#[derive(Debug, Args)]
pub struct EndpointArgs {
    /// Address to listen on (host:port).
    #[arg(long, env = "FERRY_LISTEN")]
    pub listen: String,

    /// Address to forward to (host:port).
    #[arg(long, env = "FERRY_TARGET")]
    pub target: String,

    /// PEM bundle with certificate chain and private key.
    #[arg(long, env = "FERRY_KEYSTORE", conflicts_with_all = ["cert", "key"])]
    pub keystore: Option<PathBuf>,

    /// PEM certificate chain (use with --key).
    #[arg(long, env = "FERRY_CERT", requires = "key")]
    pub cert: Option<PathBuf>,

    /// PEM private key (use with --cert).
    #[arg(long, env = "FERRY_KEY", requires = "cert")]
    pub key: Option<PathBuf>,

    /// PEM bundle of trusted roots for verifying the peer.
    #[arg(long, env = "FERRY_CACERT")]
    pub cacert: PathBuf,
}

#[derive(Debug, Args)]
pub struct ClientArgs {
    #[command(flatten)]
    pub endpoints: EndpointArgs,

    /// Server name to verify instead of the target host.
    #[arg(long, env = "FERRY_OVERRIDE_SERVER_NAME")]
    pub override_server_name: Option<String>,

    /// Do not present a client certificate.
    #[arg(long, env = "FERRY_DISABLE_AUTHENTICATION")]
    pub disable_authentication: bool,

    /// Allow listening on a non-loopback address.
    #[arg(long, env = "FERRY_UNSAFE_LISTEN")]
    pub unsafe_listen: bool,
}

#[derive(Debug, Args)]
pub struct ServerArgs {
    #[command(flatten)]
    pub endpoints: EndpointArgs,

    /// Allow any client with a certificate chaining to the trusted roots.
    #[arg(long, env = "FERRY_ALLOW_ALL")]
    pub allow_all: bool,

    /// Allow clients with this common name (repeatable).
    #[arg(long = "allow-cn")]
    pub allow_cn: Vec<String>,

    /// Allow clients with this organizational unit (repeatable).
    #[arg(long = "allow-ou")]
    pub allow_ou: Vec<String>,

    /// Allow clients with this DNS SAN (repeatable).
    #[arg(long = "allow-dns")]
    pub allow_dns: Vec<String>,

    /// Allow clients with this URI SAN (repeatable).
    #[arg(long = "allow-uri")]
    pub allow_uri: Vec<String>,

    /// Allow forwarding plaintext to a non-loopback target.
    #[arg(long, env = "FERRY_UNSAFE_TARGET")]
    pub unsafe_target: bool,
}

/// What an endpoint is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    Listen,
    Target,
}

/// Whether bytes on an endpoint are TLS or plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Plaintext,
    Tls,
}

/// A configured network endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub role: EndpointRole,
    pub transport: Transport,
}

impl Endpoint {
    /// Parse `host:port`, `ip:port` or `[ipv6]:port`.
    pub fn parse(s: &str, role: EndpointRole, transport: Transport) -> Result<Self, TunnelError> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TunnelError::Config(format!("endpoint '{s}' is missing a port")))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(TunnelError::Config(format!("endpoint '{s}' is missing a host")));
        }
        if host.contains(':') && host.parse::<IpAddr>().is_err() {
            return Err(TunnelError::Config(format!(
                "endpoint '{s}' has an invalid host (bracket IPv6 addresses)"
            )));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| TunnelError::Config(format!("endpoint '{s}' has an invalid port")))?;

        Ok(Self {
            host: host.to_string(),
            port,
            role,
            transport,
        })
    }

    /// `host:port` form accepted by socket APIs.
    pub fn address(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    /// Whether the host is `localhost` or a loopback IP.
    pub fn is_loopback(&self) -> bool {
        match self.host.parse::<IpAddr>() {
            Ok(ip) => ip.is_loopback(),
            Err(_) => self.host.eq_ignore_ascii_case("localhost"),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.address())
    }
}

/// Mode-specific settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeConfig {
    /// Originate TLS towards the target.
    Client { server_name: String },
    /// Terminate TLS from the listen side.
    Server { policy: AccessPolicy },
}

impl ModeConfig {
    pub fn name(&self) -> &'static str {
        match self {
            ModeConfig::Client { .. } => "client",
            ModeConfig::Server { .. } => "server",
        }
    }
}

/// Metrics bridge settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    pub url: String,
    pub interval: Duration,
    pub prefix: String,
}

/// Validated tunnel configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: ModeConfig,
    pub listen: Endpoint,
    pub target: Endpoint,
    pub credentials: CredentialSource,
    pub status_addr: Option<SocketAddr>,
    pub metrics: Option<MetricsConfig>,
    /// Prefix for metric names, also used by `/_metrics`.
    pub metrics_prefix: String,
    pub connect_timeout: Duration,
    pub close_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub max_concurrent_conns: usize,
    pub timed_reload: Option<Duration>,
    pub log_level: String,
}

impl Config {
    /// Validate parsed flags.
    pub fn from_cli(cli: Cli) -> Result<Self, TunnelError> {
        let global = cli.global;

        let (mode, listen, target, credentials) = match cli.mode {
            ModeCommand::Client(args) => {
                let listen =
                    Endpoint::parse(&args.endpoints.listen, EndpointRole::Listen, Transport::Plaintext)?;
                let target =
                    Endpoint::parse(&args.endpoints.target, EndpointRole::Target, Transport::Tls)?;

                if !listen.is_loopback() && !args.unsafe_listen {
                    return Err(TunnelError::Config(format!(
                        "refusing to accept plaintext on non-loopback address {listen} (use --unsafe-listen)"
                    )));
                }

                let identity = identity_source(&args.endpoints)?;
                let identity = match (identity, args.disable_authentication) {
                    (Some(_), true) => {
                        return Err(TunnelError::Config(
                            "--disable-authentication conflicts with --keystore/--cert".to_string(),
                        ))
                    }
                    (Some(identity), false) => identity,
                    (None, true) => IdentitySource::Anonymous,
                    (None, false) => {
                        return Err(TunnelError::Config(
                            "client mode requires --keystore, --cert/--key or --disable-authentication"
                                .to_string(),
                        ))
                    }
                };

                let server_name = args
                    .override_server_name
                    .unwrap_or_else(|| target.host.clone());

                (
                    ModeConfig::Client { server_name },
                    listen,
                    target,
                    CredentialSource {
                        identity,
                        cacert: args.endpoints.cacert,
                    },
                )
            }
            ModeCommand::Server(args) => {
                let listen =
                    Endpoint::parse(&args.endpoints.listen, EndpointRole::Listen, Transport::Tls)?;
                let target = Endpoint::parse(
                    &args.endpoints.target,
                    EndpointRole::Target,
                    Transport::Plaintext,
                )?;

                if !target.is_loopback() && !args.unsafe_target {
                    return Err(TunnelError::Config(format!(
                        "refusing to forward plaintext to non-loopback target {target} (use --unsafe-target)"
                    )));
                }

                let identity = identity_source(&args.endpoints)?.ok_or_else(|| {
                    TunnelError::Config("server mode requires --keystore or --cert/--key".to_string())
                })?;

                let rules = AccessRules {
                    common_names: args.allow_cn,
                    organizational_units: args.allow_ou,
                    dns_names: args.allow_dns,
                    uris: args.allow_uri,
                };
                let policy = match (args.allow_all, rules.is_empty()) {
                    (true, true) => AccessPolicy::AllowAll,
                    (false, false) => AccessPolicy::Rules(rules),
                    (true, false) => {
                        return Err(TunnelError::Config(
                            "--allow-all conflicts with --allow-cn/--allow-ou/--allow-dns/--allow-uri"
                                .to_string(),
                        ))
                    }
                    (false, true) => {
                        return Err(TunnelError::Config(
                            "server mode requires --allow-all or at least one --allow-* rule"
                                .to_string(),
                        ))
                    }
                };

                (
                    ModeConfig::Server { policy },
                    listen,
                    target,
                    CredentialSource {
                        identity,
                        cacert: args.endpoints.cacert,
                    },
                )
            }
        };

        if global.max_concurrent_conns == 0 || global.max_concurrent_conns > u32::MAX as usize {
            return Err(TunnelError::Config(
                "--max-concurrent-conns must be between 1 and 4294967295".to_string(),
            ));
        }

        let metrics = match global.metrics_url {
            Some(url) => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(TunnelError::Config(format!(
                        "--metrics-url '{url}' must be an http(s) URL"
                    )));
                }
                if global.metrics_interval == 0 {
                    return Err(TunnelError::Config(
                        "--metrics-interval must be at least 1 second".to_string(),
                    ));
                }
                Some(MetricsConfig {
                    url,
                    interval: Duration::from_secs(global.metrics_interval),
                    prefix: global.metrics_prefix.clone(),
                })
            }
            None => None,
        };

        Ok(Self {
            mode,
            listen,
            target,
            credentials,
            status_addr: global.status,
            metrics,
            metrics_prefix: global.metrics_prefix,
            connect_timeout: Duration::from_secs(global.connect_timeout.max(1)),
            close_timeout: Duration::from_secs(global.close_timeout),
            shutdown_timeout: Duration::from_secs(global.shutdown_timeout),
            max_concurrent_conns: global.max_concurrent_conns,
            timed_reload: global
                .timed_reload
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            log_level: global.log_level,
        })
    }
}

fn identity_source(args: &EndpointArgs) -> Result<Option<IdentitySource>, TunnelError> {
    match (&args.keystore, &args.cert, &args.key) {
        (Some(keystore), None, None) => {
            if is_pkcs12(keystore) {
                return Err(TunnelError::Config(format!(
                    "keystore {} looks like PKCS#12; ferry reads PEM keystores only \
                     (convert with `openssl pkcs12 -in {} -nodes -out keystore.pem`)",
                    keystore.display(),
                    keystore.display()
                )));
            }
            Ok(Some(IdentitySource::Keystore(keystore.clone())))
        }
        (None, Some(cert), Some(key)) => Ok(Some(IdentitySource::CertAndKey {
            cert: cert.clone(),
            key: key.clone(),
        })),
        (None, None, None) => Ok(None),
        _ => Err(TunnelError::Config(
            "use either --keystore or both --cert and --key".to_string(),
        )),
    }
}

fn is_pkcs12(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("p12") || ext.eq_ignore_ascii_case("pfx"))
}
