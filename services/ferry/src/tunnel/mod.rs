//! Connection-forwarding engine.
//!
//! This module provides:
//! - TCP listener management with a concurrency budget
//! - Connection pairing (TLS originate in client mode, TLS terminate in server mode)
//! - Server-mode access control on verified client identities
//! - Bidirectional splicing with half-close propagation
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Pairer (TLS handshake + dial) -> Splicer <-> Target
//!                                                           |
//!                                                      TunnelStats
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use tunnel::{Listener, ListenerConfig, OriginateTls, Pairer, TunnelStats};
//!
//! let originate = OriginateTls::new(target, "backend.internal", credentials, timeout)?;
//! let stats = Arc::new(TunnelStats::default());
//!
//! let config = ListenerConfig::new("127.0.0.1:8080");
//! let listener = Listener::bind(config, Pairer::Originate(originate), stats).await?;
//! listener.run(shutdown_rx).await?;
//! ```

mod leg;
mod listener;
mod pairer;
mod policy;
mod splice;
mod stats;

pub use leg::Leg;
pub use listener::{DrainOutcome, Listener, ListenerConfig, DEFAULT_SHUTDOWN_TIMEOUT};
pub use pairer::{ConnectionPair, OriginateTls, Pairer, TerminateTls};
pub use policy::{AccessPolicy, AccessRules};
pub use splice::{
    splice, Direction, PairOutcome, SpliceConfig, SpliceReport, DEFAULT_BUFFER_SIZE,
    DEFAULT_CLOSE_TIMEOUT,
};
pub use stats::TunnelStats;
