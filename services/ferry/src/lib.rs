//! ferry tunnel library.
//!
//! This crate primarily ships the `ferry` binary, but we expose the library
//! surface so integration tests can start tunnels in-process.

pub mod app;
pub mod config;
pub mod error;
pub mod signals;
pub mod status;
pub mod tunnel;

#[cfg(test)]
mod testutil;

pub use app::{start, RunningTunnel};
pub use config::{Cli, Config};
pub use error::TunnelError;
pub use tunnel::{
    AccessPolicy, AccessRules, DrainOutcome, Listener, ListenerConfig, Pairer, TunnelStats,
};
