//! Metrics records and the push bridge.
//!
//! Every interval the bridge collects one record per metric and POSTs them
//! to the collector as a single JSON array:
//!
//! ```text
//! [{"name":"ferry.conn.open","value":3,"timestamp":1700000000,"labels":{"mode":"client"}}, ...]
//! ```
//!
//! Push failures are logged and retried on the next tick; they never affect
//! the data plane.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::StatusReporter;
use crate::config::MetricsConfig;

/// One metric sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,
    pub value: i64,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// All samples collected at one instant. Serializes as a bare array.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricsSnapshot {
    pub records: Vec<MetricRecord>,
}

impl MetricsSnapshot {
    /// Read every counter and gauge from `reporter`.
    pub fn collect(reporter: &StatusReporter, prefix: &str) -> Self {
        let now = Utc::now();
        let timestamp = now.timestamp();
        let mut labels = BTreeMap::new();
        labels.insert("mode".to_string(), reporter.mode().to_string());

        let stats = reporter.stats();
        let counter = |value: &std::sync::atomic::AtomicU64| {
            i64::try_from(value.load(Ordering::Relaxed)).unwrap_or(i64::MAX)
        };

        let credential = reporter.credentials().current();
        let expiry = credential
            .identity()
            .map(|identity| identity.seconds_until_expiry(now))
            .unwrap_or(0);
        let process = reporter.process();

        let values: [(&str, i64); 14] = [
            ("conn.open", counter(&stats.connections_active)),
            ("conn.accepted", counter(&stats.connections_accepted)),
            ("conn.rejected", counter(&stats.connections_rejected)),
            ("conn.closed", counter(&stats.connections_closed)),
            ("conn.errors", counter(&stats.errors)),
            ("conn.handshake_errors", counter(&stats.handshake_errors)),
            ("conn.dial_errors", counter(&stats.dial_errors)),
            ("bytes.upstream", counter(&stats.bytes_upstream)),
            ("bytes.downstream", counter(&stats.bytes_downstream)),
            ("cert.version", credential.version() as i64),
            ("cert.expiry_seconds", expiry),
            ("cert.reloads", process.reloads() as i64),
            ("cert.reload_failures", process.reload_failures() as i64),
            ("listener.accepting", i64::from(process.get().is_accepting())),
        ];

        let records = values
            .into_iter()
            .map(|(name, value)| MetricRecord {
                name: format!("{prefix}.{name}"),
                value,
                timestamp,
                labels: labels.clone(),
            })
            .collect();

        Self { records }
    }

    pub fn get(&self, name: &str) -> Option<&MetricRecord> {
        self.records.iter().find(|record| record.name == name)
    }
}

/// Periodically pushes metrics to a collector.
pub struct MetricsBridge {
    client: Client,
    config: MetricsConfig,
    reporter: StatusReporter,
}

impl MetricsBridge {
    pub fn new(config: MetricsConfig, reporter: StatusReporter) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.interval.max(Duration::from_secs(1)))
            .build()
            .context("failed to build metrics HTTP client")?;

        Ok(Self {
            client,
            config,
            reporter,
        })
    }

    /// Collect and POST one snapshot.
    pub async fn push_once(&self) -> Result<()> {
        let snapshot = MetricsSnapshot::collect(&self.reporter, &self.config.prefix);

        let response = self
            .client
            .post(&self.config.url)
            .json(&snapshot)
            .send()
            .await
            .context("failed to send metrics")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("collector returned {}", status);
        }

        debug!(records = snapshot.records.len(), "Metrics pushed");
        Ok(())
    }

    /// Push on every tick until `shutdown` flips. The first push is immediate.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            url = %self.config.url,
            interval_secs = self.config.interval.as_secs(),
            "Starting metrics bridge"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop_requested(&mut shutdown) => break,
            }
            // A push stuck on a slow collector must not hold up shutdown.
            tokio::select! {
                result = self.push_once() => {
                    if let Err(e) = result {
                        warn!(error = %format!("{e:#}"), "Metrics push failed");
                    }
                }
                _ = stop_requested(&mut shutdown) => break,
            }
        }

        info!("Metrics bridge stopped");
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
