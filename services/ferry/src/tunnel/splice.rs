//! Bidirectional splicing between the two legs of a pair.
//!
//! Two copy directions run concurrently:
//! - upstream: inbound leg -> outbound leg
//! - downstream: outbound leg -> inbound leg
//!
//! When a direction reads end-of-stream it half-closes the write side of the
//! opposite leg and the other direction keeps running, so a peer that closes
//! its write side can still read the final response. The remaining direction
//! gets `close_timeout` to finish. Any read or write error ends the pair
//! immediately. Both legs are dropped, and therefore closed, exactly once when
//! [`splice`] returns.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use super::stats::TunnelStats;

/// Read buffer size per direction.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Default time the second direction may stay open after the first ends.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SpliceConfig {
    pub buffer_size: usize,
    pub close_timeout: Duration,
}

impl SpliceConfig {
    pub fn new(close_timeout: Duration) -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            close_timeout,
        }
    }
}

impl Default for SpliceConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CLOSE_TIMEOUT)
    }
}

/// How a pair ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairOutcome {
    /// Both legs closed in response to a peer close.
    ClosedClean,
    /// Torn down because of an I/O error on either leg.
    ClosedError,
}

/// Copy direction within a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upstream,
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => f.write_str("upstream"),
            Direction::Downstream => f.write_str("downstream"),
        }
    }
}

/// Result of splicing one pair.
#[derive(Debug, Clone)]
pub struct SpliceReport {
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
    /// The direction that terminated first.
    pub first_closed: Direction,
    pub outcome: PairOutcome,
}

/// Move bytes between `inbound` and `outbound` until both directions end.
pub async fn splice<A, B>(
    inbound: A,
    outbound: B,
    config: &SpliceConfig,
    stats: &TunnelStats,
) -> SpliceReport
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut inbound_read, mut inbound_write) = tokio::io::split(inbound);
    let (mut outbound_read, mut outbound_write) = tokio::io::split(outbound);

    let mut bytes_upstream = 0u64;
    let mut bytes_downstream = 0u64;

    let (first_closed, outcome) = {
        let upstream = copy_half(
            &mut inbound_read,
            &mut outbound_write,
            config.buffer_size,
            &mut bytes_upstream,
            &stats.bytes_upstream,
        );
        let downstream = copy_half(
            &mut outbound_read,
            &mut inbound_write,
            config.buffer_size,
            &mut bytes_downstream,
            &stats.bytes_downstream,
        );
        tokio::pin!(upstream);
        tokio::pin!(downstream);

        let (first, result) = tokio::select! {
            result = &mut upstream => (Direction::Upstream, result),
            result = &mut downstream => (Direction::Downstream, result),
        };

        let outcome = match result {
            Err(e) => {
                debug!(direction = %first, error = %e, "Splice direction failed, closing pair");
                PairOutcome::ClosedError
            }
            Ok(()) => {
                debug!(direction = %first, "Half-close propagated");
                let remaining = match first {
                    Direction::Upstream => timeout(config.close_timeout, &mut downstream).await,
                    Direction::Downstream => timeout(config.close_timeout, &mut upstream).await,
                };

                match remaining {
                    Ok(Ok(())) => PairOutcome::ClosedClean,
                    Ok(Err(e)) => {
                        debug!(error = %e, "Splice direction failed after half-close");
                        PairOutcome::ClosedError
                    }
                    Err(_) => {
                        debug!(
                            close_timeout = ?config.close_timeout,
                            "Close timeout reached, closing pair"
                        );
                        PairOutcome::ClosedClean
                    }
                }
            }
        };

        (first, outcome)
    };

    SpliceReport {
        bytes_upstream,
        bytes_downstream,
        first_closed,
        outcome,
    }
}

/// Copy until EOF, then half-close the writer.
async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    total: &mut u64,
    counter: &AtomicU64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            // TLS peer closed the transport without close_notify.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };

        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *total += n as u64;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    match writer.shutdown().await {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        result => result,
    }
}
