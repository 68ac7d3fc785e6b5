//! # Telemetry
//!
//! Structured logging setup and per-connection counters.
//!
//! Counters are plain relaxed atomics bumped on the packet path; a
//! [`StatsSnapshot`] copies them out for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (e.g. `"info"` or `"quill_quic=debug"`).
///
/// Safe to call more than once; later calls leave the first subscriber in
/// place and return an error.
pub fn init_logging(default_directive: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .with_context(|| format!("Invalid log directive: {default_directive}"))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true)
        .with_file(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    tracing::info!("Logging initialized");
    Ok(())
}

/// Live counters for one connection.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub packets_acked: AtomicU64,
    pub packets_retransmitted: AtomicU64,
    /// ACK-only packets sent to flush pending acknowledgments
    pub ack_only_sent: AtomicU64,
    /// Packets held until their keys or state were ready
    pub packets_buffered: AtomicU64,
    pub packets_dropped: AtomicU64,
}

/// Point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_acked: u64,
    pub packets_retransmitted: u64,
    pub ack_only_sent: u64,
    pub packets_buffered: u64,
    pub packets_dropped: u64,
}

impl ConnectionStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_acked: self.packets_acked.load(Ordering::Relaxed),
            packets_retransmitted: self.packets_retransmitted.load(Ordering::Relaxed),
            ack_only_sent: self.ack_only_sent.load(Ordering::Relaxed),
            packets_buffered: self.packets_buffered.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
        }
    }
}
