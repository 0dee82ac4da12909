//! Process-wide read counters.
//!
//! One [`ReadMetrics`] is created with the acquirer that owns it and shared by every
//! read. Counters only grow; nothing resets them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use serde::Serialize;

/// `os/arch` of the running process, the key of per-platform tallies
#[must_use]
pub fn current_platform() -> String {
    format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH)
}

#[derive(Debug, Default)]
pub struct ReadMetrics {
    mapped_attempts: AtomicU64,
    mapped_successes: AtomicU64,
    mapped_failures: AtomicU64,
    mapped_fallbacks: AtomicU64,
    buffered_reads: AtomicU64,
    buffered_failures: AtomicU64,
    bytes_read: AtomicU64,
    latency: RwLock<LatencyState>,
    platforms: RwLock<BTreeMap<String, PlatformTally>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct LatencyState {
    samples: u64,
    average_ms: f64,
}

/// Mapped-read outcomes for one platform
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlatformTally {
    pub successes: u64,
    pub failures: u64,
}

/// Point-in-time copy of [`ReadMetrics`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadMetricsSnapshot {
    pub mapped_attempts: u64,
    pub mapped_successes: u64,
    pub mapped_failures: u64,
    pub mapped_fallbacks: u64,
    pub buffered_reads: u64,
    pub buffered_failures: u64,
    pub bytes_read: u64,
    pub average_mapped_latency_ms: f64,
    pub platforms: BTreeMap<String, PlatformTally>,
}

impl ReadMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_mapped_attempt(&self) {
        self.mapped_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_mapped_success(&self, platform: &str, bytes: u64, elapsed: Duration) {
        self.mapped_successes.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);

        if let Ok(mut latency) = self.latency.write() {
            latency.samples += 1;
            let sample_ms = elapsed.as_secs_f64() * 1000.0;
            latency.average_ms += (sample_ms - latency.average_ms) / latency.samples as f64;
        }
        self.with_platform(platform, |tally| tally.successes += 1);
    }

    /// A mapped read failed and the buffered path takes over.
    pub(crate) fn record_mapped_failure(&self, platform: &str) {
        self.mapped_failures.fetch_add(1, Ordering::Relaxed);
        self.mapped_fallbacks.fetch_add(1, Ordering::Relaxed);
        self.with_platform(platform, |tally| tally.failures += 1);
    }

    /// Mapping was skipped up front (incompatible platform, oversized file).
    pub(crate) fn record_mapped_skip(&self) {
        self.mapped_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_buffered_read(&self, bytes: u64) {
        self.buffered_reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_buffered_failure(&self) {
        self.buffered_reads.fetch_add(1, Ordering::Relaxed);
        self.buffered_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn with_platform(&self, platform: &str, update: impl FnOnce(&mut PlatformTally)) {
        if let Ok(mut platforms) = self.platforms.write() {
            update(platforms.entry(platform.to_string()).or_default());
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> ReadMetricsSnapshot {
        let average_mapped_latency_ms = self
            .latency
            .read()
            .map(|latency| latency.average_ms)
            .unwrap_or_default();
        let platforms = self
            .platforms
            .read()
            .map(|platforms| platforms.clone())
            .unwrap_or_default();

        ReadMetricsSnapshot {
            mapped_attempts: self.mapped_attempts.load(Ordering::Relaxed),
            mapped_successes: self.mapped_successes.load(Ordering::Relaxed),
            mapped_failures: self.mapped_failures.load(Ordering::Relaxed),
            mapped_fallbacks: self.mapped_fallbacks.load(Ordering::Relaxed),
            buffered_reads: self.buffered_reads.load(Ordering::Relaxed),
            buffered_failures: self.buffered_failures.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            average_mapped_latency_ms,
            platforms,
        }
    }
}

impl ReadMetricsSnapshot {
    /// Every read attempt, mapped or buffered
    #[must_use]
    pub const fn total_attempts(&self) -> u64 {
        self.mapped_attempts + self.buffered_reads
    }
}
