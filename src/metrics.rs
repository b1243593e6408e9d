//! Per-channel counters, summarized into the stop log line.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ChannelMetrics {
    pub connect_attempts: AtomicU64,
    pub connects: AtomicU64,
    pub reconnects: AtomicU64,
    pub endpoint_switches: AtomicU64,
    pub failures: AtomicU64,
    pub probe_failures: AtomicU64,
    pub messages: AtomicU64,
}

impl ChannelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connect_success(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_endpoint_switch(&self) {
        self.endpoint_switches.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_probe_failure(&self) {
        self.probe_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn switches(&self) -> u64 {
        self.endpoint_switches.load(Ordering::Relaxed)
    }

    /// Summary string for logging
    pub fn summary(&self) -> String {
        format!(
            "connects={}/{} reconnects={} switches={} failures={} probe_failures={} messages={}",
            self.connects.load(Ordering::Relaxed),
            self.connect_attempts.load(Ordering::Relaxed),
            self.reconnects.load(Ordering::Relaxed),
            self.endpoint_switches.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
            self.probe_failures.load(Ordering::Relaxed),
            self.messages.load(Ordering::Relaxed),
        )
    }
}
