use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

/// Counters shared by the listener, its sessions and their upstream links.
#[derive(Debug, Default)]
pub struct ForwarderStats {
    /// Downstream connections handed to a session.
    pub sessions_accepted: AtomicU64,
    /// Sessions currently running.
    pub sessions_active: AtomicU64,
    /// Inbound TLS handshakes that failed or timed out.
    pub handshake_failures: AtomicU64,
    /// Outbound connections established (including TLS).
    pub upstream_connects: AtomicU64,
    /// Outbound establishment attempts that failed.
    pub upstream_failures: AtomicU64,
    /// Bytes written to the target.
    pub bytes_upstream: AtomicU64,
    /// Bytes written back to downstream clients.
    pub bytes_downstream: AtomicU64,
}

impl ForwarderStats {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn decr(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn log_summary(&self) {
        info!(
            sessions = Self::get(&self.sessions_accepted),
            handshake_failures = Self::get(&self.handshake_failures),
            upstream_connects = Self::get(&self.upstream_connects),
            upstream_failures = Self::get(&self.upstream_failures),
            bytes_upstream = Self::get(&self.bytes_upstream),
            bytes_downstream = Self::get(&self.bytes_downstream),
            "forwarder statistics"
        );
    }
}
