use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide delivery counters. Cheap to bump from any task.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    enqueued: AtomicU64,
    pushed: AtomicU64,
    queued_for_heartbeat: AtomicU64,
    claimed: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_max_ms: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
    conflicts: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStats {
    pub enqueued: u64,
    pub pushed: u64,
    pub queued_for_heartbeat: u64,
    pub claimed: u64,
    pub average_latency_ms: u64,
    pub max_latency_ms: u64,
    pub executed: u64,
    pub failed: u64,
    pub expired: u64,
    pub conflicts: u64,
}

impl DeliveryMetrics {
    pub fn record_enqueued(&self, pushed: bool) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        if pushed {
            self.pushed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.queued_for_heartbeat.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// One call per claimed command: claim time minus creation time.
    pub fn record_claim(&self, latency_ms: u64) {
        self.claimed.fetch_add(1, Ordering::Relaxed);
        self.latency_total_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.latency_max_ms.fetch_max(latency_ms, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, executed: bool) {
        if executed {
            self.executed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_expired(&self, count: u64) {
        self.expired.fetch_add(count, Ordering::Relaxed);
        self.failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeliveryStats {
        let claimed = self.claimed.load(Ordering::Relaxed);
        let total = self.latency_total_ms.load(Ordering::Relaxed);
        DeliveryStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            pushed: self.pushed.load(Ordering::Relaxed),
            queued_for_heartbeat: self.queued_for_heartbeat.load(Ordering::Relaxed),
            claimed,
            average_latency_ms: total.checked_div(claimed).unwrap_or(0),
            max_latency_ms: self.latency_max_ms.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }
}
