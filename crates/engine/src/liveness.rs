use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use core_types::{Executor, ExecutorStatus};
use serde::Serialize;
use std::sync::Arc;

/// Derives online/offline from heartbeat age. Nothing here is stored: offline
/// is always inferred at the moment of observation.
#[derive(Clone)]
pub struct LivenessTracker {
    stale_window: Duration,
    clock: Arc<dyn Clock>,
}

impl LivenessTracker {
    pub fn new(stale_window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            stale_window,
            clock,
        }
    }

    pub fn stale_window(&self) -> Duration {
        self.stale_window
    }

    pub fn is_online(&self, executor: &Executor) -> bool {
        self.is_online_at(executor, self.clock.now())
    }

    pub fn is_online_at(&self, executor: &Executor, now: DateTime<Utc>) -> bool {
        executor
            .last_heartbeat
            .is_some_and(|at| now - at < self.stale_window)
    }

    /// Offline when stale; `error` when online and the agent says so; otherwise online.
    pub fn status(&self, executor: &Executor) -> ExecutorStatus {
        self.status_at(executor, self.clock.now())
    }

    pub fn status_at(&self, executor: &Executor, now: DateTime<Utc>) -> ExecutorStatus {
        if !self.is_online_at(executor, now) {
            ExecutorStatus::Offline
        } else if executor.reported_status == Some(ExecutorStatus::Error) {
            ExecutorStatus::Error
        } else {
            ExecutorStatus::Online
        }
    }

    pub fn view(&self, executor: Executor) -> ExecutorView {
        let now = self.clock.now();
        ExecutorView {
            status: self.status_at(&executor, now),
            is_online: self.is_online_at(&executor, now),
            executor,
        }
    }
}

/// An executor together with its derived status, as shown to its owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorView {
    #[serde(flatten)]
    pub executor: Executor,
    pub status: ExecutorStatus,
    pub is_online: bool,
}
