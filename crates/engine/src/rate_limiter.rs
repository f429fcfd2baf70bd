use crate::clock::Clock;
use crate::error::EngineError;
use chrono::{DateTime, Duration, Utc};
use configuration::RateLimitRule;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: DateTime<Utc>,
    count: u32,
}

/// Fixed-window request counter keyed by executor.
///
/// Windows that have ended are evicted by [`RateLimiter::sweep`], so the map
/// only holds executors that were active within the last window.
pub struct RateLimiter {
    name: &'static str,
    max_requests: u32,
    window: Duration,
    windows: DashMap<Uuid, Window>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(name: &'static str, rule: RateLimitRule, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            max_requests: rule.max_requests,
            window: Duration::seconds(i64::try_from(rule.window_secs).unwrap_or(i64::MAX / 1_000)),
            windows: DashMap::new(),
            clock,
        }
    }

    /// Counts one request for `key`, or rejects it with the time left in the window.
    pub fn check(&self, key: Uuid) -> Result<(), EngineError> {
        let now = self.clock.now();
        let mut entry = self.windows.entry(key).or_insert(Window {
            started: now,
            count: 0,
        });

        if now - entry.started >= self.window {
            *entry = Window {
                started: now,
                count: 0,
            };
        }
        if entry.count >= self.max_requests {
            let remaining = self.window - (now - entry.started);
            let retry_after_secs = u64::try_from(remaining.num_seconds()).unwrap_or(0).max(1);
            tracing::debug!(limiter = self.name, %key, retry_after_secs, "Rate limit hit.");
            return Err(EngineError::RateLimited { retry_after_secs });
        }
        entry.count += 1;
        Ok(())
    }

    /// Drops every window that has ended. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows.retain(|_, w| now - w.started < self.window);
        before - self.windows.len()
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }

    /// Runs [`RateLimiter::sweep`] on a timer for as long as the process lives.
    pub fn spawn_sweeper(self: Arc<Self>, every: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = interval(every);
            loop {
                timer.tick().await;
                let evicted = self.sweep();
                if evicted > 0 {
                    tracing::debug!(limiter = self.name, evicted, "Evicted idle rate-limit windows.");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(clock: Arc<ManualClock>) -> RateLimiter {
        RateLimiter::new(
            "test",
            RateLimitRule {
                max_requests: 3,
                window_secs: 60,
            },
            clock,
        )
    }

    #[test]
    fn rejects_past_the_limit_until_the_window_rolls() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(clock.clone());
        let key = Uuid::new_v4();

        for _ in 0..3 {
            limiter.check(key).unwrap();
        }
        clock.advance(Duration::seconds(20));
        match limiter.check(key) {
            Err(EngineError::RateLimited { retry_after_secs }) => assert_eq!(retry_after_secs, 40),
            other => panic!("expected rate limit, got {other:?}"),
        }

        // another executor has its own budget
        limiter.check(Uuid::new_v4()).unwrap();

        clock.advance(Duration::seconds(40));
        limiter.check(key).unwrap();
    }

    #[test]
    fn sweep_evicts_finished_windows_only() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(clock.clone());
        let idle = Uuid::new_v4();
        limiter.check(idle).unwrap();

        clock.advance(Duration::seconds(59));
        let active = Uuid::new_v4();
        limiter.check(active).unwrap();
        assert_eq!(limiter.sweep(), 0);

        clock.advance(Duration::seconds(1));
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.tracked(), 1);
    }
}
