use crate::clock::Clock;
use crate::error::EngineError;
use crate::exposure::ExposureService;
use database::Store;
use events::{Channel, FanoutEvent, Publisher, RiskAlert, ViolationNotice};
use risk::RiskExposure;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use uuid::Uuid;

/// Periodically computes exposure for every user with an online executor
/// and publishes `risk-update` when something is in breach.
pub struct RiskMonitor {
    store: Arc<dyn Store>,
    exposure: Arc<ExposureService>,
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
    stale_window: chrono::Duration,
    every: Duration,
}

impl RiskMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        exposure: Arc<ExposureService>,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
        stale_window: chrono::Duration,
        every: Duration,
    ) -> Self {
        Self {
            store,
            exposure,
            publisher,
            clock,
            stale_window,
            every,
        }
    }

    /// One pass over the active users. Returns how many alerts went out.
    pub async fn run_once(&self) -> Result<usize, EngineError> {
        let since = self.clock.now() - self.stale_window;
        let users = self.store.users_active_since(since).await?;

        let mut alerts = 0;
        for user_id in users {
            match self.exposure.compute_exposure(user_id).await {
                Ok(exposure) if exposure.has_violations() => {
                    tracing::warn!(
                        %user_id,
                        risk_score = exposure.risk_score,
                        risk_level = %exposure.risk_level,
                        violations = exposure.violations.len(),
                        "Risk violations detected."
                    );
                    let event = FanoutEvent::RiskUpdate(risk_alert(user_id, &exposure));
                    if let Err(e) = self.publisher.publish(Channel::User(user_id), event) {
                        tracing::debug!(%user_id, error = %e, "Risk update not delivered.");
                    }
                    alerts += 1;
                }
                Ok(_) => {}
                Err(e) => tracing::error!(%user_id, error = %e, "Exposure computation failed."),
            }
        }
        Ok(alerts)
    }

    pub async fn start(self) {
        tracing::info!(every_secs = self.every.as_secs(), "Starting risk monitor.");
        let mut timer = interval(self.every);
        loop {
            timer.tick().await;
            if let Err(e) = self.run_once().await {
                tracing::error!(error = %e, "Risk monitor pass failed.");
            }
        }
    }
}

pub fn risk_alert(user_id: Uuid, exposure: &RiskExposure) -> RiskAlert {
    RiskAlert {
        user_id,
        risk_score: exposure.risk_score,
        risk_level: exposure.risk_level,
        violations: exposure
            .violations
            .iter()
            .map(|v| ViolationNotice {
                kind: v.kind,
                severity: v.severity,
                message: v.message.clone(),
            })
            .collect(),
        computed_at: exposure.computed_at,
    }
}
