use crate::clock::Clock;
use crate::dispatcher::CommandDispatcher;
use crate::error::EngineError;
use crate::metrics::DeliveryMetrics;
use configuration::DispatchSettings;
use database::Store;
use std::sync::Arc;
use tokio::time::{interval, Duration};

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapOutcome {
    pub expired: usize,
    pub unreported: usize,
}

/// Background sweep that fails commands nobody will ever act on.
///
/// Expired commands are already invisible to heartbeat pulls; the sweep only
/// makes their final state explicit and tells the owner.
pub struct CommandReaper {
    store: Arc<dyn Store>,
    dispatcher: Arc<CommandDispatcher>,
    metrics: Arc<DeliveryMetrics>,
    clock: Arc<dyn Clock>,
    settings: DispatchSettings,
}

impl CommandReaper {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<CommandDispatcher>,
        metrics: Arc<DeliveryMetrics>,
        clock: Arc<dyn Clock>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            dispatcher,
            metrics,
            clock,
            settings,
        }
    }

    pub async fn run_once(&self) -> Result<ReapOutcome, EngineError> {
        let now = self.clock.now();
        let mut outcome = ReapOutcome::default();

        let expired = self.store.fail_expired(now).await?;
        outcome.expired = expired.len();
        for command in &expired {
            tracing::info!(command_id = %command.id, executor_id = %command.executor_id, "Command expired before delivery.");
            self.dispatcher.notify_owner(command);
        }
        self.metrics.record_expired(expired.len() as u64);

        if let Some(timeout) = self.settings.execution_report_timeout() {
            let unreported = self.store.fail_unreported(now - timeout, now).await?;
            outcome.unreported = unreported.len();
            for command in &unreported {
                tracing::warn!(command_id = %command.id, executor_id = %command.executor_id, "Command claimed but never reported.");
                self.metrics.record_outcome(false);
                self.dispatcher.notify_owner(command);
            }
        }

        Ok(outcome)
    }

    pub async fn start(self) {
        tracing::info!(
            every_secs = self.settings.reaper_interval_secs,
            "Starting command reaper."
        );
        let mut timer = interval(Duration::from_secs(self.settings.reaper_interval_secs.max(1)));

        loop {
            // The first tick is immediate.
            timer.tick().await;

            if let Err(e) = self.run_once().await {
                tracing::error!(error = %e, "Command reaper sweep failed.");
            }
        }
    }
}
