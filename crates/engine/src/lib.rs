//! # Warden Engine
//!
//! The executor command & control plane. Everything here is stateless apart
//! from the rate-limit windows and the supervisor cache; durable state lives
//! behind the `database::Store` seam and notifications go out through the
//! `events::Publisher` seam.
//!
//! ## Components
//!
//! - `CommandDispatcher`: enqueue, push, claim and status transitions.
//! - `HeartbeatHandler`: authenticated liveness pings that carry commands back.
//! - `EmergencyStopCoordinator`: per-user fan-out of URGENT `EMERGENCY_STOP`.
//! - `ExposureService` / `RiskMonitor`: on-demand and periodic risk aggregation.
//! - `CommandReaper`: fails expired and unreported commands.
//! - `Supervisor`: the optional policy advisor, wrapped so it never fails.
//!
//! `ControlPlane` wires them together for the web server and the CLI.

pub mod agent;
pub mod auth;
pub mod clock;
pub mod dispatcher;
pub mod emergency;
pub mod error;
pub mod executors;
pub mod exposure;
pub mod heartbeat;
pub mod liveness;
pub mod metrics;
pub mod rate_limiter;
pub mod reaper;
pub mod risk_monitor;
pub mod supervisor;

pub use agent::{AgentConfig, AgentService, EvaluationRequest, StatusReport};
pub use auth::{Authenticator, Credentials, ExecutorIdentity, StoreAuthenticator};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{CommandDispatcher, DeliveryMode, DeliveryNotice, Dispatched};
pub use emergency::{EmergencyStopCoordinator, EmergencyStopReport};
pub use error::EngineError;
pub use executors::{ExecutorService, RegisteredExecutor};
pub use exposure::ExposureService;
pub use heartbeat::{HeartbeatHandler, HeartbeatRequest, HeartbeatResponse};
pub use liveness::{ExecutorView, LivenessTracker};
pub use metrics::{DeliveryMetrics, DeliveryStats};
pub use rate_limiter::RateLimiter;
pub use reaper::{CommandReaper, ReapOutcome};
pub use risk_monitor::RiskMonitor;
pub use supervisor::{
    advisor_from_settings, AdvisorDecision, Decision, DecisionContext, HttpRiskAdvisor,
    RiskAdvisor, Supervisor, SupervisorVerdict,
};

use configuration::Settings;
use database::Store;
use events::Publisher;
use risk::ExposureCalculator;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// The assembled control plane. Cheap to share behind an `Arc`.
pub struct ControlPlane {
    pub dispatcher: Arc<CommandDispatcher>,
    pub heartbeats: HeartbeatHandler,
    pub emergency: EmergencyStopCoordinator,
    pub exposure: Arc<ExposureService>,
    pub executors: ExecutorService,
    pub agents: AgentService,
    pub supervisor: Arc<Supervisor>,
    pub liveness: LivenessTracker,
    pub metrics: Arc<DeliveryMetrics>,

    // --- Background pieces ---
    settings: Settings,
    store: Arc<dyn Store>,
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
    heartbeat_limiter: Arc<RateLimiter>,
    collaborator_limiter: Arc<RateLimiter>,
}

impl ControlPlane {
    pub fn new(
        settings: Settings,
        store: Arc<dyn Store>,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
        advisor: Option<Arc<dyn RiskAdvisor>>,
    ) -> Result<Self, EngineError> {
        let authenticator: Arc<dyn Authenticator> = Arc::new(StoreAuthenticator::new(store.clone()));
        Self::with_authenticator(settings, store, publisher, clock, advisor, authenticator)
    }

    /// Same as [`ControlPlane::new`] with a caller-supplied authentication collaborator.
    pub fn with_authenticator(
        settings: Settings,
        store: Arc<dyn Store>,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
        advisor: Option<Arc<dyn RiskAdvisor>>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self, EngineError> {
        let calculator = ExposureCalculator::new(settings.risk.clone())?;
        let liveness = LivenessTracker::new(settings.liveness.stale_window(), clock.clone());
        let metrics = Arc::new(DeliveryMetrics::default());
        let supervisor = Arc::new(Supervisor::new(
            settings.supervisor.clone(),
            advisor,
            clock.clone(),
        ));
        let heartbeat_limiter = Arc::new(RateLimiter::new(
            "heartbeat",
            settings.rate_limits.heartbeat,
            clock.clone(),
        ));
        let collaborator_limiter = Arc::new(RateLimiter::new(
            "collaborator",
            settings.rate_limits.collaborator,
            clock.clone(),
        ));

        let dispatcher = Arc::new(CommandDispatcher::new(
            store.clone(),
            publisher.clone(),
            liveness.clone(),
            supervisor.clone(),
            metrics.clone(),
            clock.clone(),
            settings.dispatch.clone(),
        ));
        let heartbeats = HeartbeatHandler::new(
            authenticator.clone(),
            heartbeat_limiter.clone(),
            store.clone(),
            dispatcher.clone(),
            liveness.clone(),
            clock.clone(),
        );
        let emergency = EmergencyStopCoordinator::new(
            store.clone(),
            dispatcher.clone(),
            publisher.clone(),
            clock.clone(),
        );
        let exposure = Arc::new(ExposureService::new(store.clone(), calculator, clock.clone()));
        let executors = ExecutorService::new(
            store.clone(),
            dispatcher.clone(),
            liveness.clone(),
            clock.clone(),
        );
        let agents = AgentService::new(
            authenticator,
            collaborator_limiter.clone(),
            store.clone(),
            dispatcher.clone(),
            supervisor.clone(),
            clock.clone(),
            settings.liveness.clone(),
            settings.dispatch.clone(),
        );

        Ok(Self {
            dispatcher,
            heartbeats,
            emergency,
            exposure,
            executors,
            agents,
            supervisor,
            liveness,
            metrics,
            settings,
            store,
            publisher,
            clock,
            heartbeat_limiter,
            collaborator_limiter,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn reaper(&self) -> CommandReaper {
        CommandReaper::new(
            self.store.clone(),
            self.dispatcher.clone(),
            self.metrics.clone(),
            self.clock.clone(),
            self.settings.dispatch.clone(),
        )
    }

    pub fn risk_monitor(&self) -> RiskMonitor {
        RiskMonitor::new(
            self.store.clone(),
            self.exposure.clone(),
            self.publisher.clone(),
            self.clock.clone(),
            self.settings.liveness.stale_window(),
            Duration::from_secs(self.settings.risk.monitor_interval_secs.max(1)),
        )
    }

    /// Starts the reaper, the risk monitor and the cache sweepers.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let sweep_every = Duration::from_secs(self.settings.rate_limits.sweep_interval_secs.max(1));
        let supervisor = self.supervisor.clone();

        vec![
            tokio::spawn(self.reaper().start()),
            tokio::spawn(self.risk_monitor().start()),
            self.heartbeat_limiter.clone().spawn_sweeper(sweep_every),
            self.collaborator_limiter.clone().spawn_sweeper(sweep_every),
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(sweep_every);
                loop {
                    timer.tick().await;
                    supervisor.sweep_cache();
                }
            }),
        ]
    }
}
