use crate::clock::Clock;
use crate::error::EngineError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use configuration::{SupervisorMode, SupervisorSettings};
use core_types::{CommandKind, CommandPriority};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
    RequireConfirmation,
}

/// What the advisor is asked to judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionContext {
    pub user_id: Uuid,
    pub executor_id: Uuid,
    pub command: CommandKind,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub priority: CommandPriority,
}

/// The advisor's raw answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvisorDecision {
    pub decision: Decision,
    pub confidence: f64,
    #[serde(default)]
    pub risks: Vec<String>,
    /// How long the decision may be reused for an identical context.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// The decision after mode and fallback rules have been applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorVerdict {
    pub decision: Decision,
    pub confidence: f64,
    pub risks: Vec<String>,
    pub mode: &'static str,
    /// The advisor was not consulted or did not answer in time.
    pub fallback: bool,
    pub annotation: Option<String>,
    /// What the advisor said before the mode was applied.
    pub advisor_decision: Option<Decision>,
}

impl SupervisorVerdict {
    pub fn is_denied(&self) -> bool {
        self.decision == Decision::Deny
    }
}

/// The policy/advisor collaborator.
#[async_trait]
pub trait RiskAdvisor: Send + Sync {
    async fn decide(&self, context: &DecisionContext) -> Result<AdvisorDecision, EngineError>;
}

/// Posts the decision context as JSON and expects an [`AdvisorDecision`] back.
pub struct HttpRiskAdvisor {
    client: reqwest::Client,
    url: String,
}

impl HttpRiskAdvisor {
    pub fn new(url: impl Into<String>, timeout: std::time::Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Configuration(format!("advisor client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl RiskAdvisor for HttpRiskAdvisor {
    async fn decide(&self, context: &DecisionContext) -> Result<AdvisorDecision, EngineError> {
        let response = self
            .client
            .post(&self.url)
            .json(context)
            .send()
            .await
            .map_err(|e| EngineError::Advisor(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::Advisor(format!(
                "advisor answered {}",
                response.status()
            )));
        }
        response
            .json::<AdvisorDecision>()
            .await
            .map_err(|e| EngineError::Advisor(e.to_string()))
    }
}

/// Builds the HTTP advisor when a decision endpoint is configured.
pub fn advisor_from_settings(
    settings: &SupervisorSettings,
) -> Result<Option<Arc<dyn RiskAdvisor>>, EngineError> {
    match settings.url.as_deref() {
        Some(url) if settings.mode != SupervisorMode::Off => {
            let timeout = std::time::Duration::from_millis(settings.timeout_ms);
            let advisor: Arc<dyn RiskAdvisor> = Arc::new(HttpRiskAdvisor::new(url, timeout)?);
            Ok(Some(advisor))
        }
        _ => Ok(None),
    }
}

type CacheKey = (Uuid, CommandKind, String);

#[derive(Debug, Clone)]
struct CachedDecision {
    decision: AdvisorDecision,
    expires_at: DateTime<Utc>,
}

/// Wraps an optional advisor with a timeout, a decision cache and the
/// off/observe/enforce mode. Never returns an error.
pub struct Supervisor {
    settings: SupervisorSettings,
    advisor: Option<Arc<dyn RiskAdvisor>>,
    cache: DashMap<CacheKey, CachedDecision>,
    clock: Arc<dyn Clock>,
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        advisor: Option<Arc<dyn RiskAdvisor>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            advisor,
            cache: DashMap::new(),
            clock,
        }
    }

    pub fn mode(&self) -> SupervisorMode {
        self.settings.mode
    }

    pub async fn evaluate(&self, context: &DecisionContext) -> SupervisorVerdict {
        if self.settings.mode == SupervisorMode::Off {
            return SupervisorVerdict {
                decision: Decision::Allow,
                confidence: 1.0,
                risks: Vec::new(),
                mode: mode_name(SupervisorMode::Off),
                fallback: false,
                annotation: None,
                advisor_decision: None,
            };
        }

        match self.consult(context).await {
            Some(decision) => self.apply_mode(decision),
            None => SupervisorVerdict {
                decision: Decision::Allow,
                confidence: self.settings.fallback_confidence,
                risks: vec!["supervisor_unavailable".to_string()],
                mode: mode_name(self.settings.mode),
                fallback: true,
                annotation: Some("advisor unavailable, allowed by fallback".to_string()),
                advisor_decision: None,
            },
        }
    }

    async fn consult(&self, context: &DecisionContext) -> Option<AdvisorDecision> {
        let advisor = self.advisor.as_ref()?;
        let key = (
            context.executor_id,
            context.command,
            context.parameters.to_string(),
        );
        let now = self.clock.now();

        if let Some(hit) = self.cache.get(&key) {
            if hit.expires_at > now {
                return Some(hit.decision.clone());
            }
        }

        let timeout = std::time::Duration::from_millis(self.settings.timeout_ms);
        let decision = match tokio::time::timeout(timeout, advisor.decide(context)).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                tracing::warn!(executor_id = %context.executor_id, command = %context.command, error = %e, "Advisor call failed; falling back to allow.");
                return None;
            }
            Err(_) => {
                tracing::warn!(executor_id = %context.executor_id, command = %context.command, timeout_ms = self.settings.timeout_ms, "Advisor timed out; falling back to allow.");
                return None;
            }
        };

        let ttl = decision.ttl_secs.unwrap_or(self.settings.default_cache_ttl_secs);
        if ttl > 0 {
            let ttl = Duration::seconds(i64::try_from(ttl).unwrap_or(i64::MAX / 1_000));
            self.cache.insert(
                key,
                CachedDecision {
                    decision: decision.clone(),
                    expires_at: now + ttl,
                },
            );
        }
        Some(decision)
    }

    fn apply_mode(&self, advised: AdvisorDecision) -> SupervisorVerdict {
        let mode = self.settings.mode;
        let (decision, annotation) = match (mode, advised.decision) {
            (SupervisorMode::Observe, Decision::Deny | Decision::RequireConfirmation) => (
                Decision::Allow,
                Some(format!(
                    "observe mode: advisor said {}",
                    decision_name(advised.decision)
                )),
            ),
            (_, decision) => (decision, None),
        };
        SupervisorVerdict {
            decision,
            confidence: advised.confidence,
            risks: advised.risks,
            mode: mode_name(mode),
            fallback: false,
            annotation,
            advisor_decision: Some(advised.decision),
        }
    }

    /// Drops expired cache entries. Returns how many were removed.
    pub fn sweep_cache(&self) -> usize {
        let now = self.clock.now();
        let before = self.cache.len();
        self.cache.retain(|_, cached| cached.expires_at > now);
        before - self.cache.len()
    }
}

fn mode_name(mode: SupervisorMode) -> &'static str {
    match mode {
        SupervisorMode::Off => "off",
        SupervisorMode::Observe => "observe",
        SupervisorMode::Enforce => "enforce",
    }
}

fn decision_name(decision: Decision) -> &'static str {
    match decision {
        Decision::Allow => "allow",
        Decision::Deny => "deny",
        Decision::RequireConfirmation => "require_confirmation",
    }
}
