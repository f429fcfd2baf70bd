use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

/// The root configuration structure for the entire application.
///
/// Every section has built-in defaults, so an empty `config.toml` (or none at
/// all) yields a working in-process setup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub storage: StorageSettings,
    pub liveness: LivenessSettings,
    pub dispatch: DispatchSettings,
    pub rate_limits: RateLimitSettings,
    pub risk: RiskSettings,
    pub supervisor: SupervisorSettings,
    pub alerts: AlertSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Socket address the HTTP server binds to.
    pub addr: String,
    /// Upper bound on request bodies, in bytes.
    pub body_limit_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            body_limit_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Falls back to the `DATABASE_URL` environment variable when unset.
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            acquire_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum StorageBackend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LivenessSettings {
    /// A heartbeat older than this marks the executor offline.
    pub stale_window_secs: u64,
    /// The cadence agents are told to heartbeat at.
    pub heartbeat_interval_secs: u64,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            stale_window_secs: 300,
            heartbeat_interval_secs: 30,
        }
    }
}

impl LivenessSettings {
    pub fn stale_window(&self) -> chrono::Duration {
        secs(self.stale_window_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// How many pending commands one heartbeat may claim.
    pub claim_batch_size: u32,
    /// Lifetime of a queued command. `0` disables expiry.
    pub command_ttl_secs: u64,
    pub reaper_interval_secs: u64,
    /// Fails claimed commands that never get an execution report. `0` disables it.
    pub execution_report_timeout_secs: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            claim_batch_size: 10,
            command_ttl_secs: 86_400,
            reaper_interval_secs: 30,
            execution_report_timeout_secs: 0,
        }
    }
}

impl DispatchSettings {
    pub fn command_ttl(&self) -> Option<chrono::Duration> {
        (self.command_ttl_secs > 0).then(|| secs(self.command_ttl_secs))
    }

    pub fn execution_report_timeout(&self) -> Option<chrono::Duration> {
        (self.execution_report_timeout_secs > 0).then(|| secs(self.execution_report_timeout_secs))
    }
}

/// `max_requests` per `window_secs`, counted per executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitRule {
    pub max_requests: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub heartbeat: RateLimitRule,
    /// Config fetches and supervisor evaluations.
    pub collaborator: RateLimitRule,
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            heartbeat: RateLimitRule {
                max_requests: 30,
                window_secs: 60,
            },
            collaborator: RateLimitRule {
                max_requests: 10,
                window_secs: 60,
            },
            sweep_interval_secs: 60,
        }
    }
}

/// Parameters and thresholds for exposure aggregation. Percentages are whole
/// numbers (`20` means 20%).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskSettings {
    pub leverage: Decimal,
    pub contract_size: Decimal,
    /// Assumed loss per lot for positions without a stop-loss.
    pub default_risk_per_lot: Decimal,
    pub margin_level_critical_pct: Decimal,
    pub margin_level_high_pct: Decimal,
    pub drawdown_critical_pct: Decimal,
    pub drawdown_high_pct: Decimal,
    pub drawdown_medium_pct: Decimal,
    pub unrealized_loss_critical_pct: Decimal,
    pub unrealized_loss_high_pct: Decimal,
    pub concentration_high_pct: Decimal,
    pub concentration_medium_pct: Decimal,
    /// Cadence of the background risk monitor. `0` disables it.
    pub monitor_interval_secs: u64,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            leverage: dec!(100),
            contract_size: dec!(100000),
            default_risk_per_lot: dec!(1000),
            margin_level_critical_pct: dec!(100),
            margin_level_high_pct: dec!(200),
            drawdown_critical_pct: dec!(20),
            drawdown_high_pct: dec!(15),
            drawdown_medium_pct: dec!(10),
            unrealized_loss_critical_pct: dec!(10),
            unrealized_loss_high_pct: dec!(5),
            concentration_high_pct: dec!(5),
            concentration_medium_pct: dec!(3),
            monitor_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum SupervisorMode {
    /// Every command is allowed without consulting the advisor.
    Off,
    /// The advisor is consulted but a denial is only annotated.
    #[default]
    Observe,
    /// The advisor's decision is binding.
    Enforce,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub mode: SupervisorMode,
    /// Decision endpoint of the advisor. Without one every decision is a fallback.
    pub url: Option<String>,
    pub timeout_ms: u64,
    /// Used when the advisor does not say how long its decision is good for.
    pub default_cache_ttl_secs: u64,
    /// Confidence attached to fallback `allow` decisions.
    pub fallback_confidence: f64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            mode: SupervisorMode::Observe,
            url: None,
            timeout_ms: 2_000,
            default_cache_ttl_secs: 30,
            fallback_confidence: 0.3,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    pub enabled: bool,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` wins when set.
    pub level: String,
    /// Directory for daily-rolling log files. No file output when unset.
    pub directory: Option<String>,
    pub file_prefix: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            file_prefix: "warden.log".to_string(),
        }
    }
}

fn secs(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1_000))
}
