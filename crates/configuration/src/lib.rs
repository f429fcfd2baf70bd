use crate::error::ConfigError;
use std::path::Path;

// Declare the modules that make up this crate.
pub mod error;
pub mod logging;
pub mod settings;

// Re-export the core types to provide a clean public API.
pub use logging::init_tracing;
pub use settings::{
    AlertSettings, DatabaseSettings, DispatchSettings, LivenessSettings, LoggingSettings,
    RateLimitRule, RateLimitSettings, RiskSettings, ServerSettings, Settings, StorageBackend,
    StorageSettings, SupervisorMode, SupervisorSettings,
};

const DEFAULT_CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "WARDEN";

/// Loads the application configuration.
///
/// Layers, lowest precedence first: built-in defaults, the TOML file at `path`
/// (or an optional `config.toml` in the working directory), then `WARDEN__*`
/// environment variables (`WARDEN__SERVER__ADDR=127.0.0.1:9000`). A `.env`
/// file is read beforehand if present.
pub fn load_config(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let _ = dotenvy::dotenv();

    let file = match path {
        Some(path) => config::File::from(path).required(true),
        None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
    };
    let builder = config::Config::builder().add_source(file).add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    let mut settings = finish(builder)?;
    if settings.database.url.is_none() {
        settings.database.url = std::env::var("DATABASE_URL").ok();
    }
    Ok(settings)
}

fn finish(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> Result<Settings, ConfigError> {
    // Attempt to deserialize the entire configuration into our `Settings` struct
    let settings = builder.build()?.try_deserialize::<Settings>()?;
    validate(&settings)?;
    Ok(settings)
}

/// Rejects values that would make the control plane misbehave rather than fail.
pub fn validate(settings: &Settings) -> Result<(), ConfigError> {
    let fail = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

    if settings.liveness.stale_window_secs == 0 {
        return fail("liveness.stale_window_secs must be greater than zero");
    }
    if settings.dispatch.claim_batch_size == 0 {
        return fail("dispatch.claim_batch_size must be greater than zero");
    }
    for (name, rule) in [
        ("heartbeat", settings.rate_limits.heartbeat),
        ("collaborator", settings.rate_limits.collaborator),
    ] {
        if rule.max_requests == 0 || rule.window_secs == 0 {
            return Err(ConfigError::ValidationError(format!(
                "rate_limits.{name} needs a non-zero max_requests and window_secs"
            )));
        }
    }
    if settings.risk.leverage <= rust_decimal::Decimal::ZERO
        || settings.risk.contract_size <= rust_decimal::Decimal::ZERO
    {
        return fail("risk.leverage and risk.contract_size must be positive");
    }
    if !(0.0..=1.0).contains(&settings.supervisor.fallback_confidence) {
        return fail("supervisor.fallback_confidence must be within 0..=1");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn from_toml(toml: &str) -> Result<Settings, ConfigError> {
        finish(
            config::Config::builder()
                .add_source(config::File::from_str(toml, config::FileFormat::Toml)),
        )
    }

    #[test]
    fn empty_file_yields_defaults() {
        let settings = from_toml("").unwrap();
        assert_eq!(settings.liveness.stale_window_secs, 300);
        assert_eq!(settings.dispatch.claim_batch_size, 10);
        assert_eq!(settings.rate_limits.heartbeat.max_requests, 30);
        assert_eq!(settings.rate_limits.collaborator.max_requests, 10);
        assert_eq!(settings.risk.leverage, dec!(100));
        assert_eq!(settings.risk.contract_size, dec!(100000));
        assert_eq!(settings.supervisor.mode, SupervisorMode::Observe);
        assert_eq!(settings.storage.backend, StorageBackend::Postgres);
        assert!(settings.dispatch.execution_report_timeout().is_none());
    }

    #[test]
    fn file_values_override_defaults() {
        let settings = from_toml(
            r#"
            [liveness]
            stale_window_secs = 120

            [dispatch]
            command_ttl_secs = 0

            [supervisor]
            mode = "enforce"
            url = "http://advisor.local/decide"

            [risk]
            leverage = 50
            drawdown_high_pct = "12.5"
            "#,
        )
        .unwrap();

        assert_eq!(settings.liveness.stale_window(), chrono::Duration::seconds(120));
        assert!(settings.dispatch.command_ttl().is_none());
        assert_eq!(settings.supervisor.mode, SupervisorMode::Enforce);
        assert_eq!(settings.risk.leverage, dec!(50));
        assert_eq!(settings.risk.drawdown_high_pct, dec!(12.5));
        // untouched neighbours keep their defaults
        assert_eq!(settings.liveness.heartbeat_interval_secs, 30);
    }

    #[test]
    fn zero_rate_limit_is_rejected() {
        let err = from_toml(
            r#"
            [rate_limits.heartbeat]
            max_requests = 0
            window_secs = 60
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }
}
