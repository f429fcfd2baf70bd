use core_types::{CommandStatus, CoreError};
use database::DbError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Authentication failed.")]
    AuthenticationFailed,

    /// Unknown and foreign resources are reported identically.
    #[error("{0} not found.")]
    NotFound(&'static str),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Rate limit exceeded, retry in {retry_after_secs}s.")]
    RateLimited { retry_after_secs: u64 },

    #[error("Command is already '{current}'.")]
    ConflictingTransition { current: CommandStatus },

    #[error("Rejected by the risk supervisor: {0}")]
    PolicyDenied(String),

    #[error("Advisor call failed: {0}")]
    Advisor(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Risk management error: {0}")]
    Risk(#[from] risk::RiskError),

    #[error("Database error: {0}")]
    Database(DbError),
}

impl From<DbError> for EngineError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound => EngineError::NotFound("Resource"),
            DbError::Conflict { current } => EngineError::ConflictingTransition { current },
            other => EngineError::Database(other),
        }
    }
}

impl From<CoreError> for EngineError {
    fn from(e: CoreError) -> Self {
        EngineError::Validation(e.to_string())
    }
}

/// Maps a store `NotFound` onto a named resource, leaving other errors as they are.
pub(crate) fn or_not_found(what: &'static str) -> impl FnOnce(DbError) -> EngineError {
    move |e| match e {
        DbError::NotFound => EngineError::NotFound(what),
        other => other.into(),
    }
}
