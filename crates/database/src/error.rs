use core_types::{CommandStatus, CoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection is not configured: {0}")]
    ConnectionConfigError(String),

    #[error("Failed to connect to the database: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Database migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("An error occurred during JSON serialization/deserialization: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Stored row could not be mapped to a domain value: {0}")]
    InvalidData(#[from] CoreError),

    #[error("The requested data was not found in the database.")]
    NotFound,

    /// A conditional command update matched nothing because the command is
    /// no longer in a state the update allows.
    #[error("Command is already '{current}'.")]
    Conflict { current: CommandStatus },
}
