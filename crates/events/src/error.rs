use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventsError {
    #[error("Failed to serialize event message: {0}")]
    Serialization(String),

    #[error("No subscriber on channel '{0}'")]
    NoSubscribers(String),

    #[error("Invalid channel name: '{0}'")]
    InvalidChannel(String),
}
