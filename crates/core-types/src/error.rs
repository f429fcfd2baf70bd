use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid input for {0}: {1}")]
    InvalidInput(String, String),

    #[error("Unknown {type_name} value: '{value}'")]
    UnknownVariant {
        type_name: &'static str,
        value: String,
    },
}
