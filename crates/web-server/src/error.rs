use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use engine::EngineError;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// A header or body that could not even be parsed.
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Invalid request body: {0}")]
    Body(String),
    #[error(transparent)]
    Json(#[from] JsonRejection),
    #[error(transparent)]
    Query(#[from] QueryRejection),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Engine(e) => match e {
                EngineError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
                EngineError::NotFound(_) => StatusCode::NOT_FOUND,
                EngineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                EngineError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
                EngineError::ConflictingTransition { .. } => StatusCode::CONFLICT,
                EngineError::PolicyDenied(_) => StatusCode::FORBIDDEN,
                EngineError::Advisor(_)
                | EngineError::Configuration(_)
                | EngineError::Risk(_)
                | EngineError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Body(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Json(rejection) => rejection.status(),
            AppError::Query(rejection) => rejection.status(),
        }
    }
}

/// Converts our custom `AppError` into an HTTP response.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            AppError::Engine(EngineError::ConflictingTransition { current }) => json!({
                "error": self.to_string(),
                "currentStatus": current,
            }),
            AppError::Engine(EngineError::RateLimited { retry_after_secs }) => json!({
                "error": self.to_string(),
                "retryAfterSecs": retry_after_secs,
            }),
            AppError::Json(rejection) => json!({ "error": rejection.body_text() }),
            AppError::Query(rejection) => json!({ "error": rejection.body_text() }),
            _ if status.is_server_error() => {
                tracing::error!(error = ?self, "Request failed with an internal error.");
                json!({ "error": "An internal error occurred" })
            }
            _ => json!({ "error": self.to_string() }),
        };

        let mut response = (status, Json(body)).into_response();
        if let AppError::Engine(EngineError::RateLimited { retry_after_secs }) = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
