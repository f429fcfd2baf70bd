use crate::error::AppError;
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use engine::Credentials;
use serde::de::DeserializeOwned;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const API_KEY_HEADER: &str = "x-api-key";
pub const API_SECRET_HEADER: &str = "x-api-secret";

/// The user identity the upstream gateway puts in `X-User-Id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserId(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| AppError::Unauthorized("missing X-User-Id header".into()))?;
        let id = raw
            .to_str()
            .ok()
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .ok_or_else(|| AppError::BadRequest("X-User-Id must be a UUID".into()))?;
        Ok(UserId(id))
    }
}

/// Agent credentials from `X-Api-Key` / `X-Api-Secret`.
#[derive(Debug, Clone)]
pub struct AgentCredentials(pub Credentials);

#[async_trait]
impl<S> FromRequestParts<S> for AgentCredentials
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        credentials_from_headers(&parts.headers)
            .map(AgentCredentials)
            .ok_or_else(|| AppError::Engine(engine::EngineError::AuthenticationFailed))
    }
}

fn credentials_from_headers(headers: &HeaderMap) -> Option<Credentials> {
    let value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    Some(Credentials {
        api_key: value(API_KEY_HEADER)?,
        api_secret: value(API_SECRET_HEADER)?,
    })
}

/// Parses a JSON body that may legitimately be empty.
pub fn optional_json<T>(body: &[u8]) -> Result<T, AppError>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| AppError::Body(e.to_string()))
}
