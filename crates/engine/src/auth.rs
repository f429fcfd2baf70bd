use crate::error::EngineError;
use async_trait::async_trait;
use database::{DbError, Store};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use uuid::Uuid;

// Create a type alias for the HMAC-SHA256 implementation.
type HmacSha256 = Hmac<Sha256>;

/// The credential pair an agent presents on every call.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Who a valid credential pair belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorIdentity {
    pub executor_id: Uuid,
    pub user_id: Uuid,
}

/// The authentication collaborator.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<ExecutorIdentity, EngineError>;
}

/// Hashes an agent secret for storage.
///
/// The API key is the HMAC key, so a digest is only valid for the key it was
/// issued with.
pub fn hash_secret(api_key: &str, secret: &str) -> String {
    let mac = keyed_mac(api_key, secret);
    hex::encode(mac.finalize().into_bytes())
}

fn keyed_mac(api_key: &str, secret: &str) -> HmacSha256 {
    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac = match HmacSha256::new_from_slice(api_key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC can take key of any size"),
    };
    mac.update(secret.as_bytes());
    mac
}

/// Constant-time comparison of a presented secret against a stored digest.
pub fn verify_secret(api_key: &str, secret: &str, stored_hash: &str) -> bool {
    let Ok(expected) = hex::decode(stored_hash) else {
        return false;
    };
    keyed_mac(api_key, secret).verify_slice(&expected).is_ok()
}

/// A fresh credential pair. The secret is only ever shown once.
pub fn generate_credentials() -> Credentials {
    Credentials {
        api_key: format!("wk_{}", Uuid::new_v4().simple()),
        api_secret: format!("ws_{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple()),
    }
}

/// Resolves credentials against the executor table.
pub struct StoreAuthenticator {
    store: Arc<dyn Store>,
}

impl StoreAuthenticator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Authenticator for StoreAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<ExecutorIdentity, EngineError> {
        let executor = match self.store.find_executor_by_api_key(&credentials.api_key).await {
            Ok(executor) => executor,
            Err(DbError::NotFound) => return Err(EngineError::AuthenticationFailed),
            Err(e) => return Err(e.into()),
        };
        if !verify_secret(&credentials.api_key, &credentials.api_secret, &executor.secret_hash) {
            return Err(EngineError::AuthenticationFailed);
        }
        Ok(ExecutorIdentity {
            executor_id: executor.id,
            user_id: executor.user_id,
        })
    }
}

/// Authenticates and checks the credentials belong to `executor_id`.
pub async fn authorize_executor(
    authenticator: &dyn Authenticator,
    executor_id: Uuid,
    credentials: &Credentials,
) -> Result<ExecutorIdentity, EngineError> {
    let identity = authenticator.authenticate(credentials).await?;
    if identity.executor_id != executor_id {
        tracing::warn!(
            %executor_id,
            credential_owner = %identity.executor_id,
            "Credentials presented for another executor."
        );
        return Err(EngineError::AuthenticationFailed);
    }
    Ok(identity)
}
