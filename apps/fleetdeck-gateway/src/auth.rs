use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::RelayStore;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,
    #[error("unknown, expired, or revoked api key")]
    UnknownKey,
    #[error("invalid session token")]
    InvalidToken,
    #[error("credential lookup failed")]
    LookupFailed,
}

/// Hash an agent bearer key for storage/lookup. Plaintext keys are never
/// persisted or compared.
pub fn hash_api_key(raw_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    sub: String,
    exp: i64,
}

/// Validates agent API keys and dashboard session tokens at connection
/// time. Agent keys go through the store by one-way hash; dashboard tokens
/// are verified by signature and expiry alone.
#[derive(Clone)]
pub struct Authenticator {
    store: Arc<dyn RelayStore>,
    decoding_key: Arc<DecodingKey>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn RelayStore>, session_secret: &str) -> Self {
        Self {
            store,
            decoding_key: Arc::new(DecodingKey::from_secret(session_secret.as_bytes())),
        }
    }

    /// Resolves an agent's bearer key to its owner id, or rejects. Lookup
    /// failures reject: the gateway never fails open.
    pub async fn authenticate_agent(&self, raw_key: &str) -> Result<String, AuthError> {
        if raw_key.trim().is_empty() {
            return Err(AuthError::Missing);
        }
        let key_hash = hash_api_key(raw_key);
        let record = self
            .store
            .find_api_key(&key_hash)
            .await
            .map_err(|err| {
                warn!(error = %err, "api key lookup failed");
                AuthError::LookupFailed
            })?
            .ok_or(AuthError::UnknownKey)?;

        let now = Utc::now();
        if !record.is_usable(now) {
            return Err(AuthError::UnknownKey);
        }

        // Last-used stamping is off the handshake path.
        let store = self.store.clone();
        let stamped_hash = record.key_hash.clone();
        tokio::spawn(async move {
            if let Err(err) = store.touch_api_key(&stamped_hash, now).await {
                debug!(error = %err, "failed to stamp api key last-used");
            }
        });

        Ok(record.owner_id)
    }

    /// Validates a dashboard session token (signature + expiry) and returns
    /// the user id it was issued to. No store round trip.
    pub fn authenticate_dashboard(&self, token: &str) -> Result<String, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::Missing);
        }
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<SessionClaims>(token, &self.decoding_key, &validation)
            .map_err(|_| AuthError::InvalidToken)?;
        if data.claims.sub.trim().is_empty() {
            return Err(AuthError::InvalidToken);
        }
        Ok(data.claims.sub)
    }
}

/// Issue a session token for `user_id`. The web application mints these in
/// production; this helper backs the debug CLI and tests.
pub fn mint_session_token(
    session_secret: &str,
    user_id: &str,
    ttl: chrono::Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = SessionClaims {
        sub: user_id.to_string(),
        exp: (Utc::now() + ttl).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(session_secret.as_bytes()),
    )
}
