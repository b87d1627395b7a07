use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::info;

use crate::constants::{SERVER_STATS_DEFAULT_PASSWORD, SERVER_STATS_DEFAULT_USERNAME};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication token is required")]
    TokenRequired,
    #[error("invalid authentication token")]
    TokenInvalid,
}

/// One entry in the `--api-keys-file` JSON array.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyConfig {
    pub key: String,
    pub limit: usize,
}

/// Holds the api keys loaded at server startup. Keys gate nothing on the
/// wire; they exist so a deployment can pre-provision quotas.
pub struct AuthManager {
    api_keys: HashMap<String, usize>,
}

impl AuthManager {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read API keys file: {}", path.display()))?;
        let entries: Vec<ApiKeyConfig> = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse API keys file: {}", path.display()))?;

        let api_keys: HashMap<String, usize> =
            entries.into_iter().map(|entry| (entry.key, entry.limit)).collect();
        info!("Loaded {} API key(s)", api_keys.len());
        for (key, limit) in &api_keys {
            info!("  {} | {}", key, limit);
        }

        Ok(Self { api_keys })
    }

    pub fn validate_token(&self, token: &str) -> Result<usize, AuthError> {
        if token.is_empty() {
            return Err(AuthError::TokenRequired);
        }
        self.api_keys.get(token).copied().ok_or(AuthError::TokenInvalid)
    }

    pub fn token_limit(&self, token: &str) -> usize {
        self.api_keys.get(token).copied().unwrap_or(0)
    }
}

/// Expected hash for one credential: the `USERNAME_HASH`/`PASSWORD_HASH` env
/// var if set (hex-encoded SHA-256), else the hash of the default value.
fn expected_hash(env_var: &str, default: &str) -> Option<Vec<u8>> {
    match std::env::var(env_var) {
        Ok(encoded) => hex::decode(encoded).ok(),
        Err(_) => Some(Sha256::digest(default.as_bytes()).to_vec()),
    }
}

/// Check Basic-Auth credentials for the stats endpoint. Comparison is
/// constant time over the SHA-256 digests.
pub fn valid_credentials(username: &str, password: &str) -> bool {
    let username_hash = Sha256::digest(username.as_bytes());
    let password_hash = Sha256::digest(password.as_bytes());

    let (Some(expected_username), Some(expected_password)) = (
        expected_hash("USERNAME_HASH", SERVER_STATS_DEFAULT_USERNAME),
        expected_hash("PASSWORD_HASH", SERVER_STATS_DEFAULT_PASSWORD),
    ) else {
        return false;
    };

    let username_ok: bool = username_hash.as_slice().ct_eq(&expected_username).into();
    let password_ok: bool = password_hash.as_slice().ct_eq(&expected_password).into();
    username_ok && password_ok
}
