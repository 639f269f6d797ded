//! Credential lookup for nodes and webhook authentication

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::{EngineError, Result};

/// Decrypted credential fields, e.g. `{"user": "...", "password": "..."}`.
pub type CredentialData = HashMap<String, String>;

#[async_trait]
pub trait CredentialVault: Send + Sync {
    /// Returns decrypted credential fields. `user_id` scopes the lookup when
    /// the vault is multi-user; single-user vaults ignore it.
    async fn get_decrypted(&self, credential_id: &str, user_id: Option<&str>) -> Result<CredentialData>;
}

/// In-memory vault, seeded at startup or from tests
#[derive(Default)]
pub struct StaticCredentialVault {
    credentials: RwLock<HashMap<String, CredentialData>>,
}

impl StaticCredentialVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, credential_id: impl Into<String>, data: CredentialData) {
        self.credentials.write().insert(credential_id.into(), data);
    }

    /// Seeds the vault from `MECHAWAY_CREDENTIALS`, a JSON object of
    /// `{"credentialId": {"field": "value"}}`. Missing or malformed input
    /// yields an empty vault.
    pub fn from_env() -> Self {
        let vault = Self::new();
        let Ok(raw) = std::env::var("MECHAWAY_CREDENTIALS") else {
            return vault;
        };
        match serde_json::from_str::<HashMap<String, CredentialData>>(&raw) {
            Ok(credentials) => {
                tracing::info!("🔑 Loaded {} credentials from environment", credentials.len());
                *vault.credentials.write() = credentials;
            }
            Err(e) => tracing::warn!("⚠️ Ignoring malformed MECHAWAY_CREDENTIALS: {}", e),
        }
        vault
    }

    /// Builder-style insert.
    pub fn with(self, credential_id: &str, fields: &[(&str, &str)]) -> Self {
        let data = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.insert(credential_id, data);
        self
    }
}

#[async_trait]
impl CredentialVault for StaticCredentialVault {
    async fn get_decrypted(&self, credential_id: &str, _user_id: Option<&str>) -> Result<CredentialData> {
        self.credentials
            .read()
            .get(credential_id)
            .cloned()
            .ok_or_else(|| EngineError::Collaborator(format!("Credential '{credential_id}' not found")))
    }
}
