//! Profile records keyed by wallet address
//!
//! The profile store is an external collaborator; the reconciler only uses
//! the two-method [`ProfileStore`] contract. A profile may not exist for a
//! freshly connected wallet. It is created on first save.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use validator::Validate;

use crate::identity::normalize_address;

/// Errors that can occur while loading or saving profiles
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("Invalid profile: {0}")]
    Validation(String),

    #[error("Profile service request failed: {0}")]
    Transport(String),

    #[error("No authenticated wallet matches {0}")]
    NotAuthenticated(String),
}

/// Profile record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Profile {
    /// Wallet address (key)
    #[validate(length(min = 1))]
    pub wallet_address: String,

    #[validate(length(min = 1, max = 64))]
    pub display_name: String,

    #[validate(length(min = 3, max = 32))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[validate(url)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,

    /// Token symbol -> decimal amount
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balances: Option<BTreeMap<String, String>>,

    pub created_at: DateTime<Utc>,
}

impl Profile {
    pub fn new(wallet_address: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            wallet_address: wallet_address.into(),
            display_name: display_name.into(),
            username: None,
            avatar_url: None,
            balances: None,
            created_at: Utc::now(),
        }
    }

    fn ensure_valid(&self) -> Result<(), ProfileError> {
        self.validate()
            .map_err(|e| ProfileError::Validation(e.to_string()))
    }
}

/// Profile store contract
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_by_wallet(&self, address: &str) -> Result<Option<Profile>, ProfileError>;

    async fn save(&self, profile: Profile) -> Result<Profile, ProfileError>;
}

/// In-memory profile store keyed by lowercased address
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    profiles: DashMap<String, Profile>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn get_by_wallet(&self, address: &str) -> Result<Option<Profile>, ProfileError> {
        Ok(self
            .profiles
            .get(&normalize_address(address))
            .map(|entry| entry.value().clone()))
    }

    async fn save(&self, mut profile: Profile) -> Result<Profile, ProfileError> {
        profile.ensure_valid()?;

        let key = normalize_address(&profile.wallet_address);
        if let Some(existing) = self.profiles.get(&key) {
            profile.created_at = existing.created_at;
        }

        self.profiles.insert(key, profile.clone());
        Ok(profile)
    }
}

/// HTTP client for a remote profile service
///
/// `GET /profiles/{address}` (404 means no profile) and
/// `PUT /profiles/{address}` returning the stored record.
#[derive(Clone)]
pub struct HttpProfileStore {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpProfileStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProfileError> {
        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(timeout)
            .build()
            .map_err(|e| ProfileError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn profile_url(&self, address: &str) -> String {
        format!(
            "{}/profiles/{}",
            self.base_url,
            urlencoding::encode(&normalize_address(address))
        )
    }
}

#[async_trait]
impl ProfileStore for HttpProfileStore {
    async fn get_by_wallet(&self, address: &str) -> Result<Option<Profile>, ProfileError> {
        let response = self
            .http_client
            .get(self.profile_url(address))
            .send()
            .await
            .map_err(|e| ProfileError::Transport(format!("Profile request failed: {}", e)))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!(address = %address, "No profile for wallet");
                Ok(None)
            }
            s if s.is_success() => response
                .json()
                .await
                .map(Some)
                .map_err(|e| ProfileError::Transport(format!("Failed to parse profile: {}", e))),
            s => Err(ProfileError::Transport(format!(
                "Unexpected status from profile service: {}",
                s
            ))),
        }
    }

    async fn save(&self, profile: Profile) -> Result<Profile, ProfileError> {
        profile.ensure_valid()?;

        let response = self
            .http_client
            .put(self.profile_url(&profile.wallet_address))
            .json(&profile)
            .send()
            .await
            .map_err(|e| ProfileError::Transport(format!("Profile save failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::UNPROCESSABLE_ENTITY || status == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            return Err(ProfileError::Validation(body));
        }
        if !status.is_success() {
            return Err(ProfileError::Transport(format!(
                "Unexpected status from profile service: {}",
                status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ProfileError::Transport(format!("Failed to parse profile: {}", e)))
    }
}
