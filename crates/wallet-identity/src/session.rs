//! Session gateway to the remote identity provider
//!
//! A [`SessionGateway`] exchanges a signed challenge for a session, recovers
//! the current session on boot, reports external session changes, and signs
//! out. Provider-side rejection is `Ok(false)`; only transport failures are
//! errors.
//!
//! [`HttpSessionGateway`] can persist its bearer session through a
//! [`SessionStore`] so a restarted process recovers it with
//! [`HttpSessionGateway::restore`] before reconciling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::identity::address_from_identity;

/// Capacity of session change channels
pub(crate) const SESSION_CHANNEL_CAPACITY: usize = 32;

/// Errors that can occur while talking to the identity provider
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Identity provider request failed: {0}")]
    Transport(String),

    #[error("Invalid identity provider response: {0}")]
    InvalidResponse(String),
}

/// Session issued by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Provider-side session identifier
    pub session_id: String,
    /// Bearer token presented on later calls
    pub access_token: String,
    /// Synthetic identity (`<lowercased-address>@<domain>`)
    pub identity: String,
    /// Expiration time, if the provider reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Wallet address this session is bound to
    pub fn bound_address(&self, domain: &str) -> Option<String> {
        address_from_identity(&self.identity, domain)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

/// Identity provider surface used by the reconciler
#[async_trait]
pub trait SessionGateway: Send + Sync {
    /// Exchange a signed challenge for a session
    ///
    /// Returns `Ok(false)` when the provider rejects the signature.
    async fn authenticate(
        &self,
        address: &str,
        signature: &str,
        challenge_text: &str,
    ) -> Result<bool, GatewayError>;

    /// Recover the current session without prompting the wallet
    async fn current_session(&self) -> Result<Option<Session>, GatewayError>;

    /// Stream of session changes (sign-in, expiry, sign-out elsewhere)
    fn subscribe(&self) -> broadcast::Receiver<Option<Session>>;

    /// Sign out. Idempotent.
    async fn sign_out(&self) -> Result<(), GatewayError>;

    /// Domain suffix of synthetic session identities
    fn domain(&self) -> &str;
}

/// Durable storage for the provider session of a restarted process
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self) -> Option<Session>;

    async fn store_session(&self, session: &Session);

    async fn clear_session(&self);
}

/// Wallet login request body
#[derive(Debug, Serialize)]
struct WalletLoginRequest<'a> {
    wallet_address: &'a str,
    signature: &'a str,
    message: &'a str,
}

/// HTTP client for a remote identity provider
///
/// Endpoints (relative to `base_url`):
/// - `POST /auth/wallet` exchanges a signed challenge for a [`Session`]
/// - `GET /auth/session` returns the session for the bearer token
/// - `POST /auth/logout` revokes the bearer token
#[derive(Clone)]
pub struct HttpSessionGateway {
    base_url: String,
    domain: String,
    http_client: reqwest::Client,
    session: Arc<RwLock<Option<Session>>>,
    store: Option<Arc<dyn SessionStore>>,
    changes: broadcast::Sender<Option<Session>>,
}

impl HttpSessionGateway {
    /// Create a gateway with a pooled HTTP client
    pub fn new(
        base_url: impl Into<String>,
        domain: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        let (changes, _) = broadcast::channel(SESSION_CHANNEL_CAPACITY);

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            domain: domain.into(),
            http_client,
            session: Arc::new(RwLock::new(None)),
            store: None,
            changes,
        })
    }

    /// Seed the gateway with a session persisted by a previous run
    pub fn with_session(self, session: Session) -> Self {
        self.replace_session(Some(session));
        self
    }

    /// Persist sessions through `store`
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Load the persisted session into the gateway
    ///
    /// Returns `true` if a session was found. It is only trusted after
    /// `current_session` confirms it with the provider.
    pub async fn restore(&self) -> bool {
        let Some(store) = &self.store else {
            return false;
        };

        match store.load_session().await {
            Some(session) => {
                debug!(session_id = %session.session_id, "Restored persisted session");
                self.replace_session(Some(session));
                true
            }
            None => false,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn stored_session(&self) -> Option<Session> {
        match self.session.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swap the local session copy, returning the previous one
    fn replace_session(&self, session: Option<Session>) -> Option<Session> {
        let mut guard = match self.session.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, session)
    }

    fn publish(&self, session: Option<Session>) {
        // No receivers is fine
        let _ = self.changes.send(session);
    }

    async fn persist(&self, session: Option<&Session>) {
        let Some(store) = &self.store else {
            return;
        };

        match session {
            Some(session) => store.store_session(session).await,
            None => store.clear_session().await,
        }
    }
}

/// Map a login response status to accept/reject/transport error
fn classify_login_status(status: StatusCode) -> Result<bool, GatewayError> {
    match status {
        s if s.is_success() => Ok(true),
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(false),
        s => Err(GatewayError::Transport(format!(
            "Unexpected status from identity provider: {}",
            s
        ))),
    }
}

#[async_trait]
impl SessionGateway for HttpSessionGateway {
    async fn authenticate(
        &self,
        address: &str,
        signature: &str,
        challenge_text: &str,
    ) -> Result<bool, GatewayError> {
        let response = self
            .http_client
            .post(self.endpoint("/auth/wallet"))
            .json(&WalletLoginRequest {
                wallet_address: address,
                signature,
                message: challenge_text,
            })
            .send()
            .await
            .map_err(|e| GatewayError::Transport(format!("Login request failed: {}", e)))?;

        let status = response.status();
        if !classify_login_status(status)? {
            info!(address = %address, status = %status, "Identity provider rejected wallet login");
            return Ok(false);
        }

        let session: Session = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(format!("Failed to parse session: {}", e)))?;

        if session.bound_address(&self.domain).is_none() {
            return Err(GatewayError::InvalidResponse(format!(
                "Session identity '{}' is not bound to domain '{}'",
                session.identity, self.domain
            )));
        }

        debug!(address = %address, session_id = %session.session_id, "Wallet login accepted");
        self.replace_session(Some(session.clone()));
        self.persist(Some(&session)).await;
        self.publish(Some(session));
        Ok(true)
    }

    async fn current_session(&self) -> Result<Option<Session>, GatewayError> {
        let Some(stored) = self.stored_session() else {
            return Ok(None);
        };

        if stored.is_expired(Utc::now()) {
            debug!(session_id = %stored.session_id, "Stored session expired");
            self.replace_session(None);
            self.persist(None).await;
            self.publish(None);
            return Ok(None);
        }

        let response = self
            .http_client
            .get(self.endpoint("/auth/session"))
            .bearer_auth(&stored.access_token)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(format!("Session request failed: {}", e)))?;

        match response.status() {
            s if s.is_success() => {
                let session: Session = response.json().await.map_err(|e| {
                    GatewayError::InvalidResponse(format!("Failed to parse session: {}", e))
                })?;
                if session != stored {
                    self.replace_session(Some(session.clone()));
                    self.persist(Some(&session)).await;
                    self.publish(Some(session.clone()));
                }
                Ok(Some(session))
            }
            StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND => {
                info!(session_id = %stored.session_id, "Identity provider no longer recognises session");
                self.replace_session(None);
                self.persist(None).await;
                self.publish(None);
                Ok(None)
            }
            s => {
                error!(status = %s, "Unexpected status while fetching session");
                Err(GatewayError::Transport(format!(
                    "Unexpected status from identity provider: {}",
                    s
                )))
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Option<Session>> {
        self.changes.subscribe()
    }

    async fn sign_out(&self) -> Result<(), GatewayError> {
        let Some(previous) = self.replace_session(None) else {
            debug!("Sign-out with no active session");
            return Ok(());
        };
        self.persist(None).await;
        self.publish(None);

        // Local state is already cleared; a failed revoke only leaves a
        // dangling token on the provider side
        let result = self
            .http_client
            .post(self.endpoint("/auth/logout"))
            .bearer_auth(&previous.access_token)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) if response.status() == StatusCode::UNAUTHORIZED => Ok(()),
            Ok(response) => {
                warn!(status = %response.status(), "Logout returned unexpected status");
                Err(GatewayError::Transport(format!(
                    "Unexpected status from identity provider: {}",
                    response.status()
                )))
            }
            Err(e) => Err(GatewayError::Transport(format!("Logout request failed: {}", e))),
        }
    }

    fn domain(&self) -> &str {
        &self.domain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn session(identity: &str) -> Session {
        Session {
            session_id: "s1".to_string(),
            access_token: "token".to_string(),
            identity: identity.to_string(),
            expires_at: None,
        }
    }

    #[test]
    fn test_session_bound_address() {
        let s = session("0xaa@wallet.local");
        assert_eq!(s.bound_address("wallet.local"), Some("0xaa".to_string()));
        assert_eq!(s.bound_address("other.local"), None);
    }

    #[test]
    fn test_session_expiry() {
        let now = Utc::now();
        let mut s = session("0xaa@wallet.local");
        assert!(!s.is_expired(now));

        s.expires_at = Some(now - ChronoDuration::seconds(1));
        assert!(s.is_expired(now));
    }

    #[test]
    fn test_session_wire_format_without_expiry() {
        let parsed: Session = serde_json::from_value(serde_json::json!({
            "session_id": "s1",
            "access_token": "token",
            "identity": "0xaa@wallet.local"
        }))
        .unwrap();
        assert_eq!(parsed, session("0xaa@wallet.local"));

        let encoded = serde_json::to_value(&parsed).unwrap();
        assert!(encoded.get("expires_at").is_none());
    }

    #[test]
    fn test_classify_login_status() {
        assert!(classify_login_status(StatusCode::OK).unwrap());
        assert!(!classify_login_status(StatusCode::UNAUTHORIZED).unwrap());
        assert!(!classify_login_status(StatusCode::FORBIDDEN).unwrap());
        assert!(!classify_login_status(StatusCode::BAD_REQUEST).unwrap());
        assert!(matches!(
            classify_login_status(StatusCode::BAD_GATEWAY),
            Err(GatewayError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_http_gateway_without_session_needs_no_network() {
        let gateway =
            HttpSessionGateway::new("http://127.0.0.1:9/", "wallet.local", Duration::from_secs(1))
                .unwrap();

        assert_eq!(gateway.endpoint("/auth/session"), "http://127.0.0.1:9/auth/session");
        assert_eq!(gateway.current_session().await.unwrap(), None);
        assert!(gateway.sign_out().await.is_ok());
    }

    #[tokio::test]
    async fn test_http_gateway_drops_expired_session_locally() {
        let mut expired = session("0xaa@wallet.local");
        expired.expires_at = Some(Utc::now() - ChronoDuration::minutes(1));

        let gateway =
            HttpSessionGateway::new("http://127.0.0.1:9", "wallet.local", Duration::from_secs(1))
                .unwrap()
                .with_session(expired);
        let mut changes = gateway.subscribe();

        assert_eq!(gateway.current_session().await.unwrap(), None);
        assert_eq!(changes.recv().await.unwrap(), None);
    }
}
