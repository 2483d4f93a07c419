//! In-process identity provider
//!
//! [`LocalSessionGateway`] verifies signed login challenges itself instead of
//! calling a remote service. It is used by the agent binary in standalone
//! mode and by tests that need real signature checks.
//!
//! # Security
//!
//! - The bound address is parsed from the challenge text and must equal the
//!   claimed address
//! - Challenges older than the configured max age are rejected
//! - Each (address, timestamp) nonce is accepted once
//! - Signatures are verified as EIP-191 personal_sign signatures

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::RngCore;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::challenge::{ensure_fresh, parse_challenge};
use crate::crypto;
use crate::identity::{addresses_match, normalize_address, synthetic_identity};
use crate::session::{GatewayError, Session, SessionGateway, SESSION_CHANNEL_CAPACITY};

/// Token prefix for wallet session tokens
const TOKEN_PREFIX: &str = "wst_";

/// Length of random bytes for token generation (256 bits of entropy)
const TOKEN_ENTROPY_BYTES: usize = 32;

/// Settings for the in-process provider
#[derive(Debug, Clone)]
pub struct LocalProviderSettings {
    /// Application name the challenges must carry
    pub app_name: String,
    /// Synthetic identity domain
    pub domain: String,
    /// Maximum accepted challenge age
    pub max_challenge_age: Duration,
    /// Lifetime of issued sessions
    pub session_ttl: Duration,
}

/// Single-session identity provider that verifies challenges locally
pub struct LocalSessionGateway {
    settings: LocalProviderSettings,
    session: RwLock<Option<Session>>,
    used_nonces: DashMap<(String, i64), DateTime<Utc>>,
    changes: broadcast::Sender<Option<Session>>,
}

impl LocalSessionGateway {
    pub fn new(settings: LocalProviderSettings) -> Self {
        let (changes, _) = broadcast::channel(SESSION_CHANNEL_CAPACITY);
        Self {
            settings,
            session: RwLock::new(None),
            used_nonces: DashMap::new(),
            changes,
        }
    }

    /// Check the login attempt; returns the rejection reason if any
    fn check_login(
        &self,
        address: &str,
        signature: &str,
        challenge_text: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, String> {
        let parsed = parse_challenge(challenge_text, &self.settings.app_name)
            .map_err(|e| e.to_string())?;

        if !addresses_match(&parsed.wallet_address, address) {
            return Err(format!(
                "challenge is bound to {}, not {}",
                parsed.wallet_address, address
            ));
        }

        ensure_fresh(parsed.issued_at_ms, now, self.settings.max_challenge_age)
            .map_err(|e| e.to_string())?;

        crypto::verify_signature(challenge_text, signature, address).map_err(|e| e.to_string())?;

        Ok(parsed.issued_at_ms)
    }

    /// Record a nonce as used; `false` if it was already seen
    fn consume_nonce(&self, address: &str, issued_at_ms: i64, now: DateTime<Utc>) -> bool {
        // Anything older than the max age is rejected by ensure_fresh anyway
        let horizon = now - self.settings.max_challenge_age - Duration::minutes(1);
        self.used_nonces.retain(|_, seen_at| *seen_at > horizon);

        match self
            .used_nonces
            .entry((normalize_address(address), issued_at_ms))
        {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    fn issue_session(&self, address: &str, now: DateTime<Utc>) -> Session {
        let mut random_bytes = [0u8; TOKEN_ENTROPY_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut random_bytes);

        Session {
            session_id: uuid::Uuid::new_v4().to_string(),
            access_token: format!("{}{}", TOKEN_PREFIX, URL_SAFE_NO_PAD.encode(random_bytes)),
            identity: synthetic_identity(address, &self.settings.domain),
            expires_at: Some(now + self.settings.session_ttl),
        }
    }

    fn replace_session(&self, session: Option<Session>) -> Option<Session> {
        let mut guard = match self.session.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, session)
    }

    fn stored_session(&self) -> Option<Session> {
        match self.session.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl SessionGateway for LocalSessionGateway {
    async fn authenticate(
        &self,
        address: &str,
        signature: &str,
        challenge_text: &str,
    ) -> Result<bool, GatewayError> {
        let now = Utc::now();

        let issued_at_ms = match self.check_login(address, signature, challenge_text, now) {
            Ok(issued_at_ms) => issued_at_ms,
            Err(reason) => {
                info!(address = %address, reason = %reason, "Rejected wallet login");
                return Ok(false);
            }
        };

        if !self.consume_nonce(address, issued_at_ms, now) {
            info!(address = %address, nonce = issued_at_ms, "Rejected replayed challenge");
            return Ok(false);
        }

        let session = self.issue_session(address, now);
        debug!(
            address = %address,
            session_id = %session.session_id,
            "Issued wallet session"
        );

        self.replace_session(Some(session.clone()));
        let _ = self.changes.send(Some(session));
        Ok(true)
    }

    async fn current_session(&self) -> Result<Option<Session>, GatewayError> {
        match self.stored_session() {
            Some(session) if session.is_expired(Utc::now()) => {
                debug!(session_id = %session.session_id, "Session expired");
                self.replace_session(None);
                let _ = self.changes.send(None);
                Ok(None)
            }
            other => Ok(other),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Option<Session>> {
        self.changes.subscribe()
    }

    async fn sign_out(&self) -> Result<(), GatewayError> {
        if self.replace_session(None).is_some() {
            let _ = self.changes.send(None);
        }
        Ok(())
    }

    fn domain(&self) -> &str {
        &self.settings.domain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::ChallengeBuilder;
    use crate::wallet::{LocalKeyWallet, WalletExtension};

    const APP: &str = "Community Reports";

    fn gateway() -> LocalSessionGateway {
        LocalSessionGateway::new(LocalProviderSettings {
            app_name: APP.to_string(),
            domain: "wallet.local".to_string(),
            max_challenge_age: Duration::minutes(5),
            session_ttl: Duration::hours(1),
        })
    }

    async fn connected_wallet() -> (LocalKeyWallet, String) {
        let wallet = LocalKeyWallet::random();
        let address = wallet.connect().await.unwrap().unwrap();
        (wallet, address)
    }

    #[tokio::test]
    async fn test_valid_signature_issues_bound_session() {
        let gateway = gateway();
        let (wallet, address) = connected_wallet().await;
        let challenge = ChallengeBuilder::new(APP).build(&address).unwrap();
        let signature = wallet
            .sign_message(&challenge.rendered_text)
            .await
            .unwrap()
            .unwrap();

        let mut changes = gateway.subscribe();
        assert!(gateway
            .authenticate(&address, &signature, &challenge.rendered_text)
            .await
            .unwrap());

        let session = gateway.current_session().await.unwrap().unwrap();
        assert_eq!(session.bound_address("wallet.local"), Some(address.clone()));
        assert!(session.access_token.starts_with(TOKEN_PREFIX));
        assert_eq!(changes.recv().await.unwrap(), Some(session));
    }

    #[tokio::test]
    async fn test_replayed_challenge_rejected() {
        let gateway = gateway();
        let (wallet, address) = connected_wallet().await;
        let challenge = ChallengeBuilder::new(APP).build(&address).unwrap();
        let signature = wallet
            .sign_message(&challenge.rendered_text)
            .await
            .unwrap()
            .unwrap();

        assert!(gateway
            .authenticate(&address, &signature, &challenge.rendered_text)
            .await
            .unwrap());
        assert!(!gateway
            .authenticate(&address, &signature, &challenge.rendered_text)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_challenge_for_other_address_rejected() {
        let gateway = gateway();
        let (wallet, address) = connected_wallet().await;
        let (_, other) = connected_wallet().await;
        let challenge = ChallengeBuilder::new(APP).build(&other).unwrap();
        let signature = wallet
            .sign_message(&challenge.rendered_text)
            .await
            .unwrap()
            .unwrap();

        assert!(!gateway
            .authenticate(&address, &signature, &challenge.rendered_text)
            .await
            .unwrap());
        assert_eq!(gateway.current_session().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_challenge_rejected() {
        let gateway = gateway();
        let (wallet, address) = connected_wallet().await;
        let challenge = ChallengeBuilder::new(APP)
            .build_at(&address, Utc::now() - Duration::minutes(10))
            .unwrap();
        let signature = wallet
            .sign_message(&challenge.rendered_text)
            .await
            .unwrap()
            .unwrap();

        assert!(!gateway
            .authenticate(&address, &signature, &challenge.rendered_text)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_garbage_signature_is_rejection_not_error() {
        let gateway = gateway();
        let (_, address) = connected_wallet().await;
        let challenge = ChallengeBuilder::new(APP).build(&address).unwrap();

        let result = gateway
            .authenticate(&address, "0xdeadbeef", &challenge.rendered_text)
            .await;
        assert!(matches!(result, Ok(false)));
    }

    #[tokio::test]
    async fn test_sign_out_is_idempotent() {
        let gateway = gateway();
        let mut changes = gateway.subscribe();

        gateway.sign_out().await.unwrap();
        gateway.sign_out().await.unwrap();

        assert!(matches!(
            changes.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
