//! Identity reconciliation state machine
//!
//! Owns the canonical "connected identity" and keeps it consistent with both
//! the live wallet and the provider session.
//!
//! # State Machine
//!
//! ```text
//! DISCONNECTED
//!   ↓ (user clicks connect)
//! PENDING_SIGNATURE ──(wallet declines)──→ DISCONNECTED
//!   ↓ (wallet connects with address A)
//! AUTHENTICATING(A) ──(signature cancelled)──→ DISCONNECTED
//!   ↓ (provider accepts, session bound to A, wallet still reports A)
//! AUTHENTICATED(A) ──(wallet disconnect / session ended)──→ DISCONNECTED
//!
//! any state ──(session and wallet disagree)──→ INVALID ──(cleanup)──→ DISCONNECTED
//! ```
//!
//! # Invariants
//!
//! After every settled transition:
//! - a held session is bound to the address the wallet currently reports
//! - the session cache is written only while that holds, and cleared on teardown
//! - profiles are fetched and saved only for an authenticated address
//!
//! # Attempt tokens
//!
//! Every flow captures a monotonically increasing attempt number when it
//! starts, and every teardown bumps it. Each async step re-checks the token
//! and the wallet's current address before committing, so a slow result for
//! a superseded attempt is discarded instead of overwriting newer state.
//!
//! Call [`IdentityReconciler::boot`] before [`IdentityReconciler::run`]: the
//! event loop signs out sessions it finds while disconnected.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::SessionCache;
use crate::challenge::{ChallengeBuilder, ChallengeError};
use crate::identity::{addresses_match, normalize_address};
use crate::profile::{Profile, ProfileError, ProfileStore};
use crate::session::{GatewayError, Session, SessionGateway};
use crate::wallet::{WalletAdapter, WalletError, WalletEvent};

/// Capacity of the notice channel
const NOTICE_CHANNEL_CAPACITY: usize = 32;

/// Reconciler states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No wallet identity and no session
    Disconnected,
    /// Waiting for the wallet to connect
    PendingSignature,
    /// Challenge signing and provider exchange in progress
    Authenticating { address: String },
    /// Session and wallet agree on this address
    Authenticated { address: String },
    /// Mismatch detected, cleanup in progress
    Invalid,
}

impl ConnectionState {
    /// Address of an authenticated identity, if any
    pub fn authenticated_address(&self) -> Option<&str> {
        match self {
            ConnectionState::Authenticated { address } => Some(address),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::PendingSignature => write!(f, "PendingSignature"),
            ConnectionState::Authenticating { address } => write!(f, "Authenticating({})", address),
            ConnectionState::Authenticated { address } => write!(f, "Authenticated({})", address),
            ConnectionState::Invalid => write!(f, "Invalid"),
        }
    }
}

/// Result of a connect flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Session established for this address
    Authenticated(String),
    /// Address was already authenticated with a matching session
    AlreadyAuthenticated(String),
    /// An attempt for this address is already running
    InFlight,
    /// No wallet extension installed
    ExtensionMissing,
    /// The user declined to connect or sign
    Cancelled,
    /// The identity provider rejected the signature
    Rejected,
    /// A newer attempt or a disconnect overtook this one
    Superseded,
    /// Session and wallet disagreed after authentication
    IdentityMismatch,
}

impl ConnectOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectOutcome::Authenticated(_) => "authenticated",
            ConnectOutcome::AlreadyAuthenticated(_) => "already_authenticated",
            ConnectOutcome::InFlight => "in_flight",
            ConnectOutcome::ExtensionMissing => "extension_missing",
            ConnectOutcome::Cancelled => "cancelled",
            ConnectOutcome::Rejected => "rejected",
            ConnectOutcome::Superseded => "superseded",
            ConnectOutcome::IdentityMismatch => "identity_mismatch",
        }
    }
}

/// User-visible notices
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthNotice {
    /// No wallet extension; direct the user to install one
    InstallWallet,
    /// The provider rejected the login; the user may retry
    AuthenticationFailed,
    /// Wallet or provider transport failed
    TransportFailure(String),
    /// Session and wallet disagreed; the session was signed out
    IdentityMismatch,
}

/// Errors surfaced by reconciler operations (transport-class failures)
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Challenge(#[from] ChallengeError),

    #[error(transparent)]
    Profile(#[from] ProfileError),
}

struct Inner {
    state: ConnectionState,
    attempt: u64,
    /// Address bound to the session verified at commit
    session_address: Option<String>,
    profile: Option<Profile>,
}

/// The identity reconciliation state machine
pub struct IdentityReconciler {
    wallet: WalletAdapter,
    gateway: Arc<dyn SessionGateway>,
    cache: Arc<dyn SessionCache>,
    profiles: Arc<dyn ProfileStore>,
    challenges: ChallengeBuilder,
    inner: RwLock<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    notices: broadcast::Sender<AuthNotice>,
}

impl IdentityReconciler {
    pub fn new(
        wallet: WalletAdapter,
        gateway: Arc<dyn SessionGateway>,
        cache: Arc<dyn SessionCache>,
        profiles: Arc<dyn ProfileStore>,
        challenges: ChallengeBuilder,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);

        Self {
            wallet,
            gateway,
            cache,
            profiles,
            challenges,
            inner: RwLock::new(Inner {
                state: ConnectionState::Disconnected,
                attempt: 0,
                session_address: None,
                profile: None,
            }),
            state_tx,
            notices,
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.read().await.state.clone()
    }

    /// Profile loaded for the authenticated address
    pub async fn profile(&self) -> Option<Profile> {
        self.inner.read().await.profile.clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<AuthNotice> {
        self.notices.subscribe()
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Recover a prior session without prompting the wallet
    ///
    /// The session is trusted only if its bound address equals the address
    /// the wallet reports right now; otherwise it is signed out.
    pub async fn boot(&self) -> Result<ConnectionState, ReconcileError> {
        let attempt = self.next_attempt().await;

        let (cached, session) = tokio::join!(self.cache.load(), self.gateway.current_session());
        let session = match session {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Failed to recover session on boot");
                self.notify(AuthNotice::TransportFailure(e.to_string()));
                self.settle_disconnected(attempt).await;
                return Err(e.into());
            }
        };

        let Some(session) = session else {
            if let Some(cached) = cached {
                debug!(cached = %cached, "No session on boot, clearing cached wallet address");
                self.cache.clear().await;
            }
            return Ok(self.state().await);
        };

        let bound = session.bound_address(self.gateway.domain());
        let live = self.wallet.public_key();

        match (bound, live) {
            (Some(bound), Some(live)) if addresses_match(&bound, &live) => {
                if let Some(cached) = cached.as_deref().filter(|c| !addresses_match(c, &live)) {
                    debug!(cached = %cached, live = %live, "Cached wallet address is stale");
                }
                if self.commit_authenticated(attempt, &live).await {
                    info!(address = %live, "Recovered wallet session on boot");
                }
            }
            (bound, live) => {
                warn!(
                    session_address = ?bound,
                    wallet_address = ?live,
                    "Session on boot does not match wallet"
                );
                self.notify(AuthNotice::IdentityMismatch);
                self.teardown("boot identity mismatch", true, true).await;
            }
        }

        Ok(self.state().await)
    }

    /// User-initiated connect
    pub async fn connect(&self) -> Result<ConnectOutcome, ReconcileError> {
        if !self.wallet.is_available() {
            info!("Wallet extension not installed");
            self.notify(AuthNotice::InstallWallet);
            return Ok(self.finish(ConnectOutcome::ExtensionMissing));
        }

        let attempt = {
            let mut inner = self.inner.write().await;
            if matches!(
                inner.state,
                ConnectionState::Disconnected | ConnectionState::Invalid
            ) {
                inner.attempt += 1;
                self.set_state(&mut inner, ConnectionState::PendingSignature);
            }
            inner.attempt
        };

        let address = match self.wallet.connect().await {
            Ok(Some(address)) => address,
            Ok(None) => {
                debug!("Wallet connection declined");
                self.settle_pending(attempt).await;
                return Ok(self.finish(ConnectOutcome::Cancelled));
            }
            Err(e) => {
                error!(error = %e, "Wallet connect failed");
                self.notify(AuthNotice::TransportFailure(e.to_string()));
                self.settle_pending(attempt).await;
                return Err(e.into());
            }
        };

        self.handle_wallet_connected(&address).await
    }

    /// Wallet reported a connection to `address`
    ///
    /// Runs challenge → sign → exchange → verify unless the address is
    /// already authenticated or already being authenticated.
    pub async fn handle_wallet_connected(
        &self,
        address: &str,
    ) -> Result<ConnectOutcome, ReconcileError> {
        // Check and start under one write guard so duplicate events cannot
        // both begin an attempt
        let attempt = loop {
            let previous = {
                let mut inner = self.inner.write().await;
                match inner.state.clone() {
                    ConnectionState::Authenticated { address: current }
                        if addresses_match(&current, address)
                            && inner
                                .session_address
                                .as_deref()
                                .is_some_and(|bound| addresses_match(bound, address)) =>
                    {
                        debug!(address = %current, "Wallet already authenticated, skipping signature");
                        return Ok(self.finish(ConnectOutcome::AlreadyAuthenticated(current)));
                    }
                    ConnectionState::Authenticating { address: pending }
                        if addresses_match(&pending, address) =>
                    {
                        debug!(address = %pending, "Authentication already in flight");
                        return Ok(self.finish(ConnectOutcome::InFlight));
                    }
                    ConnectionState::Authenticated { address: current } => current,
                    _ => {
                        inner.attempt += 1;
                        self.set_state(
                            &mut inner,
                            ConnectionState::Authenticating {
                                address: address.to_string(),
                            },
                        );
                        break inner.attempt;
                    }
                }
            };

            info!(previous = %previous, address = %address, "Wallet switched accounts");
            self.teardown("wallet switched accounts", true, true).await;
        };

        let outcome = self.authenticate_attempt(attempt, address).await;
        outcome.map(|outcome| self.finish(outcome))
    }

    /// Wallet reported a disconnect
    pub async fn handle_wallet_disconnected(&self) {
        let held = self.holds_session().await;
        info!(session_held = held, "Wallet disconnected");
        self.teardown("wallet disconnected", held, false).await;
    }

    /// Provider reported a session change
    ///
    /// The payload may be stale by the time it is processed, so the current
    /// session is re-read. A `None` change tears down the authenticated
    /// identity even if that re-read fails.
    pub async fn handle_session_changed(&self, change: Option<Session>) {
        match self.verify_identity().await {
            Ok(_) => {}
            Err(e) if change.is_none() => {
                warn!(error = %e, "Could not confirm session end, tearing down");
                if self.holds_session().await {
                    self.teardown("session ended", false, false).await;
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to verify identity after session change");
                self.notify(AuthNotice::TransportFailure(e.to_string()));
            }
        }
    }

    /// Catch-all consistency check
    ///
    /// Returns `Ok(true)` if session, wallet, and state agree. On a mismatch
    /// the session is signed out and the state ends `Disconnected`.
    pub async fn verify_identity(&self) -> Result<bool, ReconcileError> {
        let session = self.gateway.current_session().await?;
        let state = self.state().await;
        let live = self.wallet.public_key();
        let bound = session
            .as_ref()
            .map(|s| s.bound_address(self.gateway.domain()));

        match (bound, state) {
            (None, ConnectionState::Authenticated { address }) => {
                info!(address = %address, "Session ended externally");
                self.teardown("session ended", false, false).await;
                Ok(false)
            }
            (None, _) => Ok(true),
            (Some(bound), ConnectionState::Authenticated { address }) => {
                let consistent = bound.as_deref().is_some_and(|b| addresses_match(b, &address))
                    && live.as_deref().is_some_and(|l| addresses_match(l, &address));
                if consistent {
                    return Ok(true);
                }

                warn!(
                    address = %address,
                    session_address = ?bound,
                    wallet_address = ?live,
                    "Identity mismatch detected"
                );
                self.notify(AuthNotice::IdentityMismatch);
                self.teardown("identity mismatch", true, true).await;
                Ok(false)
            }
            (Some(bound), ConnectionState::Authenticating { address })
                if bound.as_deref().is_some_and(|b| addresses_match(b, &address)) =>
            {
                // The in-flight attempt verifies before it commits
                Ok(true)
            }
            (Some(bound), state) => {
                warn!(
                    state = %state,
                    session_address = ?bound,
                    "Signing out session not owned by the current identity"
                );
                if let Err(e) = self.gateway.sign_out().await {
                    error!(error = %e, "Failed to sign out stray session");
                    return Err(e.into());
                }
                Ok(false)
            }
        }
    }

    /// Explicit sign-out: tear down the session and disconnect the wallet
    pub async fn sign_out(&self) -> Result<(), ReconcileError> {
        self.teardown("user signed out", true, false).await;
        self.wallet.disconnect().await?;
        Ok(())
    }

    /// Save the profile of the authenticated wallet
    pub async fn save_profile(&self, profile: Profile) -> Result<Profile, ReconcileError> {
        let attempt = {
            let inner = self.inner.read().await;
            let authorised = inner
                .state
                .authenticated_address()
                .is_some_and(|address| addresses_match(address, &profile.wallet_address))
                && self
                    .wallet
                    .public_key()
                    .is_some_and(|live| addresses_match(&live, &profile.wallet_address));
            if !authorised {
                return Err(ProfileError::NotAuthenticated(profile.wallet_address).into());
            }
            inner.attempt
        };

        let saved = self.profiles.save(profile).await?;

        let mut inner = self.inner.write().await;
        if inner.attempt == attempt {
            inner.profile = Some(saved.clone());
        }
        Ok(saved)
    }

    /// Event loop feeding wallet and session streams into the state machine
    ///
    /// Connect flows run as spawned tasks so disconnects and session changes
    /// are processed while a signature or provider call is pending.
    pub async fn run(self: Arc<Self>, cancel_token: CancellationToken) {
        let mut wallet_events = self.wallet.subscribe();
        let mut session_events = self.gateway.subscribe();

        info!("Identity reconciler started");

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("Identity reconciler stopping due to shutdown");
                    break;
                }
                event = wallet_events.recv() => match event {
                    Ok(WalletEvent::Connected(address)) => {
                        let reconciler = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = reconciler.handle_wallet_connected(&address).await {
                                error!(address = %address, error = %e, "Wallet connect flow failed");
                            }
                        });
                    }
                    Ok(WalletEvent::Disconnected) => self.handle_wallet_disconnected().await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Wallet events lagged, re-verifying identity");
                        if let Err(e) = self.verify_identity().await {
                            error!(error = %e, "Identity verification failed");
                        }
                    }
                    Err(RecvError::Closed) => {
                        warn!("Wallet event stream closed");
                        break;
                    }
                },
                change = session_events.recv() => match change {
                    Ok(change) => self.handle_session_changed(change).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Session events lagged, re-verifying identity");
                        if let Err(e) = self.verify_identity().await {
                            error!(error = %e, "Identity verification failed");
                        }
                    }
                    Err(RecvError::Closed) => {
                        warn!("Session event stream closed");
                        break;
                    }
                },
            }
        }

        info!("Identity reconciler stopped");
    }

    // ------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------

    async fn authenticate_attempt(
        &self,
        attempt: u64,
        address: &str,
    ) -> Result<ConnectOutcome, ReconcileError> {
        let challenge = match self.challenges.build(address) {
            Ok(challenge) => challenge,
            Err(e) => {
                warn!(address = %address, error = %e, "Cannot build challenge");
                self.settle_disconnected(attempt).await;
                return Err(e.into());
            }
        };

        let signature = match self.wallet.sign_message(&challenge.rendered_text).await {
            Ok(Some(signature)) => signature,
            Ok(None) => {
                debug!(address = %address, attempt = attempt, "Signature request cancelled");
                self.settle_disconnected(attempt).await;
                return Ok(ConnectOutcome::Cancelled);
            }
            Err(e) => {
                error!(address = %address, error = %e, "Wallet signing failed");
                self.notify(AuthNotice::TransportFailure(e.to_string()));
                self.settle_disconnected(attempt).await;
                return Err(e.into());
            }
        };

        if !self.is_current(attempt, address).await {
            debug!(address = %address, attempt = attempt, "Discarding stale signature");
            return Ok(ConnectOutcome::Superseded);
        }

        let accepted = match self
            .gateway
            .authenticate(address, &signature, &challenge.rendered_text)
            .await
        {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(address = %address, error = %e, "Identity provider unreachable");
                self.notify(AuthNotice::TransportFailure(e.to_string()));
                self.settle_disconnected(attempt).await;
                return Err(e.into());
            }
        };

        if !self.is_current(attempt, address).await {
            return Ok(self.discard_stale(attempt, address, accepted).await);
        }

        if !accepted {
            warn!(address = %address, "Identity provider rejected wallet signature");
            self.notify(AuthNotice::AuthenticationFailed);
            self.teardown("authentication rejected", true, false).await;
            return Ok(ConnectOutcome::Rejected);
        }

        let session = match self.gateway.current_session().await {
            Ok(session) => session,
            Err(e) => {
                error!(address = %address, error = %e, "Failed to read session after login");
                self.notify(AuthNotice::TransportFailure(e.to_string()));
                self.teardown("session unreadable after login", true, false).await;
                return Err(e.into());
            }
        };

        if !self.is_current(attempt, address).await {
            return Ok(self.discard_stale(attempt, address, true).await);
        }

        let bound = session.and_then(|s| s.bound_address(self.gateway.domain()));
        let live = self.wallet.public_key();
        let live = match (bound, live) {
            (Some(bound), Some(live))
                if addresses_match(&bound, address) && addresses_match(&live, address) =>
            {
                live
            }
            (bound, live) => {
                warn!(
                    address = %address,
                    session_address = ?bound,
                    wallet_address = ?live,
                    "Session does not match wallet after login"
                );
                self.notify(AuthNotice::IdentityMismatch);
                self.teardown("identity mismatch after login", true, true).await;
                return Ok(ConnectOutcome::IdentityMismatch);
            }
        };

        if !self.commit_authenticated(attempt, &live).await {
            return Ok(self.discard_stale(attempt, address, true).await);
        }

        info!(address = %live, "Wallet authenticated");
        Ok(ConnectOutcome::Authenticated(live))
    }

    async fn discard_stale(&self, attempt: u64, address: &str, accepted: bool) -> ConnectOutcome {
        debug!(
            address = %address,
            attempt = attempt,
            accepted = accepted,
            "Discarding stale authentication result"
        );
        if accepted {
            // The provider may now hold a session nobody owns
            if let Err(e) = self.verify_identity().await {
                error!(error = %e, "Identity verification after stale login failed");
            }
        }
        ConnectOutcome::Superseded
    }

    /// Move to `Authenticated`, write the cache, and load the profile once
    async fn commit_authenticated(&self, attempt: u64, address: &str) -> bool {
        {
            let mut inner = self.inner.write().await;
            if inner.attempt != attempt {
                return false;
            }
            inner.session_address = Some(normalize_address(address));
            inner.profile = None;
            self.set_state(
                &mut inner,
                ConnectionState::Authenticated {
                    address: address.to_string(),
                },
            );
        }

        self.cache.store(address).await;

        // A teardown may have cleared the cache while the write was pending
        if !self.attempt_is_latest(attempt).await {
            debug!(address = %address, attempt = attempt, "Attempt superseded during cache write");
            self.resync_cache().await;
            return false;
        }

        match self.profiles.get_by_wallet(address).await {
            Ok(profile) => {
                let mut inner = self.inner.write().await;
                if inner.attempt == attempt {
                    debug!(address = %address, found = profile.is_some(), "Loaded profile");
                    inner.profile = profile;
                }
            }
            Err(e) => {
                warn!(address = %address, error = %e, "Failed to load profile");
            }
        }

        true
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Tear down session, cache, and profile
    ///
    /// `invalid` routes through `Invalid` before settling on `Disconnected`.
    async fn teardown(&self, reason: &str, sign_out: bool, invalid: bool) {
        let token = {
            let mut inner = self.inner.write().await;
            inner.attempt += 1;
            inner.session_address = None;
            inner.profile = None;
            let next = if invalid {
                ConnectionState::Invalid
            } else {
                ConnectionState::Disconnected
            };
            self.set_state(&mut inner, next);
            inner.attempt
        };

        warn!(reason = %reason, sign_out = sign_out, "Tearing down wallet session");

        #[cfg(feature = "metrics")]
        metrics::counter!("wallet_identity.teardowns", "invalid" => invalid.to_string())
            .increment(1);

        self.cache.clear().await;

        if sign_out {
            if let Err(e) = self.gateway.sign_out().await {
                error!(reason = %reason, error = %e, "Sign-out failed during teardown");
            }
        }

        self.settle_disconnected(token).await;
    }

    /// Rewrite the cache from the current state after a stale write
    async fn resync_cache(&self) {
        let current = self
            .inner
            .read()
            .await
            .state
            .authenticated_address()
            .map(str::to_string);

        match current {
            Some(address) => self.cache.store(&address).await,
            None => self.cache.clear().await,
        }
    }

    async fn attempt_is_latest(&self, attempt: u64) -> bool {
        self.inner.read().await.attempt == attempt
    }

    async fn next_attempt(&self) -> u64 {
        let mut inner = self.inner.write().await;
        inner.attempt += 1;
        inner.attempt
    }

    /// Whether `attempt` is still the latest and the wallet still reports `address`
    async fn is_current(&self, attempt: u64, address: &str) -> bool {
        self.attempt_is_latest(attempt).await
            && self
                .wallet
                .public_key()
                .is_some_and(|live| addresses_match(&live, address))
    }

    async fn holds_session(&self) -> bool {
        let inner = self.inner.read().await;
        matches!(inner.state, ConnectionState::Authenticated { .. })
            || inner.session_address.is_some()
    }

    /// Return to `Disconnected` if `attempt` is still the latest
    async fn settle_disconnected(&self, attempt: u64) {
        let mut inner = self.inner.write().await;
        if inner.attempt == attempt && inner.state != ConnectionState::Disconnected {
            inner.session_address = None;
            inner.profile = None;
            self.set_state(&mut inner, ConnectionState::Disconnected);
        }
    }

    /// Leave `PendingSignature` after a declined or failed wallet connect
    async fn settle_pending(&self, attempt: u64) {
        let mut inner = self.inner.write().await;
        if inner.attempt == attempt && inner.state == ConnectionState::PendingSignature {
            self.set_state(&mut inner, ConnectionState::Disconnected);
        }
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state != state {
            debug!(from = %inner.state, to = %state, attempt = inner.attempt, "State transition");
        }
        inner.state = state.clone();
        self.state_tx.send_replace(state);
    }

    fn notify(&self, notice: AuthNotice) {
        // No receivers is fine
        let _ = self.notices.send(notice);
    }

    fn finish(&self, outcome: ConnectOutcome) -> ConnectOutcome {
        #[cfg(feature = "metrics")]
        metrics::counter!("wallet_identity.connect_outcomes", "outcome" => outcome.as_str())
            .increment(1);

        debug!(outcome = outcome.as_str(), "Connect flow finished");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "Disconnected");
        assert_eq!(
            ConnectionState::Authenticated {
                address: "0xAA".to_string()
            }
            .to_string(),
            "Authenticated(0xAA)"
        );
    }

    #[test]
    fn test_authenticated_address() {
        let state = ConnectionState::Authenticated {
            address: "0xAA".to_string(),
        };
        assert_eq!(state.authenticated_address(), Some("0xAA"));
        assert_eq!(
            ConnectionState::Authenticating {
                address: "0xAA".to_string()
            }
            .authenticated_address(),
            None
        );
    }

    #[test]
    fn test_outcome_labels_are_distinct() {
        let outcomes = [
            ConnectOutcome::Authenticated("a".to_string()),
            ConnectOutcome::AlreadyAuthenticated("a".to_string()),
            ConnectOutcome::InFlight,
            ConnectOutcome::ExtensionMissing,
            ConnectOutcome::Cancelled,
            ConnectOutcome::Rejected,
            ConnectOutcome::Superseded,
            ConnectOutcome::IdentityMismatch,
        ];
        let labels: std::collections::HashSet<_> = outcomes.iter().map(|o| o.as_str()).collect();
        assert_eq!(labels.len(), outcomes.len());
    }
}
