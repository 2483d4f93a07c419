//! Common test utilities for integration tests
//!
//! Hand-written fakes for the wallet extension and the identity provider.
//! Both record call counts and expose switches for the user's choices
//! (decline, cancel, reject), and the gateway can park `authenticate` on a
//! gate so tests can interleave events with an in-flight attempt.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Notify};

use wallet_identity::identity::synthetic_identity;
use wallet_identity::{
    ChallengeBuilder, GatewayError, IdentityReconciler, MemoryProfileStore, MemorySessionCache,
    ProfileStore, Session, SessionCache, SessionGateway, WalletAdapter, WalletError, WalletEvent,
    WalletExtension,
};

pub const APP_NAME: &str = "Community Reports";
pub const DOMAIN: &str = "wallet.local";

// ----------------------------------------------------------------------
// Wallet
// ----------------------------------------------------------------------

/// Scriptable wallet extension
pub struct FakeWallet {
    available: bool,
    /// Account selected inside the extension
    account: Mutex<String>,
    /// Address reported to the page, `None` while disconnected
    connected: Mutex<Option<String>>,
    declines_connect: AtomicBool,
    cancels_signing: AtomicBool,
    sign_calls: AtomicUsize,
    events: broadcast::Sender<WalletEvent>,
}

impl FakeWallet {
    pub fn new(account: &str) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            available: true,
            account: Mutex::new(account.to_string()),
            connected: Mutex::new(None),
            declines_connect: AtomicBool::new(false),
            cancels_signing: AtomicBool::new(false),
            sign_calls: AtomicUsize::new(0),
            events,
        }
    }

    /// Wallet that is already connected (e.g. after a page reload)
    pub fn connected(account: &str) -> Self {
        let wallet = Self::new(account);
        *wallet.connected.lock().unwrap() = Some(account.to_string());
        wallet
    }

    /// No extension installed
    pub fn missing() -> Self {
        Self {
            available: false,
            ..Self::new("0x0")
        }
    }

    pub fn set_declines_connect(&self, declines: bool) {
        self.declines_connect.store(declines, Ordering::SeqCst);
    }

    pub fn set_cancels_signing(&self, cancels: bool) {
        self.cancels_signing.store(cancels, Ordering::SeqCst);
    }

    pub fn sign_calls(&self) -> usize {
        self.sign_calls.load(Ordering::SeqCst)
    }

    pub fn reported(&self) -> Option<String> {
        self.connected.lock().unwrap().clone()
    }

    /// User picks another account; returns `true` if the page was told
    pub fn switch_account(&self, account: &str) -> bool {
        *self.account.lock().unwrap() = account.to_string();
        let mut connected = self.connected.lock().unwrap();
        if connected.is_some() {
            *connected = Some(account.to_string());
            let _ = self.events.send(WalletEvent::Connected(account.to_string()));
            true
        } else {
            false
        }
    }

    /// Extension drops the connection on its own
    pub fn drop_connection(&self) {
        if self.connected.lock().unwrap().take().is_some() {
            let _ = self.events.send(WalletEvent::Disconnected);
        }
    }
}

#[async_trait]
impl WalletExtension for FakeWallet {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn connect(&self) -> Result<Option<String>, WalletError> {
        if self.declines_connect.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let account = self.account.lock().unwrap().clone();
        *self.connected.lock().unwrap() = Some(account.clone());
        let _ = self.events.send(WalletEvent::Connected(account.clone()));
        Ok(Some(account))
    }

    async fn disconnect(&self) -> Result<(), WalletError> {
        self.drop_connection();
        Ok(())
    }

    fn public_key(&self) -> Option<String> {
        self.reported()
    }

    async fn sign_message(&self, message: &str) -> Result<Option<String>, WalletError> {
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        if self.cancels_signing.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(format!("signed:{}", message)))
    }

    fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }
}

// ----------------------------------------------------------------------
// Identity provider
// ----------------------------------------------------------------------

/// Pair of notifications parking `authenticate` mid-flight
#[derive(Clone, Default)]
pub struct Gate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

/// Identity provider fake that trusts any signature unless told to reject
pub struct FakeGateway {
    session: Mutex<Option<Session>>,
    accepts: AtomicBool,
    unreachable: AtomicBool,
    gate: Mutex<Option<Gate>>,
    authenticate_calls: AtomicUsize,
    sign_out_calls: AtomicUsize,
    changes: broadcast::Sender<Option<Session>>,
}

impl Default for FakeGateway {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            session: Mutex::new(None),
            accepts: AtomicBool::new(true),
            unreachable: AtomicBool::new(false),
            gate: Mutex::new(None),
            authenticate_calls: AtomicUsize::new(0),
            sign_out_calls: AtomicUsize::new(0),
            changes,
        }
    }
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider already holds a session for `address`
    pub fn with_session(address: &str) -> Self {
        let gateway = Self::new();
        *gateway.session.lock().unwrap() = Some(session_for(address));
        gateway
    }

    pub fn set_accepts(&self, accepts: bool) {
        self.accepts.store(accepts, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Park the next `authenticate` calls until `gate.release` is notified
    pub fn install_gate(&self) -> Gate {
        let gate = Gate::default();
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn session(&self) -> Option<Session> {
        self.session.lock().unwrap().clone()
    }

    /// Session ends on the provider side (expiry, sign-out in another tab)
    pub fn expire(&self) {
        self.session.lock().unwrap().take();
        let _ = self.changes.send(None);
    }

    pub fn authenticate_calls(&self) -> usize {
        self.authenticate_calls.load(Ordering::SeqCst)
    }

    pub fn sign_out_calls(&self) -> usize {
        self.sign_out_calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), GatewayError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionGateway for FakeGateway {
    async fn authenticate(
        &self,
        address: &str,
        _signature: &str,
        _challenge_text: &str,
    ) -> Result<bool, GatewayError> {
        self.authenticate_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        if !self.accepts.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let session = session_for(address);
        *self.session.lock().unwrap() = Some(session.clone());
        let _ = self.changes.send(Some(session));
        Ok(true)
    }

    async fn current_session(&self) -> Result<Option<Session>, GatewayError> {
        self.check_reachable()?;
        Ok(self.session())
    }

    fn subscribe(&self) -> broadcast::Receiver<Option<Session>> {
        self.changes.subscribe()
    }

    async fn sign_out(&self) -> Result<(), GatewayError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        if self.session.lock().unwrap().take().is_some() {
            let _ = self.changes.send(None);
        }
        Ok(())
    }

    fn domain(&self) -> &str {
        DOMAIN
    }
}

pub fn session_for(address: &str) -> Session {
    Session {
        session_id: format!("session-{}", address.to_lowercase()),
        access_token: "wst_test".to_string(),
        identity: synthetic_identity(address, DOMAIN),
        expires_at: None,
    }
}

// ----------------------------------------------------------------------
// Cache
// ----------------------------------------------------------------------

/// Memory cache whose next `store` can be parked on a gate
#[derive(Default)]
pub struct GatedCache {
    inner: MemorySessionCache,
    gate: Mutex<Option<Gate>>,
}

impl GatedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park the next `store` until `gate.release` is notified
    pub fn install_gate(&self) -> Gate {
        let gate = Gate::default();
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl SessionCache for GatedCache {
    async fn load(&self) -> Option<String> {
        self.inner.load().await
    }

    async fn store(&self, address: &str) {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        self.inner.store(address).await;
    }

    async fn clear(&self) {
        self.inner.clear().await;
    }
}

// ----------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------

pub struct Harness {
    pub wallet: Arc<FakeWallet>,
    pub gateway: Arc<FakeGateway>,
    pub cache: Arc<MemorySessionCache>,
    pub reconciler: Arc<IdentityReconciler>,
}

impl Harness {
    pub fn new(wallet: FakeWallet, gateway: FakeGateway) -> Self {
        Self::build(
            wallet,
            gateway,
            MemorySessionCache::new(),
            Arc::new(MemoryProfileStore::new()),
        )
    }

    pub fn build(
        wallet: FakeWallet,
        gateway: FakeGateway,
        cache: MemorySessionCache,
        profiles: Arc<dyn ProfileStore>,
    ) -> Self {
        let wallet = Arc::new(wallet);
        let gateway = Arc::new(gateway);
        let cache = Arc::new(cache);

        let reconciler = Arc::new(IdentityReconciler::new(
            WalletAdapter::new(wallet.clone()),
            gateway.clone(),
            cache.clone(),
            profiles,
            ChallengeBuilder::new(APP_NAME),
        ));

        Self {
            wallet,
            gateway,
            cache,
            reconciler,
        }
    }
}
