//! Wallet capability wrapper
//!
//! [`WalletExtension`] is the vendor-neutral surface of an injected wallet
//! (availability, connect/disconnect, public key, message signing, and a
//! stream of connect/disconnect events). [`WalletAdapter`] wraps it with the
//! behaviour the reconciler relies on:
//!
//! - `connect` resolves to `None` when no extension is present
//! - `sign_message` is single-flight: while one signing prompt is open, a
//!   second call returns `Ok(None)` immediately instead of queueing
//!
//! `Ok(None)` from either call means "cancelled", never an error.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use alloy::signers::k256::ecdsa::SigningKey;

use crate::crypto;

/// Capacity of wallet event channels
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Errors raised by the wallet transport (not cancellations)
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Wallet RPC failed: {0}")]
    Rpc(String),

    #[error("Invalid wallet key: {0}")]
    InvalidKey(String),

    #[error("Signing failed: {0}")]
    Signing(String),
}

/// Events emitted by a wallet extension outside the page's control
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    /// The extension connected (or switched) to this address
    Connected(String),
    /// The extension disconnected
    Disconnected,
}

/// Injected wallet extension surface
#[async_trait]
pub trait WalletExtension: Send + Sync {
    /// Whether the extension is installed
    fn is_available(&self) -> bool;

    /// Ask the user to connect; `None` if they decline
    async fn connect(&self) -> Result<Option<String>, WalletError>;

    async fn disconnect(&self) -> Result<(), WalletError>;

    /// Currently reported address, if connected
    fn public_key(&self) -> Option<String>;

    /// Ask the user to sign `message`; `None` if they decline
    async fn sign_message(&self, message: &str) -> Result<Option<String>, WalletError>;

    /// Stream of connect/disconnect events
    fn subscribe(&self) -> broadcast::Receiver<WalletEvent>;
}

/// Capability wrapper handed to the reconciler
#[derive(Clone)]
pub struct WalletAdapter {
    extension: Arc<dyn WalletExtension>,
    signing: Arc<AtomicBool>,
}

impl WalletAdapter {
    pub fn new(extension: Arc<dyn WalletExtension>) -> Self {
        Self {
            extension,
            signing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_available(&self) -> bool {
        self.extension.is_available()
    }

    /// Connect the wallet
    ///
    /// Resolves to `None` if the extension is absent or the user declines.
    pub async fn connect(&self) -> Result<Option<String>, WalletError> {
        if !self.is_available() {
            info!("Wallet extension not available, cannot connect");
            return Ok(None);
        }
        self.extension.connect().await
    }

    pub async fn disconnect(&self) -> Result<(), WalletError> {
        if !self.is_available() {
            return Ok(());
        }
        self.extension.disconnect().await
    }

    /// Current known address (synchronous)
    pub fn public_key(&self) -> Option<String> {
        if !self.is_available() {
            return None;
        }
        self.extension.public_key()
    }

    /// Sign `text`, or return `None` if a signing request is already open
    pub async fn sign_message(&self, text: &str) -> Result<Option<String>, WalletError> {
        if !self.is_available() {
            return Ok(None);
        }

        let Some(_guard) = SigningGuard::acquire(&self.signing) else {
            debug!("Signing request already in flight, treating as cancelled");
            return Ok(None);
        };

        self.extension.sign_message(text).await
    }

    /// Subscribe to connect/disconnect events
    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.extension.subscribe()
    }
}

/// Holds the single signing slot until dropped
struct SigningGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> SigningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for SigningGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// In-process secp256k1 wallet for headless use
///
/// Behaves like an extension that is always installed: `connect` never
/// prompts, and signatures are EIP-191 personal_sign signatures.
pub struct LocalKeyWallet {
    key: SigningKey,
    address: String,
    connected: AtomicBool,
    events: broadcast::Sender<WalletEvent>,
}

impl LocalKeyWallet {
    pub fn new(key: SigningKey) -> Self {
        let address = crypto::pubkey_to_address(key.verifying_key());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            key,
            address,
            connected: AtomicBool::new(false),
            events,
        }
    }

    /// Load a wallet from a hex-encoded 32-byte private key (0x optional)
    pub fn from_hex(private_key: &str) -> Result<Self, WalletError> {
        let raw = private_key.trim();
        let bytes = hex::decode(raw.strip_prefix("0x").unwrap_or(raw))
            .map_err(|e| WalletError::InvalidKey(format!("Invalid hex: {}", e)))?;
        let key = SigningKey::from_slice(&bytes)
            .map_err(|e| WalletError::InvalidKey(e.to_string()))?;

        Ok(Self::new(key))
    }

    /// Generate a wallet with a fresh random key
    pub fn random() -> Self {
        Self::new(SigningKey::random(&mut rand::rngs::OsRng))
    }

    /// Address derived from the key, regardless of connection state
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl WalletExtension for LocalKeyWallet {
    fn is_available(&self) -> bool {
        true
    }

    async fn connect(&self) -> Result<Option<String>, WalletError> {
        self.connected.store(true, Ordering::SeqCst);
        // No receivers is fine: nobody may be listening yet
        let _ = self.events.send(WalletEvent::Connected(self.address.clone()));
        Ok(Some(self.address.clone()))
    }

    async fn disconnect(&self) -> Result<(), WalletError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(WalletEvent::Disconnected);
        }
        Ok(())
    }

    fn public_key(&self) -> Option<String> {
        self.connected
            .load(Ordering::SeqCst)
            .then(|| self.address.clone())
    }

    async fn sign_message(&self, message: &str) -> Result<Option<String>, WalletError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Ok(None);
        }

        crypto::sign_eip191(&self.key, message)
            .map(Some)
            .map_err(|e| WalletError::Signing(e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }
}
