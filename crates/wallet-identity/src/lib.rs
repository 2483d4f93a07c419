//! Wallet-backed authentication and identity reconciliation
//!
//! Keeps three independently changing sources of truth consistent: the
//! address a browser-style wallet currently reports, the session held by an
//! identity provider, and a locally cached "last authenticated address".
//!
//! - [`wallet`]: capability wrapper around an injected wallet
//! - [`challenge`]: login challenge construction and parsing
//! - [`session`]: identity provider gateway
//! - [`provider`]: in-process identity provider
//! - [`cache`]: last-address cache
//! - [`profile`]: profile records keyed by wallet address
//! - [`reconciler`]: the state machine tying them together

pub mod cache;
pub mod challenge;
pub mod crypto;
pub mod identity;
pub mod profile;
pub mod provider;
pub mod reconciler;
pub mod session;
pub mod wallet;

pub use cache::{MemorySessionCache, RedisSessionCache, SessionCache};
pub use challenge::{Challenge, ChallengeBuilder, ChallengeError};
pub use profile::{HttpProfileStore, MemoryProfileStore, Profile, ProfileError, ProfileStore};
pub use provider::{LocalProviderSettings, LocalSessionGateway};
pub use reconciler::{
    AuthNotice, ConnectOutcome, ConnectionState, IdentityReconciler, ReconcileError,
};
pub use session::{GatewayError, HttpSessionGateway, Session, SessionGateway, SessionStore};
pub use wallet::{LocalKeyWallet, WalletAdapter, WalletError, WalletEvent, WalletExtension};
