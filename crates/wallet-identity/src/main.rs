//! Identity agent
//!
//! Runs the wallet identity reconciler headless, with an in-process key as
//! the wallet, until interrupted. `IDENTITY_PROVIDER=local` swaps the remote
//! identity provider for the in-process one.

use anyhow::{Context, Result};
use shared::{Config, IdentityConfig, ProviderMode};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use wallet_identity::{
    ChallengeBuilder, ConnectionState, HttpProfileStore, HttpSessionGateway, IdentityReconciler,
    LocalKeyWallet, LocalProviderSettings, LocalSessionGateway, MemoryProfileStore, ProfileStore,
    RedisSessionCache, SessionGateway, WalletAdapter,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    shared::init_tracing();

    tracing::info!("Starting Identity Agent...");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    let identity = &config.identity;
    let http_timeout = Duration::from_secs(identity.http_timeout_secs);

    // Wallet key
    let private_key = std::env::var("WALLET_PRIVATE_KEY")
        .context("WALLET_PRIVATE_KEY must be set")?;
    let wallet = LocalKeyWallet::from_hex(&private_key).context("Failed to load wallet key")?;
    tracing::info!(address = %wallet.address(), "Loaded wallet key");

    // Create Redis connection
    let redis_conn = shared::redis::create_client(&config.redis.connection_url())
        .await
        .context("Failed to connect to Redis")?;

    tracing::info!("Connected to Redis");

    let cache = Arc::new(RedisSessionCache::new(
        redis_conn,
        identity.cache_key.as_str(),
        Duration::from_secs(identity.cache_ttl_secs),
    ));

    let (gateway, profiles): (Arc<dyn SessionGateway>, Arc<dyn ProfileStore>) =
        match identity.provider_mode {
            ProviderMode::Http => {
                let gateway = HttpSessionGateway::new(
                    identity.provider_url.as_str(),
                    identity.session_domain.as_str(),
                    http_timeout,
                )
                .context("Failed to create identity provider client")?
                .with_store(cache.clone());

                if gateway.restore().await {
                    tracing::info!("Found persisted session from a previous run");
                }

                let profiles = HttpProfileStore::new(identity.profile_url.as_str(), http_timeout)
                    .context("Failed to create profile service client")?;

                (Arc::new(gateway), Arc::new(profiles))
            }
            ProviderMode::Local => {
                tracing::info!("Using in-process identity provider");
                let gateway = LocalSessionGateway::new(local_provider_settings(identity)?);
                (Arc::new(gateway), Arc::new(MemoryProfileStore::new()))
            }
        };

    let reconciler = Arc::new(IdentityReconciler::new(
        WalletAdapter::new(Arc::new(wallet)),
        gateway,
        cache,
        profiles,
        ChallengeBuilder::new(identity.app_name.as_str()),
    ));

    let mut notices = reconciler.subscribe_notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            tracing::warn!(notice = ?notice, "Authentication notice");
        }
    });

    let state = reconciler
        .boot()
        .await
        .context("Failed to recover session")?;

    if !matches!(state, ConnectionState::Authenticated { .. }) {
        let outcome = reconciler
            .connect()
            .await
            .context("Failed to authenticate wallet")?;
        tracing::info!(outcome = outcome.as_str(), "Connect finished");
    }

    let cancel_token = CancellationToken::new();
    let loop_handle = tokio::spawn({
        let reconciler = Arc::clone(&reconciler);
        let cancel_token = cancel_token.clone();
        async move { reconciler.run(cancel_token).await }
    });

    // Wait for either shutdown signal OR event loop exit
    tokio::select! {
        result = signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            tracing::info!("Shutdown signal received, stopping Identity Agent...");
            cancel_token.cancel();
        }
        result = loop_handle => {
            match result {
                Ok(()) => {
                    tracing::warn!("Event loop exited (event streams closed)");
                }
                Err(e) => {
                    tracing::error!("Event loop task panicked: {}", e);
                    anyhow::bail!("Identity event loop panicked: {}", e);
                }
            }
        }
    }

    Ok(())
}

fn local_provider_settings(identity: &IdentityConfig) -> Result<LocalProviderSettings> {
    Ok(LocalProviderSettings {
        app_name: identity.app_name.clone(),
        domain: identity.session_domain.clone(),
        max_challenge_age: seconds(identity.challenge_max_age_secs)
            .context("CHALLENGE_MAX_AGE_SECS out of range")?,
        session_ttl: seconds(identity.session_ttl_secs).context("SESSION_TTL_SECS out of range")?,
    })
}

fn seconds(secs: u64) -> Option<chrono::Duration> {
    i64::try_from(secs).ok().and_then(chrono::Duration::try_seconds)
}
