//! Shared library for the wallet identity services
//!
//! This crate provides common functionality used by the identity core and
//! the agent binary:
//! - Configuration management
//! - Error handling types
//! - Logging infrastructure
//! - Redis client construction

pub mod config;
pub mod error;
pub mod redis;

// Re-export commonly used types
pub use config::{Config, IdentityConfig, ProviderMode, RedisConfig};
pub use error::{Error, Result};

/// Initialize tracing subscriber for structured logging
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shared=debug,wallet_identity=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
