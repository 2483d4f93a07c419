//! Redis client utilities
//!
//! The identity core keeps its last-known wallet address in Redis so a
//! restarted agent can cross-check it against the live wallet.

use crate::error::{Error, Result};
use redis::{aio::ConnectionManager, Client};

/// Create a Redis connection manager from a connection URL
pub async fn create_client(url: &str) -> Result<ConnectionManager> {
    let client = Client::open(url).map_err(|e| Error::config(format!("Invalid Redis URL: {}", e)))?;

    ConnectionManager::new(client)
        .await
        .map_err(|e| Error::internal(format!("Failed to connect to Redis: {}", e)))
}
