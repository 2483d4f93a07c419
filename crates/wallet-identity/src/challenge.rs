//! Login challenge construction and parsing
//!
//! The rendered text is a contract between the client and the identity
//! provider: `Login to <AppName> with wallet <address> at <unix-ms-timestamp>`.
//! The provider binds the session to the address it parses out of this text,
//! so both sides go through [`ChallengeBuilder`] and [`parse_challenge`].
//!
//! The timestamp doubles as the nonce. [`ensure_fresh`] enforces a maximum
//! age on the verifying side.

use chrono::{DateTime, Duration, TimeZone, Utc};
use thiserror::Error;

/// Tolerated clock skew for challenges stamped slightly in the future
const MAX_CLOCK_SKEW_SECS: i64 = 30;

/// Errors that can occur while building or checking challenges
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChallengeError {
    #[error("Invalid wallet address: {0}")]
    InvalidAddress(String),

    #[error("Malformed challenge: {0}")]
    Malformed(String),

    #[error("Challenge expired ({age_secs}s old, max {max_age_secs}s)")]
    Expired { age_secs: i64, max_age_secs: i64 },

    #[error("Challenge timestamp is in the future")]
    FromFuture,
}

/// A challenge ready to be signed. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Address the challenge is bound to, exactly as the wallet reported it
    pub wallet_address: String,
    /// Unix timestamp in milliseconds
    pub nonce: i64,
    /// Text sent to the wallet for signing and to the provider for verification
    pub rendered_text: String,
}

/// Fields recovered from a rendered challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedChallenge {
    pub wallet_address: String,
    pub issued_at_ms: i64,
}

/// Builds login challenges for one application name
#[derive(Debug, Clone)]
pub struct ChallengeBuilder {
    app_name: String,
}

impl ChallengeBuilder {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
        }
    }

    /// Build a challenge stamped with the current time
    pub fn build(&self, address: &str) -> Result<Challenge, ChallengeError> {
        self.build_at(address, Utc::now())
    }

    /// Build a challenge stamped with `issued_at`
    pub fn build_at(
        &self,
        address: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<Challenge, ChallengeError> {
        if address.is_empty() || address.chars().any(char::is_whitespace) {
            return Err(ChallengeError::InvalidAddress(address.to_string()));
        }

        let nonce = issued_at.timestamp_millis();
        let rendered_text = format!(
            "Login to {} with wallet {} at {}",
            self.app_name, address, nonce
        );

        Ok(Challenge {
            wallet_address: address.to_string(),
            nonce,
            rendered_text,
        })
    }
}

/// Parse challenge text rendered by a [`ChallengeBuilder`] for `app_name`
pub fn parse_challenge(text: &str, app_name: &str) -> Result<ParsedChallenge, ChallengeError> {
    let rest = text
        .strip_prefix("Login to ")
        .and_then(|rest| rest.strip_prefix(app_name))
        .and_then(|rest| rest.strip_prefix(" with wallet "))
        .ok_or_else(|| ChallengeError::Malformed("unexpected prefix".to_string()))?;

    let (address, timestamp) = rest
        .rsplit_once(" at ")
        .ok_or_else(|| ChallengeError::Malformed("missing timestamp".to_string()))?;

    if address.is_empty() || address.chars().any(char::is_whitespace) {
        return Err(ChallengeError::Malformed(format!(
            "invalid address segment '{}'",
            address
        )));
    }

    let issued_at_ms = timestamp
        .parse::<i64>()
        .map_err(|e| ChallengeError::Malformed(format!("invalid timestamp: {}", e)))?;

    Ok(ParsedChallenge {
        wallet_address: address.to_string(),
        issued_at_ms,
    })
}

/// Reject challenges older than `max_age` or stamped in the future
pub fn ensure_fresh(
    issued_at_ms: i64,
    now: DateTime<Utc>,
    max_age: Duration,
) -> Result<(), ChallengeError> {
    let issued_at = Utc
        .timestamp_millis_opt(issued_at_ms)
        .single()
        .ok_or_else(|| ChallengeError::Malformed("timestamp out of range".to_string()))?;

    let age = now - issued_at;
    if age < -Duration::seconds(MAX_CLOCK_SKEW_SECS) {
        return Err(ChallengeError::FromFuture);
    }
    if age > max_age {
        return Err(ChallengeError::Expired {
            age_secs: age.num_seconds(),
            max_age_secs: max_age.num_seconds(),
        });
    }

    Ok(())
}
