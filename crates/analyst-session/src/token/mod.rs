//! Refresh token store.
//!
//! Refresh tokens are long-lived, rotate on every use, and are grouped into
//! *families*: the chain of tokens descending from one login. A token moves
//! through three states:
//!
//! ```text
//! store ──▶ Active ── rotate ──▶ Used ── revoke / expiry ──▶ Gone
//!             └──────────── revoke / expiry ────────────────────┘
//! ```
//!
//! A used token still validates (`is_valid = true, is_used = true`) so the
//! caller can spot replay of a superseded token and revoke the whole family.
//! The store only reports reuse; [`RefreshFlow`] is the caller that reacts.
//!
//! # Security
//!
//! - Only the SHA-256 hash of a token is persisted or logged
//! - Generated tokens carry 256 bits from the OS CSPRNG
//! - Validity is `now < expires_at` and `now < last_used_at + sliding_window`

mod flow;
mod memory;
mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::SessionResult;
use crate::config::{BackendKind, TokenConfig};

pub use self::flow::{RefreshFlow, RefreshOutcome};
pub use self::memory::MemoryTokenStore;
pub use self::redis::RedisTokenStore;

/// Hashes a raw token with SHA-256, hex encoded.
#[must_use]
pub fn hash_token(raw_token: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(raw_token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generates a 256-bit random token encoded as base64url (43 characters).
#[must_use]
pub fn generate_token() -> String {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use rand::RngCore;

    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// New family id for a fresh login.
#[must_use]
pub fn generate_family_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Short hash prefix for log fields.
pub(crate) fn hash_prefix(token_hash: &str) -> &str {
    token_hash.get(..8).unwrap_or(token_hash)
}

/// A stored refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshToken {
    /// SHA-256 hash of the raw token. The raw value is never stored.
    pub token_hash: String,

    pub user_id: String,

    /// Rotation chain this token belongs to.
    pub family_id: String,

    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,

    /// Absolute ceiling, fixed at issuance.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,

    /// Anchor of the sliding window. Only ever moves forward.
    #[serde(with = "time::serde::rfc3339")]
    pub last_used_at: OffsetDateTime,

    /// Set once the token has been rotated away from. Never cleared.
    pub used: bool,
}

impl RefreshToken {
    /// Creates an active token issued at `now`.
    pub fn issue(
        token_hash: String,
        user_id: &str,
        family_id: &str,
        now: OffsetDateTime,
        config: &TokenConfig,
    ) -> Self {
        Self {
            token_hash,
            user_id: user_id.to_string(),
            family_id: family_id.to_string(),
            issued_at: now,
            expires_at: now + config.absolute_lifetime,
            last_used_at: now,
            used: false,
        }
    }

    /// Returns `true` once the absolute ceiling has been reached.
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    /// Returns `true` once the sliding window since the last use has passed.
    #[must_use]
    pub fn is_idle_at(&self, now: OffsetDateTime, config: &TokenConfig) -> bool {
        now >= self.last_used_at + config.sliding_window
    }

    /// Returns `true` if neither expiry applies. Says nothing about `used`.
    #[must_use]
    pub fn is_valid_at(&self, now: OffsetDateTime, config: &TokenConfig) -> bool {
        !self.is_expired_at(now) && !self.is_idle_at(now, config)
    }

    /// Advances the sliding anchor, never moving it backwards.
    pub(crate) fn touch(&mut self, now: OffsetDateTime) {
        if now > self.last_used_at {
            self.last_used_at = now;
        }
    }
}

/// Result of [`TokenStore::validate`].
///
/// Not found, expired and idle all collapse to `is_valid = false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenValidation {
    pub is_valid: bool,
    pub is_used: bool,
    pub family_id: Option<String>,
    pub user_id: Option<String>,
}

impl TokenValidation {
    pub fn invalid() -> Self {
        Self {
            is_valid: false,
            is_used: false,
            family_id: None,
            user_id: None,
        }
    }

    /// Validation result for a token found at `now`.
    pub(crate) fn of(token: &RefreshToken, now: OffsetDateTime, config: &TokenConfig) -> Self {
        if !token.is_valid_at(now, config) {
            return Self::invalid();
        }
        Self {
            is_valid: true,
            is_used: token.used,
            family_id: Some(token.family_id.clone()),
            user_id: Some(token.user_id.clone()),
        }
    }

    /// `true` when a token that was already rotated away from is presented
    /// again.
    pub fn is_reuse(&self) -> bool {
        self.is_valid && self.is_used
    }
}

/// Storage contract shared by the transient and persistent token stores.
///
/// Operations on an unknown hash are no-ops.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Hashes and persists a new active token.
    async fn store(&self, user_id: &str, raw_token: &str, family_id: &str) -> SessionResult<RefreshToken>;

    /// Looks up a raw token.
    async fn validate(&self, raw_token: &str) -> SessionResult<TokenValidation>;

    /// Flags a token as rotated away from. Irreversible.
    async fn mark_used(&self, token_hash: &str) -> SessionResult<()>;

    /// Moves the sliding-window anchor to now, if now is later.
    async fn update_last_used(&self, token_hash: &str) -> SessionResult<()>;

    /// Deletes one token and its index entries.
    async fn revoke(&self, token_hash: &str) -> SessionResult<()>;

    /// Deletes every token of a family, returning how many were removed.
    async fn revoke_family(&self, family_id: &str) -> SessionResult<u64>;

    /// Deletes every token of a user, returning how many were removed.
    async fn revoke_all(&self, user_id: &str) -> SessionResult<u64>;

    /// Atomically marks `old_raw_token` used and issues its successor in
    /// the same family.
    ///
    /// Returns `None` without changing anything if the old token is not an
    /// active, unexpired token of `user_id` in `family_id`. Of two
    /// concurrent rotations of the same token, exactly one succeeds.
    async fn rotate(
        &self,
        old_raw_token: &str,
        user_id: &str,
        family_id: &str,
    ) -> SessionResult<Option<(String, RefreshToken)>>;

    /// Removes expired and idle tokens from a transient store, returning
    /// how many were removed. Backends with native TTL report 0.
    fn cleanup_expired(&self) -> usize {
        0
    }

    fn backend(&self) -> BackendKind;
}
