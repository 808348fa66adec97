//! Key layout in the shared store.
//!
//! Each service owns one or more disjoint prefixes so all three can share a
//! single Redis database without collisions.
//!
//! | Service | Key | Structure |
//! |---------|-----|-----------|
//! | Cache | `cache:{key}` | JSON string, TTL = ttl + max_stale + margin |
//! | Rate limiter | `ratelimit:{key}` | sorted set of admission timestamps |
//! | Token store | `refresh_token:{hash}` | hash of token fields |
//! | Token store | `token_family:{family_id}` | set of token hashes |
//! | Token store | `user_tokens:{user_id}` | set of token hashes |

use std::time::Duration;

pub const CACHE_PREFIX: &str = "cache:";
pub const RATE_LIMIT_PREFIX: &str = "ratelimit:";
pub const REFRESH_TOKEN_PREFIX: &str = "refresh_token:";
pub const TOKEN_FAMILY_PREFIX: &str = "token_family:";
pub const USER_TOKENS_PREFIX: &str = "user_tokens:";

/// Extra lifetime given to cache keys beyond `ttl + max_stale`.
pub const CACHE_TTL_MARGIN: Duration = Duration::from_secs(1);

/// Extra lifetime given to rate-limit keys beyond the window.
pub const RATE_LIMIT_TTL_MARGIN: Duration = Duration::from_secs(1);

/// Extra lifetime given to token records and indices beyond absolute expiry.
pub const TOKEN_TTL_MARGIN: Duration = Duration::from_secs(3600);

pub fn cache_key(key: &str) -> String {
    format!("{CACHE_PREFIX}{key}")
}

pub fn rate_limit_key(key: &str) -> String {
    format!("{RATE_LIMIT_PREFIX}{key}")
}

pub fn refresh_token_key(token_hash: &str) -> String {
    format!("{REFRESH_TOKEN_PREFIX}{token_hash}")
}

pub fn token_family_key(family_id: &str) -> String {
    format!("{TOKEN_FAMILY_PREFIX}{family_id}")
}

pub fn user_tokens_key(user_id: &str) -> String {
    format!("{USER_TOKENS_PREFIX}{user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixes_are_disjoint() {
        let keys = [
            cache_key("x"),
            rate_limit_key("x"),
            refresh_token_key("x"),
            token_family_key("x"),
            user_tokens_key("x"),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
        assert_eq!(cache_key("price:btc"), "cache:price:btc");
        assert_eq!(rate_limit_key("user:42"), "ratelimit:user:42");
    }
}
