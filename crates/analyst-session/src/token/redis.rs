//! Redis-backed token store.
//!
//! Each token is a hash under `refresh_token:{hash}` with timestamps in Unix
//! milliseconds and `used` as `"0"`/`"1"`. Family and user indices are sets
//! of token hashes. Records and indices expire one hour after the absolute
//! ceiling; validity itself is always decided from the stored fields.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands};
use time::OffsetDateTime;

use super::{RefreshToken, TokenStore, TokenValidation, generate_token, hash_prefix, hash_token};
use crate::SessionResult;
use crate::clock::{SharedClock, from_unix_millis, unix_millis};
use crate::config::{BackendKind, TokenConfig};
use crate::keyspace::{
    REFRESH_TOKEN_PREFIX, TOKEN_FAMILY_PREFIX, TOKEN_TTL_MARGIN, USER_TOKENS_PREFIX,
    refresh_token_key, token_family_key, user_tokens_key,
};
use crate::persistent::RedisHandle;

/// KEYS[1] = token hash
/// ARGV[1] = field, ARGV[2] = value
const SET_IF_EXISTS: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
return 1
";

/// KEYS[1] = token hash
/// ARGV[1] = now (ms)
const TOUCH: &str = r"
local current = redis.call('HGET', KEYS[1], 'last_used_at')
if not current then
    return 0
end
if tonumber(ARGV[1]) > tonumber(current) then
    redis.call('HSET', KEYS[1], 'last_used_at', ARGV[1])
end
return 1
";

/// KEYS[1] = old token, KEYS[2] = new token, KEYS[3] = family set,
/// KEYS[4] = user set
/// ARGV = user_id, family_id, now ms, expires_at ms, sliding ms,
/// new hash, key expiry (unix ms)
const ROTATE: &str = r"
local old = redis.call('HMGET', KEYS[1], 'user_id', 'family_id', 'used', 'expires_at', 'last_used_at')
if not old[1] or old[1] ~= ARGV[1] or old[2] ~= ARGV[2] or old[3] ~= '0' then
    return 0
end
local now = tonumber(ARGV[3])
if now >= tonumber(old[4]) or now >= tonumber(old[5]) + tonumber(ARGV[5]) then
    return 0
end

redis.call('HSET', KEYS[2],
    'user_id', ARGV[1],
    'family_id', ARGV[2],
    'issued_at', ARGV[3],
    'expires_at', ARGV[4],
    'last_used_at', ARGV[3],
    'used', '0')
redis.call('PEXPIREAT', KEYS[2], ARGV[7])
redis.call('SADD', KEYS[3], ARGV[6])
redis.call('PEXPIREAT', KEYS[3], ARGV[7])
redis.call('SADD', KEYS[4], ARGV[6])
redis.call('PEXPIREAT', KEYS[4], ARGV[7])
redis.call('HSET', KEYS[1], 'used', '1')
return 1
";

/// KEYS[1] = token hash
/// ARGV[1] = token hash value, ARGV[2] = family prefix, ARGV[3] = user prefix
const REVOKE: &str = r"
local owner = {false, false}
if redis.call('TYPE', KEYS[1]).ok == 'hash' then
    owner = redis.call('HMGET', KEYS[1], 'user_id', 'family_id')
end
local removed = redis.call('DEL', KEYS[1])
if owner[1] then
    redis.call('SREM', ARGV[3] .. owner[1], ARGV[1])
end
if owner[2] then
    redis.call('SREM', ARGV[2] .. owner[2], ARGV[1])
end
return removed
";

/// Deletes every token listed in an index set, unlinks each from the other
/// index, then drops the set.
///
/// KEYS[1] = index set
/// ARGV[1] = token prefix, ARGV[2] = other index prefix, ARGV[3] = field
/// naming the other index owner
const REVOKE_INDEXED: &str = r"
local hashes = redis.call('SMEMBERS', KEYS[1])
local removed = 0
for _, hash in ipairs(hashes) do
    local key = ARGV[1] .. hash
    local owner = false
    if redis.call('TYPE', key).ok == 'hash' then
        owner = redis.call('HGET', key, ARGV[3])
    end
    removed = removed + redis.call('DEL', key)
    if owner then
        redis.call('SREM', ARGV[2] .. owner, hash)
    end
end
redis.call('DEL', KEYS[1])
return removed
";

/// A key of another type squatting on a token key is a corrupt record.
fn is_wrong_type(err: &redis::RedisError) -> bool {
    err.code() == Some("WRONGTYPE")
}

const FIELD_USER_ID: &str = "user_id";
const FIELD_FAMILY_ID: &str = "family_id";
const FIELD_ISSUED_AT: &str = "issued_at";
const FIELD_EXPIRES_AT: &str = "expires_at";
const FIELD_LAST_USED_AT: &str = "last_used_at";
const FIELD_USED: &str = "used";

pub struct RedisTokenStore {
    redis: RedisHandle,
    config: TokenConfig,
    clock: SharedClock,
    set_if_exists: redis::Script,
    touch: redis::Script,
    rotate_script: redis::Script,
    revoke_one: redis::Script,
    revoke_indexed: redis::Script,
}

impl RedisTokenStore {
    pub fn new(redis: RedisHandle, config: TokenConfig, clock: SharedClock) -> Self {
        Self {
            redis,
            config,
            clock,
            set_if_exists: redis::Script::new(SET_IF_EXISTS),
            touch: redis::Script::new(TOUCH),
            rotate_script: redis::Script::new(ROTATE),
            revoke_one: redis::Script::new(REVOKE),
            revoke_indexed: redis::Script::new(REVOKE_INDEXED),
        }
    }

    /// Unix ms at which a token's keys are garbage collected.
    fn key_expiry(&self, token: &RefreshToken) -> i64 {
        unix_millis(token.expires_at + TOKEN_TTL_MARGIN)
    }

    async fn revoke_index(&self, index_key: String, other_prefix: &str, other_field: &str) -> SessionResult<u64> {
        let mut conn = self.redis.connection().await?;
        self.redis
            .timed(
                "EVALSHA revoke_indexed",
                self.revoke_indexed
                    .key(index_key)
                    .arg(REFRESH_TOKEN_PREFIX)
                    .arg(other_prefix)
                    .arg(other_field)
                    .invoke_async(&mut conn),
            )
            .await
    }
}

fn record_fields(token: &RefreshToken) -> [(&'static str, String); 6] {
    [
        (FIELD_USER_ID, token.user_id.clone()),
        (FIELD_FAMILY_ID, token.family_id.clone()),
        (FIELD_ISSUED_AT, unix_millis(token.issued_at).to_string()),
        (FIELD_EXPIRES_AT, unix_millis(token.expires_at).to_string()),
        (FIELD_LAST_USED_AT, unix_millis(token.last_used_at).to_string()),
        (FIELD_USED, if token.used { "1" } else { "0" }.to_string()),
    ]
}

/// Rebuilds a token from its hash fields. `None` if any field is missing
/// or malformed.
fn parse_record(token_hash: &str, mut fields: HashMap<String, String>) -> Option<RefreshToken> {
    let timestamp = |raw: Option<String>| -> Option<OffsetDateTime> {
        raw.and_then(|v| v.parse::<i64>().ok()).and_then(from_unix_millis)
    };

    let used = match fields.remove(FIELD_USED)?.as_str() {
        "0" => false,
        "1" => true,
        _ => return None,
    };

    Some(RefreshToken {
        token_hash: token_hash.to_string(),
        user_id: fields.remove(FIELD_USER_ID)?,
        family_id: fields.remove(FIELD_FAMILY_ID)?,
        issued_at: timestamp(fields.remove(FIELD_ISSUED_AT))?,
        expires_at: timestamp(fields.remove(FIELD_EXPIRES_AT))?,
        last_used_at: timestamp(fields.remove(FIELD_LAST_USED_AT))?,
        used,
    })
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl TokenStore for RedisTokenStore {
    async fn store(&self, user_id: &str, raw_token: &str, family_id: &str) -> SessionResult<RefreshToken> {
        let token = RefreshToken::issue(
            hash_token(raw_token),
            user_id,
            family_id,
            self.clock.now(),
            &self.config,
        );
        let record_key = refresh_token_key(&token.token_hash);
        let family_key = token_family_key(family_id);
        let user_key = user_tokens_key(user_id);
        let expiry = self.key_expiry(&token);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(&record_key, &record_fields(&token))
            .ignore()
            .cmd("PEXPIREAT")
            .arg(&record_key)
            .arg(expiry)
            .ignore()
            .sadd(&family_key, &token.token_hash)
            .ignore()
            .cmd("PEXPIREAT")
            .arg(&family_key)
            .arg(expiry)
            .ignore()
            .sadd(&user_key, &token.token_hash)
            .ignore()
            .cmd("PEXPIREAT")
            .arg(&user_key)
            .arg(expiry)
            .ignore();

        let mut conn = self.redis.connection().await?;
        let () = self.redis.timed("MULTI store", pipe.query_async(&mut conn)).await?;

        tracing::debug!(
            user_id = %user_id,
            family_id = %family_id,
            token = %hash_prefix(&token.token_hash),
            "refresh token stored"
        );
        Ok(token)
    }

    async fn validate(&self, raw_token: &str) -> SessionResult<TokenValidation> {
        let token_hash = hash_token(raw_token);
        let record_key = refresh_token_key(&token_hash);

        let mut conn = self.redis.connection().await?;
        let fields: Option<HashMap<String, String>> = self
            .redis
            .timed("HGETALL", async {
                match conn.hgetall::<_, HashMap<String, String>>(&record_key).await {
                    Ok(fields) => Ok(Some(fields)),
                    Err(e) if is_wrong_type(&e) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await?;
        drop(conn);

        if fields.as_ref().is_some_and(HashMap::is_empty) {
            return Ok(TokenValidation::invalid());
        }

        match fields.and_then(|fields| parse_record(&token_hash, fields)) {
            Some(token) => Ok(TokenValidation::of(&token, self.clock.now(), &self.config)),
            None => {
                tracing::warn!(token = %hash_prefix(&token_hash), "corrupt refresh token record, revoking");
                self.revoke(&token_hash).await?;
                Ok(TokenValidation::invalid())
            }
        }
    }

    async fn mark_used(&self, token_hash: &str) -> SessionResult<()> {
        let mut conn = self.redis.connection().await?;
        let _: i64 = self
            .redis
            .timed(
                "EVALSHA set_if_exists",
                self.set_if_exists
                    .key(refresh_token_key(token_hash))
                    .arg(FIELD_USED)
                    .arg("1")
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn update_last_used(&self, token_hash: &str) -> SessionResult<()> {
        let now = unix_millis(self.clock.now());
        let mut conn = self.redis.connection().await?;
        let _: i64 = self
            .redis
            .timed(
                "EVALSHA touch",
                self.touch
                    .key(refresh_token_key(token_hash))
                    .arg(now)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn revoke(&self, token_hash: &str) -> SessionResult<()> {
        let mut conn = self.redis.connection().await?;
        let removed: i64 = self
            .redis
            .timed(
                "EVALSHA revoke",
                self.revoke_one
                    .key(refresh_token_key(token_hash))
                    .arg(token_hash)
                    .arg(TOKEN_FAMILY_PREFIX)
                    .arg(USER_TOKENS_PREFIX)
                    .invoke_async(&mut conn),
            )
            .await?;
        if removed > 0 {
            tracing::info!(token = %hash_prefix(token_hash), "refresh token revoked");
        }
        Ok(())
    }

    async fn revoke_family(&self, family_id: &str) -> SessionResult<u64> {
        let revoked = self
            .revoke_index(token_family_key(family_id), USER_TOKENS_PREFIX, FIELD_USER_ID)
            .await?;
        tracing::info!(family_id = %family_id, count = revoked, "token family revoked");
        Ok(revoked)
    }

    async fn revoke_all(&self, user_id: &str) -> SessionResult<u64> {
        let revoked = self
            .revoke_index(user_tokens_key(user_id), TOKEN_FAMILY_PREFIX, FIELD_FAMILY_ID)
            .await?;
        tracing::info!(user_id = %user_id, count = revoked, "all user tokens revoked");
        Ok(revoked)
    }

    async fn rotate(
        &self,
        old_raw_token: &str,
        user_id: &str,
        family_id: &str,
    ) -> SessionResult<Option<(String, RefreshToken)>> {
        let old_hash = hash_token(old_raw_token);
        let new_raw = generate_token();
        let token = RefreshToken::issue(
            hash_token(&new_raw),
            user_id,
            family_id,
            self.clock.now(),
            &self.config,
        );

        let mut conn = self.redis.connection().await?;
        let rotated: i64 = self
            .redis
            .timed(
                "EVALSHA rotate",
                self.rotate_script
                    .key(refresh_token_key(&old_hash))
                    .key(refresh_token_key(&token.token_hash))
                    .key(token_family_key(family_id))
                    .key(user_tokens_key(user_id))
                    .arg(user_id)
                    .arg(family_id)
                    .arg(unix_millis(token.issued_at))
                    .arg(unix_millis(token.expires_at))
                    .arg(duration_millis(self.config.sliding_window))
                    .arg(&token.token_hash)
                    .arg(self.key_expiry(&token))
                    .invoke_async(&mut conn),
            )
            .await?;

        if rotated == 0 {
            tracing::debug!(old = %hash_prefix(&old_hash), "rotation refused, token not active");
            return Ok(None);
        }

        tracing::debug!(
            family_id = %family_id,
            old = %hash_prefix(&old_hash),
            new = %hash_prefix(&token.token_hash),
            "refresh token rotated"
        );
        Ok(Some((new_raw, token)))
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Redis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(token: &RefreshToken) -> HashMap<String, String> {
        record_fields(token)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn test_record_fields_parse_back() {
        let now = from_unix_millis(1_700_000_000_123).unwrap();
        let mut token = RefreshToken::issue(hash_token("t"), "u1", "f1", now, &TokenConfig::default());
        token.used = true;

        let parsed = parse_record(&token.token_hash, fields(&token)).unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn test_corrupt_record_rejected() {
        let now = from_unix_millis(1_700_000_000_000).unwrap();
        let token = RefreshToken::issue(hash_token("t"), "u1", "f1", now, &TokenConfig::default());

        let mut bad_used = fields(&token);
        bad_used.insert(FIELD_USED.to_string(), "yes".to_string());
        assert!(parse_record(&token.token_hash, bad_used).is_none());

        let mut missing = fields(&token);
        missing.remove(FIELD_FAMILY_ID);
        assert!(parse_record(&token.token_hash, missing).is_none());

        let mut bad_time = fields(&token);
        bad_time.insert(FIELD_EXPIRES_AT.to_string(), "soon".to_string());
        assert!(parse_record(&token.token_hash, bad_time).is_none());
    }
}
