//! Process-local token store.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{RefreshToken, TokenStore, TokenValidation, generate_token, hash_prefix, hash_token};
use crate::SessionResult;
use crate::clock::SharedClock;
use crate::config::{BackendKind, TokenConfig};

#[derive(Debug, Default)]
struct TokenState {
    tokens: HashMap<String, RefreshToken>,
    by_family: HashMap<String, HashSet<String>>,
    by_user: HashMap<String, HashSet<String>>,
}

impl TokenState {
    fn insert(&mut self, token: RefreshToken) {
        self.by_family
            .entry(token.family_id.clone())
            .or_default()
            .insert(token.token_hash.clone());
        self.by_user
            .entry(token.user_id.clone())
            .or_default()
            .insert(token.token_hash.clone());
        self.tokens.insert(token.token_hash.clone(), token);
    }

    fn remove(&mut self, token_hash: &str) -> Option<RefreshToken> {
        let token = self.tokens.remove(token_hash)?;
        unindex(&mut self.by_family, &token.family_id, token_hash);
        unindex(&mut self.by_user, &token.user_id, token_hash);
        Some(token)
    }
}

fn unindex(index: &mut HashMap<String, HashSet<String>>, owner: &str, token_hash: &str) {
    if let Some(hashes) = index.get_mut(owner) {
        hashes.remove(token_hash);
        if hashes.is_empty() {
            index.remove(owner);
        }
    }
}

/// In-memory token store.
///
/// One mutex guards the records and both indices, so every operation,
/// including rotation and cascading revocation, is atomic.
pub struct MemoryTokenStore {
    state: Mutex<TokenState>,
    config: TokenConfig,
    clock: SharedClock,
}

impl MemoryTokenStore {
    pub fn new(config: TokenConfig, clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(TokenState::default()),
            config,
            clock,
        }
    }

    /// Number of stored tokens, used or not.
    pub fn len(&self) -> usize {
        self.state.lock().tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().tokens.is_empty()
    }

    /// Snapshot of one record.
    pub fn get(&self, token_hash: &str) -> Option<RefreshToken> {
        self.state.lock().tokens.get(token_hash).cloned()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn store(&self, user_id: &str, raw_token: &str, family_id: &str) -> SessionResult<RefreshToken> {
        let token = RefreshToken::issue(
            hash_token(raw_token),
            user_id,
            family_id,
            self.clock.now(),
            &self.config,
        );
        self.state.lock().insert(token.clone());
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
        let now = self.clock.now();
        let state = self.state.lock();
        Ok(state
            .tokens
            .get(&token_hash)
            .map_or_else(TokenValidation::invalid, |token| {
                TokenValidation::of(token, now, &self.config)
            }))
    }

    async fn mark_used(&self, token_hash: &str) -> SessionResult<()> {
        if let Some(token) = self.state.lock().tokens.get_mut(token_hash) {
            token.used = true;
        }
        Ok(())
    }

    async fn update_last_used(&self, token_hash: &str) -> SessionResult<()> {
        let now = self.clock.now();
        if let Some(token) = self.state.lock().tokens.get_mut(token_hash) {
            token.touch(now);
        }
        Ok(())
    }

    async fn revoke(&self, token_hash: &str) -> SessionResult<()> {
        if self.state.lock().remove(token_hash).is_some() {
            tracing::info!(token = %hash_prefix(token_hash), "refresh token revoked");
        }
        Ok(())
    }

    async fn revoke_family(&self, family_id: &str) -> SessionResult<u64> {
        let mut state = self.state.lock();
        let hashes = state.by_family.get(family_id).cloned().unwrap_or_default();
        let revoked = hashes
            .iter()
            .filter(|hash| state.remove(hash).is_some())
            .count() as u64;
        drop(state);

        tracing::info!(family_id = %family_id, count = revoked, "token family revoked");
        Ok(revoked)
    }

    async fn revoke_all(&self, user_id: &str) -> SessionResult<u64> {
        let mut state = self.state.lock();
        let hashes = state.by_user.get(user_id).cloned().unwrap_or_default();
        let revoked = hashes
            .iter()
            .filter(|hash| state.remove(hash).is_some())
            .count() as u64;
        drop(state);

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
        let now = self.clock.now();

        let mut state = self.state.lock();
        let Some(old) = state.tokens.get_mut(&old_hash) else {
            return Ok(None);
        };
        if old.used
            || old.user_id != user_id
            || old.family_id != family_id
            || !old.is_valid_at(now, &self.config)
        {
            return Ok(None);
        }
        old.used = true;

        let token = RefreshToken::issue(hash_token(&new_raw), user_id, family_id, now, &self.config);
        state.insert(token.clone());
        drop(state);

        tracing::debug!(
            family_id = %family_id,
            old = %hash_prefix(&old_hash),
            new = %hash_prefix(&token.token_hash),
            "refresh token rotated"
        );
        Ok(Some((new_raw, token)))
    }

    fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .tokens
            .values()
            .filter(|token| !token.is_valid_at(now, &self.config))
            .map(|token| token.token_hash.clone())
            .collect();
        for hash in &expired {
            state.remove(hash);
        }
        drop(state);

        if !expired.is_empty() {
            tracing::debug!(removed = expired.len(), "swept expired refresh tokens");
        }
        expired.len()
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Memory
    }
}
