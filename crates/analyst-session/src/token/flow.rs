//! Refresh protocol on top of a [`TokenStore`].
//!
//! ```text
//! refresh(raw)
//!   validate ── invalid ─────────────────▶ Rejected
//!      │
//!      ├── used ── revoke_family ────────▶ ReuseDetected
//!      │
//!      └── active ── rotate ── lost race ▶ Rejected
//!                       │
//!                       └── update_last_used(new) ▶ Rotated
//! ```

use std::sync::Arc;

use super::{RefreshToken, TokenStore, generate_family_id, generate_token, hash_prefix, hash_token};
use crate::SessionResult;

/// Result of presenting a refresh token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The token was active and has been replaced.
    Rotated {
        /// New raw token to hand back to the client.
        refresh_token: String,
        token: RefreshToken,
    },
    /// Unknown, expired, idle, or lost a concurrent rotation.
    ///
    /// Losing a rotation race revokes nothing, but the winner has already
    /// marked the token used, so presenting it again yields
    /// [`ReuseDetected`](Self::ReuseDetected).
    Rejected,
    /// An already rotated token was replayed. The whole family is gone and
    /// the user must log in again.
    ReuseDetected { family_id: String, revoked: u64 },
}

impl RefreshOutcome {
    pub fn is_rotated(&self) -> bool {
        matches!(self, Self::Rotated { .. })
    }
}

#[derive(Clone)]
pub struct RefreshFlow {
    store: Arc<dyn TokenStore>,
}

impl RefreshFlow {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    /// Starts a new family for `user_id` and returns its first raw token.
    pub async fn login(&self, user_id: &str) -> SessionResult<(String, RefreshToken)> {
        let raw = generate_token();
        let family_id = generate_family_id();
        let token = self.store.store(user_id, &raw, &family_id).await?;
        tracing::info!(user_id = %user_id, family_id = %family_id, "session started");
        Ok((raw, token))
    }

    /// Exchanges a refresh token for its successor.
    ///
    /// A backend failure while validating rejects the token. Errors after
    /// validation propagate.
    pub async fn refresh(&self, raw_token: &str) -> SessionResult<RefreshOutcome> {
        let validation = match self.store.validate(raw_token).await {
            Ok(validation) => validation,
            Err(e) if e.is_backend_failure() => {
                tracing::warn!(error = %e, "token store unavailable, rejecting refresh");
                return Ok(RefreshOutcome::Rejected);
            }
            Err(e) => return Err(e),
        };

        if !validation.is_valid {
            return Ok(RefreshOutcome::Rejected);
        }
        let (Some(user_id), Some(family_id)) = (validation.user_id, validation.family_id) else {
            return Ok(RefreshOutcome::Rejected);
        };

        if validation.is_used {
            let revoked = self.store.revoke_family(&family_id).await?;
            tracing::warn!(
                user_id = %user_id,
                family_id = %family_id,
                token = %hash_prefix(&hash_token(raw_token)),
                revoked,
                "refresh token reuse detected, family revoked"
            );
            return Ok(RefreshOutcome::ReuseDetected { family_id, revoked });
        }

        let Some((refresh_token, token)) = self.store.rotate(raw_token, &user_id, &family_id).await? else {
            tracing::debug!(family_id = %family_id, "refresh lost a concurrent rotation");
            return Ok(RefreshOutcome::Rejected);
        };

        // The new token is already issued; failing here would strand the
        // client with a used token.
        if let Err(e) = self.store.update_last_used(&token.token_hash).await {
            tracing::warn!(
                token = %hash_prefix(&token.token_hash),
                error = %e,
                "failed to refresh sliding window of rotated token"
            );
        }

        Ok(RefreshOutcome::Rotated { refresh_token, token })
    }

    /// Revokes the presented token only.
    pub async fn logout(&self, raw_token: &str) -> SessionResult<()> {
        self.store.revoke(&hash_token(raw_token)).await
    }

    /// Revokes every token of `user_id`, returning how many were removed.
    pub async fn logout_all(&self, user_id: &str) -> SessionResult<u64> {
        self.store.revoke_all(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{BackendKind, TokenConfig};
    use crate::error::SessionError;
    use crate::token::{MemoryTokenStore, TokenValidation};
    use async_trait::async_trait;
    use std::time::Duration;

    const DAY: Duration = Duration::from_secs(86_400);

    fn flow() -> (RefreshFlow, ManualClock) {
        let clock = ManualClock::starting_now();
        let store = MemoryTokenStore::new(TokenConfig::default(), Arc::new(clock.clone()));
        (RefreshFlow::new(Arc::new(store)), clock)
    }

    fn rotated(outcome: RefreshOutcome) -> String {
        match outcome {
            RefreshOutcome::Rotated { refresh_token, .. } => refresh_token,
            other => panic!("expected rotation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_login_then_refresh_chain() {
        let (flow, _clock) = flow();
        let (raw_a, token_a) = flow.login("u1").await.unwrap();

        let outcome = flow.refresh(&raw_a).await.unwrap();
        let RefreshOutcome::Rotated { refresh_token: raw_b, token: token_b } = outcome else {
            panic!("expected rotation");
        };
        assert_eq!(token_b.family_id, token_a.family_id);
        assert_eq!(token_b.user_id, "u1");

        let raw_c = rotated(flow.refresh(&raw_b).await.unwrap());
        assert_ne!(raw_c, raw_b);
    }

    #[tokio::test]
    async fn test_replay_revokes_whole_family() {
        let (flow, _clock) = flow();
        let (raw_a, token_a) = flow.login("u1").await.unwrap();
        let raw_b = rotated(flow.refresh(&raw_a).await.unwrap());

        // Attacker replays the superseded token.
        let outcome = flow.refresh(&raw_a).await.unwrap();
        assert_eq!(
            outcome,
            RefreshOutcome::ReuseDetected {
                family_id: token_a.family_id.clone(),
                revoked: 2,
            }
        );

        // The legitimate holder of B is logged out too.
        assert_eq!(flow.refresh(&raw_b).await.unwrap(), RefreshOutcome::Rejected);
        assert!(!flow.store().validate(&raw_b).await.unwrap().is_valid);
    }

    #[tokio::test]
    async fn test_replay_leaves_other_sessions_alone() {
        let (flow, _clock) = flow();
        let (raw_a, _) = flow.login("u1").await.unwrap();
        let (raw_other, _) = flow.login("u1").await.unwrap();
        rotated(flow.refresh(&raw_a).await.unwrap());

        assert!(matches!(
            flow.refresh(&raw_a).await.unwrap(),
            RefreshOutcome::ReuseDetected { .. }
        ));
        assert!(flow.refresh(&raw_other).await.unwrap().is_rotated());
    }

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let (flow, _clock) = flow();
        assert_eq!(flow.refresh("forged").await.unwrap(), RefreshOutcome::Rejected);
    }

    #[tokio::test]
    async fn test_rotation_keeps_session_alive() {
        let (flow, clock) = flow();
        let (mut raw, first) = flow.login("u1").await.unwrap();

        // Rotating every 6 days keeps the session alive past the first
        // token's 7-day idle limit.
        for _ in 0..4 {
            clock.advance(6 * DAY);
            raw = rotated(flow.refresh(&raw).await.unwrap());
        }

        clock.advance(6 * DAY);
        let RefreshOutcome::Rotated { token, .. } = flow.refresh(&raw).await.unwrap() else {
            panic!("expected rotation");
        };
        assert!(token.expires_at > first.expires_at);
    }

    #[tokio::test]
    async fn test_idle_session_rejected() {
        let (flow, clock) = flow();
        let (raw, _) = flow.login("u1").await.unwrap();

        clock.advance(7 * DAY + Duration::from_secs(1));
        assert_eq!(flow.refresh(&raw).await.unwrap(), RefreshOutcome::Rejected);
    }

    #[tokio::test]
    async fn test_logout_and_logout_all() {
        let (flow, _clock) = flow();
        let (raw_a, _) = flow.login("u1").await.unwrap();
        let (raw_b, _) = flow.login("u1").await.unwrap();
        let (raw_c, _) = flow.login("u1").await.unwrap();

        flow.logout(&raw_a).await.unwrap();
        assert_eq!(flow.refresh(&raw_a).await.unwrap(), RefreshOutcome::Rejected);

        assert_eq!(flow.logout_all("u1").await.unwrap(), 2);
        for raw in [raw_b, raw_c] {
            assert_eq!(flow.refresh(&raw).await.unwrap(), RefreshOutcome::Rejected);
        }
    }

    struct UnavailableStore;

    #[async_trait]
    impl TokenStore for UnavailableStore {
        async fn store(&self, _: &str, _: &str, _: &str) -> SessionResult<RefreshToken> {
            Err(SessionError::backend("connection refused"))
        }
        async fn validate(&self, _: &str) -> SessionResult<TokenValidation> {
            Err(SessionError::backend("connection refused"))
        }
        async fn mark_used(&self, _: &str) -> SessionResult<()> {
            Err(SessionError::backend("connection refused"))
        }
        async fn update_last_used(&self, _: &str) -> SessionResult<()> {
            Err(SessionError::backend("connection refused"))
        }
        async fn revoke(&self, _: &str) -> SessionResult<()> {
            Err(SessionError::backend("connection refused"))
        }
        async fn revoke_family(&self, _: &str) -> SessionResult<u64> {
            Err(SessionError::backend("connection refused"))
        }
        async fn revoke_all(&self, _: &str) -> SessionResult<u64> {
            Err(SessionError::backend("connection refused"))
        }
        async fn rotate(&self, _: &str, _: &str, _: &str) -> SessionResult<Option<(String, RefreshToken)>> {
            Err(SessionError::backend("connection refused"))
        }
        fn backend(&self) -> BackendKind {
            BackendKind::Redis
        }
    }

    #[tokio::test]
    async fn test_outage_fails_closed() {
        let flow = RefreshFlow::new(Arc::new(UnavailableStore));
        assert_eq!(flow.refresh("anything").await.unwrap(), RefreshOutcome::Rejected);
        assert!(flow.login("u1").await.is_err());
    }

    /// Lets another client rotate the token between the flow's validate and
    /// its own rotate.
    struct RacedStore {
        inner: MemoryTokenStore,
        raced: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl TokenStore for RacedStore {
        async fn store(&self, user_id: &str, raw: &str, family_id: &str) -> SessionResult<RefreshToken> {
            self.inner.store(user_id, raw, family_id).await
        }
        async fn validate(&self, raw: &str) -> SessionResult<TokenValidation> {
            let validation = self.inner.validate(raw).await?;
            if !self.raced.swap(true, std::sync::atomic::Ordering::SeqCst) {
                if let (Some(user), Some(family)) = (&validation.user_id, &validation.family_id) {
                    assert!(self.inner.rotate(raw, user, family).await?.is_some());
                }
            }
            Ok(validation)
        }
        async fn mark_used(&self, token_hash: &str) -> SessionResult<()> {
            self.inner.mark_used(token_hash).await
        }
        async fn update_last_used(&self, token_hash: &str) -> SessionResult<()> {
            self.inner.update_last_used(token_hash).await
        }
        async fn revoke(&self, token_hash: &str) -> SessionResult<()> {
            self.inner.revoke(token_hash).await
        }
        async fn revoke_family(&self, family_id: &str) -> SessionResult<u64> {
            self.inner.revoke_family(family_id).await
        }
        async fn revoke_all(&self, user_id: &str) -> SessionResult<u64> {
            self.inner.revoke_all(user_id).await
        }
        async fn rotate(
            &self,
            raw: &str,
            user_id: &str,
            family_id: &str,
        ) -> SessionResult<Option<(String, RefreshToken)>> {
            self.inner.rotate(raw, user_id, family_id).await
        }
        fn backend(&self) -> BackendKind {
            BackendKind::Memory
        }
    }

    #[tokio::test]
    async fn test_lost_rotation_race_then_replay_is_reuse() {
        let clock = ManualClock::starting_now();
        let flow = RefreshFlow::new(Arc::new(RacedStore {
            inner: MemoryTokenStore::new(TokenConfig::default(), Arc::new(clock)),
            raced: std::sync::atomic::AtomicBool::new(false),
        }));
        let (raw, token) = flow.login("u1").await.unwrap();

        assert_eq!(flow.refresh(&raw).await.unwrap(), RefreshOutcome::Rejected);
        match flow.refresh(&raw).await.unwrap() {
            RefreshOutcome::ReuseDetected { family_id, revoked } => {
                assert_eq!(family_id, token.family_id);
                assert_eq!(revoked, 2);
            }
            other => panic!("expected reuse detection, got {other:?}"),
        }
    }
}
