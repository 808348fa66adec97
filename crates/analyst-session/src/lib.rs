//! # analyst-session
//!
//! Session and resilience services shared by every analystOS API instance.
//!
//! This crate provides:
//! - A response cache with stale-while-error fallback
//! - A sliding-window rate limiter with per-tier limits
//! - A refresh token store with rotation, reuse detection and family revocation
//!
//! Each service has a process-local backend and a Redis backend behind the
//! same trait. The backend is chosen once from [`SessionConfig`] and the
//! services are held in a [`ServiceRegistry`] for the life of the process.
//!
//! ## Modules
//!
//! - [`cache`] - Cache service and stores
//! - [`rate_limit`] - Rate limiter, stores and client address resolution
//! - [`token`] - Refresh token store and the refresh protocol
//! - [`registry`] - Service construction, maintenance and shutdown
//! - [`config`] - Configuration types
//! - [`clock`] - Injectable time source

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod keyspace;
pub mod persistent;
pub mod rate_limit;
pub mod registry;
pub mod token;

pub use cache::{CachePolicy, CacheRead, CacheService, CacheStatus, CacheStore};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{BackendKind, ConfigError, FailurePolicy, SessionConfig};
pub use error::SessionError;
pub use persistent::RedisHandle;
pub use rate_limit::{RateLimitDecision, RateLimitKey, RateLimitStore, RateLimiter, TrustedProxies};
pub use registry::{MaintenanceHandle, ServiceRegistry};
pub use token::{
    RefreshFlow, RefreshOutcome, RefreshToken, TokenStore, TokenValidation, generate_family_id,
    generate_token, hash_token,
};

/// Result type for session service operations.
pub type SessionResult<T> = Result<T, SessionError>;
