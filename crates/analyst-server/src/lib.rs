//! HTTP boundary for the analystOS session services.
//!
//! Loads [`AppConfig`], installs tracing, builds the
//! [`ServiceRegistry`](analyst_session::ServiceRegistry) and serves an axum
//! router whose API routes sit behind [`rate_limit_middleware`].

pub mod config;
pub mod middleware;
pub mod observability;
pub mod server;

pub use config::{AppConfig, LoggingConfig, ServerConfig};
pub use middleware::{AuthenticatedUser, rate_limit_middleware, with_cache_status};
pub use observability::{apply_logging_level, init_tracing, init_tracing_with_level};
pub use server::{AnalystServer, AppState, build_app, build_app_with, shutdown_signal};
