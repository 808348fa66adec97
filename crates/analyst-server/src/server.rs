use std::net::SocketAddr;

use analyst_session::ServiceRegistry;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::middleware::{rate_limit_middleware, request_id};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub registry: ServiceRegistry,
}

impl AppState {
    pub fn new(registry: ServiceRegistry) -> Self {
        Self { registry }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    backend: &'static str,
}

async fn healthz(State(state): State<AppState>) -> Response {
    let backend = state.registry.backend().as_str();
    if state.registry.is_healthy().await {
        (StatusCode::OK, Json(HealthResponse { status: "ok", backend })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unavailable",
                backend,
            }),
        )
            .into_response()
    }
}

/// Router with the health endpoint.
pub fn build_app(state: AppState, body_limit: usize) -> Router {
    build_app_with(state, Router::new(), body_limit)
}

/// Mounts `api` behind the rate limiter next to the unlimited `/healthz`.
pub fn build_app_with(state: AppState, api: Router<AppState>, body_limit: usize) -> Router {
    let limiter = state.registry.rate_limiter().clone();

    Router::new()
        .route("/healthz", get(healthz))
        .merge(api.layer(middleware::from_fn_with_state(limiter, rate_limit_middleware)))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let req_id = req
                        .extensions()
                        .get::<axum::http::HeaderValue>()
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = tracing::field::Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: std::time::Duration, span: &tracing::Span| {
                        span.record("http.status_code", tracing::field::display(res.status().as_u16()));
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(middleware::from_fn(request_id))
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

pub struct AnalystServer {
    addr: SocketAddr,
    app: Router,
}

impl AnalystServer {
    pub fn new(cfg: &AppConfig, state: AppState) -> Self {
        Self {
            addr: cfg.addr(),
            app: build_app(state, cfg.server.body_limit_bytes),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        // Peer addresses feed the anonymous rate-limit key
        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;
        Ok(())
    }
}

pub async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
