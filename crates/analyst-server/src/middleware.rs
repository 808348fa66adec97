use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use analyst_session::{CacheStatus, RateLimitDecision, RateLimiter};
use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderName, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use uuid::Uuid;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Caller identity placed in the request extensions by the authentication
/// layer. Requests without it are limited by client address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    // Preserve an incoming id, otherwise mint one
    let req_id_value = req
        .headers()
        .get(&X_REQUEST_ID)
        .cloned()
        .or_else(|| HeaderValue::from_str(&Uuid::new_v4().to_string()).ok());

    let Some(req_id_value) = req_id_value else {
        return next.run(req).await;
    };

    req.extensions_mut().insert(req_id_value.clone());
    let mut res = next.run(req).await;
    res.headers_mut().insert(X_REQUEST_ID, req_id_value);
    res
}

/// Admits or rejects the request against the caller's tier.
///
/// Rejections short-circuit with 429 and a `Retry-After` in whole seconds,
/// rounded up. Admitted responses carry the `X-RateLimit-*` headers.
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let forwarded_for = req
        .headers()
        .get(&X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok());
    let user = req
        .extensions()
        .get::<AuthenticatedUser>()
        .map(|AuthenticatedUser(id)| id.as_str());

    let identity = limiter.identify(user, peer, forwarded_for);

    let decision = match limiter.check_identity(&identity).await {
        Ok(decision) => decision,
        Err(e) => {
            tracing::error!(identity = %identity, error = %e, "rate limit check failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"detail": "Internal server error"})),
            )
                .into_response();
        }
    };

    if !decision.allowed {
        return too_many_requests(&decision);
    }

    let mut res = next.run(req).await;
    insert_rate_limit_headers(&mut res, &decision);
    res
}

fn too_many_requests(decision: &RateLimitDecision) -> Response {
    let mut res = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({"detail": "Rate limit exceeded"})),
    )
        .into_response();
    if let Some(secs) = decision.retry_after_secs() {
        res.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    insert_rate_limit_headers(&mut res, decision);
    res
}

fn insert_rate_limit_headers(res: &mut Response, decision: &RateLimitDecision) {
    let headers = res.headers_mut();
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_after_secs()));
}

/// Surfaces how a cached value was served.
pub fn with_cache_status(mut response: Response, status: CacheStatus) -> Response {
    response
        .headers_mut()
        .insert(X_CACHE, HeaderValue::from_static(status.as_str()));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cache_status_header() {
        let res = with_cache_status(StatusCode::OK.into_response(), CacheStatus::Stale);
        assert_eq!(res.headers()[&X_CACHE], "STALE");
    }

    #[test]
    fn test_rejection_rounds_retry_after_up() {
        let decision = RateLimitDecision {
            allowed: false,
            remaining: 0,
            limit: 30,
            reset_after: Duration::from_millis(12_300),
            retry_after: Some(Duration::from_millis(12_300)),
        };
        let res = too_many_requests(&decision);
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(res.headers()[header::RETRY_AFTER], "13");
        assert_eq!(res.headers()[&X_RATELIMIT_REMAINING], "0");
        assert_eq!(res.headers()[&X_RATELIMIT_LIMIT], "30");
    }
}
