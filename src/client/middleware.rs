//! axum middleware enforcing [`RateLimitGuard`] verdicts.
//!
//! Caller identity is never read from client headers. An authentication layer
//! in front of this one resolves it and inserts a [`CallerIdentity`]; requests
//! without one are limited by client IP alone.
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/api/orders", get(list_orders))
//!     .layer(axum::middleware::from_fn_with_state(guard, rate_limit))
//!     .layer(axum::middleware::from_fn(authenticate));
//! ```

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use super::guard::RateLimitGuard;
use crate::error::GatekeeperError;
use crate::ratelimit::{CheckContext, Decision, ANONYMOUS_ROLE};

const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Identity resolved by an upstream authentication layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: Option<String>,
    pub user_role: Option<String>,
    pub api_key: Option<String>,
}

/// Build the check context for an inbound request.
///
/// `trust_forwarded` allows the client IP to come from `X-Forwarded-For` or
/// `X-Real-IP`; otherwise only the peer address from `ConnectInfo` is used.
pub fn context_from_request(request: &Request, trust_forwarded: bool) -> CheckContext {
    let forwarded = if trust_forwarded {
        forwarded_ip(request.headers())
    } else {
        None
    };
    let client_ip = forwarded
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_default();

    let mut ctx = CheckContext::new(client_ip, request.uri().path())
        .with_method(request.method().as_str());
    if let Some(caller) = request.extensions().get::<CallerIdentity>() {
        ctx.user_id = caller.user_id.clone();
        ctx.api_key = caller.api_key.clone();
        ctx.user_role = caller
            .user_role
            .clone()
            .unwrap_or_else(|| ANONYMOUS_ROLE.to_string());
    }
    ctx
}

/// First `X-Forwarded-For` entry, then `X-Real-IP`.
fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .or_else(|| header_str(headers, "x-real-ip"))
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn quota_headers(headers: &mut HeaderMap, decision: &Decision) {
    if decision.unlimited {
        return;
    }
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
    headers.insert(RESET_HEADER, HeaderValue::from(decision.reset_at));
}

fn too_many_requests(decision: &Decision) -> Response {
    let retry_after = decision.retry_after.unwrap_or(1);
    let body = json!({
        "allowed": false,
        "limit": decision.limit,
        "remaining": 0,
        "reset": decision.reset_at,
        "retry_after": retry_after,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    quota_headers(headers, decision);
    headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

/// Rate limiting middleware for `axum::middleware::from_fn_with_state`.
pub async fn rate_limit(
    State(guard): State<Arc<RateLimitGuard>>,
    request: Request,
    next: Next,
) -> Response {
    if guard.is_skipped(request.uri().path()) {
        return next.run(request).await;
    }

    let ctx = context_from_request(&request, guard.trusts_forwarded_headers());
    let outcome = match guard.check(&ctx).await {
        Ok(outcome) => outcome,
        Err(GatekeeperError::InvalidContext(reason)) => {
            warn!(endpoint = %ctx.endpoint, reason = %reason, "Rejecting request with invalid rate limit context");
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": reason }))).into_response();
        }
        Err(err) => {
            warn!(error = %err, "Rate limit check failed, admitting request");
            return next.run(request).await;
        }
    };

    let Some(decision) = outcome.decision else {
        return next.run(request).await;
    };

    if !decision.allowed {
        debug!(
            endpoint = %ctx.endpoint,
            path = ?outcome.path,
            retry_after = ?decision.retry_after,
            "Request rate limited"
        );
        return too_many_requests(&decision);
    }

    let mut response = next.run(request).await;
    quota_headers(response.headers_mut(), &decision);
    response
}
