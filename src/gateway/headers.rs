//! Pipeline front matter: security headers, request ids, request metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use super::{GatewayState, RequestId};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Process-wide request counters.
#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub responses_error: AtomicU64,
}

impl Metrics {
    pub fn observe(&self, status: u16) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if status >= 500 {
            self.responses_error.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Emit the configured security headers on every response.
pub async fn security_headers_middleware(
    State(state): State<GatewayState>,
    req: Request,
    next: Next,
) -> Response {
    let mut response = next.run(req).await;
    let options = &state.security_headers;
    let headers = response.headers_mut();
    let pairs = [
        ("strict-transport-security", options.hsts.as_str()),
        ("x-frame-options", options.frame_options.as_str()),
        ("x-content-type-options", options.content_type_options.as_str()),
        ("content-security-policy", options.content_security_policy.as_str()),
        ("referrer-policy", options.referrer_policy.as_str()),
        ("permissions-policy", options.permissions_policy.as_str()),
        ("cross-origin-opener-policy", options.cross_origin_opener_policy.as_str()),
        ("cross-origin-resource-policy", options.cross_origin_resource_policy.as_str()),
    ];
    for (name, value) in pairs {
        if value.is_empty() {
            continue;
        }
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
    response
}

/// Propagate an inbound `X-Request-ID` or mint a UUIDv4, expose it to the
/// rest of the pipeline, and echo it outbound.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);

    req.extensions_mut().insert(RequestId(request_id.clone()));
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

/// Count requests and log slow ones.
pub async fn metrics_middleware(
    State(state): State<GatewayState>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(req).await;
    let elapsed = started.elapsed();
    state.metrics.observe(response.status().as_u16());
    tracing::debug!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = elapsed.as_millis() as u64,
        "Request completed"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_count_totals_and_errors() {
        let metrics = Metrics::default();
        metrics.observe(200);
        metrics.observe(404);
        metrics.observe(500);
        assert_eq!(metrics.requests_total.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.responses_error.load(Ordering::Relaxed), 1);
    }
}
