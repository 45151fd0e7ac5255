//! First-run setup authentication.
//!
//! Setup endpoints are guarded by a single-use token whose bcrypt hash
//! lives in system settings. Once setup completes the endpoints are
//! permanently disabled. Attempts are rate limited per client IP.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;

use crate::config::RateLimitProfile;
use super::{error_response, GatewayState, RateLimiter};

/// Attempts allowed per IP per minute.
const SETUP_ATTEMPTS_PER_MINUTE: u32 = 5;

/// Dedicated limiter for setup attempts.
#[must_use]
pub fn setup_limiter() -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(RateLimitProfile {
        requests_per_minute: SETUP_ATTEMPTS_PER_MINUTE,
        burst_size: SETUP_ATTEMPTS_PER_MINUTE,
    }))
}

/// Extract the token from an `Authorization: SetupToken <t>` header.
/// The scheme is matched case-insensitively.
#[must_use]
pub fn parse_setup_token(header: &str) -> Option<&str> {
    let mut parts = header.splitn(2, ' ');
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("SetupToken") {
        return None;
    }
    let token = parts.next()?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Middleware guarding setup endpoints.
///
/// Enforced in order: completed setup disables the endpoints (403),
/// per-IP attempt limiting (429), header shape, bcrypt comparison
/// against the stored hash (401).
pub fn setup_middleware(
    limiter: Arc<RateLimiter>,
) -> impl Fn(
    State<GatewayState>,
    Request,
    Next,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Response> + Send>>
       + Clone
       + Send
       + 'static {
    move |State(state): State<GatewayState>, req: Request, next: Next| {
        let limiter = limiter.clone();
        Box::pin(async move {
            let settings = match state.settings.system_settings().await {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to load system settings");
                    return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
                }
            };
            if settings.setup_completed {
                return error_response(StatusCode::FORBIDDEN, "setup already completed");
            }

            let client_ip = req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map_or_else(|| "unknown".to_string(), |info| info.0.ip().to_string());
            if !limiter.check(&format!("setup:{client_ip}")).allowed {
                return error_response(StatusCode::TOO_MANY_REQUESTS, "too many setup attempts");
            }

            let token = req
                .headers()
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_setup_token);
            let Some(token) = token else {
                return error_response(StatusCode::UNAUTHORIZED, "setup token required");
            };

            let Some(hash) = settings.setup_token_hash.as_deref() else {
                return error_response(StatusCode::UNAUTHORIZED, "setup token not provisioned");
            };
            if !bcrypt::verify(token, hash).unwrap_or(false) {
                return error_response(StatusCode::UNAUTHORIZED, "invalid setup token");
            }

            next.run(req).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("SetupToken abc123", Some("abc123") ; "standard scheme")]
    #[test_case("setuptoken abc123", Some("abc123") ; "scheme case insensitive")]
    #[test_case("SETUPTOKEN abc123", Some("abc123") ; "upper scheme")]
    #[test_case("Bearer abc123", None ; "wrong scheme")]
    #[test_case("SetupToken ", None ; "empty token")]
    #[test_case("SetupToken", None ; "no token part")]
    fn setup_token_parsing(header: &str, expected: Option<&str>) {
        assert_eq!(parse_setup_token(header), expected);
    }

    #[test]
    fn setup_limiter_matches_policy() {
        let limiter = setup_limiter();
        for _ in 0..SETUP_ATTEMPTS_PER_MINUTE {
            assert!(limiter.check("setup:1.2.3.4").allowed);
        }
        assert!(!limiter.check("setup:1.2.3.4").allowed);
    }
}
