//! Token-bucket rate limiting.
//!
//! One bucket per rate-limit key. On each request the bucket gains
//! `elapsed * rpm / 60` tokens (capped at the burst size) and spends one;
//! an empty bucket rejects with 429 and the standard headers. A cleanup
//! tick evicts buckets idle for ten minutes.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::config::RateLimitProfile;
use super::{error_response, AuthContext, AuthMethod, GatewayState};

/// How often idle buckets are evicted.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Idle time after which a bucket is dropped.
pub const IDLE_EVICTION: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// The outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
}

/// Token-bucket limiter keyed by caller identity.
#[derive(Debug)]
pub struct RateLimiter {
    profile: RateLimitProfile,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(profile: RateLimitProfile) -> Self {
        Self {
            profile,
            buckets: DashMap::new(),
        }
    }

    #[must_use]
    pub fn limit(&self) -> u32 {
        self.profile.requests_per_minute
    }

    /// Take one token for `key`, refilling first.
    pub fn check(&self, key: &str) -> RateDecision {
        let now = Instant::now();
        let refill_per_second = f64::from(self.profile.requests_per_minute) / 60.0;
        let burst = f64::from(self.profile.burst_size);

        let mut bucket = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: burst,
            last_refill: now,
            last_seen: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_second).min(burst);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateDecision {
                allowed: true,
                remaining: bucket.tokens.floor().max(0.0) as u32,
            }
        } else {
            RateDecision {
                allowed: false,
                remaining: 0,
            }
        }
    }

    /// Drop buckets unused for [`IDLE_EVICTION`].
    pub fn evict_idle(&self) {
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_seen) < IDLE_EVICTION);
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Periodic eviction loop; exits on cancellation.
    pub async fn run_cleanup(self: std::sync::Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.evict_idle();
                    tracing::trace!(buckets = self.bucket_count(), "Rate limiter cleanup tick");
                }
            }
        }
    }
}

/// The rate-limit key, in priority order: JWT user, API key, client IP.
#[must_use]
pub fn rate_limit_key(ctx: Option<&AuthContext>, client_ip: &str) -> String {
    if let Some(ctx) = ctx {
        match ctx.auth_method {
            Some(AuthMethod::Jwt) => {
                if let Some(user_id) = ctx.user_id {
                    return format!("user:{user_id}");
                }
            }
            Some(AuthMethod::ApiKey) => {
                if let Some(key_id) = ctx.api_key_id {
                    return format!("apikey:{key_id}");
                }
            }
            None => {}
        }
    }
    format!("ip:{client_ip}")
}

/// Rate-limiting middleware.
pub async fn rate_limit_middleware(
    State(state): State<GatewayState>,
    req: Request,
    next: Next,
) -> Response {
    let client_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |info| info.0.ip().to_string());
    let key = rate_limit_key(req.extensions().get::<AuthContext>(), &client_ip);

    let decision = state.limiter.check(&key);
    if !decision.allowed {
        let mut response = error_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
        let headers = response.headers_mut();
        headers.insert("x-ratelimit-limit", state.limiter.limit().into());
        headers.insert("x-ratelimit-remaining", 0.into());
        headers.insert("retry-after", 60.into());
        return response;
    }

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", state.limiter.limit().into());
    headers.insert("x-ratelimit-remaining", decision.remaining.into());
    response
}
