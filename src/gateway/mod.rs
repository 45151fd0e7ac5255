//! Authentication and authorization gateway.
//!
//! A middleware pipeline executed in fixed order in front of every
//! handler:
//!
//! ```text
//! security-headers -> request-id -> metrics -> rate-limit -> auth -> rbac -> audit -> handler
//! ```
//!
//! Authentication accepts JWTs (checked first, no database round-trip)
//! and API keys (prefix candidate lookup, then bcrypt). Authorization is
//! scope-based and evaluated at request time, so role edits take effect
//! on the next request.

pub mod apikey;
pub mod audit;
pub mod auth;
pub mod headers;
pub mod jwt;
pub mod ratelimit;
pub mod scopes;
pub mod setup;

pub use jwt::JwtSigner;
pub use ratelimit::RateLimiter;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use uuid::Uuid;

use crate::config::{AuditOptions, SecurityHeaderOptions};
use crate::persist::{ApiKeyStore, AuditStore, SettingsStore, UserStore};
use crate::types::User;

/// How the request authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Jwt,
    ApiKey,
}

impl AuthMethod {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jwt => "jwt",
            Self::ApiKey => "api_key",
        }
    }
}

/// Authentication result placed into request extensions by the auth
/// middleware and consumed by RBAC, audit, and handlers.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub user_id: Option<Uuid>,
    pub user: Option<User>,
    pub api_key_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
    pub auth_method: Option<AuthMethod>,
    pub scopes: Vec<String>,
}

impl AuthContext {
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.auth_method.is_some()
    }
}

/// Request id minted or propagated by the request-id middleware.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Shared state for the gateway middlewares.
#[derive(Clone)]
pub struct GatewayState {
    pub users: Arc<dyn UserStore>,
    pub api_keys: Arc<dyn ApiKeyStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub audit: Arc<dyn AuditStore>,
    pub jwt: Arc<JwtSigner>,
    pub limiter: Arc<RateLimiter>,
    pub audit_options: AuditOptions,
    pub security_headers: SecurityHeaderOptions,
    pub metrics: Arc<headers::Metrics>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

/// A JSON error response with the given status.
#[must_use]
pub fn error_response(status: StatusCode, message: &str) -> Response {
    (status, axum::Json(ErrorBody { error: message })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_method_names_match_context_values() {
        assert_eq!(AuthMethod::Jwt.as_str(), "jwt");
        assert_eq!(AuthMethod::ApiKey.as_str(), "api_key");
    }

    #[test]
    fn default_context_is_unauthenticated() {
        let ctx = AuthContext::default();
        assert!(!ctx.is_authenticated());
        assert!(ctx.scopes.is_empty());
    }
}
