//! Request authentication.
//!
//! JWT validation runs first because it is stateless; only when that
//! fails is the token treated as an API key, with a prefix candidate
//! lookup followed by bcrypt comparison. The `last_used_at` update is a
//! fire-and-forget background task bounded by a timeout so it never
//! blocks the request.

use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;

use super::{apikey, error_response, AuthContext, AuthMethod, GatewayState};

const LAST_USED_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Authenticating middleware: rejects requests that do not carry a valid
/// JWT or API key.
pub async fn auth_middleware(
    State(state): State<GatewayState>,
    mut req: Request,
    next: Next,
) -> Response {
    match authenticate(&state, req.headers()).await {
        Ok(ctx) => {
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Err(response) => response,
    }
}

/// Variant that never aborts: handlers observe an authenticated context
/// when possible and an empty one otherwise.
pub async fn optional_auth_middleware(
    State(state): State<GatewayState>,
    mut req: Request,
    next: Next,
) -> Response {
    let ctx = authenticate(&state, req.headers()).await.unwrap_or_default();
    req.extensions_mut().insert(ctx);
    next.run(req).await
}

/// The authentication decision shared by both middleware variants.
pub async fn authenticate(
    state: &GatewayState,
    headers: &HeaderMap,
) -> Result<AuthContext, Response> {
    let Some(header) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return Err(error_response(StatusCode::UNAUTHORIZED, "authorization required"));
    };
    let Some(token) = apikey::parse_bearer(header) else {
        return Err(error_response(StatusCode::UNAUTHORIZED, "invalid authorization header"));
    };

    // JWT first: stateless, no database round-trip.
    if let Ok(claims) = state.jwt.verify(token) {
        let user = state
            .users
            .get_user(claims.user_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "user not found"))?;
        let scopes = state.users.user_scopes(user.id).await.map_err(internal)?;
        return Ok(AuthContext {
            user_id: Some(user.id),
            user: Some(user),
            api_key_id: None,
            organization_id: None,
            auth_method: Some(AuthMethod::Jwt),
            scopes,
        });
    }

    // API key path: candidates by cleartext prefix, then bcrypt.
    if let Some(prefix) = apikey::lookup_prefix(token) {
        let candidates = state.api_keys.find_keys_by_prefix(prefix).await.map_err(internal)?;
        if let Some(matched) = candidates
            .into_iter()
            .find(|candidate| apikey::validate(token, &candidate.secret_hash))
        {
            let now = Utc::now();
            if matched.is_expired(now) {
                return Err(error_response(StatusCode::UNAUTHORIZED, "API key expired"));
            }

            let api_keys = state.api_keys.clone();
            let key_id = matched.id;
            tokio::spawn(async move {
                let write = api_keys.touch_last_used(key_id, now);
                if tokio::time::timeout(LAST_USED_WRITE_TIMEOUT, write).await.is_err() {
                    tracing::warn!(api_key_id = %key_id, "last_used_at update timed out");
                }
            });

            let user = match matched.user_id {
                Some(user_id) => state.users.get_user(user_id).await.map_err(internal)?,
                None => None,
            };
            return Ok(AuthContext {
                user_id: matched.user_id,
                user,
                api_key_id: Some(matched.id),
                organization_id: matched.organization_id,
                auth_method: Some(AuthMethod::ApiKey),
                scopes: matched.scopes,
            });
        }
    }

    Err(error_response(StatusCode::UNAUTHORIZED, "invalid credentials"))
}

fn internal(err: crate::error::BaliseError) -> Response {
    tracing::error!(error = %err, "Auth store failure");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuditOptions, SecurityHeaderOptions};
    use crate::gateway::headers::Metrics;
    use crate::gateway::{JwtSigner, RateLimiter};
    use crate::persist::MemoryStore;
    use crate::types::{ApiKey, User, KEY_PREFIX_LENGTH};
    use axum::http::HeaderValue;
    use std::sync::Arc;
    use uuid::Uuid;

    fn state_with(store: Arc<MemoryStore>) -> GatewayState {
        GatewayState {
            users: store.clone(),
            api_keys: store.clone(),
            settings: store.clone(),
            audit: store,
            jwt: Arc::new(JwtSigner::new(b"test-secret", 60)),
            limiter: Arc::new(RateLimiter::new(crate::config::RateLimitProfile {
                requests_per_minute: 200,
                burst_size: 50,
            })),
            audit_options: AuditOptions::default(),
            security_headers: SecurityHeaderOptions::default(),
            metrics: Arc::new(Metrics::default()),
        }
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    fn insert_key(store: &MemoryStore, key: &ApiKey) {
        store.api_keys.insert(key.id, key.clone());
    }

    fn api_key_with(cleartext: &str, expires_at: Option<chrono::DateTime<Utc>>) -> ApiKey {
        ApiKey {
            id: Uuid::new_v4(),
            user_id: None,
            organization_id: Some(Uuid::new_v4()),
            secret_hash: bcrypt::hash(cleartext, 4).unwrap(),
            key_prefix: cleartext[..KEY_PREFIX_LENGTH].to_string(),
            name: "ci".into(),
            description: String::new(),
            scopes: vec!["mirrors:read".into()],
            expires_at,
            last_used_at: None,
            expiry_notification_sent_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn missing_and_malformed_headers_fail() {
        let state = state_with(Arc::new(MemoryStore::new()));
        assert!(authenticate(&state, &HeaderMap::new()).await.is_err());

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(authenticate(&state, &headers).await.is_err());
    }

    #[tokio::test]
    async fn jwt_path_loads_user_and_scopes() {
        let store = Arc::new(MemoryStore::new());
        let user = User {
            id: Uuid::new_v4(),
            email: "dev@example.com".into(),
            display_name: "Dev".into(),
            external_subject: None,
        };
        store.users.insert(user.id, user.clone());
        let state = state_with(store);

        let token = state.jwt.issue(user.id, &user.email).unwrap();
        let ctx = authenticate(&state, &bearer(&token)).await.unwrap();
        assert_eq!(ctx.auth_method, Some(AuthMethod::Jwt));
        assert_eq!(ctx.user_id, Some(user.id));
    }

    #[tokio::test]
    async fn jwt_for_unknown_user_is_rejected() {
        let state = state_with(Arc::new(MemoryStore::new()));
        let token = state.jwt.issue(Uuid::new_v4(), "ghost@example.com").unwrap();
        assert!(authenticate(&state, &bearer(&token)).await.is_err());
    }

    #[tokio::test]
    async fn api_key_path_matches_by_prefix_then_bcrypt() {
        let store = Arc::new(MemoryStore::new());
        let cleartext = "blse_0123456789abcdef0123456789abcdef";
        let key = api_key_with(cleartext, None);
        insert_key(&store, &key);
        let state = state_with(store);

        let ctx = authenticate(&state, &bearer(cleartext)).await.unwrap();
        assert_eq!(ctx.auth_method, Some(AuthMethod::ApiKey));
        assert_eq!(ctx.api_key_id, Some(key.id));
        assert_eq!(ctx.organization_id, key.organization_id);
        assert_eq!(ctx.scopes, vec!["mirrors:read".to_string()]);
    }

    #[tokio::test]
    async fn expired_api_key_is_401_with_specific_body() {
        let store = Arc::new(MemoryStore::new());
        let cleartext = "blse_ffffffffffffffffffffffffffffffff";
        let key = api_key_with(cleartext, Some(Utc::now() - chrono::Duration::hours(1)));
        insert_key(&store, &key);
        let state = state_with(store);

        let response = authenticate(&state, &bearer(cleartext)).await.unwrap_err();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], br#"{"error":"API key expired"}"#);
    }

    #[tokio::test]
    async fn wrong_secret_with_right_prefix_fails() {
        let store = Arc::new(MemoryStore::new());
        let cleartext = "blse_0123456789abcdef0123456789abcdef";
        insert_key(&store, &api_key_with(cleartext, None));
        let state = state_with(store);

        // Same 10-char prefix, different secret.
        let forged = "blse_0123499999999999999999999999999999";
        assert!(authenticate(&state, &bearer(forged)).await.is_err());
    }
}
