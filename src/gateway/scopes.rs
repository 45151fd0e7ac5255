//! Scope-based authorization.
//!
//! Scopes are `resource:action` strings from a closed set, plus the
//! `admin` wildcard. Write or manage on a resource implies read on that
//! same resource and nothing else. Checks run at request time against
//! the scopes the auth middleware put in context, so role template edits
//! apply on the next request.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use axum::extract::{Path, Request};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use axum::RequestExt;
use uuid::Uuid;

use super::{error_response, AuthContext};

/// The wildcard scope granting everything.
pub const ADMIN: &str = "admin";

/// The closed scope set.
pub const ALL_SCOPES: &[&str] = &[
    "modules:read",
    "modules:write",
    "providers:read",
    "providers:write",
    "mirrors:read",
    "mirrors:manage",
    "users:read",
    "users:write",
    "organizations:read",
    "organizations:write",
    "scm:read",
    "scm:manage",
    "api_keys:manage",
    "audit:read",
    ADMIN,
];

/// Whether a scope set satisfies a requirement.
#[must_use]
pub fn has_scope(scopes: &[String], required: &str) -> bool {
    if scopes.iter().any(|s| s == required || s == ADMIN) {
        return true;
    }
    // Write or manage implies read, on the same resource only.
    if let Some(resource) = required.strip_suffix(":read") {
        let write = format!("{resource}:write");
        let manage = format!("{resource}:manage");
        return scopes.iter().any(|s| *s == write || *s == manage);
    }
    false
}

#[must_use]
pub fn has_any_scope(scopes: &[String], required: &[&str]) -> bool {
    required.iter().any(|r| has_scope(scopes, r))
}

#[must_use]
pub fn has_all_scopes(scopes: &[String], required: &[&str]) -> bool {
    required.iter().all(|r| has_scope(scopes, r))
}

/// Whether the context may act inside an organization: the API key is
/// bound to it, or an authenticated user holds the admin wildcard.
#[must_use]
pub fn is_org_member(ctx: &AuthContext, org_id: Uuid) -> bool {
    if !ctx.is_authenticated() {
        return false;
    }
    if ctx.organization_id == Some(org_id) {
        return true;
    }
    ctx.scopes.iter().any(|s| s == ADMIN)
}

type MiddlewareFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

fn deny(required: &str) -> Response {
    error_response(
        StatusCode::FORBIDDEN,
        &format!("insufficient scope: {required} required"),
    )
}

fn unauthenticated() -> Response {
    error_response(StatusCode::UNAUTHORIZED, "authentication required")
}

fn context_of(req: &Request) -> Option<AuthContext> {
    req.extensions().get::<AuthContext>().cloned()
}

/// Middleware requiring one scope.
pub fn require_scope(
    scope: &'static str,
) -> impl Fn(Request, Next) -> MiddlewareFuture + Clone + Send + 'static {
    move |req: Request, next: Next| {
        Box::pin(async move {
            let Some(ctx) = context_of(&req) else {
                return unauthenticated();
            };
            if !ctx.is_authenticated() {
                return unauthenticated();
            }
            if !has_scope(&ctx.scopes, scope) {
                return deny(scope);
            }
            next.run(req).await
        })
    }
}

/// Middleware requiring at least one of the scopes.
pub fn require_any_scope(
    required: &'static [&'static str],
) -> impl Fn(Request, Next) -> MiddlewareFuture + Clone + Send + 'static {
    move |req: Request, next: Next| {
        Box::pin(async move {
            let Some(ctx) = context_of(&req) else {
                return unauthenticated();
            };
            if !ctx.is_authenticated() {
                return unauthenticated();
            }
            if !has_any_scope(&ctx.scopes, required) {
                return deny(&required.join(" | "));
            }
            next.run(req).await
        })
    }
}

/// Middleware requiring every one of the scopes.
pub fn require_all_scopes(
    required: &'static [&'static str],
) -> impl Fn(Request, Next) -> MiddlewareFuture + Clone + Send + 'static {
    move |req: Request, next: Next| {
        Box::pin(async move {
            let Some(ctx) = context_of(&req) else {
                return unauthenticated();
            };
            if !ctx.is_authenticated() {
                return unauthenticated();
            }
            if !has_all_scopes(&ctx.scopes, required) {
                return deny(&required.join(" & "));
            }
            next.run(req).await
        })
    }
}

async fn org_id_of(req: &mut Request) -> Option<Uuid> {
    let Ok(Path(params)) = req.extract_parts::<Path<HashMap<String, String>>>().await else {
        return None;
    };
    params.get("org_id").and_then(|raw| raw.parse().ok())
}

/// Middleware requiring membership in the organization named by the
/// `org_id` path parameter.
pub fn require_org_membership(
) -> impl Fn(Request, Next) -> MiddlewareFuture + Clone + Send + 'static {
    move |mut req: Request, next: Next| {
        Box::pin(async move {
            let Some(org_id) = org_id_of(&mut req).await else {
                return error_response(StatusCode::BAD_REQUEST, "missing organization id");
            };
            let Some(ctx) = context_of(&req) else {
                return unauthenticated();
            };
            if !is_org_member(&ctx, org_id) {
                return error_response(StatusCode::FORBIDDEN, "not a member of this organization");
            }
            next.run(req).await
        })
    }
}

/// Middleware requiring both a scope and membership in the `org_id`
/// organization.
pub fn require_org_scope(
    scope: &'static str,
) -> impl Fn(Request, Next) -> MiddlewareFuture + Clone + Send + 'static {
    move |mut req: Request, next: Next| {
        Box::pin(async move {
            let Some(org_id) = org_id_of(&mut req).await else {
                return error_response(StatusCode::BAD_REQUEST, "missing organization id");
            };
            let Some(ctx) = context_of(&req) else {
                return unauthenticated();
            };
            if !ctx.is_authenticated() {
                return unauthenticated();
            }
            if !is_org_member(&ctx, org_id) {
                return error_response(StatusCode::FORBIDDEN, "not a member of this organization");
            }
            if !has_scope(&ctx.scopes, scope) {
                return deny(scope);
            }
            next.run(req).await
        })
    }
}
