//! Audit recording.
//!
//! Runs after the handler. With no configuration only authenticated,
//! non-GET, non-error actions are recorded; `log_read_operations` and
//! `log_failed_requests` widen that independently. The write itself is a
//! bounded background task so request latency is unaffected.

use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use uuid::Uuid;

use crate::config::AuditOptions;
use crate::types::AuditEntry;
use super::{AuthContext, GatewayState, RequestId};

const AUDIT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Derive `(resource_type, action)` from method and path.
///
/// Path substrings are checked in a fixed order; mirror operations are
/// refined by method and suffix.
#[must_use]
pub fn derive_resource(method: &Method, path: &str) -> Option<(String, String)> {
    let action_for = |resource: &str| -> String {
        match *method {
            Method::POST => format!("{resource}.created"),
            Method::PUT | Method::PATCH => format!("{resource}.updated"),
            Method::DELETE => format!("{resource}.deleted"),
            _ => format!("{resource}.read"),
        }
    };

    if path.contains("modules") {
        return Some(("module".to_string(), action_for("module")));
    }
    if path.contains("mirrors") {
        let action = if *method == Method::POST && path.ends_with("/sync") {
            "mirror.sync_triggered".to_string()
        } else {
            action_for("mirror")
        };
        return Some(("mirror".to_string(), action));
    }
    if path.contains("providers") {
        return Some(("provider".to_string(), action_for("provider")));
    }
    if path.contains("users") {
        return Some(("user".to_string(), action_for("user")));
    }
    if path.contains("apikeys") {
        return Some(("api_key".to_string(), action_for("api_key")));
    }
    if path.contains("organizations") {
        return Some(("organization".to_string(), action_for("organization")));
    }
    None
}

/// Whether a request should be recorded.
#[must_use]
pub fn should_record(
    options: &AuditOptions,
    authenticated: bool,
    method: &Method,
    status: u16,
) -> bool {
    if !authenticated {
        return false;
    }
    if *method == Method::GET && !options.log_read_operations {
        return false;
    }
    if status >= 400 && !options.log_failed_requests {
        return false;
    }
    true
}

/// Audit middleware; wraps the handler and records afterwards.
pub async fn audit_middleware(
    State(state): State<GatewayState>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let ctx = req.extensions().get::<AuthContext>().cloned().unwrap_or_default();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map_or_else(String::new, |id| id.0.clone());

    let response = next.run(req).await;
    let status = response.status().as_u16();

    if should_record(&state.audit_options, ctx.is_authenticated(), &method, status) {
        let resource = derive_resource(&method, &path);
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            user_id: ctx.user_id,
            api_key_id: ctx.api_key_id,
            method: method.to_string(),
            path,
            status,
            resource_type: resource.as_ref().map(|(r, _)| r.clone()),
            action: resource.map(|(_, a)| a),
            request_id,
        };
        let audit = state.audit.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(AUDIT_WRITE_TIMEOUT, audit.record(entry))
                .await
                .is_err()
            {
                tracing::warn!("Audit write timed out");
            }
        });
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn defaults_record_only_authenticated_writes_that_succeed() {
        let options = AuditOptions::default();
        assert!(should_record(&options, true, &Method::POST, 201));
        assert!(!should_record(&options, false, &Method::POST, 201));
        assert!(!should_record(&options, true, &Method::GET, 200));
        assert!(!should_record(&options, true, &Method::POST, 403));
        assert!(!should_record(&options, true, &Method::DELETE, 500));
    }

    #[test]
    fn toggles_widen_recording_independently() {
        let reads = AuditOptions {
            log_read_operations: true,
            log_failed_requests: false,
        };
        assert!(should_record(&reads, true, &Method::GET, 200));
        assert!(!should_record(&reads, true, &Method::GET, 404));

        let failures = AuditOptions {
            log_read_operations: false,
            log_failed_requests: true,
        };
        assert!(should_record(&failures, true, &Method::POST, 422));
        assert!(!should_record(&failures, true, &Method::GET, 200));
    }

    #[test_case(Method::POST, "/v1/mirrors/abc/sync", "mirror", "mirror.sync_triggered" ; "manual sync trigger")]
    #[test_case(Method::POST, "/v1/mirrors", "mirror", "mirror.created" ; "mirror create")]
    #[test_case(Method::PUT, "/v1/mirrors/abc", "mirror", "mirror.updated" ; "mirror update")]
    #[test_case(Method::DELETE, "/v1/mirrors/abc", "mirror", "mirror.deleted" ; "mirror delete")]
    #[test_case(Method::POST, "/v1/modules/acme/vpc", "module", "module.created" ; "module create")]
    #[test_case(Method::GET, "/v1/providers/acme/aws", "provider", "provider.read" ; "provider read")]
    #[test_case(Method::DELETE, "/v1/apikeys/abc", "api_key", "api_key.deleted" ; "api key delete")]
    #[test_case(Method::PATCH, "/v1/organizations/abc", "organization", "organization.updated" ; "org update")]
    fn resource_derivation(method: Method, path: &str, resource: &str, action: &str) {
        let (r, a) = derive_resource(&method, path).unwrap();
        assert_eq!(r, resource);
        assert_eq!(a, action);
    }

    #[test]
    fn modules_win_over_providers_in_ambiguous_paths() {
        // Order is fixed: "modules" is checked before "providers".
        let (r, _) = derive_resource(&Method::GET, "/v1/modules/hashicorp/providers-demo").unwrap();
        assert_eq!(r, "module");
        assert!(derive_resource(&Method::GET, "/healthz").is_none());
    }
}
