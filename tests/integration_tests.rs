//! End-to-end tests driving the engine and the gateway pipeline against
//! in-process doubles: wiremock upstreams and the in-memory store.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware as axum_mw;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use balise::config::{
    AuditOptions, LocalStorageOptions, RateLimitProfile, SecurityHeaderOptions,
};
use balise::gateway::{self, GatewayState, JwtSigner, RateLimiter};
use balise::mirror::MirrorEngine;
use balise::persist::{MemoryStore, MirrorStore, SettingsStore};
use balise::storage::{LocalFsBackend, StorageBackend};
use balise::types::{
    ApiKey, MirrorConfiguration, SyncStatus, SystemSettings, KEY_PREFIX_LENGTH,
};

fn local_storage(dir: &tempfile::TempDir) -> Arc<LocalFsBackend> {
    Arc::new(
        LocalFsBackend::new(&LocalStorageOptions {
            base_path: dir.path().to_string_lossy().into_owned(),
            serve_directly: false,
        })
        .unwrap(),
    )
}

async fn mount_provider_upstream(server: &MockServer) {
    let body: &[u8] = b"provider binary";
    let digest = hex::encode(Sha256::digest(body));
    Mock::given(method("GET"))
        .and(path("/.well-known/terraform.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"providers.v1": "/v1/providers/"})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/providers/hashicorp/random/versions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "versions": [
                {"version": "3.6.0", "protocols": ["5.0"], "platforms": [{"os": "linux", "arch": "amd64"}]}
            ]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/providers/hashicorp/random/3.6.0/download/linux/amd64"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "download_url": format!("{}/dist/terraform-provider-random_3.6.0_linux_amd64.zip", server.uri()),
            "filename": "terraform-provider-random_3.6.0_linux_amd64.zip",
            "shasums_url": format!("{}/dist/SHA256SUMS", server.uri()),
            "shasums_signature_url": null,
            "shasum": digest,
            "protocols": ["5.0"],
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dist/SHA256SUMS"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "{digest}  terraform-provider-random_3.6.0_linux_amd64.zip\n"
        )))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dist/terraform-provider-random_3.6.0_linux_amd64.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
}

fn mirror_config(id: Uuid, upstream: &str) -> MirrorConfiguration {
    MirrorConfiguration {
        id,
        name: "hashicorp-random".into(),
        upstream_url: upstream.to_string(),
        namespace_filter: Some("hashicorp".into()),
        provider_filter: Some("random".into()),
        version_filter: None,
        platform_filter: None,
        interval_minutes: 60,
        enabled: true,
        last_sync_at: None,
        last_sync_status: SyncStatus::Idle,
    }
}

async fn wait_for_sync(engine: &Arc<MirrorEngine>, id: Uuid) {
    for _ in 0..200 {
        if !engine.is_sync_active(id) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    panic!("sync {id} did not finish in time");
}

#[tokio::test]
async fn manual_sync_records_history_and_storage() {
    let server = MockServer::start().await;
    mount_provider_upstream(&server).await;

    let store = Arc::new(MemoryStore::new());
    let config_id = Uuid::new_v4();
    store
        .mirror_configs
        .insert(config_id, mirror_config(config_id, &server.uri()));

    let dir = tempfile::tempdir().unwrap();
    let storage = local_storage(&dir);
    let engine = Arc::new(MirrorEngine::new(
        store.clone(),
        store.clone(),
        storage.clone(),
        5,
        Default::default(),
    ));

    engine.clone().trigger_manual_sync(config_id).await.unwrap();
    wait_for_sync(&engine, config_id).await;

    // History: one append-only row, running -> terminal, ordered stamps.
    let history = store.list_history(config_id).await.unwrap();
    assert_eq!(history.len(), 1);
    let row = &history[0];
    assert_eq!(row.status, SyncStatus::Success);
    assert_eq!(row.providers_synced, 1);
    assert_eq!(row.versions_synced, 1);
    assert!(row.completed_at.unwrap() > row.started_at);

    // Configuration flipped to success with a sync stamp.
    let config = store.get_configuration(config_id).await.unwrap().unwrap();
    assert_eq!(config.last_sync_status, SyncStatus::Success);
    assert!(config.last_sync_at.is_some());

    // The binary landed under the documented layout with its digest.
    let meta = storage
        .get_metadata("providers/hashicorp/random/3.6.0/linux/amd64/terraform-provider-random_3.6.0_linux_amd64.zip")
        .await
        .unwrap();
    assert_eq!(
        meta.sha256_hex.as_deref(),
        Some(hex::encode(Sha256::digest(b"provider binary")).as_str())
    );
}

#[tokio::test]
async fn scheduler_runs_due_configurations_and_stops_cleanly() {
    let server = MockServer::start().await;
    mount_provider_upstream(&server).await;

    let store = Arc::new(MemoryStore::new());
    let config_id = Uuid::new_v4();
    store
        .mirror_configs
        .insert(config_id, mirror_config(config_id, &server.uri()));

    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MirrorEngine::new(
        store.clone(),
        store.clone(),
        local_storage(&dir),
        5,
        Default::default(),
    ));

    // The scheduler scans immediately on start.
    let scheduler = tokio::spawn(engine.clone().run_scheduler());
    for _ in 0..200 {
        if !store.list_history(config_id).await.unwrap().is_empty()
            && !engine.is_sync_active(config_id)
        {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }

    engine.shutdown();
    tokio::time::timeout(std::time::Duration::from_secs(5), scheduler)
        .await
        .expect("scheduler exits on shutdown")
        .unwrap();

    let history = store.list_history(config_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, SyncStatus::Success);
}

fn gateway_state(store: Arc<MemoryStore>) -> GatewayState {
    GatewayState {
        users: store.clone(),
        api_keys: store.clone(),
        settings: store.clone(),
        audit: store,
        jwt: Arc::new(JwtSigner::new(b"integration-secret", 60)),
        limiter: Arc::new(RateLimiter::new(RateLimitProfile {
            requests_per_minute: 200,
            burst_size: 50,
        })),
        audit_options: AuditOptions::default(),
        security_headers: SecurityHeaderOptions::default(),
        metrics: Arc::new(gateway::headers::Metrics::default()),
    }
}

fn protected_router(state: GatewayState) -> Router {
    Router::new()
        .route("/v1/mirrors", get(|| async { "mirror list" }))
        .route_layer(axum_mw::from_fn_with_state(state.clone(), gateway::audit::audit_middleware))
        .route_layer(axum_mw::from_fn(gateway::scopes::require_scope("mirrors:read")))
        .route_layer(axum_mw::from_fn_with_state(state.clone(), gateway::auth::auth_middleware))
        .route_layer(axum_mw::from_fn_with_state(
            state.clone(),
            gateway::ratelimit::rate_limit_middleware,
        ))
        .route_layer(axum_mw::from_fn(gateway::headers::request_id_middleware))
        .route_layer(axum_mw::from_fn_with_state(
            state,
            gateway::headers::security_headers_middleware,
        ))
}

fn seeded_api_key(store: &MemoryStore, cleartext: &str, scopes: &[&str]) -> ApiKey {
    let key = ApiKey {
        id: Uuid::new_v4(),
        user_id: None,
        organization_id: None,
        secret_hash: bcrypt::hash(cleartext, 4).unwrap(),
        key_prefix: cleartext[..KEY_PREFIX_LENGTH].to_string(),
        name: "integration".into(),
        description: String::new(),
        scopes: scopes.iter().map(|s| (*s).to_string()).collect(),
        expires_at: None,
        last_used_at: None,
        expiry_notification_sent_at: None,
        created_at: Utc::now(),
    };
    store.api_keys.insert(key.id, key.clone());
    key
}

#[tokio::test]
async fn pipeline_authenticates_authorizes_and_stamps_headers() {
    let store = Arc::new(MemoryStore::new());
    let cleartext = "blse_11112222333344445555666677778888";
    seeded_api_key(&store, cleartext, &["mirrors:read"]);
    let router = protected_router(gateway_state(store.clone()));

    // No credentials: the auth layer rejects.
    let response = router
        .clone()
        .oneshot(Request::get("/v1/mirrors").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Valid key with the right scope: the request flows through and the
    // pipeline stamps its headers.
    let response = router
        .clone()
        .oneshot(
            Request::get("/v1/mirrors")
                .header("Authorization", format!("Bearer {cleartext}"))
                .header("X-Request-ID", "req-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers.get("x-request-id").unwrap(), "req-42");
    assert!(headers.contains_key("x-ratelimit-remaining"));
    assert_eq!(
        headers.get("content-security-policy").unwrap(),
        "default-src 'none'; frame-ancestors 'none'"
    );

    // Right key, wrong scope: 403 from the RBAC layer.
    let store2 = Arc::new(MemoryStore::new());
    let limited = "blse_99990000111122223333444455556666";
    seeded_api_key(&store2, limited, &["modules:read"]);
    let router2 = protected_router(gateway_state(store2));
    let response = router2
        .oneshot(
            Request::get("/v1/mirrors")
                .header("Authorization", format!("Bearer {limited}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn expired_api_key_yields_401_with_documented_body() {
    let store = Arc::new(MemoryStore::new());
    let cleartext = "blse_aaaabbbbccccddddeeeeffff00001111";
    let mut key = seeded_api_key(&store, cleartext, &["mirrors:read"]);
    key.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
    store.api_keys.insert(key.id, key);

    let router = protected_router(gateway_state(store));
    let response = router
        .oneshot(
            Request::get("/v1/mirrors")
                .header("Authorization", format!("Bearer {cleartext}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(&body[..], br#"{"error":"API key expired"}"#);
}

#[tokio::test]
async fn setup_token_lifecycle() {
    let store = Arc::new(MemoryStore::new());
    let token = "first-run-token";
    store
        .update_system_settings(SystemSettings {
            setup_completed: false,
            setup_token_hash: Some(bcrypt::hash(token, 4).unwrap()),
        })
        .await
        .unwrap();

    let state = gateway_state(store.clone());
    let router = Router::new()
        .route("/setup/admin", post(|| async { "created" }))
        .route_layer(axum_mw::from_fn_with_state(
            state,
            gateway::setup::setup_middleware(gateway::setup::setup_limiter()),
        ));

    // Before completion a correct token passes.
    let response = router
        .clone()
        .oneshot(
            Request::post("/setup/admin")
                .header("Authorization", format!("SetupToken {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // A wrong token fails.
    let response = router
        .clone()
        .oneshot(
            Request::post("/setup/admin")
                .header("Authorization", "SetupToken wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // After completion the same correct request is permanently 403.
    store
        .update_system_settings(SystemSettings {
            setup_completed: true,
            setup_token_hash: Some(bcrypt::hash(token, 4).unwrap()),
        })
        .await
        .unwrap();
    let response = router
        .oneshot(
            Request::post("/setup/admin")
                .header("Authorization", format!("SetupToken {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
