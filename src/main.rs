//! Balise server entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::middleware as axum_mw;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use balise::cli::{Cli, Commands};
use balise::config::Config;
use balise::crypto::SecretSealer;
use balise::gateway::{self, GatewayState, JwtSigner, RateLimiter};
use balise::mirror::MirrorEngine;
use balise::notify::SmtpMailer;
use balise::persist::MemoryStore;
use balise::workers::{KeyExpiryNotifier, TagVerifier};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match run(cli).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Fatal error");
            eprintln!("Error: {e:#}");
            std::process::ExitCode::from(1)
        }
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = match verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            };
            EnvFilter::new(format!("warn,balise={level}"))
        })
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(ErrorLayer::default())
        .with(filter)
        .init();
}

struct App {
    config: Config,
    store: Arc<MemoryStore>,
    engine: Arc<MirrorEngine>,
    gateway: GatewayState,
    cancel: CancellationToken,
}

async fn build_app(config: Config) -> anyhow::Result<App> {
    let store = Arc::new(MemoryStore::new());
    let storage = balise::storage::make_backend(&config.storage, &config.server.base_url)
        .await
        .context("storage backend")?;

    let secret = gateway::jwt::process_secret(
        config.auth.jwt_secret.as_deref(),
        config.server.dev_mode,
    )
    .context("JWT secret")?;
    let jwt = Arc::new(JwtSigner::new(secret, config.auth.token_lifetime_minutes));

    let engine = Arc::new(MirrorEngine::new(
        store.clone(),
        store.clone(),
        storage,
        config.mirror.scan_interval_minutes,
        config.mirror.verify_keys(),
    ));

    let gateway = GatewayState {
        users: store.clone(),
        api_keys: store.clone(),
        settings: store.clone(),
        audit: store.clone(),
        jwt,
        limiter: Arc::new(RateLimiter::new(config.rate_limit.general)),
        audit_options: config.audit.clone(),
        security_headers: config.security_headers.clone(),
        metrics: Arc::new(gateway::headers::Metrics::default()),
    };

    Ok(App {
        config,
        store,
        engine,
        gateway,
        cancel: CancellationToken::new(),
    })
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(Some(cli.config.as_path())).context("configuration")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Sync { mirror, binary } => {
            let app = build_app(config).await?;
            if binary {
                app.engine.clone().trigger_manual_binary_sync(mirror).await?;
            } else {
                app.engine.clone().trigger_manual_sync(mirror).await?;
            }
            // The worker is detached; poll the active set until it clears.
            while app.engine.is_sync_active(mirror) {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
            Ok(())
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let app = build_app(config).await?;
    let cancel = app.cancel.clone();

    // Background workers.
    tokio::spawn(app.engine.clone().run_scheduler());
    tokio::spawn(app.gateway.limiter.clone().run_cleanup(cancel.clone()));

    if app.config.tag_verify.enabled {
        let sealer = match app.config.auth.secret_seal_key.as_deref() {
            Some(key) => SecretSealer::from_base64_key(key).context("secret seal key")?,
            None => SecretSealer::ephemeral(),
        };
        let verifier = Arc::new(TagVerifier::new(
            app.store.clone(),
            sealer,
            app.config.tag_verify.interval_hours,
        ));
        tokio::spawn(verifier.run(cancel.clone()));
    }

    let mailer = Arc::new(SmtpMailer::new(app.config.smtp.clone()));
    let notifier = Arc::new(KeyExpiryNotifier::new(
        app.store.clone(),
        app.store.clone(),
        mailer,
        app.config.notifications.clone(),
        app.config.smtp.clone(),
    ));
    tokio::spawn(notifier.run(cancel.clone()));

    // Route wiring stays thin; the gateway pipeline is the interesting
    // part and wraps everything in the documented order.
    let engine = app.engine.clone();
    let state = app.gateway.clone();
    let router = Router::new()
        .route("/v1/mirrors/:id/sync", post(trigger_sync))
        .with_state(engine)
        .route_layer(axum_mw::from_fn_with_state(state.clone(), gateway::audit::audit_middleware))
        .route_layer(axum_mw::from_fn(gateway::scopes::require_scope("mirrors:manage")))
        .route_layer(axum_mw::from_fn_with_state(state.clone(), gateway::auth::auth_middleware))
        .route_layer(axum_mw::from_fn_with_state(
            state.clone(),
            gateway::ratelimit::rate_limit_middleware,
        ))
        .route_layer(axum_mw::from_fn_with_state(state.clone(), gateway::headers::metrics_middleware))
        .route_layer(axum_mw::from_fn(gateway::headers::request_id_middleware))
        .route_layer(axum_mw::from_fn_with_state(
            state.clone(),
            gateway::headers::security_headers_middleware,
        ))
        .route("/healthz", get(|| async { "ok" }))
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", app.config.server.host, app.config.server.port)
        .parse()
        .context("listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(addr = %addr, "Balise listening");

    let engine_for_shutdown = app.engine.clone();
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown requested");
        engine_for_shutdown.shutdown();
        cancel.cancel();
    })
    .await
    .context("server")?;

    Ok(())
}

async fn trigger_sync(
    State(engine): State<Arc<MirrorEngine>>,
    AxumPath(id): AxumPath<Uuid>,
) -> impl IntoResponse {
    match engine.trigger_manual_sync(id).await {
        Ok(()) => (StatusCode::ACCEPTED, axum::Json(serde_json::json!({"status": "started"})))
            .into_response(),
        Err(e) => gateway::error_response(StatusCode::CONFLICT, &e.to_string()),
    }
}
