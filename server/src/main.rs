mod config;
mod debug;
mod handlers;
mod models;
mod pricing;
mod proxy;
mod relay;
pub mod service;
mod usage;


use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use handlers::AppState;
use service::SqliteKeyService;
use std::sync::Arc;

use crate::config::load_config;
use crate::debug::DebugMirror;
use crate::models::ModelCache;
use crate::usage::UsageRecorder;

#[derive(Parser)]
#[command(name = "llm-usage-proxy")]
struct Args {
    #[arg(long, default_value = "config")]
    config_file: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/v1/{*path}",
            get(proxy::forward)
                .post(proxy::forward)
                .put(proxy::forward)
                .patch(proxy::forward)
                .delete(proxy::forward),
        )
        .route("/healthz", get(handlers::healthz))
        .route("/models", get(handlers::list_models))
        .route("/debug/last-response", get(handlers::last_response))
        .route("/admin/keys", post(handlers::issue_key))
        .route("/admin/keys/{token}/revoke", post(handlers::revoke_key))
        .route("/admin/usage/{token}", get(handlers::usage_for_token))
        .route("/reports/data", get(handlers::reports_data))
        .route("/public/keys", post(handlers::public_issue_key))
        .route("/public/keys/{username}", get(handlers::public_list_keys))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("server=info"));

    let args = Args::parse();
    let app_config = load_config(&args.config_file).await?;

    if app_config.upstream_api_key.trim().is_empty() {
        anyhow::bail!("upstream_api_key is required. Set it in the config file or UPSTREAM_API_KEY.");
    }
    if app_config.admin_token.is_none() {
        log::warn!("admin_token is not set; admin endpoints will refuse requests");
    }

    let pricing = app_config.resolve_pricing()?;
    if pricing.is_empty() {
        log::warn!("Pricing table is empty; usage will be recorded without cost");
    } else {
        log::info!("Loaded pricing for {} models", pricing.len());
    }

    let pool = db::init_pool(&app_config.database_url).await?;
    db::create_tables(&pool).await?;

    let upstream = Arc::new(upstream::new_client(&app_config.upstream_settings())?);
    log::info!("Upstream base {}", upstream.base());

    let models = Arc::new(ModelCache::new(upstream.clone()));
    match models.refresh().await {
        Ok(count) => log::info!("Loaded {count} upstream models"),
        Err(e) => log::warn!("Initial model refresh failed, will retry on demand: {e}"),
    }

    let keys = Arc::new(SqliteKeyService { pool });
    let state = AppState {
        keys: keys.clone(),
        models,
        recorder: Arc::new(UsageRecorder::new(keys, Arc::new(pricing))),
        upstream,
        debug: Arc::new(DebugMirror::default()),
        admin_token: app_config.admin_token,
        usage_exempt_paths: app_config.usage_exempt_paths,
        event_stream_paths: app_config.event_stream_paths,
    };

    let app = build_router(state);

    let listener =
        tokio::net::TcpListener::bind(format!("{}:{}", app_config.host, app_config.port)).await?;
    log::info!(
        "Listening on http://{}:{}",
        app_config.host,
        app_config.port
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("Shutting down");
}
