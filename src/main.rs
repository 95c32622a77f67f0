//! Push notification dispatcher — bridges an RTC server to APNs and FCM.
//!
//! - Loads the global server settings and the per-application table
//!   (spec.md §6), building one vendor client per `(app_id, platform)`.
//! - Watches the application table and credentials directory for changes
//!   and swaps in a fresh registry generation without downtime (spec.md
//!   §4.1).
//! - Selects a token-store backend (file or Cassandra-family column store)
//!   for the account-fanout path (spec.md §4.5, DESIGN NOTES §9).
//! - Serves the four HTTP endpoints in `handlers.rs` behind an optional
//!   CIDR allowlist.

mod acl;
mod config;
mod dispatcher;
mod errors;
mod handlers;
mod models;
mod registry;
mod renderers;
mod retry;
mod store;
mod util;
mod vendor_apns;
mod vendor_fcm;

use acl::AccessList;
use arc_swap::ArcSwap;
use axum::{
    routing::{get, post},
    Router,
};
use config::Config;
use dispatcher::Dispatcher;
use handlers::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::info;

/// Maximum request body size (64 KiB — vendor payloads are small JSON
/// envelopes, this just guards against abuse).
const MAX_BODY_SIZE: usize = 64 * 1024;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Config::from_env();
    let server_settings = config::load_server_settings(&config.config_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "cannot read global config, using defaults");
        config::ServerSettings::default()
    });

    let acl = AccessList::parse(&server_settings.allowed_hosts).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "cannot parse allowed-hosts, denying nothing");
        AccessList::default()
    });

    let initial_registry = registry::build(&config.applications_path, &config.credentials_dir);
    log_startup_info(&config, &server_settings, &initial_registry);
    let registry = Arc::new(ArcSwap::from_pointee(initial_registry));

    tokio::spawn(registry::watch(
        registry.clone(),
        config.applications_path.clone(),
        config.credentials_dir.clone(),
        config.reload_interval,
    ));

    let spool_path = server_settings.spool_dir.join("tokens.json");
    let token_store = store::open(&server_settings.cassandra_contact_points, "pushd", spool_path).await;

    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), token_store));
    let state = AppState::new(registry, dispatcher, acl, server_settings.return_async);

    let app = build_router(state);
    serve(app, &config).await;
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pushd=debug,tower_http=info")))
        .init();
}

fn log_startup_info(config: &Config, settings: &config::ServerSettings, registry: &registry::Registry) {
    info!(
        bind_addr = %config.bind_addr,
        port = config.port,
        bindings = registry.bindings.len(),
        invalid_bindings = registry.invalid.len(),
        return_async = settings.return_async,
        allowed_hosts = settings.allowed_hosts.len(),
        cassandra = !settings.cassandra_contact_points.is_empty(),
        "starting push dispatcher"
    );
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/push", post(handlers::push))
        .route("/v2/tokens/:account", post(handlers::add_token).delete(handlers::remove_token))
        .route("/v2/tokens/:account/push", post(handlers::fanout_push_account))
        .route("/v2/tokens/:account/push/:device", post(handlers::fanout_push_device))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn serve(app: Router, config: &Config) {
    let bind_addr = format!("{}:{}", config.bind_addr, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await.expect("failed to bind to address");

    info!(addr = %bind_addr, "server listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .expect("server error");
}
