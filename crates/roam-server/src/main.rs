mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use roam_api::error::ApiError;
use roam_api::identity::Identity;
use roam_api::routes;
use roam_api::state::{AppState, AppStateInner};
use roam_api::storage::LocalBlobStore;
use roam_db::Database;
use roam_gateway::connection;

use crate::config::ServerConfig;

#[derive(Debug, Deserialize)]
struct GatewayParams {
    #[serde(default)]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roam=debug,roam_api=debug,roam_gateway=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    // Init database and storage
    let db = Arc::new(Database::open(&config.db_path)?);
    let blobs = Arc::new(LocalBlobStore::new(config.blob_dir.clone()).await?);

    let state = AppStateInner::build(
        db,
        blobs,
        Identity::new(&config.jwt_secret),
        config.service_settings(),
    );

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state.clone());

    let app = Router::new()
        .merge(routes::router(state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Roam server listening on {}", addr);
    info!(
        "Share links grant {}; storage retries: {}",
        config.share_default_role, config.storage_retries
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Browsers cannot set headers on a WebSocket handshake, so the token rides
/// in the query string and is checked before upgrading.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<GatewayParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = params.token else {
        return ApiError::Unauthenticated.into_response();
    };
    let user_id = match state.identity.verify(&token) {
        Ok(user_id) => user_id,
        Err(e) => return e.into_response(),
    };

    let dispatcher = state.dispatcher.clone();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, dispatcher, user_id))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Could not install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
