//! Web server: axum application wiring and shared state.

pub mod protocol;
pub mod voice_ws;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::upstream::registry::ModelRegistry;
use crate::voice::session::SessionStore;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionStore>,
    pub registry: Arc<ModelRegistry>,
}

impl ServerState {
    pub fn new(config: Config) -> Self {
        let registry = ModelRegistry::new(config.runtime.http_url(), config.models.clone());
        let sessions = SessionStore::new(config.server.max_sessions);
        Self {
            config: Arc::new(config),
            sessions: Arc::new(sessions),
            registry: Arc::new(registry),
        }
    }
}

/// Build the router; separated from [`start`] so tests can drive it.
pub fn app(state: ServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/v1/{namespace}/{project}/voice/chat",
            get(voice_ws::voice_chat_handler),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until shutdown.
pub async fn start(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server bind address")?;

    let state = ServerState::new(config);
    let router = app(state);

    info!("voice gateway listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, router)
        .await
        .context("server error")?;
    Ok(())
}
