use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::services::ServeDir;
use tracing::info;

use crate::broadcast::Broadcaster;
use crate::constants::GAME_VERSION;
use crate::state::{ServerState, SharedState};

#[derive(Clone)]
pub struct ApiContext {
    pub state: SharedState,
    pub broadcaster: Arc<Broadcaster>,
}

pub fn router(ctx: ApiContext, web_root: PathBuf) -> Router {
    Router::new()
        .route("/api/config", get(config_handler))
        .route("/api/status", get(status_handler))
        .fallback_service(ServeDir::new(web_root).append_index_html_on_directories(true))
        .layer(middleware::from_fn(traversal_guard))
        .with_state(ctx)
}

pub async fn serve(
    listener: TcpListener,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
            info!("http surface stopping");
        })
        .await
}

/// Any `..` segment (literal or percent-encoded) is refused outright; the
/// static file service below never sees such a request.
fn is_traversal(path: &str) -> bool {
    if path.split(['/', '\\']).any(|segment| segment == "..") {
        return true;
    }
    path.to_ascii_lowercase().contains("%2e%2e")
}

async fn traversal_guard(request: Request, next: Next) -> Response {
    if is_traversal(request.uri().path()) {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }
    next.run(request).await
}

fn config_payload(state: &ServerState) -> Value {
    json!({
        "websocketPort": state.websocket_port,
        "gameVersion": GAME_VERSION,
        "serverName": state.config.server_name,
        "mazeSize": format!(
            "{}x{}x{}",
            state.config.maze_width, state.config.maze_height, state.config.maze_layers
        ),
        "maxPlayers": state.config.max_players,
    })
}

fn status_payload(state: &ServerState, broadcaster: &Broadcaster) -> Value {
    json!({
        "status": "running",
        "connectedPlayers": broadcaster.connection_count(),
        "totalPlayers": state.registry.player_count(),
        "onlinePlayers": state.registry.online_count(),
        "uptime": state.uptime_secs(),
        "serverTime": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

async fn config_handler(State(ctx): State<ApiContext>) -> impl IntoResponse {
    let guard = ctx.state.lock().await;
    Json(config_payload(&guard))
}

async fn status_handler(State(ctx): State<ApiContext>) -> impl IntoResponse {
    let guard = ctx.state.lock().await;
    Json(status_payload(&guard, &ctx.broadcaster))
}
