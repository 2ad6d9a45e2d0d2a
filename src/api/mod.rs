use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::domain::{PerformanceMetrics, SystemStatus, TradeResult};
use crate::engine::registry::StrategyInfo;
use crate::engine::Engine;
use crate::error::EngineError;

pub struct AppState {
    pub engine: Arc<Engine>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/strategies", get(strategies))
        .route("/api/strategies/{id}/enable", post(enable_strategy))
        .route("/api/strategies/{id}/disable", post(disable_strategy))
        .route("/api/metrics", get(metrics))
        .route("/api/trades", get(trades))
        .route("/api/halt", post(halt))
        .route("/api/resume", post(resume))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Status stream, served on its own port.
pub fn ws_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Maps engine errors onto HTTP status codes.
struct ApiError(EngineError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match &self.0 {
            EngineError::UnknownStrategy(_) => StatusCode::NOT_FOUND,
            EngineError::CapacityExceeded { .. } | EngineError::RiskLevelDisabled(_) => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::BAD_REQUEST,
        };
        (code, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    Json(state.engine.status().await)
}

async fn strategies(State(state): State<Arc<AppState>>) -> Json<Vec<StrategyInfo>> {
    Json(state.engine.registry().infos().await)
}

async fn set_enabled(state: &AppState, id: &str, enabled: bool) -> Result<Json<StrategyInfo>, ApiError> {
    let mut registry = state.engine.registry().write().await;
    registry.set_enabled(id, enabled).map_err(ApiError)?;
    let info = registry
        .get(id)
        .map(|e| e.info())
        .ok_or_else(|| ApiError(EngineError::UnknownStrategy(id.to_string())))?;
    Ok(Json(info))
}

async fn enable_strategy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StrategyInfo>, ApiError> {
    set_enabled(&state, &id, true).await
}

async fn disable_strategy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StrategyInfo>, ApiError> {
    set_enabled(&state, &id, false).await
}

async fn metrics(State(state): State<Arc<AppState>>) -> Json<PerformanceMetrics> {
    Json(state.engine.tracker().metrics().await)
}

#[derive(Deserialize)]
struct TradesQuery {
    limit: Option<usize>,
    strategy: Option<String>,
}

async fn trades(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TradesQuery>,
) -> Json<Vec<TradeResult>> {
    let limit = q.limit.unwrap_or(100).min(1_000);
    Json(state.engine.tracker().recent(q.strategy.as_deref(), limit).await)
}

#[derive(Deserialize)]
struct HaltRequest {
    reason: Option<String>,
}

/// POST /api/halt - optional body `{"reason": "..."}`
async fn halt(State(state): State<Arc<AppState>>, body: Bytes) -> Json<serde_json::Value> {
    let reason = serde_json::from_slice::<HaltRequest>(&body)
        .ok()
        .and_then(|b| b.reason)
        .unwrap_or_else(|| "requested via API".into());
    state.engine.risk().kill(&reason);
    Json(serde_json::json!({ "status": "halted", "reason": state.engine.risk().halt_reason() }))
}

async fn resume(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.engine.risk().resume();
    Json(serde_json::json!({ "status": "running", "halted": state.engine.risk().is_halted() }))
}

/// GET /ws - pushes `SystemStatus` once per second
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

async fn handle_websocket(mut socket: WebSocket, state: Arc<AppState>) {
    info!("WebSocket client connected");
    let mut interval = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let status = state.engine.status().await;
                match serde_json::to_string(&status) {
                    Ok(json) => {
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to encode status: {:?}", e),
                }
            }

            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}
