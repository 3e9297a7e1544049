use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

use crate::AppState;

/// `POST /close`: stops every backend and triggers graceful shutdown of the
/// listener. Only the first call does anything; later ones get 410.
pub async fn handle(State(state): State<AppState>) -> Response {
    if !state.gateway.mark_closed() {
        return (
            StatusCode::GONE,
            Json(json!({"error": "Gateway has already been closed"})),
        )
            .into_response();
    }

    tracing::info!("close requested over HTTP");
    let terminated = state.gateway.shutdown().await;

    Json(json!({
        "status": "closed",
        "message": "Gateway shutdown initiated",
        "serversTerminated": terminated,
    }))
    .into_response()
}
