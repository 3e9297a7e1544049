use axum::{extract::State, response::Json};

use crate::gateway::HealthReport;
use crate::AppState;

/// `GET /health`, unauthenticated. Always 200; per-backend trouble is
/// reported in the body.
pub async fn handle(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.gateway.health_report())
}
