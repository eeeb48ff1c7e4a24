use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub db_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_holds: Option<i64>,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let db_ok = sqlx::query("SELECT 1").execute(&state.db).await.is_ok();

    // Provisional reservations currently blocking slots; a runaway number
    // here means the hold sweep is not keeping up.
    let open_holds = sqlx::query_scalar(
        "SELECT COUNT(*) FROM bookings
         WHERE status IN ('temp', 'on_hold') AND deleted_at IS NULL",
    )
    .fetch_one(&state.db)
    .await
    .ok();

    Json(HealthResponse {
        status: if db_ok { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        db_ok,
        open_holds,
    })
}
