use axum::{Json, Router, extract::State, routing::get};
use serde_json::{Value, json};
use std::sync::atomic::Ordering;

use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    let now = state.clock.now_ms();
    Json(json!({
        "status": "ok",
        "uptime_s": (now - state.started_at_ms) / 1000,
        "bus": {
            "connected": state.bus_stats.is_connected(),
            "decode_errors": state.bus_stats.decode_errors.load(Ordering::Relaxed),
            "shed_applies": state.bus_stats.shed_applies.load(Ordering::Relaxed),
            "dropped_publishes": state.bus_stats.dropped_publishes.load(Ordering::Relaxed),
        },
        "store": {
            "healthy": state.writer_stats.is_healthy(),
            "shed_readings": state.writer_stats.shed_readings.load(Ordering::Relaxed),
            "write_errors": state.writer_stats.write_errors.load(Ordering::Relaxed),
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
