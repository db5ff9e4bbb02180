use axum::{Json, Router, extract::State, routing::get};
use serde_json::{Value, json};

use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new().route("/", get(current))
}

/// Current freezer temperature, taken from whichever device reports a
/// freezer section (the garage chest freezer wins ties by device id).
async fn current(State(state): State<ApiState>) -> Json<Value> {
    let snapshot = state.state.snapshot_all().await;
    let mut devices: Vec<_> = snapshot.values().collect();
    devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));

    let freezer = devices
        .iter()
        .filter_map(|d| d.freezer.as_ref())
        .find(|f| f.temperature_f.is_some());

    Json(json!({
        "temperature_f": freezer.and_then(|f| f.temperature_f),
    }))
}
