use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde_json::{Value, json};

use hh_bus::DispatchError;

use crate::state::{ApiState, WRITE_DEADLINE};

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/", get(list))
        .route("/{device_id}/reboot", post(reboot))
}

async fn list(State(state): State<ApiState>) -> Json<Value> {
    let snapshot = state.state.snapshot_all().await;
    Json(json!(snapshot))
}

async fn reboot(State(state): State<ApiState>, Path(device_id): Path<String>) -> Json<Value> {
    let result = tokio::time::timeout(WRITE_DEADLINE, state.dispatcher.reboot(&device_id)).await;
    match result {
        Ok(Ok(())) => Json(json!({ "accepted": true })),
        Ok(Err(DispatchError::UnknownDevice(_))) => {
            Json(json!({ "accepted": false, "reason": "unknown_device" }))
        }
        Ok(Err(DispatchError::BusUnavailable)) => {
            Json(json!({ "accepted": false, "reason": "bus_unavailable" }))
        }
        Err(_) => Json(json!({ "accepted": false, "reason": "timeout" })),
    }
}
