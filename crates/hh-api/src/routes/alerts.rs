use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/", get(current))
        .route("/{device_id}/{code}/resolve", post(resolve))
}

async fn current(State(state): State<ApiState>) -> Json<Value> {
    Json(json!(state.alerts.current().await))
}

#[derive(Deserialize, Default)]
struct ResolveRequest {
    note: Option<String>,
}

/// Manually resolve an open incident. The alert set catches up on its
/// next evaluation tick.
async fn resolve(
    State(state): State<ApiState>,
    Path((device_id, code)): Path<(String, String)>,
    body: Option<Json<ResolveRequest>>,
) -> Json<Value> {
    let note = body.and_then(|Json(body)| body.note);
    match state
        .store
        .resolve_incident(&device_id, &code, note.as_deref())
    {
        Ok(0) => Json(json!({ "accepted": false, "reason": "no_open_incident" })),
        Ok(_) => Json(json!({ "accepted": true })),
        Err(e) => Json(json!({ "accepted": false, "reason": "store_error", "error": e.to_string() })),
    }
}
