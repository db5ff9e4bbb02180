use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

use hh_ota::OtaError;

use crate::state::{ApiState, READ_DEADLINE, WRITE_DEADLINE};

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/{device_id}/trigger", post(trigger))
        .route("/{device_id}/manifest", get(preview))
}

#[derive(Deserialize, Default)]
struct RefBody {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
}

#[derive(Deserialize)]
struct RefQuery {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
}

fn reason(error: &OtaError) -> &'static str {
    match error {
        OtaError::UnknownDevice(_) => "unknown_device",
        OtaError::BadRef(_) => "bad_ref",
        OtaError::NoBaseUrl => "no_base_url",
        OtaError::BusUnavailable => "bus_unavailable",
        OtaError::Io(_) => "enumeration_failed",
    }
}

async fn trigger(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    body: Option<Json<RefBody>>,
) -> Json<Value> {
    let git_ref = body.and_then(|Json(body)| body.git_ref);
    let attempt = tokio::time::timeout(
        WRITE_DEADLINE,
        state.ota.trigger(&device_id, git_ref.as_deref()),
    )
    .await;

    match attempt {
        Ok(Ok(manifest)) => Json(json!({ "accepted": true, "manifest": manifest })),
        Ok(Err(e)) => Json(json!({ "accepted": false, "reason": reason(&e), "error": e.to_string() })),
        Err(_) => Json(json!({ "accepted": false, "reason": "timeout" })),
    }
}

async fn preview(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    Query(query): Query<RefQuery>,
) -> Json<Value> {
    let attempt = tokio::time::timeout(
        READ_DEADLINE,
        state.ota.preview(&device_id, query.git_ref.as_deref()),
    )
    .await;

    match attempt {
        Ok(Ok(manifest)) => Json(json!(manifest)),
        Ok(Err(e)) => Json(json!({ "error": e.to_string(), "reason": reason(&e) })),
        Err(_) => Json(json!({ "error": "manifest build timed out", "reason": "timeout" })),
    }
}
