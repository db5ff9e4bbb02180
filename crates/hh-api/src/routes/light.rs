use axum::{Json, Router, extract::State, routing::get};
use serde::Deserialize;
use serde_json::{Value, json};

use hh_bus::DispatchError;
use hh_codec::LightCommand;
use hh_codec::registry::GARAGE_DEVICE;

use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new().route("/", get(current).post(send_command))
}

async fn current(State(state): State<ApiState>) -> Json<Value> {
    let device = state.state.snapshot_device(GARAGE_DEVICE).await;
    let light = device.and_then(|d| d.light);
    Json(json!({
        "state": light.as_ref().map(|l| l.state.as_str()),
        "last_updated": light.as_ref().map(|l| l.ts),
    }))
}

#[derive(Deserialize)]
struct LightRequest {
    state: String,
}

async fn send_command(
    State(state): State<ApiState>,
    Json(request): Json<LightRequest>,
) -> Json<Value> {
    let result = match LightCommand::parse(&request.state) {
        Some(LightCommand::Toggle) => state.dispatcher.light_toggle(),
        Some(command) => state.dispatcher.light(command),
        None => return Json(json!({ "accepted": false, "reason": "bad_request" })),
    };

    match result {
        Ok(()) => Json(json!({ "accepted": true })),
        Err(DispatchError::BusUnavailable) => {
            Json(json!({ "accepted": false, "reason": "bus_unavailable" }))
        }
        Err(DispatchError::UnknownDevice(_)) => {
            Json(json!({ "accepted": false, "reason": "unknown_device" }))
        }
    }
}
