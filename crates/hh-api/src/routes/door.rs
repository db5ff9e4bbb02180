use axum::{Json, Router, extract::State, routing::get};
use serde::Deserialize;
use serde_json::{Value, json};

use hh_bus::DispatchError;
use hh_codec::DoorCommand;
use hh_codec::registry::GARAGE_DEVICE;

use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new().route("/", get(current).post(send_command))
}

async fn current(State(state): State<ApiState>) -> Json<Value> {
    let device = state.state.snapshot_device(GARAGE_DEVICE).await;
    let door = device.and_then(|d| d.door);
    Json(json!({
        "state": door.map(|d| d.state.as_str()),
    }))
}

#[derive(Deserialize)]
struct DoorRequest {
    command: String,
}

async fn send_command(
    State(state): State<ApiState>,
    Json(request): Json<DoorRequest>,
) -> Json<Value> {
    let Some(command) = DoorCommand::parse(&request.command) else {
        return Json(json!({ "accepted": false, "reason": "bad_request" }));
    };

    match state.dispatcher.door(command) {
        Ok(()) => Json(json!({ "accepted": true })),
        Err(DispatchError::BusUnavailable) => {
            Json(json!({ "accepted": false, "reason": "bus_unavailable" }))
        }
        Err(DispatchError::UnknownDevice(_)) => {
            Json(json!({ "accepted": false, "reason": "unknown_device" }))
        }
    }
}
