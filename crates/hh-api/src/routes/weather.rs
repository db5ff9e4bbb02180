use axum::{
    Json, Router,
    extract::{Query, State},
    routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;

use hh_codec::registry::GARAGE_DEVICE;
use hh_common::model::metric;
use hh_store::HistoryBucket;

use crate::state::{ApiState, READ_DEADLINE};

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/", get(current))
        .route("/history", get(history))
}

async fn current(State(state): State<ApiState>) -> Json<Value> {
    let device = state.state.snapshot_device(GARAGE_DEVICE).await;
    let weather = device.and_then(|d| d.weather);
    Json(json!({
        "temperature_f": weather.as_ref().and_then(|w| w.temperature_f),
        "pressure_inhg": weather.as_ref().and_then(|w| w.pressure_inhg),
    }))
}

#[derive(Deserialize)]
struct HistoryQuery {
    /// Epoch milliseconds; overrides `range` when present.
    start: Option<i64>,
    end: Option<i64>,
    #[serde(default = "default_range")]
    range: String,
    #[serde(default = "default_bucket")]
    bucket: String,
}

fn default_range() -> String {
    "24h".to_string()
}

fn default_bucket() -> String {
    "hour".to_string()
}

/// Parse a "24h" / "7d" / "30d" style range into milliseconds.
fn range_ms(range: &str) -> Option<i64> {
    let (number, unit) = range.split_at(range.len().checked_sub(1)?);
    let number: i64 = number.parse().ok()?;
    match unit {
        "h" => Some(number * 3_600_000),
        "d" => Some(number * 86_400_000),
        _ => None,
    }
}

async fn history(
    State(state): State<ApiState>,
    Query(query): Query<HistoryQuery>,
) -> Json<Value> {
    let Some(bucket) = HistoryBucket::parse(&query.bucket) else {
        return Json(json!({ "error": "bucket must be minute, hour or day" }));
    };
    let now = state.clock.now_ms();
    let end = query.end.unwrap_or(now);
    let start = match query.start {
        Some(start) => start,
        None => match range_ms(&query.range) {
            Some(window) => end - window,
            None => return Json(json!({ "error": "range must look like 24h, 7d or 30d" })),
        },
    };

    let store = state.store.clone();
    let task = tokio::task::spawn_blocking(move || {
        let temperature = store.reading_history(
            GARAGE_DEVICE,
            metric::WEATHER_TEMP_F,
            start,
            end,
            bucket,
        )?;
        let pressure = store.reading_history(
            GARAGE_DEVICE,
            metric::WEATHER_PRESSURE_INHG,
            start,
            end,
            bucket,
        )?;
        anyhow::Ok((temperature, pressure))
    });

    let (temperature, pressure) = match tokio::time::timeout(READ_DEADLINE, task).await {
        Ok(Ok(Ok(series))) => series,
        Ok(Ok(Err(e))) => return Json(json!({ "error": e.to_string() })),
        Ok(Err(_)) | Err(_) => return Json(json!({ "error": "history query timed out" })),
    };

    // Merge both series on bucket timestamps; points carry whichever
    // metrics had samples in that bucket.
    let mut merged: BTreeMap<i64, (Option<f64>, Option<f64>)> = BTreeMap::new();
    for point in temperature {
        merged.entry(point.ts).or_default().0 = Some(point.value);
    }
    for point in pressure {
        merged.entry(point.ts).or_default().1 = Some(point.value);
    }

    let points: Vec<Value> = merged
        .into_iter()
        .map(|(ts, (temperature_f, pressure_inhg))| {
            json!({
                "ts": ts,
                "temperature_f": temperature_f,
                "pressure_inhg": pressure_inhg,
            })
        })
        .collect();

    Json(json!(points))
}
