//! Event application: the single place device state mutates.

use std::collections::HashMap;

use serde_json::{Value, json};

use hh_codec::Event;
use hh_codec::event::{ConsolidatedStatus, HealthStatus, LifecycleStatus};
use hh_common::events::{BootChange, ChangeKind, DeviceRowChange, ReadingChange, SosChange, StateChange};
use hh_common::model::{
    CityPower, DeviceState, DeviceStatus, DoorView, FreezerView, LightView, MemoryInfo,
    MetricSample, PowerView, WeatherView, metric,
};

pub(crate) fn json_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn row_change(device: &DeviceState) -> DeviceRowChange {
    DeviceRowChange {
        status: device.status,
        last_seen: device.last_seen,
        version: device.version.clone(),
        last_boot: device.last_boot,
        last_error_code: device.last_error_code.clone(),
        ip_address: device.ip_address.clone(),
        rssi: device.rssi,
    }
}

fn touch(device: &mut DeviceState, now: i64) {
    device.last_seen = Some(device.last_seen.map_or(now, |seen| seen.max(now)));
}

/// Move the device through the status automaton, recording the transition.
fn transition(device: &mut DeviceState, next: DeviceStatus, changes: &mut Vec<StateChange>) {
    if device.status == next {
        return;
    }
    let before = device.status;
    device.status = next;
    if next == DeviceStatus::Online {
        device.was_online = true;
    }
    changes.push(StateChange::new(
        &device.device_id,
        ChangeKind::Status,
        json!({ "status": before.to_string() }),
        json_value(&row_change(device)),
    ));
}

/// Any message marks its device online, except that `updating` is only
/// left through an explicit health or status message: a device mid-update
/// may still emit telemetry, and that must not be read as the update
/// having finished.
fn mark_online(device: &mut DeviceState, changes: &mut Vec<StateChange>) {
    if device.status == DeviceStatus::Updating {
        return;
    }
    transition(device, DeviceStatus::Online, changes);
}

/// Record a sample in the per-metric map, enforcing monotonic timestamps.
/// Stale samples and exact replays are dropped. Returns whether the
/// sample was accepted.
fn push_reading(
    device: &mut DeviceState,
    metric_name: &str,
    value: f64,
    ts: i64,
    changes: &mut Vec<StateChange>,
) -> bool {
    match device.metrics.get(metric_name) {
        Some(sample) if ts < sample.ts => return false,
        Some(sample) if ts == sample.ts && sample.value == value => return false,
        _ => {}
    }
    device
        .metrics
        .insert(metric_name.to_string(), MetricSample { value, ts });
    changes.push(StateChange::new(
        &device.device_id,
        ChangeKind::Reading,
        Value::Null,
        json_value(&ReadingChange {
            metric: metric_name.to_string(),
            value,
            ts,
        }),
    ));
    true
}

pub(crate) fn apply_event(
    devices: &mut HashMap<String, DeviceState>,
    event: &Event,
    now: i64,
) -> Vec<StateChange> {
    let Some(device_id) = event.device_id() else {
        // Decoded command topics carry no device state.
        return Vec::new();
    };

    let device = devices
        .entry(device_id.to_string())
        .or_insert_with(|| DeviceState::new(device_id));

    let mut changes = Vec::new();

    match event {
        Event::StatusUpdate { status, .. } => {
            let next = match status {
                // The broker publishes this on the device's behalf when the
                // session dies; the device is not talking, so last_seen is
                // left alone.
                LifecycleStatus::Offline => DeviceStatus::Offline,
                LifecycleStatus::UpdateReceived
                | LifecycleStatus::Updating
                | LifecycleStatus::Updated => DeviceStatus::Updating,
                LifecycleStatus::Running | LifecycleStatus::Alive => DeviceStatus::Online,
            };
            if *status != LifecycleStatus::Offline {
                touch(device, now);
            }
            transition(device, next, &mut changes);
        }

        Event::Health { health, .. } => {
            touch(device, now);
            let next = match health {
                HealthStatus::Online => DeviceStatus::Online,
                HealthStatus::Error => DeviceStatus::Error,
                HealthStatus::NeedsHelp => DeviceStatus::NeedsHelp,
                HealthStatus::Offline => DeviceStatus::Offline,
            };
            transition(device, next, &mut changes);
        }

        Event::TelemetryReading {
            metric: metric_name,
            value,
            ts,
            ..
        } => {
            let ts = ts.unwrap_or(now);
            touch(device, now);
            mark_online(device, &mut changes);
            if push_reading(device, metric_name, *value, ts, &mut changes) {
                update_section_from_metric(device, metric_name, *value, ts, &mut changes);
            }
        }

        Event::DoorState { state, .. } => {
            touch(device, now);
            mark_online(device, &mut changes);
            let changed = device.door.as_ref().map(|d| d.state != *state).unwrap_or(true);
            if changed {
                let before = json_value(&device.door);
                device.door = Some(DoorView {
                    state: *state,
                    open_switch: device.door.as_ref().and_then(|d| d.open_switch),
                    closed_switch: device.door.as_ref().and_then(|d| d.closed_switch),
                    ts: now,
                });
                changes.push(StateChange::new(
                    device_id,
                    ChangeKind::Door,
                    before,
                    json_value(&device.door),
                ));
            }
        }

        Event::LightState { state, .. } => {
            touch(device, now);
            mark_online(device, &mut changes);
            let changed = device.light.as_ref().map(|l| l.state != *state).unwrap_or(true);
            if changed {
                let before = json_value(&device.light);
                device.light = Some(LightView { state: *state, ts: now });
                changes.push(StateChange::new(
                    device_id,
                    ChangeKind::Light,
                    before,
                    json_value(&device.light),
                ));
            }
        }

        Event::PowerState { city, .. } => {
            touch(device, now);
            mark_online(device, &mut changes);
            set_power(device, *city, now, &mut changes);
        }

        Event::PowerHeartbeat { .. } => {
            touch(device, now);
            mark_online(device, &mut changes);
        }

        Event::FreezerDoor { state, .. } => {
            touch(device, now);
            mark_online(device, &mut changes);
            let changed = device
                .freezer
                .as_ref()
                .map(|f| f.door != Some(*state))
                .unwrap_or(true);
            if changed {
                let before = json_value(&device.freezer);
                let view = device.freezer.get_or_insert_with(|| FreezerView {
                    temperature_f: None,
                    prev_temperature_f: None,
                    door: None,
                    door_ajar_s: 0,
                    ts: now,
                });
                view.door = Some(*state);
                view.ts = now;
                changes.push(StateChange::new(
                    device_id,
                    ChangeKind::Freezer,
                    before,
                    json_value(&device.freezer),
                ));
            }
        }

        Event::Sos { report, .. } => {
            touch(device, now);
            transition(device, DeviceStatus::NeedsHelp, &mut changes);
            device.last_error_code = Some(report.error.clone());
            device.clean_status_streak = 0;
            changes.push(StateChange::new(
                device_id,
                ChangeKind::Sos,
                Value::Null,
                json_value(&SosChange {
                    code: report.error.clone(),
                    message: report.message.clone().unwrap_or_else(|| report.error.clone()),
                    ts: report.timestamp,
                }),
            ));
        }

        Event::Boot { payload, .. } => {
            touch(device, now);
            mark_online(device, &mut changes);
            if device.last_boot != Some(payload.ts) {
                device.last_boot = Some(device.last_boot.map_or(payload.ts, |b| b.max(payload.ts)));
                changes.push(StateChange::new(
                    device_id,
                    ChangeKind::Boot,
                    Value::Null,
                    json_value(&BootChange {
                        ts: payload.ts,
                        reason: payload.reason.clone(),
                        success: payload.success,
                    }),
                ));
            }
        }

        Event::Version { version, .. } => {
            touch(device, now);
            mark_online(device, &mut changes);
            if device.version.as_deref() != Some(version) {
                let before = json!({ "version": device.version });
                device.version = Some(version.clone());
                changes.push(StateChange::new(
                    device_id,
                    ChangeKind::Version,
                    before,
                    json_value(&row_change(device)),
                ));
            }
        }

        Event::ConsolidatedStatus { status, .. } => {
            apply_consolidated(device, status, now, &mut changes);
        }

        Event::Command(_) => {}
    }

    changes
}

fn set_power(device: &mut DeviceState, city: CityPower, ts: i64, changes: &mut Vec<StateChange>) {
    let changed = device.power.as_ref().map(|p| p.city != city).unwrap_or(true);
    let newer = device.power.as_ref().map(|p| ts >= p.ts).unwrap_or(true);
    if !newer {
        return;
    }
    let before = json_value(&device.power);
    device.power = Some(PowerView { city, ts });
    if changed {
        changes.push(StateChange::new(
            &device.device_id,
            ChangeKind::Power,
            before,
            json_value(&device.power),
        ));
    }
}

/// Keep the derived door/freezer/weather views in sync with samples that
/// arrive on the single-purpose telemetry topics.
fn update_section_from_metric(
    device: &mut DeviceState,
    metric_name: &str,
    value: f64,
    ts: i64,
    changes: &mut Vec<StateChange>,
) {
    match metric_name {
        metric::FREEZER_TEMP_F => {
            let newer = device.freezer.as_ref().map(|f| ts > f.ts).unwrap_or(true);
            if !newer {
                return;
            }
            let before = json_value(&device.freezer);
            let prev = device.freezer.as_ref().and_then(|f| f.temperature_f);
            let visible = prev != Some(value);
            let view = device.freezer.get_or_insert_with(|| FreezerView {
                temperature_f: None,
                prev_temperature_f: None,
                door: None,
                door_ajar_s: 0,
                ts,
            });
            view.prev_temperature_f = prev;
            view.temperature_f = Some(value);
            view.ts = ts;
            if visible {
                changes.push(StateChange::new(
                    &device.device_id,
                    ChangeKind::Freezer,
                    before,
                    json_value(&device.freezer),
                ));
            }
        }
        metric::FREEZER_DOOR_AJAR_S => {
            let before = json_value(&device.freezer);
            let ajar = value as i64;
            let visible = device
                .freezer
                .as_ref()
                .map(|f| f.door_ajar_s != ajar)
                .unwrap_or(true);
            let view = device.freezer.get_or_insert_with(|| FreezerView {
                temperature_f: None,
                prev_temperature_f: None,
                door: None,
                door_ajar_s: 0,
                ts,
            });
            view.door_ajar_s = ajar;
            view.ts = view.ts.max(ts);
            if visible {
                changes.push(StateChange::new(
                    &device.device_id,
                    ChangeKind::Freezer,
                    before,
                    json_value(&device.freezer),
                ));
            }
        }
        metric::WEATHER_TEMP_F | metric::WEATHER_PRESSURE_INHG | metric::WEATHER_BMP388_TEMP_F => {
            let before = json_value(&device.weather);
            let view = device.weather.get_or_insert_with(|| WeatherView {
                temperature_f: None,
                pressure_inhg: None,
                bmp388_temperature_f: None,
                ts,
            });
            let slot = match metric_name {
                metric::WEATHER_TEMP_F => &mut view.temperature_f,
                metric::WEATHER_PRESSURE_INHG => &mut view.pressure_inhg,
                _ => &mut view.bmp388_temperature_f,
            };
            let visible = *slot != Some(value);
            *slot = Some(value);
            view.ts = view.ts.max(ts);
            if visible {
                changes.push(StateChange::new(
                    &device.device_id,
                    ChangeKind::Weather,
                    before,
                    json_value(&device.weather),
                ));
            }
        }
        _ => {}
    }
}

fn apply_consolidated(
    device: &mut DeviceState,
    status: &ConsolidatedStatus,
    now: i64,
    changes: &mut Vec<StateChange>,
) {
    let ts = status.timestamp;
    touch(device, now);
    mark_online(device, changes);

    if let Some(uptime) = status.uptime_s {
        device.uptime_s = Some(uptime);
    }
    if let Some(memory) = &status.memory {
        device.memory = Some(MemoryInfo {
            free: memory.free,
            allocated: memory.allocated,
        });
    }
    if let Some(ip) = &status.ip {
        device.ip_address = Some(ip.clone());
    }
    if let Some(rssi) = status.rssi {
        device.rssi = Some(rssi);
    }

    if let Some(power) = &status.power {
        set_power(device, power.city, ts, changes);
    }

    if let Some(freezer) = &status.freezer {
        let newer = device.freezer.as_ref().map(|f| ts > f.ts).unwrap_or(true);
        if newer {
            let before = json_value(&device.freezer);
            let prev = device.freezer.as_ref().and_then(|f| f.temperature_f);
            let visible = device
                .freezer
                .as_ref()
                .map(|f| {
                    f.temperature_f != freezer.temperature_f
                        || f.door != freezer.door
                        || f.door_ajar_s != freezer.door_ajar_s
                })
                .unwrap_or(true);
            device.freezer = Some(FreezerView {
                temperature_f: freezer.temperature_f,
                prev_temperature_f: prev,
                door: freezer.door,
                door_ajar_s: freezer.door_ajar_s,
                ts,
            });
            if visible {
                changes.push(StateChange::new(
                    &device.device_id,
                    ChangeKind::Freezer,
                    before,
                    json_value(&device.freezer),
                ));
            }
            if let Some(temp) = freezer.temperature_f {
                push_reading(device, metric::FREEZER_TEMP_F, temp, ts, changes);
            }
            push_reading(
                device,
                metric::FREEZER_DOOR_AJAR_S,
                freezer.door_ajar_s as f64,
                ts,
                changes,
            );
        }
    }

    if let Some(weather) = &status.weather {
        let newer = device.weather.as_ref().map(|w| ts > w.ts).unwrap_or(true);
        if newer {
            let before = json_value(&device.weather);
            let visible = device
                .weather
                .as_ref()
                .map(|w| {
                    w.temperature_f != weather.temperature_f
                        || w.pressure_inhg != weather.pressure_inhg
                        || w.bmp388_temperature_f != weather.bmp388_temperature_f
                })
                .unwrap_or(true);
            device.weather = Some(WeatherView {
                temperature_f: weather.temperature_f,
                pressure_inhg: weather.pressure_inhg,
                bmp388_temperature_f: weather.bmp388_temperature_f,
                ts,
            });
            if visible {
                changes.push(StateChange::new(
                    &device.device_id,
                    ChangeKind::Weather,
                    before,
                    json_value(&device.weather),
                ));
            }
            if let Some(temp) = weather.temperature_f {
                push_reading(device, metric::WEATHER_TEMP_F, temp, ts, changes);
            }
            if let Some(pressure) = weather.pressure_inhg {
                push_reading(device, metric::WEATHER_PRESSURE_INHG, pressure, ts, changes);
            }
            if let Some(temp) = weather.bmp388_temperature_f {
                push_reading(device, metric::WEATHER_BMP388_TEMP_F, temp, ts, changes);
            }
        }
    }

    if let Some(door) = &status.door {
        let newer = device.door.as_ref().map(|d| ts > d.ts).unwrap_or(true);
        if newer {
            let visible = device
                .door
                .as_ref()
                .map(|d| {
                    d.state != door.state
                        || d.open_switch != door.open_switch
                        || d.closed_switch != door.closed_switch
                })
                .unwrap_or(true);
            let before = json_value(&device.door);
            device.door = Some(DoorView {
                state: door.state,
                open_switch: door.open_switch,
                closed_switch: door.closed_switch,
                ts,
            });
            if visible {
                changes.push(StateChange::new(
                    &device.device_id,
                    ChangeKind::Door,
                    before,
                    json_value(&device.door),
                ));
            }
        }
    }

    if let Some(light) = &status.light {
        let newer = device.light.as_ref().map(|l| ts > l.ts).unwrap_or(true);
        if newer {
            let visible = device.light.as_ref().map(|l| l.state != light.state).unwrap_or(true);
            let before = json_value(&device.light);
            device.light = Some(LightView {
                state: light.state,
                ts,
            });
            if visible {
                changes.push(StateChange::new(
                    &device.device_id,
                    ChangeKind::Light,
                    before,
                    json_value(&device.light),
                ));
            }
        }
    }

    if status.errors.is_empty() {
        let before = device.clean_status_streak;
        device.clean_status_streak = before.saturating_add(1).min(2);
        if before == 1 {
            changes.push(StateChange::new(
                &device.device_id,
                ChangeKind::IncidentsCleared,
                Value::Null,
                json!({ "note": "device reported two consecutive clean statuses" }),
            ));
        }
    } else {
        device.clean_status_streak = 0;
        for entry in &status.errors {
            device.last_error_code = Some(entry.code.clone());
            changes.push(StateChange::new(
                &device.device_id,
                ChangeKind::Sos,
                Value::Null,
                json_value(&SosChange {
                    code: entry.code.clone(),
                    message: entry.message.clone(),
                    ts: if entry.since > 0 { entry.since } else { ts },
                }),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hh_codec::event::{
        ConsolidatedStatus, DeviceHealth, ErrorEntry, FreezerSection, WeatherSection,
    };
    use hh_common::model::FreezerDoor;

    const T0: i64 = 1_700_000_000_000;

    fn consolidated(ts: i64) -> ConsolidatedStatus {
        ConsolidatedStatus {
            timestamp: ts,
            uptime_s: Some(60),
            health: DeviceHealth::Online,
            power: None,
            freezer: None,
            weather: None,
            door: None,
            light: None,
            errors: Vec::new(),
            memory: None,
            ip: None,
            rssi: None,
        }
    }

    fn apply_one(devices: &mut HashMap<String, DeviceState>, status: ConsolidatedStatus) -> Vec<StateChange> {
        apply_event(
            devices,
            &Event::ConsolidatedStatus {
                device_id: "house-monitor".to_string(),
                status,
            },
            T0 + 1_000,
        )
    }

    #[test]
    fn consolidated_freezer_shifts_previous_temperature() {
        let mut devices = HashMap::new();

        let mut first = consolidated(T0);
        first.freezer = Some(FreezerSection {
            temperature_f: Some(12.0),
            door: Some(FreezerDoor::Closed),
            door_ajar_s: 0,
        });
        apply_one(&mut devices, first);

        let mut second = consolidated(T0 + 30_000);
        second.freezer = Some(FreezerSection {
            temperature_f: Some(12.5),
            door: Some(FreezerDoor::Closed),
            door_ajar_s: 0,
        });
        apply_one(&mut devices, second);

        let freezer = devices["house-monitor"].freezer.clone().unwrap();
        assert_eq!(freezer.temperature_f, Some(12.5));
        assert_eq!(freezer.prev_temperature_f, Some(12.0));
    }

    #[test]
    fn stale_consolidated_section_is_ignored() {
        let mut devices = HashMap::new();

        let mut newer = consolidated(T0 + 30_000);
        newer.weather = Some(WeatherSection {
            temperature_f: Some(70.0),
            pressure_inhg: Some(29.9),
            bmp388_temperature_f: None,
        });
        apply_one(&mut devices, newer);

        let mut stale = consolidated(T0);
        stale.weather = Some(WeatherSection {
            temperature_f: Some(55.0),
            pressure_inhg: Some(29.1),
            bmp388_temperature_f: None,
        });
        let changes = apply_one(&mut devices, stale);

        assert!(!changes.iter().any(|c| c.kind == ChangeKind::Weather));
        let weather = devices["house-monitor"].weather.clone().unwrap();
        assert_eq!(weather.temperature_f, Some(70.0));
    }

    #[test]
    fn two_clean_statuses_emit_incidents_cleared_once() {
        let mut devices = HashMap::new();

        let mut degraded = consolidated(T0);
        degraded.health = DeviceHealth::Degraded;
        degraded.errors = vec![ErrorEntry {
            code: "ds18b20_read_error".to_string(),
            message: "CRC mismatch".to_string(),
            since: T0,
            extra: serde_json::Map::new(),
        }];
        let changes = apply_one(&mut devices, degraded);
        assert!(changes.iter().any(|c| c.kind == ChangeKind::Sos));

        let changes = apply_one(&mut devices, consolidated(T0 + 30_000));
        assert!(!changes.iter().any(|c| c.kind == ChangeKind::IncidentsCleared));

        let changes = apply_one(&mut devices, consolidated(T0 + 60_000));
        assert!(changes.iter().any(|c| c.kind == ChangeKind::IncidentsCleared));

        // A third clean status does not re-emit.
        let changes = apply_one(&mut devices, consolidated(T0 + 90_000));
        assert!(!changes.iter().any(|c| c.kind == ChangeKind::IncidentsCleared));
    }

    #[test]
    fn consolidated_status_does_not_end_an_update() {
        let mut devices = HashMap::new();
        apply_event(
            &mut devices,
            &Event::StatusUpdate {
                device_id: "house-monitor".to_string(),
                status: LifecycleStatus::UpdateReceived,
            },
            T0,
        );

        apply_one(&mut devices, consolidated(T0 + 1_000));
        assert_eq!(devices["house-monitor"].status, DeviceStatus::Updating);

        apply_event(
            &mut devices,
            &Event::Health {
                device_id: "house-monitor".to_string(),
                health: HealthStatus::Online,
            },
            T0 + 2_000,
        );
        assert_eq!(devices["house-monitor"].status, DeviceStatus::Online);
    }

    #[test]
    fn consolidated_numeric_fields_become_readings() {
        let mut devices = HashMap::new();

        let mut status = consolidated(T0);
        status.weather = Some(WeatherSection {
            temperature_f: Some(70.0),
            pressure_inhg: Some(29.9),
            bmp388_temperature_f: Some(70.8),
        });
        let changes = apply_one(&mut devices, status);

        let readings: Vec<_> = changes
            .iter()
            .filter(|c| c.kind == ChangeKind::Reading)
            .collect();
        assert_eq!(readings.len(), 3);
    }
}
