//! Pure alert predicates. Given the same snapshot, incidents and clock
//! reading, the same alert set comes back.

use std::collections::HashMap;

use hh_common::model::{ActiveAlert, CityPower, DeviceState, DeviceStatus, Incident};

/// Stable alert code strings.
pub mod codes {
    pub const FREEZER_TEMP_HIGH: &str = "freezer_temp_high";
    pub const FREEZER_DOOR_AJAR: &str = "freezer_door_ajar";
    pub const CITY_POWER_OFFLINE: &str = "city_power_offline";
    pub const DEVICE_DEGRADED: &str = "device_degraded";
    pub const DEVICE_SILENT: &str = "device_silent";
    pub const WEATHER_STUCK: &str = "weather_stuck";
    pub const STORE_FAILURE: &str = "store_failure";
}

/// Device id used for alerts about the server itself.
const SYSTEM_DEVICE: &str = "homehub";

#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub freezer_temp_limit_f: f64,
    pub freezer_ajar_limit_s: i64,
    pub offline_timeout_ms: i64,
    pub weather_stall_ms: i64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            freezer_temp_limit_f: 10.0,
            freezer_ajar_limit_s: 300,
            offline_timeout_ms: 90_000,
            weather_stall_ms: 120_000,
        }
    }
}

/// Produce the active alert set for a snapshot. Deduplicated by
/// `(device_id, code)` and sorted for deterministic output.
pub fn evaluate(
    snapshot: &HashMap<String, DeviceState>,
    open_incidents: &[Incident],
    now_ms: i64,
    config: &AlertConfig,
    store_healthy: bool,
) -> Vec<ActiveAlert> {
    let mut alerts = Vec::new();

    for device in snapshot.values() {
        if let Some(freezer) = &device.freezer {
            // Requires two consecutive high readings; a single spike is not
            // an alert.
            if let (Some(temp), Some(prev)) = (freezer.temperature_f, freezer.prev_temperature_f) {
                if temp > config.freezer_temp_limit_f && prev > config.freezer_temp_limit_f {
                    alerts.push(ActiveAlert {
                        device_id: device.device_id.clone(),
                        code: codes::FREEZER_TEMP_HIGH.to_string(),
                        message: format!(
                            "Freezer temperature {:.1}°F above {:.0}°F limit",
                            temp, config.freezer_temp_limit_f
                        ),
                        last_seen: freezer.ts,
                    });
                }
            }

            if freezer.door_ajar_s > config.freezer_ajar_limit_s {
                alerts.push(ActiveAlert {
                    device_id: device.device_id.clone(),
                    code: codes::FREEZER_DOOR_AJAR.to_string(),
                    message: format!("Freezer door ajar for {}s", freezer.door_ajar_s),
                    last_seen: freezer.ts,
                });
            }
        }

        if let Some(power) = &device.power {
            if power.city == CityPower::Offline {
                alerts.push(ActiveAlert {
                    device_id: device.device_id.clone(),
                    code: codes::CITY_POWER_OFFLINE.to_string(),
                    message: "City power is offline".to_string(),
                    last_seen: power.ts,
                });
            }
        }

        let has_open_incident = open_incidents
            .iter()
            .any(|incident| incident.device_id == device.device_id);
        if device.status == DeviceStatus::NeedsHelp || has_open_incident {
            alerts.push(ActiveAlert {
                device_id: device.device_id.clone(),
                code: codes::DEVICE_DEGRADED.to_string(),
                message: if device.status == DeviceStatus::NeedsHelp {
                    "Device reports needs_help".to_string()
                } else {
                    "Device has open incidents".to_string()
                },
                last_seen: device.last_seen.unwrap_or(now_ms),
            });
        }

        if device.was_online {
            if let Some(last_seen) = device.last_seen {
                if now_ms - last_seen > config.offline_timeout_ms {
                    alerts.push(ActiveAlert {
                        device_id: device.device_id.clone(),
                        code: codes::DEVICE_SILENT.to_string(),
                        message: format!("No messages for {}s", (now_ms - last_seen) / 1000),
                        last_seen,
                    });
                }
            }
        }

        if device.status == DeviceStatus::Online {
            if let Some(weather) = &device.weather {
                if now_ms - weather.ts > config.weather_stall_ms {
                    alerts.push(ActiveAlert {
                        device_id: device.device_id.clone(),
                        code: codes::WEATHER_STUCK.to_string(),
                        message: format!(
                            "No weather readings for {}s",
                            (now_ms - weather.ts) / 1000
                        ),
                        last_seen: weather.ts,
                    });
                }
            }
        }
    }

    // Every open incident surfaces under its own code.
    for incident in open_incidents {
        alerts.push(ActiveAlert {
            device_id: incident.device_id.clone(),
            code: incident.code.clone(),
            message: incident.message.clone(),
            last_seen: incident.last_seen,
        });
    }

    if !store_healthy {
        alerts.push(ActiveAlert {
            device_id: SYSTEM_DEVICE.to_string(),
            code: codes::STORE_FAILURE.to_string(),
            message: "Persistent store writes are failing; history may be incomplete".to_string(),
            last_seen: now_ms,
        });
    }

    alerts.sort_by(|a, b| (&a.device_id, &a.code).cmp(&(&b.device_id, &b.code)));
    alerts.dedup_by(|a, b| a.device_id == b.device_id && a.code == b.code);
    alerts
}
