use serde::{Deserialize, Serialize};
use serde_json::Value;

use hh_common::model::{CityPower, DoorPosition, FreezerDoor, LightSwitch};

use crate::command::Command;

/// Lifecycle token published on `home/system/<id>/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Running,
    UpdateReceived,
    Updating,
    Updated,
    Alive,
    /// Last-will message the broker publishes when the device session dies.
    Offline,
}

impl LifecycleStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "update_received" => Some(Self::UpdateReceived),
            "updating" => Some(Self::Updating),
            "updated" => Some(Self::Updated),
            "alive" => Some(Self::Alive),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// Token published on `home/system/<id>/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Online,
    Error,
    NeedsHelp,
    Offline,
}

impl HealthStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "error" => Some(Self::Error),
            "needs_help" => Some(Self::NeedsHelp),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// Problem report published on `home/system/<id>/sos`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SosReport {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: i64,
    pub device_id: String,
}

/// Boot record published on `home/system/<id>/boot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootPayload {
    pub ts: i64,
    pub reason: String,
    pub success: bool,
}

// ── Consolidated status ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceHealth {
    Online,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerSection {
    pub city: CityPower,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreezerSection {
    #[serde(default)]
    pub temperature_f: Option<f64>,
    #[serde(default)]
    pub door: Option<FreezerDoor>,
    #[serde(default)]
    pub door_ajar_s: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherSection {
    #[serde(default)]
    pub temperature_f: Option<f64>,
    #[serde(default)]
    pub pressure_inhg: Option<f64>,
    #[serde(default)]
    pub bmp388_temperature_f: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoorSection {
    pub state: DoorPosition,
    #[serde(default)]
    pub open_switch: Option<bool>,
    #[serde(default)]
    pub closed_switch: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LightSection {
    pub state: LightSwitch,
}

/// One entry of the consolidated-status `errors` array. Unknown fields
/// are preserved in `extra` rather than dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub since: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySection {
    pub free: i64,
    pub allocated: i64,
}

/// Periodic atomic snapshot a device publishes on `home/<id>/status`.
/// Missing sections signal the device lacks that capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidatedStatus {
    pub timestamp: i64,
    #[serde(default)]
    pub uptime_s: Option<i64>,
    pub health: DeviceHealth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<PowerSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freezer: Option<FreezerSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather: Option<WeatherSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub door: Option<DoorSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light: Option<LightSection>,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemorySection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
}

// ── Event ───────────────────────────────────────────────────────────

/// Typed result of decoding one bus message. Everything downstream of the
/// codec registry consumes these instead of raw payloads.
#[derive(Debug, Clone)]
pub enum Event {
    /// `home/<id>/status` — the periodic consolidated snapshot.
    ConsolidatedStatus {
        device_id: String,
        status: ConsolidatedStatus,
    },
    /// `home/system/<id>/status` — lifecycle token (includes the LWT).
    StatusUpdate {
        device_id: String,
        status: LifecycleStatus,
    },
    /// A single numeric sample from a telemetry topic.
    TelemetryReading {
        device_id: String,
        metric: String,
        value: f64,
        /// Payload-carried timestamp; the ingest clock is used when absent.
        ts: Option<i64>,
    },
    DoorState {
        device_id: String,
        state: DoorPosition,
    },
    LightState {
        device_id: String,
        state: LightSwitch,
    },
    PowerState {
        device_id: String,
        city: CityPower,
    },
    /// `home/power/city/heartbeat` — liveness only, no reading is stored.
    PowerHeartbeat {
        device_id: String,
        ts: i64,
    },
    FreezerDoor {
        device_id: String,
        state: FreezerDoor,
    },
    Sos {
        device_id: String,
        report: SosReport,
    },
    Boot {
        device_id: String,
        payload: BootPayload,
    },
    Version {
        device_id: String,
        version: String,
    },
    Health {
        device_id: String,
        health: HealthStatus,
    },
    /// A decoded server-to-device command topic. Never received in normal
    /// operation (the server does not subscribe to command topics); exists
    /// so encode/decode round-trip.
    Command(Command),
}

impl Event {
    /// Device the event is attributed to, when it has one.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::ConsolidatedStatus { device_id, .. }
            | Self::StatusUpdate { device_id, .. }
            | Self::TelemetryReading { device_id, .. }
            | Self::DoorState { device_id, .. }
            | Self::LightState { device_id, .. }
            | Self::PowerState { device_id, .. }
            | Self::PowerHeartbeat { device_id, .. }
            | Self::FreezerDoor { device_id, .. }
            | Self::Sos { device_id, .. }
            | Self::Boot { device_id, .. }
            | Self::Version { device_id, .. }
            | Self::Health { device_id, .. } => Some(device_id),
            Self::Command(_) => None,
        }
    }
}
