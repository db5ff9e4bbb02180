use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Well-known metric names for `sensor_readings`.
pub mod metric {
    pub const WEATHER_TEMP_F: &str = "weather_temperature_f";
    pub const WEATHER_PRESSURE_INHG: &str = "weather_pressure_inhg";
    pub const WEATHER_BMP388_TEMP_F: &str = "weather_bmp388_temperature_f";
    pub const FREEZER_TEMP_F: &str = "freezer_temperature_f";
    pub const FREEZER_TEMP_MAIN: &str = "freezer_temperature_main";
    pub const FREEZER_TEMP_BACKUP: &str = "freezer_temperature_backup";
    pub const FREEZER_DOOR_AJAR_S: &str = "freezer_door_ajar_s";
}

/// Lifecycle status of a device as seen by clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Initial state, never published to clients.
    #[default]
    Unknown,
    Online,
    Offline,
    NeedsHelp,
    Updating,
    Error,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
            Self::NeedsHelp => write!(f, "needs_help"),
            Self::Updating => write!(f, "updating"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Position reported by the garage door controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorPosition {
    Open,
    Closed,
    Opening,
    Closing,
    Error,
}

impl DoorPosition {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            "opening" => Some(Self::Opening),
            "closing" => Some(Self::Closing),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Closing => "closing",
            Self::Error => "error",
        }
    }
}

/// On/off state of the garage light.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightSwitch {
    On,
    Off,
}

impl LightSwitch {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

/// City power feed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CityPower {
    Online,
    Offline,
}

/// Freezer door leaf position (no opening/closing states).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreezerDoor {
    Open,
    Closed,
}

/// One timestamped numeric sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub value: f64,
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoorView {
    pub state: DoorPosition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_switch: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_switch: Option<bool>,
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightView {
    pub state: LightSwitch,
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerView {
    pub city: CityPower,
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreezerView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_f: Option<f64>,
    /// Previous temperature sample, kept so the critical-temperature alert
    /// can require two consecutive high readings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_temperature_f: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub door: Option<FreezerDoor>,
    pub door_ajar_s: i64,
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_f: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure_inhg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bmp388_temperature_f: Option<f64>,
    pub ts: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub free: i64,
    pub allocated: i64,
}

/// Authoritative in-memory view of one device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: String,
    pub status: DeviceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_boot: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_s: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryInfo>,
    /// Whether the device has ever been observed online; the silent-device
    /// alert only fires for devices that were.
    #[serde(default)]
    pub was_online: bool,
    /// Consecutive consolidated-status messages with an empty errors array.
    /// Two in a row resolve the device's open incidents.
    #[serde(skip)]
    pub clean_status_streak: u8,
    /// Last sample per metric.
    #[serde(default)]
    pub metrics: HashMap<String, MetricSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub door: Option<DoorView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub light: Option<LightView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<PowerView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freezer: Option<FreezerView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weather: Option<WeatherView>,
}

impl DeviceState {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            ..Default::default()
        }
    }
}

/// A device-originated problem report, persisted until resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: i64,
    pub device_id: String,
    pub code: String,
    pub message: String,
    pub first_seen: i64,
    pub last_seen: i64,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_note: Option<String>,
}

/// Append-only record of a device boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootEvent {
    pub device_id: String,
    pub ts: i64,
    pub reason: String,
    pub success: bool,
}

/// Derived, non-persistent alert entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveAlert {
    pub device_id: String,
    pub code: String,
    pub message: String,
    pub last_seen: i64,
}

/// One file entry in an OTA manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub url: String,
    pub path: String,
}

/// Update descriptor published to a device's update topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaManifest {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub files: Vec<ManifestFile>,
}
