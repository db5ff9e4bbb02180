use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::DeviceStatus;

/// Coarse category of a state change, used to route the record to
/// persistence and to group fan-out frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Device lifecycle status or identity fields changed.
    Status,
    Door,
    Light,
    Power,
    Freezer,
    Weather,
    /// A new sensor reading was accepted.
    Reading,
    Boot,
    Version,
    /// A problem report was received (opens or refreshes an incident).
    Sos,
    /// Two consecutive clean consolidated statuses; open incidents resolve.
    IncidentsCleared,
    /// The active alert set changed.
    Alerts,
}

/// Record emitted by the state store whenever a device-visible field
/// transitions. Persistence and client fan-out are both subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub device_id: String,
    pub kind: ChangeKind,
    pub before: Value,
    pub after: Value,
}

impl StateChange {
    pub fn new(device_id: &str, kind: ChangeKind, before: Value, after: Value) -> Self {
        Self {
            device_id: device_id.to_string(),
            kind,
            before,
            after,
        }
    }

    /// Logical fan-out group for this change. Section changes map to their
    /// section name, alert-set changes to `alerts`, and everything else to
    /// the originating device id.
    pub fn topic_group(&self) -> &str {
        match self.kind {
            ChangeKind::Door => "door",
            ChangeKind::Light => "light",
            ChangeKind::Weather => "weather",
            ChangeKind::Freezer => "freezer",
            ChangeKind::Alerts => "alerts",
            _ => self.device_id.as_str(),
        }
    }
}

// ── Typed change payloads ───────────────────────────────────────────
//
// The `after` value of a change is one of these shapes, depending on kind.
// The persistence writer deserializes back into them at its boundary.

/// `after` payload of a `Reading` change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingChange {
    pub metric: String,
    pub value: f64,
    pub ts: i64,
}

/// `after` payload of a `Sos` change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SosChange {
    pub code: String,
    pub message: String,
    pub ts: i64,
}

/// `after` payload of a `Boot` change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootChange {
    pub ts: i64,
    pub reason: String,
    pub success: bool,
}

/// `after` payload of `Status` and `Version` changes: the device row as
/// the relational store should see it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRowChange {
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_group_maps_sections_and_devices() {
        let door = StateChange::new("garage-controller", ChangeKind::Door, Value::Null, Value::Null);
        assert_eq!(door.topic_group(), "door");

        let status =
            StateChange::new("house-monitor", ChangeKind::Status, Value::Null, Value::Null);
        assert_eq!(status.topic_group(), "house-monitor");

        let alerts = StateChange::new("", ChangeKind::Alerts, Value::Null, Value::Null);
        assert_eq!(alerts.topic_group(), "alerts");
    }

    #[test]
    fn reading_change_round_trips_through_value() {
        let change = ReadingChange {
            metric: "weather_temperature_f".into(),
            value: 71.5,
            ts: 1_700_000_000_000,
        };
        let value = serde_json::to_value(&change).unwrap();
        let back: ReadingChange = serde_json::from_value(value).unwrap();
        assert_eq!(back.metric, change.metric);
        assert_eq!(back.ts, change.ts);
    }
}
