use thiserror::Error;

use hh_common::model::{DoorPosition, FreezerDoor, LightSwitch, OtaManifest, metric};

use crate::command::{Command, DoorCommand, LightCommand};
use crate::event::{
    BootPayload, ConsolidatedStatus, Event, HealthStatus, LifecycleStatus, SosReport,
};
use crate::topic::TopicPattern;

/// Device that owns the `home/garage/...` topics.
pub const GARAGE_DEVICE: &str = "garage-controller";
/// Device that owns the `home/power/...` and `home/freezer/...` topics.
pub const HOUSE_DEVICE: &str = "house-monitor";

/// Topic filters the bus adapter subscribes to.
pub const SUBSCRIPTIONS: &[&str] = &[
    "home/+/status",
    "home/garage/door/status",
    "home/garage/light/status",
    "home/garage/weather/temperature",
    "home/garage/weather/pressure",
    "home/garage/freezer/temperature",
    "home/power/city/status",
    "home/power/city/heartbeat",
    "home/freezer/temperature/+",
    "home/freezer/door/status",
    "home/freezer/door/ajar_time",
    "home/system/+/status",
    "home/system/+/sos",
    "home/system/+/health",
    "home/system/+/version",
    "home/system/+/boot",
];

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unknown topic in home hierarchy: {0}")]
    UnknownTopic(String),
    #[error("payload on {topic} is not valid UTF-8")]
    NotUtf8 { topic: String },
    #[error("bad payload on {topic}: {reason}")]
    BadPayload { topic: String, reason: String },
    #[error("bad JSON on {topic}: {source}")]
    Json {
        topic: String,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteKind {
    Consolidated,
    GarageDoorStatus,
    GarageDoorCommand,
    GarageLightStatus,
    GarageLightCommand,
    GarageWeatherTemperature,
    GarageWeatherPressure,
    GarageFreezerTemperature,
    PowerStatus,
    PowerHeartbeat,
    FreezerProbeTemperature,
    FreezerDoorStatus,
    FreezerDoorAjar,
    SystemStatus,
    SystemSos,
    SystemHealth,
    SystemVersion,
    SystemBoot,
    SystemUpdate,
    SystemReboot,
    SystemPing,
}

struct Route {
    pattern: TopicPattern,
    kind: RouteKind,
}

/// Maps topics to typed events and logical commands to publishable
/// `(topic, payload)` pairs. Decoders are pure and never block.
pub struct CodecRegistry {
    /// Sorted most-specific-first; ties keep registration order.
    routes: Vec<Route>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecRegistry {
    pub fn new() -> Self {
        use RouteKind::*;
        let table: &[(&str, RouteKind)] = &[
            ("home/garage/door/status", GarageDoorStatus),
            ("home/garage/door/command", GarageDoorCommand),
            ("home/garage/light/status", GarageLightStatus),
            ("home/garage/light/command", GarageLightCommand),
            ("home/garage/weather/temperature", GarageWeatherTemperature),
            ("home/garage/weather/pressure", GarageWeatherPressure),
            ("home/garage/freezer/temperature", GarageFreezerTemperature),
            ("home/power/city/status", PowerStatus),
            ("home/power/city/heartbeat", PowerHeartbeat),
            ("home/freezer/temperature/+", FreezerProbeTemperature),
            ("home/freezer/door/status", FreezerDoorStatus),
            ("home/freezer/door/ajar_time", FreezerDoorAjar),
            ("home/system/+/status", SystemStatus),
            ("home/system/+/sos", SystemSos),
            ("home/system/+/health", SystemHealth),
            ("home/system/+/version", SystemVersion),
            ("home/system/+/boot", SystemBoot),
            ("home/system/+/update", SystemUpdate),
            ("home/system/+/reboot", SystemReboot),
            ("home/system/+/ping", SystemPing),
            ("home/+/status", Consolidated),
        ];

        let mut routes: Vec<Route> = table
            .iter()
            .map(|(pattern, kind)| Route {
                pattern: TopicPattern::parse(pattern),
                kind: *kind,
            })
            .collect();
        // Stable sort keeps registration order within a specificity tier.
        routes.sort_by_key(|r| std::cmp::Reverse(r.pattern.specificity()));

        Self { routes }
    }

    /// Decode one bus message. `Ok(None)` means the topic is outside the
    /// `home/` hierarchy and is not ours to interpret.
    pub fn decode(&self, topic: &str, payload: &[u8]) -> Result<Option<Event>, DecodeError> {
        if !topic.starts_with("home/") {
            return Ok(None);
        }

        let route = self
            .routes
            .iter()
            .find(|r| r.pattern.matches(topic))
            .ok_or_else(|| DecodeError::UnknownTopic(topic.to_string()))?;

        let event = match route.kind {
            RouteKind::Consolidated => {
                let device_id = route
                    .pattern
                    .wildcard_segment(topic)
                    .unwrap_or_default()
                    .to_string();
                let status: ConsolidatedStatus = parse_json(topic, payload)?;
                Event::ConsolidatedStatus { device_id, status }
            }
            RouteKind::GarageDoorStatus => {
                let state = DoorPosition::parse(token(topic, payload)?).ok_or_else(|| {
                    bad_payload(topic, "expected open|closed|opening|closing|error")
                })?;
                Event::DoorState {
                    device_id: GARAGE_DEVICE.to_string(),
                    state,
                }
            }
            RouteKind::GarageLightStatus => {
                let state = LightSwitch::parse(token(topic, payload)?)
                    .ok_or_else(|| bad_payload(topic, "expected on|off"))?;
                Event::LightState {
                    device_id: GARAGE_DEVICE.to_string(),
                    state,
                }
            }
            RouteKind::GarageWeatherTemperature => {
                reading(GARAGE_DEVICE, metric::WEATHER_TEMP_F, topic, payload)?
            }
            RouteKind::GarageWeatherPressure => {
                reading(GARAGE_DEVICE, metric::WEATHER_PRESSURE_INHG, topic, payload)?
            }
            RouteKind::GarageFreezerTemperature => {
                reading(GARAGE_DEVICE, metric::FREEZER_TEMP_F, topic, payload)?
            }
            RouteKind::PowerStatus => {
                let city = match token(topic, payload)? {
                    "online" => hh_common::model::CityPower::Online,
                    "offline" => hh_common::model::CityPower::Offline,
                    _ => return Err(bad_payload(topic, "expected online|offline")),
                };
                Event::PowerState {
                    device_id: HOUSE_DEVICE.to_string(),
                    city,
                }
            }
            RouteKind::PowerHeartbeat => {
                let ts: i64 = token(topic, payload)?
                    .parse()
                    .map_err(|_| bad_payload(topic, "expected integer timestamp ms"))?;
                Event::PowerHeartbeat {
                    device_id: HOUSE_DEVICE.to_string(),
                    ts,
                }
            }
            RouteKind::FreezerProbeTemperature => {
                let probe = route
                    .pattern
                    .wildcard_segment(topic)
                    .ok_or_else(|| bad_payload(topic, "missing probe segment"))?;
                let metric = format!("freezer_temperature_{probe}");
                reading(HOUSE_DEVICE, &metric, topic, payload)?
            }
            RouteKind::FreezerDoorStatus => {
                let state = match token(topic, payload)? {
                    "open" => FreezerDoor::Open,
                    "closed" => FreezerDoor::Closed,
                    _ => return Err(bad_payload(topic, "expected open|closed")),
                };
                Event::FreezerDoor {
                    device_id: HOUSE_DEVICE.to_string(),
                    state,
                }
            }
            RouteKind::FreezerDoorAjar => {
                reading(HOUSE_DEVICE, metric::FREEZER_DOOR_AJAR_S, topic, payload)?
            }
            RouteKind::SystemStatus => {
                let device_id = device_from(route, topic)?;
                let status = LifecycleStatus::parse(token(topic, payload)?)
                    .ok_or_else(|| bad_payload(topic, "unknown lifecycle token"))?;
                Event::StatusUpdate { device_id, status }
            }
            RouteKind::SystemSos => {
                let device_id = device_from(route, topic)?;
                let report: SosReport = parse_json(topic, payload)?;
                Event::Sos { device_id, report }
            }
            RouteKind::SystemHealth => {
                let device_id = device_from(route, topic)?;
                let health = HealthStatus::parse(token(topic, payload)?)
                    .ok_or_else(|| bad_payload(topic, "unknown health token"))?;
                Event::Health { device_id, health }
            }
            RouteKind::SystemVersion => {
                let device_id = device_from(route, topic)?;
                Event::Version {
                    device_id,
                    version: token(topic, payload)?.to_string(),
                }
            }
            RouteKind::SystemBoot => {
                let device_id = device_from(route, topic)?;
                let payload: BootPayload = parse_json(topic, payload)?;
                Event::Boot { device_id, payload }
            }
            RouteKind::SystemUpdate => {
                let device_id = device_from(route, topic)?;
                let manifest: OtaManifest = parse_json(topic, payload)?;
                Event::Command(Command::Update {
                    device_id,
                    manifest,
                })
            }
            RouteKind::SystemReboot => {
                Event::Command(Command::Reboot {
                    device_id: device_from(route, topic)?,
                })
            }
            RouteKind::SystemPing => {
                Event::Command(Command::Ping {
                    device_id: device_from(route, topic)?,
                })
            }
            RouteKind::GarageDoorCommand => {
                let command = DoorCommand::parse(token(topic, payload)?)
                    .ok_or_else(|| bad_payload(topic, "expected open|close|toggle"))?;
                Event::Command(Command::Door(command))
            }
            RouteKind::GarageLightCommand => {
                let command = LightCommand::parse(token(topic, payload)?)
                    .ok_or_else(|| bad_payload(topic, "expected on|off|toggle"))?;
                Event::Command(Command::Light(command))
            }
        };

        Ok(Some(event))
    }

    /// Encode a logical command into its publishable `(topic, payload)`.
    pub fn encode_command(&self, command: &Command) -> (String, Vec<u8>) {
        match command {
            Command::Door(c) => (
                "home/garage/door/command".to_string(),
                c.as_str().as_bytes().to_vec(),
            ),
            Command::Light(c) => (
                "home/garage/light/command".to_string(),
                c.as_str().as_bytes().to_vec(),
            ),
            Command::Reboot { device_id } => {
                (format!("home/system/{device_id}/reboot"), b"{}".to_vec())
            }
            Command::Ping { device_id } => {
                (format!("home/system/{device_id}/ping"), b"{}".to_vec())
            }
            Command::Update {
                device_id,
                manifest,
            } => {
                let payload = serde_json::to_vec(manifest)
                    .expect("OTA manifest is always JSON-serializable");
                (format!("home/system/{device_id}/update"), payload)
            }
        }
    }
}

fn device_from(route: &Route, topic: &str) -> Result<String, DecodeError> {
    route
        .pattern
        .wildcard_segment(topic)
        .map(str::to_string)
        .ok_or_else(|| bad_payload(topic, "missing device segment"))
}

fn token<'a>(topic: &str, payload: &'a [u8]) -> Result<&'a str, DecodeError> {
    std::str::from_utf8(payload)
        .map(str::trim)
        .map_err(|_| DecodeError::NotUtf8 {
            topic: topic.to_string(),
        })
}

fn bad_payload(topic: &str, reason: &str) -> DecodeError {
    DecodeError::BadPayload {
        topic: topic.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(
    topic: &str,
    payload: &[u8],
) -> Result<T, DecodeError> {
    serde_json::from_slice(payload).map_err(|source| DecodeError::Json {
        topic: topic.to_string(),
        source,
    })
}

fn reading(device_id: &str, metric: &str, topic: &str, payload: &[u8]) -> Result<Event, DecodeError> {
    let value: f64 = token(topic, payload)?
        .parse()
        .map_err(|_| bad_payload(topic, "expected decimal value"))?;
    Ok(Event::TelemetryReading {
        device_id: device_id.to_string(),
        metric: metric.to_string(),
        value,
        ts: None,
    })
}
