use serde::{Deserialize, Serialize};

use hh_common::model::OtaManifest;

/// Garage door actuation command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorCommand {
    Open,
    Close,
    Toggle,
}

impl DoorCommand {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "close" => Some(Self::Close),
            "toggle" => Some(Self::Toggle),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Toggle => "toggle",
        }
    }
}

/// Garage light actuation command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightCommand {
    On,
    Off,
    Toggle,
}

impl LightCommand {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            "toggle" => Some(Self::Toggle),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Toggle => "toggle",
        }
    }
}

/// A logical server-to-device command, encoded by the registry into a
/// `(topic, payload)` pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Door(DoorCommand),
    Light(LightCommand),
    Reboot { device_id: String },
    Ping { device_id: String },
    Update { device_id: String, manifest: OtaManifest },
}
