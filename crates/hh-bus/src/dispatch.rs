use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use hh_codec::{Command, DoorCommand, LightCommand};
use hh_state::StateStore;
use hh_store::TimeSeriesStore;

use crate::adapter::BusHandle;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("bus unavailable and outbound buffer full")]
    BusUnavailable,
}

/// Translates client intents into bus publishes.
///
/// Each operation returns as soon as the publish is accepted by the
/// adapter's outbound queue; device acknowledgment arrives later through
/// normal status topics.
pub struct CommandDispatcher {
    bus: BusHandle,
    state: Arc<StateStore>,
    store: Arc<TimeSeriesStore>,
}

impl CommandDispatcher {
    pub fn new(bus: BusHandle, state: Arc<StateStore>, store: Arc<TimeSeriesStore>) -> Self {
        Self { bus, state, store }
    }

    pub fn door(&self, command: DoorCommand) -> Result<(), DispatchError> {
        info!("Dispatching door command: {}", command.as_str());
        self.publish(Command::Door(command))
    }

    pub fn light(&self, command: LightCommand) -> Result<(), DispatchError> {
        info!("Dispatching light command: {}", command.as_str());
        self.publish(Command::Light(command))
    }

    pub fn light_toggle(&self) -> Result<(), DispatchError> {
        self.light(LightCommand::Toggle)
    }

    pub async fn reboot(&self, device_id: &str) -> Result<(), DispatchError> {
        if !self.device_known(device_id).await {
            return Err(DispatchError::UnknownDevice(device_id.to_string()));
        }
        info!("Dispatching reboot to {}", device_id);
        self.publish(Command::Reboot {
            device_id: device_id.to_string(),
        })
    }

    /// Known either from live state or, across restarts, from the
    /// persisted device table.
    pub async fn device_known(&self, device_id: &str) -> bool {
        if self.state.contains_device(device_id).await {
            return true;
        }
        self.store.device_exists(device_id).unwrap_or(false)
    }

    fn publish(&self, command: Command) -> Result<(), DispatchError> {
        self.bus
            .publish_command(&command)
            .map_err(|_| DispatchError::BusUnavailable)
    }
}
