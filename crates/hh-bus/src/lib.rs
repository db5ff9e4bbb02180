mod adapter;
mod dispatch;

pub use adapter::{BusHandle, BusStats, OutboundQueue, run_bus};
pub use dispatch::{CommandDispatcher, DispatchError};
