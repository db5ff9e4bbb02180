pub mod command;
pub mod event;
pub mod registry;
pub mod topic;

pub use command::{Command, DoorCommand, LightCommand};
pub use event::Event;
pub use registry::{CodecRegistry, DecodeError};
pub use topic::TopicPattern;
