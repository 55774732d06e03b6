pub mod broker;
pub mod button;
pub mod config;
pub mod device;
pub mod flash;
pub mod hal;
pub mod io;
pub mod network;
pub mod serial;
pub mod status;
pub mod supervisor;
pub mod time;
pub mod topics;
pub mod types;
pub mod watchdog;
pub mod web;

#[cfg(test)]
mod testing;

pub use config::{BrokerConfig, DeviceConfig, InputType, NetworkConfig};
pub use device::{Device, LoopStep, RunState, SetupStep, StepError};
pub use hal::{Board, Peripherals, RadioBlobs};
pub use topics::Topics;
pub use types::{BoardType, NetworkMode, FIRMWARE_REVISION};
