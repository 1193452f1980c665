//! Protocol module - DFU class and STM32 bootloader definitions.

pub mod command;
pub mod constants;
pub mod status;

pub use command::Command;
pub use constants::*;
pub use status::{DeviceState, DeviceStatus, StatusCode, decode_status};
