//! Engine and programmer errors.

use thiserror::Error;

use crate::protocol::status::{DeviceState, StatusCode};
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum DfuError {
    /// The control transfer itself failed. Never retried.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The device reported an unexpected state after a command.
    #[error("{operation} failed: device in {state} ({status})")]
    ProtocolState {
        operation: &'static str,
        state: DeviceState,
        status: StatusCode,
    },

    /// A wait-for-idle loop ran out of time.
    #[error("Timeout after {waited_ms}ms waiting for {operation} (last state {last_state})")]
    Timeout {
        operation: &'static str,
        waited_ms: u64,
        last_state: DeviceState,
    },

    /// Read-back after write differs. `block` is image-relative.
    #[error("Error verifying block {block}")]
    Verification { block: usize },

    /// Block index does not fit in a 16-bit wire block number.
    #[error("Block {block} is beyond the addressable wire block range")]
    BlockOutOfRange { block: usize },

    /// The firmware stream could not be read.
    #[error("Firmware image read failed: {0}")]
    Image(#[from] std::io::Error),
}

impl DfuError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DfuError::Timeout { .. })
    }
}

pub type DfuResult<T> = Result<T, DfuError>;
