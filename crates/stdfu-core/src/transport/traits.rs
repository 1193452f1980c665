//! USB Transport layer abstraction.
//!
//! Defines the `DfuTransport` trait for DFU control transfers,
//! allowing different implementations (nusb, mock, etc.).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("{request} control transfer failed: {message}")]
    TransferFailed {
        request: &'static str,
        message: String,
    },

    #[error("Short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Direction of the data stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device.
    Out,
    /// Device to host.
    In,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Out => write!(f, "OUT"),
            Direction::In => write!(f, "IN"),
        }
    }
}

/// Abstract DFU control-transfer interface.
///
/// Every request is a class request addressed to the DFU interface
/// (wIndex 0). Implementations block for the whole transfer.
pub trait DfuTransport: Send {
    /// Device-to-host transfer into `buf`. Returns bytes received.
    fn control_in(
        &self,
        request: u8,
        value: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Host-to-device transfer of `data`. Returns bytes sent.
    fn control_out(
        &self,
        request: u8,
        value: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Single entry point dispatching on direction.
    fn transfer(
        &self,
        direction: Direction,
        request: u8,
        value: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        match direction {
            Direction::In => self.control_in(request, value, buf, timeout),
            Direction::Out => self.control_out(request, value, buf, timeout),
        }
    }

    /// Check if device is still connected.
    fn is_connected(&self) -> bool;

    /// Get the VID.
    fn vendor_id(&self) -> u16;

    /// Get the PID.
    fn product_id(&self) -> u16;

    /// bcdDevice, the bootloader version on STM32 parts.
    fn device_version(&self) -> u16;
}
