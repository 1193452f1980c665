//! nusb-based USB transport implementation.

use std::time::Duration;

use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient, TransferError};
use nusb::{Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, trace};

use super::traits::{DfuTransport, TransportError};
use crate::protocol::constants::{
    DFU_INTERFACE, STM_DFU_PRODUCT_ID, STM_VENDOR_ID, request_name,
};

/// nusb-based USB transport.
///
/// Control transfers go through the claimed DFU interface so the OS
/// routes them to the bootloader on every platform.
pub struct NusbTransport {
    interface: Interface,
    vid: u16,
    pid: u16,
    bcd_device: u16,
}

impl NusbTransport {
    /// Open the first STM32 bootloader in DFU mode.
    pub fn open() -> Result<Self, TransportError> {
        Self::open_with_ids(STM_VENDOR_ID, STM_DFU_PRODUCT_ID)
    }

    /// Open a device with specific VID/PID.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_ids(vid: u16, pid: u16) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        let bcd_device = device_info.device_version();

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            bootloader_version = %format!("{:04X}", bcd_device),
            "Found DFU device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface = device.claim_interface(DFU_INTERFACE).wait().map_err(|e| {
            TransportError::ClaimInterfaceFailed {
                interface: DFU_INTERFACE,
                message: e.to_string(),
            }
        })?;

        info!(interface = DFU_INTERFACE, "Device opened successfully");

        Ok(Self {
            interface,
            vid,
            pid,
            bcd_device,
        })
    }
}

fn map_transfer_error(request: u8, timeout: Duration, err: TransferError) -> TransportError {
    match err {
        TransferError::Disconnected => TransportError::Disconnected,
        TransferError::Cancelled => TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        },
        other => TransportError::TransferFailed {
            request: request_name(request),
            message: other.to_string(),
        },
    }
}

impl DfuTransport for NusbTransport {
    #[instrument(skip(self, buf), fields(request = request_name(request), len = buf.len()))]
    fn control_in(
        &self,
        request: u8,
        value: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let data = self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index: DFU_INTERFACE as u16,
                    length: buf.len() as u16,
                },
                timeout,
            )
            .wait()
            .map_err(|e| map_transfer_error(request, timeout, e))?;

        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        trace!(bytes_read = n, "Control IN complete");
        Ok(n)
    }

    #[instrument(skip(self, data), fields(request = request_name(request), len = data.len()))]
    fn control_out(
        &self,
        request: u8,
        value: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index: DFU_INTERFACE as u16,
                    data,
                },
                timeout,
            )
            .wait()
            .map_err(|e| map_transfer_error(request, timeout, e))?;

        debug!(bytes_written = data.len(), "Control OUT complete");
        Ok(data.len())
    }

    fn is_connected(&self) -> bool {
        // nusb has no cheap liveness check; a dead device shows up as
        // TransportError::Disconnected on the next transfer.
        true
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }

    fn device_version(&self) -> u16 {
        self.bcd_device
    }
}
