//! DFU protocol engine.
//!
//! Every operation is one logical transaction against the bootloader.
//! Stateful commands (erase, address pointer, block download) run the
//! two-phase check of the DFU class protocol:
//!
//! 1. DNLOAD the payload.
//! 2. GETSTATUS must report dfuDNBUSY or dfuDNLOAD-IDLE.
//! 3. Sleep for the reported bwPollTimeout.
//! 4. GETSTATUS must report dfuIDLE or dfuDNLOAD-IDLE.
//!
//! A dfuERROR state is surfaced as [`DfuError::ProtocolState`]. The engine
//! never clears it on its own after a destructive command; only the
//! wait-for-idle backoff that precedes each operation issues CLRSTATUS.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::error::{DfuError, DfuResult};
use crate::protocol::command::Command;
use crate::protocol::constants::*;
use crate::protocol::status::{DeviceState, DeviceStatus, decode_status};
use crate::transport::{DfuTransport, TransportError};

const DOWNLOAD_READY: [DeviceState; 2] = [DeviceState::DfuIdle, DeviceState::DownloadIdle];
const UPLOAD_READY: [DeviceState; 2] = [DeviceState::DfuIdle, DeviceState::UploadIdle];

/// Pause before the next poll: the device's bwPollTimeout, at least
/// `IDLE_POLL_INTERVAL_MS`, never past the remaining budget.
fn poll_pause(status: &DeviceStatus, remaining: Duration) -> Duration {
    Duration::from_millis(u64::from(status.poll_timeout_ms).max(IDLE_POLL_INTERVAL_MS))
        .min(remaining)
}

/// Per-request timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTimeouts {
    /// GETSTATUS / GETSTATE.
    pub status: Duration,
    /// Short DNLOAD commands (erase, address pointer) and ABORT.
    pub command: Duration,
    /// Block DNLOAD / UPLOAD.
    pub block: Duration,
    /// CLRSTATUS.
    pub clear_status: Duration,
    /// Overall budget of the wait-for-idle loop.
    pub idle_wait: Duration,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        Self {
            status: Duration::from_millis(STATUS_TIMEOUT_MS),
            command: Duration::from_millis(COMMAND_TIMEOUT_MS),
            block: Duration::from_millis(BLOCK_TIMEOUT_MS),
            clear_status: Duration::from_millis(CLEAR_STATUS_TIMEOUT_MS),
            idle_wait: Duration::from_millis(IDLE_WAIT_MS),
        }
    }
}

/// DFU request/response engine over one transport.
pub struct DfuEngine<T: DfuTransport> {
    transport: T,
    timeouts: EngineTimeouts,
}

impl<T: DfuTransport> DfuEngine<T> {
    pub fn new(transport: T) -> Self {
        Self::with_timeouts(transport, EngineTimeouts::default())
    }

    pub fn with_timeouts(transport: T, timeouts: EngineTimeouts) -> Self {
        Self {
            transport,
            timeouts,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn timeouts(&self) -> &EngineTimeouts {
        &self.timeouts
    }

    /// DFU_GETSTATUS.
    pub fn get_status(&self) -> DfuResult<DeviceStatus> {
        let mut raw = [0u8; STATUS_LEN];
        let n = self
            .transport
            .control_in(DFU_GETSTATUS, 0, &mut raw, self.timeouts.status)?;
        if n < STATUS_LEN {
            return Err(TransportError::ShortTransfer {
                expected: STATUS_LEN,
                actual: n,
            }
            .into());
        }

        let status = decode_status(raw);
        trace!(
            state = %status.state,
            status = %status.status,
            poll_timeout_ms = status.poll_timeout_ms,
            "GETSTATUS"
        );
        Ok(status)
    }

    /// DFU_CLRSTATUS. Succeeds even if the device ignores it.
    pub fn clear_status(&self) -> DfuResult<()> {
        self.transport
            .control_out(DFU_CLRSTATUS, 0, &[], self.timeouts.clear_status)?;
        trace!("CLRSTATUS");
        Ok(())
    }

    /// DFU_GETSTATE.
    pub fn get_state(&self) -> DfuResult<DeviceState> {
        let mut raw = [0u8; STATE_LEN];
        let n = self
            .transport
            .control_in(DFU_GETSTATE, 0, &mut raw, self.timeouts.status)?;
        if n < STATE_LEN {
            return Err(TransportError::ShortTransfer {
                expected: STATE_LEN,
                actual: n,
            }
            .into());
        }
        Ok(DeviceState::from_u8(raw[0]))
    }

    /// DFU_ABORT. Returns the device to dfuIDLE from any idle state.
    pub fn abort(&self) -> DfuResult<()> {
        self.transport
            .control_out(DFU_ABORT, 0, &[], self.timeouts.command)?;
        debug!("ABORT");
        Ok(())
    }

    /// Poll until the device reports one of `states`, issuing CLRSTATUS
    /// between polls. Fails with [`DfuError::Timeout`] once `timeout` has
    /// elapsed.
    pub fn wait_until(&self, states: &[DeviceState], timeout: Duration) -> DfuResult<DeviceStatus> {
        self.wait_for(states, timeout, "target state")
    }

    /// Wait for dfuIDLE or dfuDNLOAD-IDLE.
    pub fn wait_download_idle(&self) -> DfuResult<DeviceStatus> {
        self.wait_for(&DOWNLOAD_READY, self.timeouts.idle_wait, "download idle")
    }

    /// Wait for dfuIDLE or dfuUPLOAD-IDLE.
    pub fn wait_upload_idle(&self) -> DfuResult<DeviceStatus> {
        self.wait_for(&UPLOAD_READY, self.timeouts.idle_wait, "upload idle")
    }

    fn wait_for(
        &self,
        states: &[DeviceState],
        timeout: Duration,
        operation: &'static str,
    ) -> DfuResult<DeviceStatus> {
        let start = Instant::now();
        let mut status = self.get_status()?;

        while !states.contains(&status.state) {
            let elapsed = start.elapsed();
            if elapsed > timeout {
                warn!(operation, last_state = %status.state, "Timed out waiting for device");
                return Err(DfuError::Timeout {
                    operation,
                    waited_ms: start.elapsed().as_millis() as u64,
                    last_state: status.state,
                });
            }
            debug!(state = %status.state, status = %status.status, "Device not ready, clearing status");
            self.clear_status()?;
            thread::sleep(poll_pause(&status, timeout.saturating_sub(elapsed)));
            status = self.get_status()?;
        }

        Ok(status)
    }

    /// Erase the whole flash. Honors the erase time reported by the device.
    pub fn mass_erase(&self) -> DfuResult<()> {
        info!("Mass erase");
        self.command(Command::MassErase)?;
        info!("Mass erase complete");
        Ok(())
    }

    /// Point subsequent block transfers at `address`.
    pub fn set_address_pointer(&self, address: u32) -> DfuResult<()> {
        debug!(address = %format!("0x{:08X}", address), "Set address pointer");
        self.command(Command::SetAddressPointer(address))
            .map(|_| ())
    }

    /// DNLOAD one block of data at a wire block number.
    pub fn write_block(&self, data: &[u8], wire_block: u16) -> DfuResult<()> {
        debug!(block = wire_block, len = data.len(), "Write block");
        self.download("write block", wire_block, data, self.timeouts.block)
            .map(|_| ())
    }

    /// UPLOAD one block into `buf`. Returns the number of bytes received.
    ///
    /// Flash reads are synchronous, so there is no busy wait; one status
    /// check afterwards confirms the device is still upload-ready.
    pub fn read_block(&self, buf: &mut [u8], wire_block: u16) -> DfuResult<usize> {
        let n = self
            .transport
            .control_in(DFU_UPLOAD, wire_block, buf, self.timeouts.block)?;

        let status = self.get_status()?;
        if !status.state.is_upload_ready() {
            return Err(DfuError::ProtocolState {
                operation: "read block",
                state: status.state,
                status: status.status,
            });
        }

        debug!(block = wire_block, len = n, "Read block");
        Ok(n)
    }

    fn command(&self, command: Command) -> DfuResult<DeviceStatus> {
        let payload = command.encode();
        self.download(command.name(), 0, &payload, self.timeouts.command)
    }

    /// DNLOAD followed by the busy -> idle check.
    fn download(
        &self,
        operation: &'static str,
        wire_block: u16,
        data: &[u8],
        timeout: Duration,
    ) -> DfuResult<DeviceStatus> {
        self.wait_download_idle()?;

        self.transport
            .control_out(DFU_DNLOAD, wire_block, data, timeout)?;

        let status = self.get_status()?;
        if !matches!(
            status.state,
            DeviceState::DownloadBusy | DeviceState::DownloadIdle
        ) {
            return Err(DfuError::ProtocolState {
                operation,
                state: status.state,
                status: status.status,
            });
        }

        if status.poll_timeout_ms > 0 {
            trace!(poll_timeout_ms = status.poll_timeout_ms, "Waiting for device");
            thread::sleep(Duration::from_millis(status.poll_timeout_ms as u64));
        }

        let status = self.get_status()?;
        if !status.state.is_download_ready() {
            return Err(DfuError::ProtocolState {
                operation,
                state: status.state,
                status: status.status,
            });
        }

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::status::StatusCode;
    use crate::transport::{Direction, MockTransport};

    fn engine(mock: &MockTransport) -> DfuEngine<MockTransport> {
        DfuEngine::new(mock.clone())
    }

    #[test]
    fn test_get_status_request_shape() {
        let mock = MockTransport::new();
        let status = engine(&mock).get_status().unwrap();
        assert_eq!(status.state, DeviceState::DfuIdle);

        let log = mock.transfers();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].direction, Direction::In);
        assert_eq!(log[0].request, DFU_GETSTATUS);
        assert_eq!(log[0].value, 0);
        assert_eq!(log[0].data.len(), STATUS_LEN);
    }

    #[test]
    fn test_wait_until_times_out_in_error() {
        let mock = MockTransport::new();
        mock.stick_in_error();
        let budget = Duration::from_millis(50);

        let start = Instant::now();
        let err = engine(&mock)
            .wait_until(&DOWNLOAD_READY, budget)
            .unwrap_err();

        assert!(err.is_timeout(), "unexpected error: {err}");
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!mock.requests(DFU_CLRSTATUS).is_empty());
    }

    #[test]
    fn test_wait_until_paces_polls() {
        let mock = MockTransport::new();
        mock.stick_in_error();
        let budget = Duration::from_millis(50);

        engine(&mock)
            .wait_until(&DOWNLOAD_READY, budget)
            .unwrap_err();

        let polls = mock.requests(DFU_GETSTATUS);
        // Full pauses fit budget / interval times; the rounds closing the
        // budget may be shorter.
        let max_rounds = (budget.as_millis() as u64 / IDLE_POLL_INTERVAL_MS) as usize + 4;
        assert!(polls.len() <= max_rounds, "{} polls", polls.len());
        assert!(
            polls[1].at.duration_since(polls[0].at) >= Duration::from_millis(IDLE_POLL_INTERVAL_MS)
        );
    }

    #[test]
    fn test_poll_pause_bounds() {
        let busy = DeviceStatus::new(StatusCode::Ok, 40, DeviceState::DownloadBusy);
        let idle = DeviceStatus::new(StatusCode::Ok, 0, DeviceState::Error);
        let budget = Duration::from_millis(500);

        assert_eq!(poll_pause(&busy, budget), Duration::from_millis(40));
        assert_eq!(poll_pause(&idle, budget), Duration::from_millis(IDLE_POLL_INTERVAL_MS));
        assert_eq!(poll_pause(&busy, Duration::from_millis(3)), Duration::from_millis(3));
    }

    #[test]
    fn test_wait_until_clears_error() {
        let mock = MockTransport::new();
        mock.queue_status(DeviceStatus::new(
            StatusCode::ErrWrite,
            0,
            DeviceState::Error,
        ));

        let status = engine(&mock).wait_download_idle().unwrap();
        assert_eq!(status.state, DeviceState::DfuIdle);
        assert_eq!(mock.requests(DFU_CLRSTATUS).len(), 1);
    }

    #[test]
    fn test_mass_erase_honors_poll_timeout() {
        let mock = MockTransport::new();
        mock.set_poll_timeout(40);
        mock.load_flash(INTERNAL_FLASH_START, &[0u8; 16]);

        engine(&mock).mass_erase().unwrap();

        let log = mock.transfers();
        let dnload = log
            .iter()
            .position(|r| r.request == DFU_DNLOAD)
            .expect("no DNLOAD issued");
        assert_eq!(log[dnload].value, 0);
        assert_eq!(log[dnload].data, vec![0x41]);

        let polls: Vec<_> = log[dnload..]
            .iter()
            .filter(|r| r.request == DFU_GETSTATUS)
            .collect();
        assert_eq!(polls.len(), 2);
        assert_eq!(polls[0].data[4], DeviceState::DownloadBusy.as_u8());
        assert!(polls[1].at.duration_since(polls[0].at) >= Duration::from_millis(40));
        assert_eq!(mock.flash(INTERNAL_FLASH_START, 16), vec![0xFF; 16]);
    }

    #[test]
    fn test_mass_erase_rejects_error_state() {
        let mock = MockTransport::new();
        mock.set_post_download_state(DeviceState::Error);

        let err = engine(&mock).mass_erase().unwrap_err();
        match err {
            DfuError::ProtocolState {
                operation, state, ..
            } => {
                assert_eq!(operation, "mass erase");
                assert_eq!(state, DeviceState::Error);
            }
            other => panic!("unexpected error: {other}"),
        }
        // No automatic clear after a failed destructive command.
        assert!(mock.requests(DFU_CLRSTATUS).is_empty());
    }

    #[test]
    fn test_set_address_pointer() {
        let mock = MockTransport::new();
        engine(&mock).set_address_pointer(0x0800_4000).unwrap();

        let dnload = mock.requests(DFU_DNLOAD);
        assert_eq!(dnload.len(), 1);
        assert_eq!(dnload[0].value, 0);
        assert_eq!(dnload[0].data, vec![0x21, 0x00, 0x40, 0x00, 0x08]);
        assert_eq!(mock.address_pointer(), 0x0800_4000);
    }

    #[test]
    fn test_write_block_transport_failure_not_retried() {
        let mock = MockTransport::new();
        mock.fail_request(DFU_DNLOAD);

        let err = engine(&mock).write_block(&[1, 2, 3], 2).unwrap_err();
        assert!(matches!(err, DfuError::Transport(_)));
        // Only the pre-command idle check reached the device.
        assert_eq!(mock.requests(DFU_GETSTATUS).len(), 1);
    }

    #[test]
    fn test_write_block_second_poll_must_be_idle() {
        let mock = MockTransport::new();
        mock.set_poll_timeout(0);
        let eng = engine(&mock);

        // Pre-check, then BUSY, then a stale BUSY where idle is required.
        mock.queue_status(DeviceStatus::new(StatusCode::Ok, 0, DeviceState::DfuIdle));
        mock.queue_status(DeviceStatus::new(StatusCode::Ok, 0, DeviceState::DownloadBusy));
        mock.queue_status(DeviceStatus::new(StatusCode::Ok, 0, DeviceState::DownloadBusy));

        let err = eng.write_block(&[0xAA; 8], 2).unwrap_err();
        assert!(matches!(
            err,
            DfuError::ProtocolState {
                operation: "write block",
                state: DeviceState::DownloadBusy,
                ..
            }
        ));
    }

    #[test]
    fn test_read_block() {
        let mock = MockTransport::new();
        mock.load_flash(INTERNAL_FLASH_START + 2048, &[0x5A; 32]);

        let mut buf = [0u8; 32];
        let n = engine(&mock).read_block(&mut buf, 3).unwrap();
        assert_eq!(n, 32);
        assert_eq!(buf, [0x5A; 32]);

        let upload = mock.requests(DFU_UPLOAD);
        assert_eq!(upload.len(), 1);
        assert_eq!(upload[0].value, 3);
        assert_eq!(mock.requests(DFU_GETSTATUS).len(), 1);
    }

    #[test]
    fn test_read_block_error_state() {
        let mock = MockTransport::new();
        mock.queue_status(DeviceStatus::new(
            StatusCode::ErrUnknown,
            0,
            DeviceState::Error,
        ));

        let mut buf = [0u8; 16];
        let err = engine(&mock).read_block(&mut buf, 2).unwrap_err();
        assert!(matches!(
            err,
            DfuError::ProtocolState {
                operation: "read block",
                ..
            }
        ));
    }

    #[test]
    fn test_get_state_and_abort() {
        let mock = MockTransport::new();
        let eng = engine(&mock);
        let mut buf = [0u8; 4];
        eng.read_block(&mut buf, 2).unwrap();
        assert_eq!(eng.get_state().unwrap(), DeviceState::UploadIdle);

        eng.abort().unwrap();
        assert_eq!(eng.get_state().unwrap(), DeviceState::DfuIdle);
    }

    #[test]
    fn test_short_status_is_transport_error() {
        struct Stub;
        impl DfuTransport for Stub {
            fn control_in(
                &self,
                _request: u8,
                _value: u16,
                _buf: &mut [u8],
                _timeout: Duration,
            ) -> Result<usize, TransportError> {
                Ok(3)
            }
            fn control_out(
                &self,
                _request: u8,
                _value: u16,
                data: &[u8],
                _timeout: Duration,
            ) -> Result<usize, TransportError> {
                Ok(data.len())
            }
            fn is_connected(&self) -> bool {
                true
            }
            fn vendor_id(&self) -> u16 {
                STM_VENDOR_ID
            }
            fn product_id(&self) -> u16 {
                STM_DFU_PRODUCT_ID
            }
            fn device_version(&self) -> u16 {
                0
            }
        }

        let err = DfuEngine::new(Stub).get_status().unwrap_err();
        assert!(matches!(
            err,
            DfuError::Transport(TransportError::ShortTransfer {
                expected: 6,
                actual: 3
            })
        ));
    }
}
