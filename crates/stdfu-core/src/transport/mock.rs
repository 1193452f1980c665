//! Mock USB transport for testing.
//!
//! Simulates an STM32 system bootloader: a flat flash array behind an
//! address pointer, the DNLOAD busy/idle cycle with a poll timeout, and
//! UPLOAD read-back. Fault injection hooks cover the failure paths the
//! engine has to handle.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::traits::{DfuTransport, Direction, TransportError};
use crate::protocol::command::Command;
use crate::protocol::constants::*;
use crate::protocol::status::{DeviceState, DeviceStatus, StatusCode};

/// One request seen by the mock.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub direction: Direction,
    pub request: u8,
    pub value: u16,
    /// OUT payload, or the bytes returned for IN.
    pub data: Vec<u8>,
    pub at: Instant,
}

#[derive(Debug)]
struct MockDevice {
    state: DeviceState,
    status: StatusCode,
    flash_base: u32,
    flash: Vec<u8>,
    address: u32,
    poll_timeout_ms: u32,
    /// Set by DNLOAD; the device reports BUSY until this instant.
    busy_until: Option<Instant>,
    /// State to report after the next DNLOAD instead of BUSY.
    post_download_state: Option<DeviceState>,
    /// Armed by DNLOAD from `post_download_state`.
    override_state: Option<DeviceState>,
    scripted: VecDeque<DeviceStatus>,
    corrupt_block: Option<u16>,
    stuck_in_error: bool,
    failing: HashSet<u8>,
    connected: bool,
    log: Vec<TransferRecord>,
}

impl MockDevice {
    fn report(&self, poll_timeout_ms: u32) -> DeviceStatus {
        DeviceStatus::new(self.status, poll_timeout_ms, self.state)
    }

    fn fail(&mut self, status: StatusCode) {
        self.state = DeviceState::Error;
        self.status = status;
        self.busy_until = None;
    }

    fn block_range(&self, block: u16, len: usize) -> Option<std::ops::Range<usize>> {
        let address = self
            .address
            .checked_add((block - FIRST_DATA_BLOCK) as u32 * BLOCK_SIZE as u32)?;
        let start = address.checked_sub(self.flash_base)? as usize;
        let end = start.checked_add(len)?;
        (end <= self.flash.len()).then_some(start..end)
    }

    fn get_status(&mut self) -> DeviceStatus {
        if let Some(scripted) = self.scripted.pop_front() {
            self.state = scripted.state;
            self.status = scripted.status;
            return scripted;
        }

        if let Some(state) = self.override_state.take() {
            self.busy_until = None;
            self.state = state;
            return self.report(0);
        }

        match self.busy_until {
            Some(_) if self.state == DeviceState::DownloadSync => {
                self.state = DeviceState::DownloadBusy;
                self.report(self.poll_timeout_ms)
            }
            Some(until) if Instant::now() < until => self.report(self.poll_timeout_ms),
            Some(_) => {
                self.busy_until = None;
                self.state = DeviceState::DownloadIdle;
                self.report(0)
            }
            None => self.report(0),
        }
    }

    fn download(&mut self, block: u16, data: &[u8]) {
        if !self.state.is_download_ready() {
            self.fail(StatusCode::ErrStalledPkt);
            return;
        }

        match block {
            0 => match Command::decode(data) {
                Some(Command::MassErase) => self.flash.fill(0xFF),
                Some(Command::SetAddressPointer(address)) => self.address = address,
                Some(Command::ReadUnprotect) => self.flash.fill(0xFF),
                None => {
                    self.fail(StatusCode::ErrTarget);
                    return;
                }
            },
            1 => {
                self.fail(StatusCode::ErrStalledPkt);
                return;
            }
            _ => match self.block_range(block, data.len()) {
                Some(range) => self.flash[range].copy_from_slice(data),
                None => {
                    self.fail(StatusCode::ErrAddress);
                    return;
                }
            },
        }

        self.state = DeviceState::DownloadSync;
        self.override_state = self.post_download_state.take();
        self.busy_until =
            Some(Instant::now() + Duration::from_millis(self.poll_timeout_ms as u64));
    }

    fn upload(&mut self, block: u16, buf: &mut [u8]) -> usize {
        if !self.state.is_upload_ready() || block < FIRST_DATA_BLOCK {
            self.fail(StatusCode::ErrStalledPkt);
            return 0;
        }
        let Some(range) = self.block_range(block, buf.len()) else {
            self.fail(StatusCode::ErrAddress);
            return 0;
        };
        buf.copy_from_slice(&self.flash[range]);
        if self.corrupt_block == Some(block) && !buf.is_empty() {
            buf[0] ^= 0xFF;
        }
        self.state = DeviceState::UploadIdle;
        buf.len()
    }
}

/// Mock transport for unit testing engine and programmer logic.
///
/// Clones share the same simulated device, so a test can keep a handle
/// for inspection after moving the transport into an engine.
#[derive(Debug, Clone)]
pub struct MockTransport {
    device: Arc<Mutex<MockDevice>>,
    vid: u16,
    pid: u16,
}

impl MockTransport {
    /// 64 KiB of erased flash at the STM32 internal flash base.
    pub fn new() -> Self {
        Self::with_flash(INTERNAL_FLASH_START, 64 * 1024)
    }

    pub fn with_flash(base: u32, size: usize) -> Self {
        Self {
            device: Arc::new(Mutex::new(MockDevice {
                state: DeviceState::DfuIdle,
                status: StatusCode::Ok,
                flash_base: base,
                flash: vec![0xFF; size],
                address: base,
                poll_timeout_ms: 0,
                busy_until: None,
                post_download_state: None,
                override_state: None,
                scripted: VecDeque::new(),
                corrupt_block: None,
                stuck_in_error: false,
                failing: HashSet::new(),
                connected: true,
                log: Vec::new(),
            })),
            vid: STM_VENDOR_ID,
            pid: STM_DFU_PRODUCT_ID,
        }
    }

    fn device(&self) -> MutexGuard<'_, MockDevice> {
        self.device.lock().unwrap()
    }

    /// bwPollTimeout reported while a download is being processed.
    pub fn set_poll_timeout(&self, ms: u32) {
        self.device().poll_timeout_ms = ms;
    }

    /// Queue a raw status to be returned on the next GETSTATUS.
    pub fn queue_status(&self, status: DeviceStatus) {
        self.device().scripted.push_back(status);
    }

    /// Report `state` instead of BUSY on the first GETSTATUS after the next DNLOAD.
    pub fn set_post_download_state(&self, state: DeviceState) {
        self.device().post_download_state = Some(state);
    }

    /// Flip the first byte of every UPLOAD of this wire block.
    pub fn corrupt_block(&self, wire_block: u16) {
        self.device().corrupt_block = Some(wire_block);
    }

    /// Enter dfuERROR and ignore CLRSTATUS from now on.
    pub fn stick_in_error(&self) {
        let mut dev = self.device();
        dev.fail(StatusCode::ErrUnknown);
        dev.stuck_in_error = true;
    }

    /// Make every transfer with this request code fail.
    pub fn fail_request(&self, request: u8) {
        self.device().failing.insert(request);
    }

    /// Overwrite flash contents at an absolute address.
    pub fn load_flash(&self, address: u32, data: &[u8]) {
        let mut dev = self.device();
        let start = (address - dev.flash_base) as usize;
        dev.flash[start..start + data.len()].copy_from_slice(data);
    }

    /// Snapshot of flash contents at an absolute address.
    pub fn flash(&self, address: u32, len: usize) -> Vec<u8> {
        let dev = self.device();
        let start = (address - dev.flash_base) as usize;
        dev.flash[start..start + len].to_vec()
    }

    pub fn address_pointer(&self) -> u32 {
        self.device().address
    }

    pub fn state(&self) -> DeviceState {
        self.device().state
    }

    /// Get all captured requests.
    pub fn transfers(&self) -> Vec<TransferRecord> {
        self.device().log.clone()
    }

    /// Captured requests with the given request code.
    pub fn requests(&self, request: u8) -> Vec<TransferRecord> {
        self.device()
            .log
            .iter()
            .filter(|r| r.request == request)
            .cloned()
            .collect()
    }

    /// Clear captured requests.
    pub fn clear_log(&self) {
        self.device().log.clear();
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.device().connected = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        self.device().connected = true;
    }

    /// Report different USB IDs.
    pub fn with_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = vid;
        self.pid = pid;
        self
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DfuTransport for MockTransport {
    fn control_in(
        &self,
        request: u8,
        value: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut dev = self.device();
        if !dev.connected {
            return Err(TransportError::Disconnected);
        }
        if dev.failing.contains(&request) {
            return Err(TransportError::TransferFailed {
                request: request_name(request),
                message: "simulated failure".into(),
            });
        }

        let n = match request {
            DFU_GETSTATUS => {
                let raw = dev.get_status().to_bytes();
                let n = raw.len().min(buf.len());
                buf[..n].copy_from_slice(&raw[..n]);
                n
            }
            DFU_GETSTATE => {
                if let Some(b) = buf.first_mut() {
                    *b = dev.state.as_u8();
                }
                buf.len().min(STATE_LEN)
            }
            DFU_UPLOAD => dev.upload(value, buf),
            _ => {
                dev.fail(StatusCode::ErrStalledPkt);
                return Err(TransportError::TransferFailed {
                    request: request_name(request),
                    message: "stall".into(),
                });
            }
        };

        dev.log.push(TransferRecord {
            direction: Direction::In,
            request,
            value,
            data: buf[..n].to_vec(),
            at: Instant::now(),
        });
        Ok(n)
    }

    fn control_out(
        &self,
        request: u8,
        value: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut dev = self.device();
        if !dev.connected {
            return Err(TransportError::Disconnected);
        }
        if dev.failing.contains(&request) {
            return Err(TransportError::TransferFailed {
                request: request_name(request),
                message: "simulated failure".into(),
            });
        }

        dev.log.push(TransferRecord {
            direction: Direction::Out,
            request,
            value,
            data: data.to_vec(),
            at: Instant::now(),
        });

        match request {
            DFU_DNLOAD => dev.download(value, data),
            DFU_CLRSTATUS => {
                if !dev.stuck_in_error {
                    dev.state = DeviceState::DfuIdle;
                    dev.status = StatusCode::Ok;
                    dev.busy_until = None;
                }
            }
            DFU_ABORT => {
                dev.state = DeviceState::DfuIdle;
                dev.busy_until = None;
            }
            DFU_DETACH => dev.state = DeviceState::AppDetach,
            _ => {
                dev.fail(StatusCode::ErrStalledPkt);
                return Err(TransportError::TransferFailed {
                    request: request_name(request),
                    message: "stall".into(),
                });
            }
        }
        Ok(data.len())
    }

    fn is_connected(&self) -> bool {
        self.device().connected
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }

    fn device_version(&self) -> u16 {
        0x2200
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::status::decode_status;

    const T: Duration = Duration::from_millis(500);

    fn status(mock: &MockTransport) -> DeviceStatus {
        let mut raw = [0u8; STATUS_LEN];
        mock.control_in(DFU_GETSTATUS, 0, &mut raw, T).unwrap();
        decode_status(raw)
    }

    #[test]
    fn test_download_busy_then_idle() {
        let mock = MockTransport::new();
        mock.set_poll_timeout(5);
        mock.control_out(DFU_DNLOAD, 2, &[1, 2, 3], T).unwrap();

        let first = status(&mock);
        assert_eq!(first.state, DeviceState::DownloadBusy);
        assert_eq!(first.poll_timeout_ms, 5);

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(status(&mock).state, DeviceState::DownloadIdle);
        assert_eq!(mock.flash(INTERNAL_FLASH_START, 3), vec![1, 2, 3]);
    }

    #[test]
    fn test_upload_follows_address_pointer() {
        let mock = MockTransport::new();
        mock.load_flash(INTERNAL_FLASH_START + 0x800, &[0xAB; 4]);

        let mut buf = [0u8; 4];
        let n = mock.control_in(DFU_UPLOAD, 3, &mut buf, T).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf, [0xAB; 4]);
        assert_eq!(mock.state(), DeviceState::UploadIdle);
    }

    #[test]
    fn test_download_out_of_range_enters_error() {
        let mock = MockTransport::with_flash(INTERNAL_FLASH_START, 2048);
        mock.control_out(DFU_DNLOAD, 3, &[0; 16], T).unwrap();
        let st = status(&mock);
        assert_eq!(st.state, DeviceState::Error);
        assert_eq!(st.status, StatusCode::ErrAddress);

        mock.control_out(DFU_CLRSTATUS, 0, &[], T).unwrap();
        assert_eq!(status(&mock).state, DeviceState::DfuIdle);
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = MockTransport::new();
        assert!(mock.is_connected());

        mock.disconnect();
        assert!(!mock.is_connected());
        assert!(matches!(
            mock.control_out(DFU_ABORT, 0, &[], T),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn test_transfer_dispatch_logs_direction() {
        let mock = MockTransport::new();
        let mut buf = [0u8; STATUS_LEN];
        mock.transfer(Direction::In, DFU_GETSTATUS, 0, &mut buf, T)
            .unwrap();
        mock.transfer(Direction::Out, DFU_CLRSTATUS, 0, &mut [], T)
            .unwrap();

        let log = mock.transfers();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].direction, Direction::In);
        assert_eq!(log[1].direction, Direction::Out);
        assert_eq!(log[1].request, DFU_CLRSTATUS);
    }
}
