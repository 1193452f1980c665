//! DFU Session - one open bootloader and its configuration.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::engine::{DfuEngine, EngineTimeouts};
use crate::events::{DfuEvent, DfuObserver, PacketDirection, TracingObserver};
use crate::image::FirmwareImage;
use crate::programmer::{FlashProgrammer, FlashTarget, WriteSummary};
use crate::protocol::constants::*;
use crate::protocol::status::{DeviceState, DeviceStatus};
use crate::transport::{DfuTransport, NusbTransport, TransportError};

/// Configuration for a DFU session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// USB vendor ID of the bootloader.
    pub vendor_id: u16,
    /// USB product ID of the bootloader.
    pub product_id: u16,
    /// First flash address written and read.
    pub flash_base: u32,
    /// Flash size in bytes, the default read length.
    pub flash_size: u32,
    pub status_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub block_timeout_ms: u64,
    pub clear_status_timeout_ms: u64,
    /// Budget of the wait-for-idle loop.
    pub idle_wait_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            vendor_id: STM_VENDOR_ID,
            product_id: STM_DFU_PRODUCT_ID,
            flash_base: INTERNAL_FLASH_START,
            flash_size: INTERNAL_FLASH_SIZE,
            status_timeout_ms: STATUS_TIMEOUT_MS,
            command_timeout_ms: COMMAND_TIMEOUT_MS,
            block_timeout_ms: BLOCK_TIMEOUT_MS,
            clear_status_timeout_ms: CLEAR_STATUS_TIMEOUT_MS,
            idle_wait_ms: IDLE_WAIT_MS,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn timeouts(&self) -> EngineTimeouts {
        EngineTimeouts {
            status: Duration::from_millis(self.status_timeout_ms),
            command: Duration::from_millis(self.command_timeout_ms),
            block: Duration::from_millis(self.block_timeout_ms),
            clear_status: Duration::from_millis(self.clear_status_timeout_ms),
            idle_wait: Duration::from_millis(self.idle_wait_ms),
        }
    }

    pub fn target(&self) -> FlashTarget {
        FlashTarget::new(self.flash_base, self.flash_size)
    }
}

/// DFU Session - owns the transport of one device.
///
/// All engine access goes through a single mutex, so a session can be
/// shared between threads but runs one transaction at a time.
pub struct DfuSession<T: DfuTransport, O: DfuObserver> {
    config: SessionConfig,
    observer: Arc<O>,
    programmer: Mutex<FlashProgrammer<ObservableTransport<T, O>, O>>,
}

impl DfuSession<NusbTransport, TracingObserver> {
    /// Open the configured device with the default tracing observer.
    pub fn open(config: SessionConfig) -> Result<Self> {
        Self::open_with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: DfuObserver> DfuSession<NusbTransport, O> {
    /// Open the configured device with a custom observer.
    pub fn open_with_observer(config: SessionConfig, observer: Arc<O>) -> Result<Self> {
        let transport = NusbTransport::open_with_ids(config.vendor_id, config.product_id)
            .with_context(|| {
                format!(
                    "Failed to open DFU device {:04X}:{:04X}",
                    config.vendor_id, config.product_id
                )
            })?;
        Ok(Self::with_transport(config, transport, observer))
    }
}

impl<T: DfuTransport, O: DfuObserver> DfuSession<T, O> {
    /// Bind an already open transport.
    pub fn with_transport(config: SessionConfig, transport: T, observer: Arc<O>) -> Self {
        observer.on_event(&DfuEvent::DeviceConnected {
            vid: transport.vendor_id(),
            pid: transport.product_id(),
            version: transport.device_version(),
        });

        let transport = ObservableTransport {
            inner: transport,
            observer: observer.clone(),
        };
        let engine = DfuEngine::with_timeouts(transport, config.timeouts());
        let programmer = FlashProgrammer::new(engine, observer.clone(), config.target());

        Self {
            config,
            observer,
            programmer: Mutex::new(programmer),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn observer(&self) -> &Arc<O> {
        &self.observer
    }

    fn lock(&self) -> Result<MutexGuard<'_, FlashProgrammer<ObservableTransport<T, O>, O>>> {
        self.programmer
            .lock()
            .map_err(|_| anyhow!("DFU session lock poisoned"))
    }

    /// Current status as reported by GETSTATUS.
    pub fn status(&self) -> Result<DeviceStatus> {
        let programmer = self.lock()?;
        programmer
            .engine()
            .get_status()
            .context("Failed to read device status")
    }

    /// Current state as reported by GETSTATE.
    pub fn state(&self) -> Result<DeviceState> {
        let programmer = self.lock()?;
        programmer
            .engine()
            .get_state()
            .context("Failed to read device state")
    }

    /// Mass erase the whole flash.
    #[instrument(skip(self))]
    pub fn erase(&self) -> Result<()> {
        self.lock()?.mass_erase().context("Mass erase failed")
    }

    /// Write and verify an image at the flash base without erasing first.
    #[instrument(skip(self, image))]
    pub fn write<R: Read>(&self, image: FirmwareImage<R>) -> Result<WriteSummary> {
        let programmer = self.lock()?;
        programmer
            .set_address_pointer(self.config.flash_base)
            .context("Failed to set address pointer")?;
        programmer.write_image(image).context("Write failed")
    }

    /// Erase, then write and verify an image.
    #[instrument(skip(self, image))]
    pub fn flash<R: Read>(&self, image: FirmwareImage<R>) -> Result<WriteSummary> {
        let summary = self
            .lock()?
            .mass_erase_and_flash(image)
            .context("Flashing failed")?;
        info!(blocks = summary.blocks, bytes = summary.bytes, "Flash complete");
        Ok(summary)
    }

    /// Read `size` bytes starting at `base` into `out`. Returns the bytes
    /// copied.
    #[instrument(skip(self, out), fields(base = %format!("0x{:08X}", base)))]
    pub fn read_to<W: Write>(&self, size: u32, base: u32, out: &mut W) -> Result<usize> {
        let programmer = self.lock()?;
        programmer
            .set_address_pointer(base)
            .context("Failed to set address pointer")?;

        let mut copied = 0;
        for block in programmer.read_flash(size, base) {
            let (address, data) =
                block.with_context(|| format!("Read failed after {} bytes", copied))?;
            out.write_all(&data)
                .with_context(|| format!("Failed to store block at 0x{:08X}", address))?;
            copied += data.len();
        }
        out.flush()?;
        Ok(copied)
    }

    /// Read `size` bytes starting at `base` and report them as hex dumps.
    #[instrument(skip(self), fields(base = %format!("0x{:08X}", base)))]
    pub fn dump(&self, size: u32, base: u32) -> Result<usize> {
        let programmer = self.lock()?;
        programmer
            .set_address_pointer(base)
            .context("Failed to set address pointer")?;
        programmer.dump_flash(size, base).context("Read failed")
    }

    /// Send ABORT, returning the device to dfuIDLE.
    pub fn abort(&self) -> Result<()> {
        self.lock()?.engine().abort().context("Abort failed")
    }

    /// Release the device.
    pub fn close(self) -> Result<T> {
        let programmer = self
            .programmer
            .into_inner()
            .map_err(|_| anyhow!("DFU session lock poisoned"))?;
        Ok(programmer.into_engine().into_transport().inner)
    }
}

/// Transport wrapper that emits packet events.
pub struct ObservableTransport<T: DfuTransport, O: DfuObserver> {
    inner: T,
    observer: Arc<O>,
}

impl<T: DfuTransport, O: DfuObserver> ObservableTransport<T, O> {
    fn observe(&self, direction: PacketDirection, request: u8, data: &[u8]) {
        self.observer.on_event(&DfuEvent::Packet {
            direction,
            request: request_name(request),
            length: data.len(),
            data: Some(data.iter().take(32).cloned().collect()),
        });
    }

    fn check_disconnect<V>(&self, res: &Result<V, TransportError>) {
        if let Err(TransportError::Disconnected) = res {
            self.observer.on_event(&DfuEvent::DeviceDisconnected);
        }
    }
}

impl<T: DfuTransport, O: DfuObserver> DfuTransport for ObservableTransport<T, O> {
    fn control_in(
        &self,
        request: u8,
        value: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let res = self.inner.control_in(request, value, buf, timeout);
        if let Ok(n) = &res {
            self.observe(PacketDirection::Rx, request, &buf[..*n]);
        }
        self.check_disconnect(&res);
        res
    }

    fn control_out(
        &self,
        request: u8,
        value: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let res = self.inner.control_out(request, value, data, timeout);
        if res.is_ok() {
            self.observe(PacketDirection::Tx, request, data);
        }
        self.check_disconnect(&res);
        res
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn vendor_id(&self) -> u16 {
        self.inner.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.inner.product_id()
    }

    fn device_version(&self) -> u16 {
        self.inner.device_version()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<DfuEvent>>,
    }

    impl DfuObserver for Recorder {
        fn on_event(&self, event: &DfuEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn session(mock: &MockTransport) -> (DfuSession<MockTransport, Recorder>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let session =
            DfuSession::with_transport(SessionConfig::default(), mock.clone(), recorder.clone());
        (session, recorder)
    }

    #[test]
    fn test_config_roundtrip() {
        let config = SessionConfig {
            product_id: 0xDF12,
            flash_size: 0x8_0000,
            idle_wait_ms: 1000,
            ..Default::default()
        };
        let path = std::env::temp_dir().join(format!("stdfu-config-{}.toml", std::process::id()));
        config.save_to_file(&path).unwrap();
        let loaded = SessionConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded, config);
        assert_eq!(loaded.timeouts().idle_wait, Duration::from_millis(1000));
    }

    #[test]
    fn test_config_partial_file_uses_defaults() {
        let config: SessionConfig = toml::from_str("flash_size = 4096\n").unwrap();
        assert_eq!(config.flash_size, 4096);
        assert_eq!(config.vendor_id, 0x0483);
        assert_eq!(config.product_id, 0xDF11);
        assert_eq!(config.timeouts(), EngineTimeouts::default());
    }

    #[test]
    fn test_flash_then_read_back() {
        let mock = MockTransport::new();
        let (session, _) = session(&mock);
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 253) as u8).collect();

        let summary = session
            .flash(FirmwareImage::from_bytes(data.clone()))
            .unwrap();
        assert_eq!(summary.blocks, 2);

        let mut out = Vec::new();
        let n = session
            .read_to(data.len() as u32, INTERNAL_FLASH_START, &mut out)
            .unwrap();
        assert_eq!(n, data.len());
        assert_eq!(out, data);
        assert_eq!(mock.address_pointer(), INTERNAL_FLASH_START);
    }

    #[test]
    fn test_write_sets_address_without_erase() {
        let mock = MockTransport::new();
        mock.load_flash(INTERNAL_FLASH_START + 0x1000, &[0x55; 16]);
        let (session, _) = session(&mock);

        session.write(FirmwareImage::from_bytes(vec![0xAA; 16])).unwrap();

        let commands: Vec<_> = mock
            .requests(DFU_DNLOAD)
            .into_iter()
            .filter(|r| r.value == 0)
            .map(|r| r.data[0])
            .collect();
        assert_eq!(commands, vec![CMD_SET_ADDRESS_POINTER]);
        assert_eq!(mock.flash(INTERNAL_FLASH_START, 16), vec![0xAA; 16]);
        assert_eq!(mock.flash(INTERNAL_FLASH_START + 0x1000, 16), vec![0x55; 16]);
    }

    #[test]
    fn test_events_include_connect_and_packets() {
        let mock = MockTransport::new();
        let (session, recorder) = session(&mock);
        let status = session.status().unwrap();
        assert_eq!(status.state, DeviceState::DfuIdle);

        let events = recorder.events.lock().unwrap();
        assert!(matches!(
            events[0],
            DfuEvent::DeviceConnected {
                vid: 0x0483,
                pid: 0xDF11,
                ..
            }
        ));
        assert!(events.iter().any(|e| matches!(
            e,
            DfuEvent::Packet {
                direction: PacketDirection::Rx,
                request: "GETSTATUS",
                length: 6,
                ..
            }
        )));
    }

    #[test]
    fn test_connect_reports_transport_ids() {
        let mock = MockTransport::new().with_ids(0x0483, 0xDF12);
        let (_session, recorder) = session(&mock);
        let events = recorder.events.lock().unwrap();
        assert_eq!(
            events[0].to_string(),
            "Device 0483:DF12 connected (bootloader v22.0)"
        );
    }

    #[test]
    fn test_disconnect_is_reported() {
        let mock = MockTransport::new();
        let (session, recorder) = session(&mock);
        mock.disconnect();

        let err = session.erase().unwrap_err();
        assert!(format!("{:#}", err).contains("Device disconnected"));
        assert!(
            recorder
                .events
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, DfuEvent::DeviceDisconnected))
        );
    }

    #[test]
    fn test_abort_and_state() {
        let mock = MockTransport::new();
        let (session, _) = session(&mock);
        session.abort().unwrap();
        assert_eq!(session.state().unwrap(), DeviceState::DfuIdle);
        assert_eq!(mock.requests(DFU_ABORT).len(), 1);

        let transport = session.close().unwrap();
        assert_eq!(transport.vendor_id(), STM_VENDOR_ID);
    }
}
