//! Whole-image operations on top of the protocol engine.
//!
//! Nothing here rolls back: an interrupted write leaves the flash partially
//! erased or partially programmed.

use std::fmt::Write as _;
use std::io::Read;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::engine::DfuEngine;
use crate::error::{DfuError, DfuResult};
use crate::events::{DfuEvent, DfuObserver, DfuPhase, LogLevel};
use crate::image::{FirmwareImage, wire_block};
use crate::protocol::constants::*;
use crate::transport::{DfuTransport, TransportError};

/// Flash region being programmed or read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashTarget {
    pub base: u32,
    pub size: u32,
}

impl FlashTarget {
    pub const fn new(base: u32, size: u32) -> Self {
        Self { base, size }
    }

    /// STM32F405 internal flash.
    pub const fn internal_flash() -> Self {
        Self::new(INTERNAL_FLASH_START, INTERNAL_FLASH_SIZE)
    }

    /// STM32F4 option bytes.
    pub const fn option_bytes() -> Self {
        Self::new(OPTION_BYTES_START, OPTION_BYTES_SIZE)
    }

    /// Absolute address of an image-relative block, if it fits in 32 bits.
    pub fn block_address(&self, index: usize) -> Option<u32> {
        u32::try_from(index)
            .ok()?
            .checked_mul(BLOCK_SIZE as u32)?
            .checked_add(self.base)
    }
}

impl Default for FlashTarget {
    fn default() -> Self {
        Self::internal_flash()
    }
}

/// Outcome of a successful image write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    pub blocks: usize,
    pub bytes: usize,
}

/// Sequences erase, write-and-verify and read-back.
pub struct FlashProgrammer<T: DfuTransport, O: DfuObserver> {
    engine: DfuEngine<T>,
    observer: Arc<O>,
    target: FlashTarget,
}

impl<T: DfuTransport, O: DfuObserver> FlashProgrammer<T, O> {
    pub fn new(engine: DfuEngine<T>, observer: Arc<O>, target: FlashTarget) -> Self {
        Self {
            engine,
            observer,
            target,
        }
    }

    pub fn engine(&self) -> &DfuEngine<T> {
        &self.engine
    }

    pub fn target(&self) -> FlashTarget {
        self.target
    }

    pub fn into_engine(self) -> DfuEngine<T> {
        self.engine
    }

    fn emit(&self, event: DfuEvent) {
        self.observer.on_event(&event);
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(DfuEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn phase(&self, from: DfuPhase, to: DfuPhase) {
        self.emit(DfuEvent::PhaseChanged { from, to });
    }

    /// Forward a failure to the observer, unchanged.
    fn report<V>(&self, phase: DfuPhase, result: DfuResult<V>) -> DfuResult<V> {
        if let Err(e) = &result {
            self.emit(DfuEvent::Error {
                message: e.to_string(),
            });
            self.phase(phase, DfuPhase::Error);
        }
        result
    }

    /// Erase the entire flash.
    pub fn mass_erase(&self) -> DfuResult<()> {
        let result = self.erase_inner();
        self.report(DfuPhase::Erasing, result)
    }

    /// Point the device at `address`.
    pub fn set_address_pointer(&self, address: u32) -> DfuResult<()> {
        let result = self.address_inner(address);
        self.report(DfuPhase::Addressing, result)
    }

    /// Write `image` block by block from wire block 2, reading each block
    /// back and comparing it before moving on.
    pub fn write_image<R: Read>(&self, image: FirmwareImage<R>) -> DfuResult<WriteSummary> {
        let result = self.write_inner(image);
        self.report(DfuPhase::Writing, result)
    }

    /// Erase, point at the target base, then write and verify `image`.
    #[instrument(skip(self, image), fields(base = %format!("0x{:08X}", self.target.base)))]
    pub fn mass_erase_and_flash<R: Read>(
        &self,
        image: FirmwareImage<R>,
    ) -> DfuResult<WriteSummary> {
        self.mass_erase()?;
        self.set_address_pointer(self.target.base)?;
        self.write_image(image)
    }

    /// Lazily read `size` bytes, labelling blocks from `base`.
    ///
    /// Each call starts again from the first block.
    pub fn read_flash(&self, size: u32, base: u32) -> FlashReader<'_, T> {
        FlashReader {
            engine: &self.engine,
            base,
            size,
            offset: 0,
            started: false,
            done: false,
        }
    }

    /// Read `size` bytes and emit each block as a hex dump. Returns the
    /// number of bytes read.
    pub fn dump_flash(&self, size: u32, base: u32) -> DfuResult<usize> {
        self.phase(DfuPhase::Idle, DfuPhase::Reading);
        let total = size.div_ceil(BLOCK_SIZE as u32) as u64;
        let mut bytes = 0;

        for (i, block) in self.read_flash(size, base).enumerate() {
            let (address, data) = self.report(DfuPhase::Reading, block)?;
            bytes += data.len();
            self.emit(DfuEvent::BlockDump {
                address,
                dump: format_hex_dump(address, &data),
            });
            self.emit(DfuEvent::Progress {
                phase: DfuPhase::Reading,
                current: i as u64 + 1,
                total,
            });
        }

        self.phase(DfuPhase::Reading, DfuPhase::Complete);
        Ok(bytes)
    }

    fn erase_inner(&self) -> DfuResult<()> {
        self.phase(DfuPhase::Idle, DfuPhase::Erasing);
        self.log(LogLevel::Info, "mass erasing...");
        self.engine.mass_erase()?;
        self.log(LogLevel::Info, "mass erase complete.");
        self.phase(DfuPhase::Erasing, DfuPhase::Idle);
        Ok(())
    }

    fn address_inner(&self, address: u32) -> DfuResult<()> {
        self.phase(DfuPhase::Idle, DfuPhase::Addressing);
        self.engine.set_address_pointer(address)?;
        self.log(
            LogLevel::Debug,
            format!("address pointer set to 0x{:08X}", address),
        );
        self.phase(DfuPhase::Addressing, DfuPhase::Idle);
        Ok(())
    }

    fn write_inner<R: Read>(&self, mut image: FirmwareImage<R>) -> DfuResult<WriteSummary> {
        self.phase(DfuPhase::Idle, DfuPhase::Writing);
        let total = image.block_count_hint().unwrap_or(0);

        let mut written = [0u8; BLOCK_SIZE];
        let mut readback = [0u8; BLOCK_SIZE];
        let mut summary = WriteSummary {
            blocks: 0,
            bytes: 0,
        };

        while let Some(len) = image.next_block(&mut written)? {
            let index = summary.blocks;
            let wire = wire_block(index).ok_or(DfuError::BlockOutOfRange { block: index })?;
            let address = self
                .target
                .block_address(index)
                .ok_or(DfuError::BlockOutOfRange { block: index })?;
            let data = &written[..len];

            self.engine.write_block(data, wire)?;
            self.engine.wait_upload_idle()?;
            let n = self.engine.read_block(&mut readback[..len], wire)?;

            if n != len || readback[..len] != *data {
                debug!(block = index, expected = len, received = n, "Read-back mismatch");
                return Err(DfuError::Verification { block: index });
            }

            self.emit(DfuEvent::BlockVerified {
                block: index,
                address,
            });
            summary.blocks += 1;
            summary.bytes += len;
            self.emit(DfuEvent::Progress {
                phase: DfuPhase::Writing,
                current: summary.blocks as u64,
                total,
            });
        }

        info!(blocks = summary.blocks, bytes = summary.bytes, "Image written and verified");
        self.phase(DfuPhase::Writing, DfuPhase::Complete);
        self.emit(DfuEvent::Complete);
        Ok(summary)
    }
}

/// Lazy, finite block reader returned by [`FlashProgrammer::read_flash`].
///
/// Yields `(address, bytes)`: full blocks, then one short remainder. A
/// block the device answers short is an error. Stops after the first error.
pub struct FlashReader<'a, T: DfuTransport> {
    engine: &'a DfuEngine<T>,
    base: u32,
    size: u32,
    offset: u32,
    started: bool,
    done: bool,
}

impl<T: DfuTransport> FlashReader<'_, T> {
    fn read_next(&mut self) -> DfuResult<(u32, Vec<u8>)> {
        if !self.started {
            self.started = true;
            self.engine.wait_upload_idle()?;
        }

        let index = (self.offset as usize) / BLOCK_SIZE;
        let wire = wire_block(index).ok_or(DfuError::BlockOutOfRange { block: index })?;
        let len = (self.size - self.offset).min(BLOCK_SIZE as u32) as usize;

        let mut buf = vec![0u8; len];
        let n = self.engine.read_block(&mut buf, wire)?;
        if n < len {
            return Err(TransportError::ShortTransfer {
                expected: len,
                actual: n,
            }
            .into());
        }

        let address = self.base.wrapping_add(self.offset);
        self.offset += len as u32;
        Ok((address, buf))
    }
}

impl<T: DfuTransport> Iterator for FlashReader<'_, T> {
    type Item = DfuResult<(u32, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.size {
            return None;
        }
        let item = self.read_next();
        if item.is_err() {
            self.done = true;
        }
        Some(item)
    }
}

/// Format bytes as 16-byte rows: `0xADDRESS: ` then hex, grouped by four.
pub fn format_hex_dump(start: u32, data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (row, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "0x{:08X}: ", start.wrapping_add(row as u32 * 16));
        for (j, byte) in chunk.iter().enumerate() {
            let _ = write!(out, "{:02x}", byte);
            if (j + 1) % 4 == 0 && j + 1 < chunk.len() {
                out.push_str("  ");
            }
        }
        out.push('\n');
    }
    out
}
