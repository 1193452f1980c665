//! STDFU-Core: STM32 USB DFU bootloader protocol in Rust.
//!
//! This crate drives the ST system-memory bootloader over the USB DFU
//! class protocol: status polling, mass erase, address pointer, block
//! download with read-back verification, and flash upload.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Request codes, device states, status decoding, STM32 commands
//! - **Transport**: Control-transfer abstraction (nusb, mock)
//! - **Engine**: One request/response transaction per operation
//! - **Programmer**: Erase, write-and-verify, read-back
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: Configuration and one open device
//!
//! # Example
//!
//! ```no_run
//! use stdfu_core::{DfuSession, FirmwareImage, SessionConfig};
//!
//! let session = DfuSession::open(SessionConfig::default())?;
//! let summary = session.flash(FirmwareImage::open("firmware.bin")?)?;
//! println!("{} blocks written", summary.blocks);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod engine;
pub mod error;
pub mod events;
pub mod image;
pub mod programmer;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use engine::{DfuEngine, EngineTimeouts};
pub use error::{DfuError, DfuResult};
pub use events::{DfuEvent, DfuObserver, DfuPhase, LogLevel, NullObserver, TracingObserver};
pub use image::FirmwareImage;
pub use programmer::{FlashProgrammer, FlashReader, FlashTarget, WriteSummary, format_hex_dump};
pub use protocol::{Command, DeviceState, DeviceStatus, StatusCode};
pub use session::{DfuSession, SessionConfig};
pub use transport::{DfuTransport, MockTransport, NusbTransport, TransportError};
