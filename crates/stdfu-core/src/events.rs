//! Event system for UI decoupling.
//!
//! Allows CLI/GUI front ends to follow an operation without tight
//! coupling to the engine. Events are observational only.

use std::fmt;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Programmer phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuPhase {
    /// Nothing running.
    Idle,
    /// Mass erase in progress.
    Erasing,
    /// Setting the address pointer.
    Addressing,
    /// Writing and verifying blocks.
    Writing,
    /// Reading flash back.
    Reading,
    /// Operation finished.
    Complete,
    /// Operation aborted.
    Error,
}

impl fmt::Display for DfuPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuPhase::Idle => write!(f, "Idle"),
            DfuPhase::Erasing => write!(f, "Erasing"),
            DfuPhase::Addressing => write!(f, "Addressing"),
            DfuPhase::Writing => write!(f, "Writing"),
            DfuPhase::Reading => write!(f, "Reading"),
            DfuPhase::Complete => write!(f, "Complete"),
            DfuPhase::Error => write!(f, "Error"),
        }
    }
}

/// USB packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Transmit (Host -> Device)
    Rx, // Receive (Device -> Host)
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by the programmer and session.
#[derive(Debug, Clone)]
pub enum DfuEvent {
    /// Device opened.
    DeviceConnected { vid: u16, pid: u16, version: u16 },
    /// Device gone.
    DeviceDisconnected,
    /// Phase changed.
    PhaseChanged { from: DfuPhase, to: DfuPhase },
    /// Progress update for current operation.
    Progress {
        phase: DfuPhase,
        current: u64,
        total: u64,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// A written block read back identical.
    BlockVerified { block: usize, address: u32 },
    /// Hex dump of a block read from flash.
    BlockDump { address: u32, dump: String },
    /// Error occurred.
    Error { message: String },
    /// Control transfer sent/received.
    Packet {
        direction: PacketDirection,
        request: &'static str,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// Operation completed successfully.
    Complete,
}

impl fmt::Display for DfuEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuEvent::DeviceConnected { vid, pid, version } => write!(
                f,
                "Device {:04X}:{:04X} connected (bootloader v{:X}.{:X})",
                vid,
                pid,
                version >> 8,
                version & 0xFF
            ),
            DfuEvent::DeviceDisconnected => write!(f, "No device connected"),
            DfuEvent::PhaseChanged { to, .. } => write!(f, "{}", to),
            DfuEvent::Progress {
                phase,
                current,
                total,
            } => write!(f, "{}: {}/{}", phase, current, total),
            DfuEvent::Log { message, .. } => write!(f, "{}", message),
            DfuEvent::BlockVerified { block, address } => write!(
                f,
                "Block {} (0x{:08X}) verified successfully.",
                block, address
            ),
            DfuEvent::BlockDump { dump, .. } => write!(f, "{}", dump),
            DfuEvent::Error { message } => write!(f, "error: {}", message),
            DfuEvent::Packet {
                direction,
                request,
                length,
                ..
            } => write!(f, "{} {} ({} bytes)", direction, request, length),
            DfuEvent::Complete => write!(f, "Operation complete"),
        }
    }
}

/// Observer trait for receiving DFU events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait DfuObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &DfuEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl DfuObserver for NullObserver {
    fn on_event(&self, _event: &DfuEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl DfuObserver for TracingObserver {
    fn on_event(&self, event: &DfuEvent) {
        match event {
            DfuEvent::DeviceConnected { vid, pid, version } => {
                tracing::info!(
                    vid = %format!("{:04X}", vid),
                    pid = %format!("{:04X}", pid),
                    version = %format!("{:04X}", version),
                    "Device connected"
                );
            }
            DfuEvent::DeviceDisconnected => {
                tracing::warn!("Device disconnected");
            }
            DfuEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            DfuEvent::Progress {
                phase,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(phase = %phase, progress = %format!("{}%", pct), "Progress");
            }
            DfuEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            DfuEvent::BlockVerified { block, address } => {
                tracing::info!(block, address = %format!("0x{:08X}", address), "Block verified");
            }
            DfuEvent::BlockDump { address, dump } => {
                tracing::info!(address = %format!("0x{:08X}", address), "\n{}", dump);
            }
            DfuEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
            DfuEvent::Packet {
                direction,
                request,
                length,
                ..
            } => {
                tracing::trace!(dir = %direction, request, len = length, "USB Packet");
            }
            DfuEvent::Complete => {
                tracing::info!("Operation complete");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_lines() {
        let verified = DfuEvent::BlockVerified {
            block: 3,
            address: 0x0800_1800,
        };
        assert_eq!(
            verified.to_string(),
            "Block 3 (0x08001800) verified successfully."
        );

        let connected = DfuEvent::DeviceConnected {
            vid: 0x0483,
            pid: 0xDF11,
            version: 0x2200,
        };
        assert_eq!(
            connected.to_string(),
            "Device 0483:DF11 connected (bootloader v22.0)"
        );
    }
}
