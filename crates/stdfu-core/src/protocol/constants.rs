//! Protocol constants for the USB DFU class and the STM32 system bootloader.
//!
//! Derived from the USB DFU 1.1 class specification and ST AN3156.

// ============================================================================
// Device Identification
// ============================================================================

/// STMicroelectronics Vendor ID
pub const STM_VENDOR_ID: u16 = 0x0483;

/// STM32 system bootloader in DFU mode
pub const STM_DFU_PRODUCT_ID: u16 = 0xDF11;

/// DFU interface number (single interface bootloader)
pub const DFU_INTERFACE: u8 = 0;

// ============================================================================
// Control Request Types (bmRequestType)
// ============================================================================

/// Class request, interface recipient, host -> device
pub const DFU_REQUEST_TYPE_OUT: u8 = 0x21;

/// Class request, interface recipient, device -> host
pub const DFU_REQUEST_TYPE_IN: u8 = DFU_REQUEST_TYPE_OUT | 0x80;

// ============================================================================
// Request Codes (bRequest)
// ============================================================================

pub const DFU_DETACH: u8 = 0x00;
pub const DFU_DNLOAD: u8 = 0x01;
pub const DFU_UPLOAD: u8 = 0x02;
pub const DFU_GETSTATUS: u8 = 0x03;
pub const DFU_CLRSTATUS: u8 = 0x04;
pub const DFU_GETSTATE: u8 = 0x05;
pub const DFU_ABORT: u8 = 0x06;

/// Human-readable request name for logs.
pub fn request_name(request: u8) -> &'static str {
    match request {
        DFU_DETACH => "DETACH",
        DFU_DNLOAD => "DNLOAD",
        DFU_UPLOAD => "UPLOAD",
        DFU_GETSTATUS => "GETSTATUS",
        DFU_CLRSTATUS => "CLRSTATUS",
        DFU_GETSTATE => "GETSTATE",
        DFU_ABORT => "ABORT",
        _ => "UNKNOWN",
    }
}

// ============================================================================
// STM32 Bootloader Commands (DNLOAD with wValue = 0)
// ============================================================================

/// Set address pointer, followed by a little-endian u32 address
pub const CMD_SET_ADDRESS_POINTER: u8 = 0x21;

/// Erase; alone it means mass erase
pub const CMD_ERASE: u8 = 0x41;

/// Read unprotect (removes read protection, wipes the flash)
pub const CMD_READ_UNPROTECT: u8 = 0x92;

// ============================================================================
// Size Constants
// ============================================================================

/// wTransferSize of the STM32 bootloader
pub const BLOCK_SIZE: usize = 2048;

/// Wire block numbers 0 and 1 are reserved for commands
pub const FIRST_DATA_BLOCK: u16 = 2;

/// GETSTATUS response length
pub const STATUS_LEN: usize = 6;

/// GETSTATE response length
pub const STATE_LEN: usize = 1;

// ============================================================================
// Memory Map (STM32F405RG)
// ============================================================================

/// Base of internal flash
pub const INTERNAL_FLASH_START: u32 = 0x0800_0000;

/// Internal flash size (1 MiB)
pub const INTERNAL_FLASH_SIZE: u32 = 0x0010_0000;

/// DfuSe memory layout descriptor of the internal flash alt setting
pub const INTERNAL_FLASH_LAYOUT: &str = "@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg";

/// Base of the option bytes
pub const OPTION_BYTES_START: u32 = 0x1FFF_C000;

/// Size of the option bytes area
pub const OPTION_BYTES_SIZE: u32 = 16;

// ============================================================================
// Timeouts (milliseconds)
// ============================================================================

pub const STATUS_TIMEOUT_MS: u64 = 500;
pub const COMMAND_TIMEOUT_MS: u64 = 50;
pub const BLOCK_TIMEOUT_MS: u64 = 500;
pub const CLEAR_STATUS_TIMEOUT_MS: u64 = 5000;

/// Budget for the wait-for-idle backoff loop
pub const IDLE_WAIT_MS: u64 = 500;

/// Minimum pause between two rounds of the wait-for-idle loop
pub const IDLE_POLL_INTERVAL_MS: u64 = 5;
