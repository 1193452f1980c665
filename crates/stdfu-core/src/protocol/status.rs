//! GETSTATUS response decoding.
//!
//! The device answers DFU_GETSTATUS with six bytes:
//!
//! | byte | field           |
//! |------|-----------------|
//! | 0    | bStatus         |
//! | 1..4 | bwPollTimeout (24-bit LE) |
//! | 4    | bState          |
//! | 5    | iString         |
//!
//! Decoding never fails. Values outside the known tables are kept as
//! `Unknown(raw)` so a misbehaving device is still observable.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::constants::STATUS_LEN;

/// Device state (bState).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    AppIdle,
    AppDetach,
    DfuIdle,
    DownloadSync,
    DownloadBusy,
    DownloadIdle,
    ManifestSync,
    Manifest,
    ManifestWaitReset,
    UploadIdle,
    Error,
    /// STM32 read variant.
    UploadSync,
    /// STM32 read variant.
    UploadBusy,
    Unknown(u8),
}

impl DeviceState {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0x00 => Self::AppIdle,
            0x01 => Self::AppDetach,
            0x02 => Self::DfuIdle,
            0x03 => Self::DownloadSync,
            0x04 => Self::DownloadBusy,
            0x05 => Self::DownloadIdle,
            0x06 => Self::ManifestSync,
            0x07 => Self::Manifest,
            0x08 => Self::ManifestWaitReset,
            0x09 => Self::UploadIdle,
            0x0A => Self::Error,
            0x91 => Self::UploadSync,
            0x92 => Self::UploadBusy,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::AppIdle => 0x00,
            Self::AppDetach => 0x01,
            Self::DfuIdle => 0x02,
            Self::DownloadSync => 0x03,
            Self::DownloadBusy => 0x04,
            Self::DownloadIdle => 0x05,
            Self::ManifestSync => 0x06,
            Self::Manifest => 0x07,
            Self::ManifestWaitReset => 0x08,
            Self::UploadIdle => 0x09,
            Self::Error => 0x0A,
            Self::UploadSync => 0x91,
            Self::UploadBusy => 0x92,
            Self::Unknown(raw) => raw,
        }
    }

    /// Check if the device can accept another DNLOAD.
    pub fn is_download_ready(self) -> bool {
        matches!(self, Self::DfuIdle | Self::DownloadIdle)
    }

    /// Check if the device can serve another UPLOAD.
    pub fn is_upload_ready(self) -> bool {
        matches!(self, Self::DfuIdle | Self::UploadIdle)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::AppIdle => write!(f, "appIDLE"),
            DeviceState::AppDetach => write!(f, "appDETACH"),
            DeviceState::DfuIdle => write!(f, "dfuIDLE"),
            DeviceState::DownloadSync => write!(f, "dfuDNLOAD-SYNC"),
            DeviceState::DownloadBusy => write!(f, "dfuDNBUSY"),
            DeviceState::DownloadIdle => write!(f, "dfuDNLOAD-IDLE"),
            DeviceState::ManifestSync => write!(f, "dfuMANIFEST-SYNC"),
            DeviceState::Manifest => write!(f, "dfuMANIFEST"),
            DeviceState::ManifestWaitReset => write!(f, "dfuMANIFEST-WAIT-RESET"),
            DeviceState::UploadIdle => write!(f, "dfuUPLOAD-IDLE"),
            DeviceState::Error => write!(f, "dfuERROR"),
            DeviceState::UploadSync => write!(f, "dfuUPLOAD-SYNC"),
            DeviceState::UploadBusy => write!(f, "dfuUPLOAD-BUSY"),
            DeviceState::Unknown(raw) => write!(f, "unknown(0x{:02X})", raw),
        }
    }
}

/// Status code (bStatus).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    ErrTarget,
    ErrFile,
    ErrWrite,
    ErrErase,
    ErrCheckErased,
    ErrProg,
    ErrVerify,
    ErrAddress,
    ErrNotDone,
    ErrFirmware,
    ErrVendor,
    ErrUsbr,
    ErrPor,
    ErrUnknown,
    ErrStalledPkt,
    Unknown(u8),
}

impl StatusCode {
    const TABLE: [StatusCode; 16] = [
        StatusCode::Ok,
        StatusCode::ErrTarget,
        StatusCode::ErrFile,
        StatusCode::ErrWrite,
        StatusCode::ErrErase,
        StatusCode::ErrCheckErased,
        StatusCode::ErrProg,
        StatusCode::ErrVerify,
        StatusCode::ErrAddress,
        StatusCode::ErrNotDone,
        StatusCode::ErrFirmware,
        StatusCode::ErrVendor,
        StatusCode::ErrUsbr,
        StatusCode::ErrPor,
        StatusCode::ErrUnknown,
        StatusCode::ErrStalledPkt,
    ];

    pub fn from_u8(raw: u8) -> Self {
        Self::TABLE
            .get(raw as usize)
            .copied()
            .unwrap_or(StatusCode::Unknown(raw))
    }

    pub fn as_u8(self) -> u8 {
        match self {
            StatusCode::Unknown(raw) => raw,
            known => Self::TABLE
                .iter()
                .position(|&c| c == known)
                .map(|i| i as u8)
                .unwrap_or(0xFF),
        }
    }

    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Ok => "OK",
            StatusCode::ErrTarget => "errTARGET",
            StatusCode::ErrFile => "errFILE",
            StatusCode::ErrWrite => "errWRITE",
            StatusCode::ErrErase => "errERASE",
            StatusCode::ErrCheckErased => "errCHECK_ERASED",
            StatusCode::ErrProg => "errPROG",
            StatusCode::ErrVerify => "errVERIFY",
            StatusCode::ErrAddress => "errADDRESS",
            StatusCode::ErrNotDone => "errNOTDONE",
            StatusCode::ErrFirmware => "errFIRMWARE",
            StatusCode::ErrVendor => "errVENDOR",
            StatusCode::ErrUsbr => "errUSBR",
            StatusCode::ErrPor => "errPOR",
            StatusCode::ErrUnknown => "errUNKNOWN",
            StatusCode::ErrStalledPkt => "errSTALLEDPKT",
            StatusCode::Unknown(raw) => return write!(f, "unknown(0x{:02X})", raw),
        };
        f.write_str(name)
    }
}

/// Decoded GETSTATUS response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    pub status: StatusCode,
    /// Minimum wait before the next GETSTATUS. Only meaningful right after
    /// a command that starts device-side work (erase, download).
    pub poll_timeout_ms: u32,
    pub state: DeviceState,
    /// iString descriptor index, carried but not interpreted.
    pub string_index: u8,
}

impl DeviceStatus {
    pub const SIZE: usize = STATUS_LEN;

    pub fn new(status: StatusCode, poll_timeout_ms: u32, state: DeviceState) -> Self {
        Self {
            status,
            poll_timeout_ms,
            state,
            string_index: 0,
        }
    }

    /// Encode back into the wire layout. The poll timeout is truncated to
    /// 24 bits.
    pub fn to_bytes(&self) -> [u8; STATUS_LEN] {
        let mut raw = [0u8; STATUS_LEN];
        raw[0] = self.status.as_u8();
        LittleEndian::write_u24(&mut raw[1..4], self.poll_timeout_ms & 0x00FF_FFFF);
        raw[4] = self.state.as_u8();
        raw[5] = self.string_index;
        raw
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "state={} status={} poll_timeout={}ms",
            self.state, self.status, self.poll_timeout_ms
        )
    }
}

/// Decode a raw GETSTATUS response.
pub fn decode_status(raw: [u8; STATUS_LEN]) -> DeviceStatus {
    DeviceStatus {
        status: StatusCode::from_u8(raw[0]),
        poll_timeout_ms: LittleEndian::read_u24(&raw[1..4]),
        state: DeviceState::from_u8(raw[4]),
        string_index: raw[5],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_poll_timeout() {
        let status = decode_status([0, 0x10, 0x27, 0, 0x05, 0]);
        assert_eq!(status.poll_timeout_ms, 10000);
        assert_eq!(status.state, DeviceState::DownloadIdle);
        assert_eq!(status.state.as_u8(), 0x05);
        assert!(status.status.is_ok());
    }

    #[test]
    fn test_decode_all_timeout_bytes() {
        let triples = [
            (0x01, 0x00, 0x00),
            (0x00, 0x01, 0x00),
            (0x00, 0x00, 0x01),
            (0xFF, 0xFF, 0xFF),
            (0x34, 0x12, 0xAB),
        ];
        for (b1, b2, b3) in triples {
            let status = decode_status([0, b1, b2, b3, 0x02, 0]);
            let expected = b1 as u32 | (b2 as u32) << 8 | (b3 as u32) << 16;
            assert_eq!(status.poll_timeout_ms, expected);
        }
    }

    #[test]
    fn test_unknown_values_preserved() {
        let status = decode_status([0x2A, 0, 0, 0, 0x77, 3]);
        assert_eq!(status.status, StatusCode::Unknown(0x2A));
        assert_eq!(status.state, DeviceState::Unknown(0x77));
        assert_eq!(status.string_index, 3);
        assert_eq!(status.state.to_string(), "unknown(0x77)");
    }

    #[test]
    fn test_stm32_read_states() {
        assert_eq!(DeviceState::from_u8(0x91), DeviceState::UploadSync);
        assert_eq!(DeviceState::from_u8(0x92), DeviceState::UploadBusy);
        assert_eq!(DeviceState::from_u8(0x0A), DeviceState::Error);
    }

    #[test]
    fn test_status_names() {
        assert_eq!(StatusCode::from_u8(7).to_string(), "errVERIFY");
        assert_eq!(StatusCode::from_u8(15), StatusCode::ErrStalledPkt);
        assert_eq!(StatusCode::ErrStalledPkt.as_u8(), 15);
        assert_eq!(DeviceState::DownloadBusy.to_string(), "dfuDNBUSY");
    }

    #[test]
    fn test_encode_matches_layout() {
        let status = DeviceStatus::new(StatusCode::ErrErase, 0x0001_86A0, DeviceState::Error);
        assert_eq!(status.to_bytes(), [4, 0xA0, 0x86, 0x01, 0x0A, 0]);
        assert_eq!(decode_status(status.to_bytes()), status);
    }

    #[test]
    fn test_idle_sets() {
        assert!(DeviceState::DfuIdle.is_download_ready());
        assert!(DeviceState::DownloadIdle.is_download_ready());
        assert!(!DeviceState::UploadIdle.is_download_ready());
        assert!(DeviceState::UploadIdle.is_upload_ready());
        assert!(!DeviceState::Error.is_upload_ready());
    }
}
