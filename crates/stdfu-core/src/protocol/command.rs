//! STM32 bootloader command payloads.
//!
//! Commands travel as DNLOAD requests on wire block 0.

use byteorder::{ByteOrder, LittleEndian};

use super::constants::{CMD_ERASE, CMD_READ_UNPROTECT, CMD_SET_ADDRESS_POINTER};

/// Command sent on DNLOAD block 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Erase the whole flash.
    MassErase,
    /// Move the device's address pointer.
    SetAddressPointer(u32),
    /// Remove read protection. Wipes the flash and resets the device.
    ReadUnprotect,
}

impl Command {
    /// Operation name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Command::MassErase => "mass erase",
            Command::SetAddressPointer(_) => "set address pointer",
            Command::ReadUnprotect => "read unprotect",
        }
    }

    /// Encode the command payload.
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Command::MassErase => vec![CMD_ERASE],
            Command::SetAddressPointer(address) => {
                let mut buf = vec![CMD_SET_ADDRESS_POINTER, 0, 0, 0, 0];
                LittleEndian::write_u32(&mut buf[1..], address);
                buf
            }
            Command::ReadUnprotect => vec![CMD_READ_UNPROTECT],
        }
    }

    /// Parse a payload received on block 0.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        match payload {
            [CMD_ERASE] => Some(Command::MassErase),
            [CMD_SET_ADDRESS_POINTER, rest @ ..] if rest.len() == 4 => {
                Some(Command::SetAddressPointer(LittleEndian::read_u32(rest)))
            }
            [CMD_READ_UNPROTECT] => Some(Command::ReadUnprotect),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mass_erase_payload() {
        assert_eq!(Command::MassErase.encode(), vec![0x41]);
    }

    #[test]
    fn test_set_address_payload() {
        let payload = Command::SetAddressPointer(0x0800_4000).encode();
        assert_eq!(payload, vec![0x21, 0x00, 0x40, 0x00, 0x08]);
        assert_eq!(
            Command::decode(&payload),
            Some(Command::SetAddressPointer(0x0800_4000))
        );
    }

    #[test]
    fn test_read_unprotect_payload() {
        assert_eq!(Command::ReadUnprotect.encode(), vec![0x92]);
    }

    #[test]
    fn test_decode_rejects_page_erase() {
        // Erase with an address is a page erase, which this tool never sends.
        assert_eq!(Command::decode(&[0x41, 0, 0, 0, 0x08]), None);
        assert_eq!(Command::decode(&[]), None);
    }
}
