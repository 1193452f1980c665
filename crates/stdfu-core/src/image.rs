//! Flat firmware images.
//!
//! An image is consumed strictly sequentially from any `Read` source and
//! cut into `BLOCK_SIZE` blocks; only the last block may be shorter.
//!
//! DfuSe `.dfu` containers (prefix, target and element headers) are not
//! parsed: a container handed in here is written byte for byte.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read};
use std::path::Path;

use crate::protocol::constants::{BLOCK_SIZE, FIRST_DATA_BLOCK};

/// Wire block number for an image-relative block index, if it fits.
pub fn wire_block(index: usize) -> Option<u16> {
    u16::try_from(index)
        .ok()
        .and_then(|i| i.checked_add(FIRST_DATA_BLOCK))
}

/// Firmware image read as a stream.
#[derive(Debug)]
pub struct FirmwareImage<R> {
    reader: R,
    /// Total length when the source knows it up front.
    len_hint: Option<u64>,
    blocks_read: usize,
    eof: bool,
}

impl<R: Read> FirmwareImage<R> {
    pub fn from_reader(reader: R) -> Self {
        Self {
            reader,
            len_hint: None,
            blocks_read: 0,
            eof: false,
        }
    }

    /// Attach a known total length, used for progress reporting only.
    pub fn with_len_hint(mut self, len: u64) -> Self {
        self.len_hint = Some(len);
        self
    }

    pub fn len_hint(&self) -> Option<u64> {
        self.len_hint
    }

    /// Number of blocks the image will produce, when the length is known.
    pub fn block_count_hint(&self) -> Option<u64> {
        self.len_hint.map(|len| len.div_ceil(BLOCK_SIZE as u64))
    }

    /// Blocks handed out so far.
    pub fn blocks_read(&self) -> usize {
        self.blocks_read
    }

    /// Fill `buf` with the next block. Returns its length, or `None` at the
    /// end of the stream. Short reads from the source are retried until the
    /// block is full or the source is exhausted.
    pub fn next_block(&mut self, buf: &mut [u8; BLOCK_SIZE]) -> io::Result<Option<usize>> {
        if self.eof {
            return Ok(None);
        }

        let mut filled = 0;
        while filled < BLOCK_SIZE {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if filled == 0 {
            return Ok(None);
        }
        self.blocks_read += 1;
        Ok(Some(filled))
    }
}

impl FirmwareImage<Cursor<Vec<u8>>> {
    /// In-memory image.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let len = data.len() as u64;
        Self::from_reader(Cursor::new(data)).with_len_hint(len)
    }
}

impl FirmwareImage<BufReader<File>> {
    /// Open an image file.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self::from_reader(BufReader::new(file)).with_len_hint(len))
    }
}
