//! Compiled sketches on the host side of an upload
//!
//! A [Sketch] is the flat binary image of an Intel HEX file produced by the
//! Arduino toolchain. It knows how to split itself into the programming
//! packets the remote programmer expects.

use std::{fs::read_to_string, path::Path};

use log::debug;
use md5::{Digest, Md5};

use crate::{
    error::Error,
    packet::{encode_data, encode_flash, encode_start, StartHeader, MAX_DATA_PAYLOAD},
};

/// Largest image the size fields of the start and flash packets can describe
pub const MAX_PROGRAM_SIZE: usize = u16::MAX as usize;

const DATA_RECORD: u8 = 0x00;
const EOF_RECORD: u8 = 0x01;
const EXTENDED_SEGMENT_ADDRESS_RECORD: u8 = 0x02;
const START_SEGMENT_ADDRESS_RECORD: u8 = 0x03;
const EXTENDED_LINEAR_ADDRESS_RECORD: u8 = 0x04;
const START_LINEAR_ADDRESS_RECORD: u8 = 0x05;

/// A program image ready to be uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sketch {
    program: Vec<u8>,
}

impl Sketch {
    /// Wrap a raw binary image
    pub fn from_bytes(program: Vec<u8>) -> Result<Self, Error> {
        if program.len() > MAX_PROGRAM_SIZE {
            return Err(Error::ImageTooLarge(program.len()));
        }

        Ok(Sketch { program })
    }

    /// Read an Intel HEX file
    pub fn from_ihex_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = read_to_string(path)
            .map_err(|e| Error::FileOpenError(path.display().to_string(), e))?;

        Self::from_ihex(&text)
    }

    /// Parse Intel HEX text
    ///
    /// Only data records are used and they must describe one contiguous image
    /// starting at address zero. Extended addressing is not supported, since
    /// no supported device has more than 64 KiB of flash.
    pub fn from_ihex(text: &str) -> Result<Self, Error> {
        let mut program = Vec::new();

        for (index, line) in text.lines().enumerate() {
            let number = index + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let record = Record::parse(line, number)?;
            match record.kind {
                DATA_RECORD => {
                    if record.address as usize != program.len() {
                        return Err(Error::InvalidHex {
                            line: number,
                            reason: format!(
                                "expected address {:#06x} but was {:#06x}",
                                program.len(),
                                record.address
                            ),
                        });
                    }
                    if program.len() + record.data.len() > MAX_PROGRAM_SIZE {
                        return Err(Error::ImageTooLarge(program.len() + record.data.len()));
                    }
                    program.extend_from_slice(&record.data);
                }
                EOF_RECORD => break,
                START_SEGMENT_ADDRESS_RECORD | START_LINEAR_ADDRESS_RECORD => {}
                EXTENDED_SEGMENT_ADDRESS_RECORD | EXTENDED_LINEAR_ADDRESS_RECORD => {
                    if record.data.iter().any(|&b| b != 0) {
                        return Err(Error::InvalidHex {
                            line: number,
                            reason: "extended addressing is not supported".into(),
                        });
                    }
                }
                kind => {
                    return Err(Error::InvalidHex {
                        line: number,
                        reason: format!("unknown record type {:#04x}", kind),
                    })
                }
            }
        }

        debug!("Parsed {} byte image", program.len());

        Self::from_bytes(program)
    }

    pub fn program(&self) -> &[u8] {
        &self.program
    }

    pub fn len(&self) -> usize {
        self.program.len()
    }

    pub fn is_empty(&self) -> bool {
        self.program.is_empty()
    }

    /// MD5 digest of the image, as lowercase hex
    pub fn md5(&self) -> String {
        let digest = Md5::digest(&self.program);
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Split the image into chunks of at most `bytes_per_packet` bytes,
    /// each paired with its offset in the image
    pub fn chunks(&self, bytes_per_packet: usize) -> impl Iterator<Item = (u16, &[u8])> + '_ {
        let size = bytes_per_packet.max(1);
        self.program
            .chunks(size)
            .enumerate()
            .map(move |(i, chunk)| ((i * size) as u16, chunk))
    }

    /// Every packet of an upload: start, data in order, flash
    pub fn packets(
        &self,
        bytes_per_packet: u8,
        timeout_secs: Option<u8>,
    ) -> Result<Vec<Vec<u8>>, Error> {
        let size = bytes_per_packet.max(1) as usize;
        if size > MAX_DATA_PAYLOAD {
            return Err(Error::PayloadTooLarge(size));
        }

        let num_pages = self.program.len().div_ceil(size);
        let mut packets = Vec::with_capacity(num_pages + 2);

        packets.push(encode_start(&StartHeader {
            program_size: self.program.len() as u16,
            num_pages: num_pages as u16,
            bytes_per_page: size as u8,
            timeout_secs,
        }));
        for (address, chunk) in self.chunks(size) {
            packets.push(encode_data(address, chunk)?);
        }
        packets.push(encode_flash(self.program.len() as u16));

        Ok(packets)
    }
}

struct Record {
    kind: u8,
    address: u16,
    data: Vec<u8>,
}

impl Record {
    fn parse(line: &str, number: usize) -> Result<Self, Error> {
        let invalid = |reason: &str| Error::InvalidHex {
            line: number,
            reason: reason.into(),
        };

        let digits = line
            .strip_prefix(':')
            .ok_or_else(|| invalid("missing start code"))?;
        if !digits.is_ascii() {
            return Err(invalid("invalid hex digit"));
        }
        if digits.len() % 2 != 0 || digits.len() < 10 {
            return Err(invalid("truncated record"));
        }

        let bytes = (0..digits.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&digits[i..i + 2], 16))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| invalid("invalid hex digit"))?;

        let len = bytes[0] as usize;
        if bytes.len() != len + 5 {
            return Err(invalid("record length does not match its byte count"));
        }

        let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if sum != 0 {
            return Err(invalid("checksum mismatch"));
        }

        Ok(Record {
            kind: bytes[3],
            address: u16::from_be_bytes([bytes[1], bytes[2]]),
            data: bytes[4..4 + len].to_vec(),
        })
    }
}
