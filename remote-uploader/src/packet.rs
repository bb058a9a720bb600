//! Programming packets exchanged with the remote host
//!
//! Every programming packet starts with the two magic bytes `EF AC`, followed
//! by a control code and the declared length of the packet (header included):
//!
//! | Control | Layout |
//! |---|---|
//! | start (`0x10`) | `EF AC 10 len sizeHi sizeLo pagesHi pagesLo bytesPerPage [timeout]` |
//! | data (`0x20`) | `EF AC 20 len addrHi addrLo payload...` |
//! | flash (`0x40`) | `EF AC 40 06 sizeHi sizeLo` |
//!
//! The host gets exactly one [ReplyCode] back for each of them.

use strum::{Display, FromRepr};

use crate::error::Error;

/// Prefix identifying a programming packet
pub const MAGIC: [u8; 2] = [0xef, 0xac];

/// Magic bytes, control code and declared length
pub const MIN_PACKET_LEN: usize = 4;
/// Header length of a start packet without the trailing timeout byte
pub const START_HEADER_LEN: usize = 9;
/// Header length of a data packet
pub const DATA_HEADER_LEN: usize = 6;
/// Header length of a flash packet
pub const FLASH_HEADER_LEN: usize = 6;

/// Largest payload a data packet can declare
pub const MAX_DATA_PAYLOAD: usize = u8::MAX as usize - DATA_HEADER_LEN;

/// Kind of programming packet
#[derive(Copy, Clone, Debug, Display, FromRepr, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCode {
    /// Start of a new upload
    ProgRequest = 0x10,
    /// A chunk of the image
    ProgData = 0x20,
    /// Image complete, program the target
    FlashStart = 0x40,
}

/// Reply sent to the host for every dispatched packet
#[derive(Copy, Clone, Debug, Display, FromRepr, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u8)]
pub enum ReplyCode {
    Ok = 0x01,
    /// Host must restart the upload (or resend the flash packet)
    StartOver = 0x02,
    /// Session expired
    Timeout = 0x03,
    StoreError = 0x80,
    StoreWriteError = 0x81,
    FlashError = 0x82,
    StoreReadError = 0xb1,
    /// Serial lines or reset line not connected
    NoBootloader = 0xc1,
    BootloaderReplyTimeout = 0xc2,
    BootloaderUnexpectedReply = 0xc3,
    VerifyPageError = 0xc4,
}

impl ReplyCode {
    pub fn is_ok(self) -> bool {
        self == ReplyCode::Ok
    }

    /// Whether the code reports a failed flash operation
    pub fn is_flash_error(self) -> bool {
        matches!(
            self,
            ReplyCode::FlashError
                | ReplyCode::StoreReadError
                | ReplyCode::NoBootloader
                | ReplyCode::BootloaderReplyTimeout
                | ReplyCode::BootloaderUnexpectedReply
                | ReplyCode::VerifyPageError
        )
    }
}

impl From<ReplyCode> for u8 {
    fn from(code: ReplyCode) -> Self {
        code as u8
    }
}

/// Header of a start packet
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StartHeader {
    /// Total image size in bytes
    pub program_size: u16,
    /// Number of data packets the host intends to send
    pub num_pages: u16,
    /// Payload bytes per data packet
    pub bytes_per_page: u8,
    /// Inactivity timeout requested by the host, in seconds
    pub timeout_secs: Option<u8>,
}

/// A parsed programming packet
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Packet<'a> {
    Start(StartHeader),
    Data { address: u16, payload: &'a [u8] },
    Flash { size: u16 },
    /// Magic bytes present but the control code is not one we know
    Unknown(u8),
}

/// Whether `packet` is addressed to the programmer at all
///
/// Anything else belongs to the application and must not be dispatched.
pub fn is_programming_packet(packet: &[u8]) -> bool {
    packet.len() >= MIN_PACKET_LEN && packet[..2] == MAGIC
}

/// Whether `packet` is a flash packet
pub fn is_flash_packet(packet: &[u8]) -> bool {
    is_programming_packet(packet) && packet[2] == ControlCode::FlashStart as u8
}

impl<'a> Packet<'a> {
    /// Parse a packet that passed [is_programming_packet]
    pub fn parse(bytes: &'a [u8]) -> Result<Self, Error> {
        if !is_programming_packet(bytes) {
            return Err(Error::MalformedPacket {
                control: bytes.get(2).copied().unwrap_or_default(),
                declared: bytes.get(3).copied().unwrap_or_default() as usize,
                actual: bytes.len(),
            });
        }

        let control = bytes[2];
        let declared = bytes[3] as usize;
        let malformed = || Error::MalformedPacket {
            control,
            declared,
            actual: bytes.len(),
        };

        let Some(code) = ControlCode::from_repr(control) else {
            return Ok(Packet::Unknown(control));
        };

        let packet = match code {
            ControlCode::ProgRequest => {
                if bytes.len() < START_HEADER_LEN {
                    return Err(malformed());
                }
                let timeout_secs = if declared > START_HEADER_LEN {
                    bytes.get(START_HEADER_LEN).copied()
                } else {
                    None
                };
                Packet::Start(StartHeader {
                    program_size: u16::from_be_bytes([bytes[4], bytes[5]]),
                    num_pages: u16::from_be_bytes([bytes[6], bytes[7]]),
                    bytes_per_page: bytes[8],
                    timeout_secs,
                })
            }
            ControlCode::ProgData => {
                if declared < DATA_HEADER_LEN || bytes.len() < declared {
                    return Err(malformed());
                }
                Packet::Data {
                    address: u16::from_be_bytes([bytes[4], bytes[5]]),
                    payload: &bytes[DATA_HEADER_LEN..declared],
                }
            }
            ControlCode::FlashStart => {
                if bytes.len() < FLASH_HEADER_LEN {
                    return Err(malformed());
                }
                Packet::Flash {
                    size: u16::from_be_bytes([bytes[4], bytes[5]]),
                }
            }
        };

        Ok(packet)
    }
}

/// Encode a start packet
pub fn encode_start(header: &StartHeader) -> Vec<u8> {
    let len = START_HEADER_LEN + header.timeout_secs.is_some() as usize;
    let mut packet = Vec::with_capacity(len);
    packet.extend_from_slice(&MAGIC);
    packet.push(ControlCode::ProgRequest as u8);
    packet.push(len as u8);
    packet.extend_from_slice(&header.program_size.to_be_bytes());
    packet.extend_from_slice(&header.num_pages.to_be_bytes());
    packet.push(header.bytes_per_page);
    packet.extend(header.timeout_secs);
    packet
}

/// Encode a data packet carrying `payload` for image offset `address`
pub fn encode_data(address: u16, payload: &[u8]) -> Result<Vec<u8>, Error> {
    if payload.len() > MAX_DATA_PAYLOAD {
        return Err(Error::PayloadTooLarge(payload.len()));
    }

    let mut packet = Vec::with_capacity(DATA_HEADER_LEN + payload.len());
    packet.extend_from_slice(&MAGIC);
    packet.push(ControlCode::ProgData as u8);
    packet.push((DATA_HEADER_LEN + payload.len()) as u8);
    packet.extend_from_slice(&address.to_be_bytes());
    packet.extend_from_slice(payload);
    Ok(packet)
}

/// Encode a flash packet declaring the total image size
pub fn encode_flash(size: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(FLASH_HEADER_LEN);
    packet.extend_from_slice(&MAGIC);
    packet.push(ControlCode::FlashStart as u8);
    packet.push(FLASH_HEADER_LEN as u8);
    packet.extend_from_slice(&size.to_be_bytes());
    packet
}
