//! Library errors

use std::io;

use miette::Diagnostic;
use thiserror::Error;

use crate::connection::command::CommandType;

/// All possible errors returned by remote-uploader
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Error while talking to the target device")]
    #[diagnostic(transparent)]
    Connection(#[source] ConnectionError),

    #[error("Exchange with the bootloader failed")]
    #[diagnostic(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("Target did not answer the bootloader probe (expected {expected:#04x}, got {got:#04x})")]
    #[diagnostic(
        code(remote_uploader::not_a_bootloader),
        help("Verify that the reset line is wired to the target's RESET pin and that the serial lines are crossed (TX -> RX)")
    )]
    NotABootloader { expected: u8, got: u8 },

    #[error("Unrecognized device signature: {0:02x?}")]
    #[diagnostic(
        code(remote_uploader::unrecognized_signature),
        help("Supported devices are: {}", crate::bootloader::SUPPORTED_DEVICES.join(", "))
    )]
    UnrecognizedSignature([u8; 3]),

    #[error("Page read back with {got} bytes, expected {expected}")]
    #[diagnostic(code(remote_uploader::read_back_length))]
    ReadBackLength { expected: usize, got: usize },

    #[error("Verification of page at word address {word_address:#06x} failed at byte {offset}")]
    #[diagnostic(code(remote_uploader::verify_failed))]
    VerifyFailed { word_address: u16, offset: usize },

    #[error("Page of {0} bytes exceeds the maximum page size of {max}", max = crate::flasher::PAGE_SIZE)]
    #[diagnostic(code(remote_uploader::page_too_large))]
    PageTooLarge(usize),

    #[error("Malformed {control:#04x} packet: declared {declared} bytes, received {actual}")]
    #[diagnostic(code(remote_uploader::malformed_packet))]
    MalformedPacket {
        control: u8,
        declared: usize,
        actual: usize,
    },

    #[error("Data packet payload of {0} bytes does not fit the one-byte length field")]
    #[diagnostic(
        code(remote_uploader::payload_too_large),
        help("Use a smaller number of bytes per packet")
    )]
    PayloadTooLarge(usize),

    #[error("Staging store operation failed")]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error("Image of {0} bytes exceeds the maximum of {max} bytes", max = crate::sketch::MAX_PROGRAM_SIZE)]
    #[diagnostic(code(remote_uploader::image_too_large))]
    ImageTooLarge(usize),

    #[error("Invalid Intel HEX image on line {line}: {reason}")]
    #[diagnostic(code(remote_uploader::invalid_hex))]
    InvalidHex { line: usize, reason: String },

    #[error("Failed to parse configuration file")]
    #[diagnostic(code(remote_uploader::invalid_config))]
    InvalidConfig(#[from] toml::de::Error),

    #[error("Failed to open file: {0}")]
    FileOpenError(String, #[source] io::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

/// Connection-related errors
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Serial port not found")]
    #[diagnostic(
        code(remote_uploader::device_not_found),
        help("Ensure that the programmer is connected and your host recognizes the serial adapter")
    )]
    DeviceNotFound,

    #[error("Timed out waiting for the serial port")]
    #[diagnostic(code(remote_uploader::timeout))]
    Timeout,

    #[error("IO error while using the serial port: {0}")]
    #[diagnostic(code(remote_uploader::io_error))]
    Io(#[source] io::Error),

    #[cfg(feature = "serialport")]
    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(remote_uploader::serial_error))]
    Serial(#[source] serialport::Error),
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => ConnectionError::Timeout,
            io::ErrorKind::NotFound => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Io(err),
        }
    }
}

#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        use serialport::ErrorKind;

        match err.kind() {
            ErrorKind::Io(io::ErrorKind::TimedOut) => ConnectionError::Timeout,
            ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err),
        }
    }
}

/// The ways a single command/reply exchange with the bootloader can go wrong
///
/// Callers treat every kind the same; the kind only exists to make logs and
/// diagnostics useful.
#[derive(Clone, Copy, Debug, Diagnostic, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExchangeErrorKind {
    #[error("no complete reply before the timeout ({got} of {expected} bytes)")]
    #[diagnostic(code(remote_uploader::exchange::timeout))]
    Timeout { expected: usize, got: usize },

    #[error("reply had {got} bytes, expected {expected}")]
    #[diagnostic(code(remote_uploader::exchange::length))]
    UnexpectedLength { expected: usize, got: usize },

    #[error("reply did not start with STK_INSYNC (got {0:#04x})")]
    #[diagnostic(
        code(remote_uploader::exchange::not_in_sync),
        help("The bootloader lost sync; reset the target and try again")
    )]
    NotInSync(u8),

    #[error("reply did not end with STK_OK (got {0:#04x})")]
    #[diagnostic(code(remote_uploader::exchange::not_ok))]
    NotOk(u8),
}

/// A failed command/reply exchange with the bootloader
#[derive(Clone, Copy, Debug, Diagnostic, Error, PartialEq, Eq)]
#[error("Error while running {command} command")]
#[non_exhaustive]
pub struct ExchangeError {
    pub command: CommandType,
    #[source]
    #[diagnostic_source]
    pub kind: ExchangeErrorKind,
}

impl ExchangeError {
    pub fn new(command: CommandType, kind: ExchangeErrorKind) -> Self {
        ExchangeError { command, kind }
    }

    /// Whether the bootloader never answered in time
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ExchangeErrorKind::Timeout { .. })
    }
}

/// Errors raised by a staging store
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("Access of {len} bytes at {address:#06x} is outside the store capacity of {capacity} bytes")]
    #[diagnostic(code(remote_uploader::store::out_of_range))]
    OutOfRange {
        address: u32,
        len: usize,
        capacity: usize,
    },

    #[error("Failed to write {len} bytes at {address:#06x}")]
    #[diagnostic(code(remote_uploader::store::write))]
    Write {
        address: u32,
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read {len} bytes at {address:#06x}")]
    #[diagnostic(code(remote_uploader::store::read))]
    Read {
        address: u32,
        len: usize,
        #[source]
        source: io::Error,
    },
}

pub(crate) trait ResultExt {
    /// Mark the command from which this error originates
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout)) => Err(Error::Exchange(
                ExchangeError::new(command, ExchangeErrorKind::Timeout { expected: 0, got: 0 }),
            )),
            res => res,
        }
    }
}
