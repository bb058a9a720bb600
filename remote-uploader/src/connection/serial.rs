//! [Transport] and [ResetLine](super::reset::ResetLine) backed by a serial port

use std::{
    io::{Read, Write},
    time::Duration,
};

use log::debug;
use serialport::{ClearBuffer, SerialPort};

use super::{
    reset::{ControlLine, SerialReset},
    Transport,
};
use crate::error::Error;

/// Serial port timeout for a single blocking read
const READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// Wrapper around a [SerialPort] connected to the target's UART
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn new(mut port: Box<dyn SerialPort>) -> Result<Self, Error> {
        port.set_timeout(READ_TIMEOUT)?;
        Ok(SerialTransport { port })
    }

    /// Open a port by name at the given baud rate
    pub fn open(path: &str, baud: u32) -> Result<Self, Error> {
        debug!("Opening serial port {} at {} baud", path, baud);
        let port = serialport::new(path, baud).open()?;
        Self::new(port)
    }

    /// A reset line driven by one of this port's modem control lines
    pub fn reset_line(&self, line: ControlLine) -> Result<SerialReset, Error> {
        Ok(SerialReset::new(self.port.try_clone()?, line))
    }

    pub fn serial_port(&self) -> &dyn SerialPort {
        self.port.as_ref()
    }

    pub fn serial_port_mut(&mut self) -> &mut dyn SerialPort {
        self.port.as_mut()
    }

    pub fn into_serial(self) -> Box<dyn SerialPort> {
        self.port
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.port.write_all(bytes)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.port.flush()?;
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize, Error> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read_byte(&mut self) -> Result<u8, Error> {
        let mut byte = [0u8; 1];
        self.port.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), Error> {
        self.port.set_baud_rate(baud)?;
        // Whatever arrived at the old rate is garbage now
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}
