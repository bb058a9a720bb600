//! Pulse the target device's reset line
//!
//! Optiboot only listens for a short window after the target comes out of
//! reset, so every flash operation starts with a pulse.

use std::time::Duration;

#[cfg(feature = "serialport")]
use std::thread::sleep;

#[cfg(feature = "serialport")]
use log::debug;
use serde::{Deserialize, Serialize};
#[cfg(feature = "serialport")]
use serialport::SerialPort;
use strum::{Display, VariantNames};

use crate::error::Error;

/// Default time the reset line is held low
pub const DEFAULT_ASSERT_HOLD: Duration = Duration::from_millis(200);
/// Default time to wait after releasing the reset line
pub const DEFAULT_RELEASE_HOLD: Duration = Duration::from_millis(300);

/// Some way of resetting the target device
pub trait ResetLine {
    /// Hold the target in reset for `assert`, release it and wait `release`
    fn pulse(&mut self, assert: Duration, release: Duration) -> Result<(), Error>;
}

impl<R: ResetLine + ?Sized> ResetLine for &mut R {
    fn pulse(&mut self, assert: Duration, release: Duration) -> Result<(), Error> {
        (**self).pulse(assert, release)
    }
}

impl<R: ResetLine + ?Sized> ResetLine for Box<R> {
    fn pulse(&mut self, assert: Duration, release: Duration) -> Result<(), Error> {
        (**self).pulse(assert, release)
    }
}

/// Hold times of a reset pulse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseTiming {
    /// Time the line is held low
    pub assert: Duration,
    /// Time to wait once the line is released
    pub release: Duration,
}

impl Default for PulseTiming {
    fn default() -> Self {
        PulseTiming {
            assert: DEFAULT_ASSERT_HOLD,
            release: DEFAULT_RELEASE_HOLD,
        }
    }
}

/// Modem control line wired to the target's RESET pin
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, VariantNames, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ControlLine {
    /// Data Terminal Ready, the Arduino auto-reset line
    #[default]
    Dtr,
    /// Request To Send
    Rts,
}

/// Reset through a serial adapter's modem control line
///
/// Asserting the line drives the target's RESET pin low through the auto-reset
/// capacitor.
#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
pub struct SerialReset {
    port: Box<dyn SerialPort>,
    line: ControlLine,
}

#[cfg(feature = "serialport")]
impl SerialReset {
    pub fn new(port: Box<dyn SerialPort>, line: ControlLine) -> Self {
        SerialReset { port, line }
    }

    fn set_line(&mut self, level: bool) -> Result<(), Error> {
        match self.line {
            ControlLine::Dtr => self.port.write_data_terminal_ready(level)?,
            ControlLine::Rts => self.port.write_request_to_send(level)?,
        }

        Ok(())
    }
}

#[cfg(feature = "serialport")]
impl ResetLine for SerialReset {
    fn pulse(&mut self, assert: Duration, release: Duration) -> Result<(), Error> {
        debug!(
            "Pulsing {} reset line ({}ms low, {}ms high)",
            self.line,
            assert.as_millis(),
            release.as_millis()
        );

        self.set_line(true)?; // RESET = LOW, target in reset

        sleep(assert);

        self.set_line(false)?; // RESET = HIGH, bootloader starts

        sleep(release);

        Ok(())
    }
}
