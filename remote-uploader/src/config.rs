//! Programmer configuration
//!
//! Every protocol constant the programmer relies on can be overridden from a
//! TOML file. Missing keys fall back to the values Optiboot and the stock
//! uploader expect:
//!
//! ```toml
//! staging_offset = 16
//! bootloader_baud = 115200
//! reply_timeout_ms = 1000
//! packet_timeout_ms = 5000
//! reset_line = "dtr"
//! ```

use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
    time::Duration,
};

use directories::ProjectDirs;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    connection::{
        reset::{ControlLine, PulseTiming},
        DEFAULT_REPLY_TIMEOUT,
    },
    dispatcher::DEFAULT_PACKET_TIMEOUT,
    error::Error,
    flasher::DEFAULT_BOOTLOADER_BAUD,
    session::DEFAULT_STAGING_OFFSET,
};

const CONFIG_FILE_NAME: &str = "remote-uploader.toml";

/// Programmer configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Start of the image in the staging store
    pub staging_offset: u32,
    /// Baud rate the bootloader listens at
    pub bootloader_baud: u32,
    /// Time allowed for a complete bootloader reply
    pub reply_timeout_ms: u64,
    /// Inactivity after which an upload is abandoned
    pub packet_timeout_ms: u64,
    /// Time the reset line is held low
    pub reset_assert_ms: u64,
    /// Time to wait after releasing the reset line
    pub reset_release_ms: u64,
    /// Modem line wired to the target's reset pin, used by
    /// `Flasher::from_serial`
    pub reset_line: ControlLine,
    /// Extra attempts for a page that fails to program or verify
    pub page_retries: u8,
}

impl Default for Config {
    fn default() -> Self {
        let pulse = PulseTiming::default();

        Config {
            staging_offset: DEFAULT_STAGING_OFFSET,
            bootloader_baud: DEFAULT_BOOTLOADER_BAUD,
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT.as_millis() as u64,
            packet_timeout_ms: DEFAULT_PACKET_TIMEOUT.as_millis() as u64,
            reset_assert_ms: pulse.assert.as_millis() as u64,
            reset_release_ms: pulse.release.as_millis() as u64,
            reset_line: ControlLine::default(),
            page_retries: 0,
        }
    }
}

impl Config {
    /// Load the configuration from the user's config directory, or the
    /// defaults if there is none
    pub fn load() -> Result<Self, Error> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from_path(&path),
            _ => {
                debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load the configuration from a TOML file
    pub fn load_from_path(path: &Path) -> Result<Self, Error> {
        debug!("Loading configuration from {}", path.display());
        let data = read_to_string(path)
            .map_err(|e| Error::FileOpenError(path.display().to_string(), e))?;

        Self::from_toml(&data)
    }

    /// Parse the configuration from TOML text
    pub fn from_toml(data: &str) -> Result<Self, Error> {
        Ok(toml::from_str(data)?)
    }

    /// Location of the global configuration file
    pub fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("rs", "remote-uploader", "remote-uploader")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn packet_timeout(&self) -> Duration {
        Duration::from_millis(self.packet_timeout_ms)
    }

    pub fn pulse_timing(&self) -> PulseTiming {
        PulseTiming {
            assert: Duration::from_millis(self.reset_assert_ms),
            release: Duration::from_millis(self.reset_release_ms),
        }
    }
}
