//! STK500v1 client for the Optiboot bootloader
//!
//! Optiboot only implements the subset of STK500v1 needed to write flash. This
//! module speaks that subset: it identifies the bootloader and the device it
//! runs on, and writes pages with read-back verification.

use log::{debug, info, warn};
use strum::{Display, EnumIter, IntoEnumIterator, VariantNames};

use crate::{
    connection::{
        command::{Command, PARAM_PROBE, PARAM_SW_MAJOR, PARAM_SW_MINOR, UNKNOWN_PARAM_REPLY},
        Connection,
        Reply,
        Transport,
    },
    error::Error,
    flasher::PAGE_SIZE,
};

/// Names of the devices the programmer accepts
pub const SUPPORTED_DEVICES: &[&str] = <Device as VariantNames>::VARIANTS;

/// Devices whose signature the programmer accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, VariantNames)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
pub enum Device {
    Atmega168,
    Atmega328p,
    Atmega328,
}

impl Device {
    /// Three-byte signature reported by `READ_SIGN`
    pub fn signature(&self) -> [u8; 3] {
        match self {
            Device::Atmega168 => [0x1e, 0x94, 0x06],
            Device::Atmega328p => [0x1e, 0x95, 0x0f],
            Device::Atmega328 => [0x1e, 0x95, 0x14],
        }
    }

    /// Look a device up by its signature
    pub fn from_signature(signature: [u8; 3]) -> Option<Self> {
        Device::iter().find(|device| device.signature() == signature)
    }
}

/// What the handshake learned about the bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootloaderInfo {
    pub major: u8,
    pub minor: u8,
    pub device: Device,
}

/// An Optiboot bootloader on the other end of a [Connection]
pub struct Bootloader<T> {
    connection: Connection<T>,
}

impl<T: Transport> Bootloader<T> {
    pub fn new(connection: Connection<T>) -> Self {
        Bootloader { connection }
    }

    /// Identify the bootloader and the device it runs on
    ///
    /// Stale bytes are discarded first. The bootloader must answer both
    /// version queries, echo the "unknown parameter" reply for the probe and
    /// report one of the [SUPPORTED_DEVICES] signatures.
    pub fn handshake(&mut self) -> Result<BootloaderInfo, Error> {
        self.connection.drain()?;

        let major = self.get_parameter(PARAM_SW_MAJOR)?;
        let minor = self.get_parameter(PARAM_SW_MINOR)?;

        let probe = self.get_parameter(PARAM_PROBE)?;
        if probe != UNKNOWN_PARAM_REPLY {
            warn!("Unexpected reply {:#04x} to bootloader probe", probe);
            return Err(Error::NotABootloader {
                expected: UNKNOWN_PARAM_REPLY,
                got: probe,
            });
        }

        let signature = self.read_signature()?;
        let device =
            Device::from_signature(signature).ok_or(Error::UnrecognizedSignature(signature))?;

        info!(
            "Found Optiboot {}.{} on {} ({:02x?})",
            major, minor, device, signature
        );

        Ok(BootloaderInfo {
            major,
            minor,
            device,
        })
    }

    /// Read a single-byte parameter
    pub fn get_parameter(&mut self, parameter: u8) -> Result<u8, Error> {
        let reply = self
            .connection
            .exchange(Command::GetParameter { parameter })?;
        debug!("Parameter {:#04x} = {:#04x}", parameter, reply[0]);

        Ok(reply[0])
    }

    /// Read the device signature
    pub fn read_signature(&mut self) -> Result<[u8; 3], Error> {
        let reply = self.connection.exchange(Command::ReadSign)?;

        Ok([reply[0], reply[1], reply[2]])
    }

    pub fn enter_program_mode(&mut self) -> Result<(), Error> {
        self.connection.exchange(Command::EnterProgMode)?;
        Ok(())
    }

    pub fn leave_program_mode(&mut self) -> Result<(), Error> {
        self.connection.exchange(Command::LeaveProgMode)?;
        Ok(())
    }

    /// Write `data` to the flash page at `word_address` and read it back
    ///
    /// The page is only reported as programmed if every byte read back
    /// matches.
    pub fn program_page(&mut self, word_address: u16, data: &[u8]) -> Result<(), Error> {
        if data.len() > PAGE_SIZE {
            return Err(Error::PageTooLarge(data.len()));
        }

        debug!(
            "Programming {} bytes at word address {:#06x}",
            data.len(),
            word_address
        );

        self.connection
            .exchange(Command::LoadAddress { word_address })?;
        self.connection.exchange(Command::ProgPage { data })?;

        // Programming leaves the loaded address untouched
        let read_back = self.read_page(data.len() as u8)?;

        verify(word_address, data, &read_back)
    }

    /// Read `len` bytes from the current address
    pub fn read_page(&mut self, len: u8) -> Result<Reply, Error> {
        self.connection.exchange(Command::ReadPage { len })
    }

    pub fn connection(&self) -> &Connection<T> {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection<T> {
        &mut self.connection
    }

    pub fn into_connection(self) -> Connection<T> {
        self.connection
    }
}

fn verify(word_address: u16, written: &[u8], read_back: &[u8]) -> Result<(), Error> {
    if written.len() != read_back.len() {
        return Err(Error::ReadBackLength {
            expected: written.len(),
            got: read_back.len(),
        });
    }

    match written.iter().zip(read_back).position(|(w, r)| w != r) {
        Some(offset) => {
            warn!(
                "Verify failed at word address {:#06x}, byte {}: wrote {:#04x}, read {:#04x}",
                word_address, offset, written[offset], read_back[offset]
            );
            Err(Error::VerifyFailed {
                word_address,
                offset,
            })
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::connection::{
        command::{STK_INSYNC, STK_OK},
        tests::ScriptedTransport,
    };

    fn ok(data: &[u8]) -> Vec<u8> {
        let mut reply = vec![STK_INSYNC];
        reply.extend_from_slice(data);
        reply.push(STK_OK);
        reply
    }

    fn bootloader(replies: Vec<Vec<u8>>) -> Bootloader<ScriptedTransport> {
        let mut connection = Connection::new(ScriptedTransport::with_replies(replies));
        connection.set_timeout(Duration::from_millis(20));
        Bootloader::new(connection)
    }

    fn handshake_replies(probe: u8, signature: [u8; 3]) -> Vec<Vec<u8>> {
        vec![ok(&[8]), ok(&[3]), ok(&[probe]), ok(&signature)]
    }

    #[test]
    fn handshake_identifies_device() {
        let mut bootloader = bootloader(handshake_replies(0x03, [0x1e, 0x95, 0x0f]));

        let info = bootloader.handshake().unwrap();

        assert_eq!(
            info,
            BootloaderInfo {
                major: 8,
                minor: 3,
                device: Device::Atmega328p,
            }
        );
        assert_eq!(
            bootloader.connection_mut().transport_mut().frames,
            vec![
                vec![0x41, 0x81, 0x20],
                vec![0x41, 0x82, 0x20],
                vec![0x41, 0x83, 0x20],
                vec![0x75, 0x20],
            ]
        );
    }

    #[test]
    fn handshake_discards_stale_bytes() {
        let mut bootloader = bootloader(handshake_replies(0x03, [0x1e, 0x94, 0x06]));
        bootloader
            .connection_mut()
            .transport_mut()
            .rx
            .extend([0x00, 0x42]);

        assert_eq!(bootloader.handshake().unwrap().device, Device::Atmega168);
    }

    #[test]
    fn handshake_rejects_wrong_probe_reply() {
        let mut bootloader = bootloader(handshake_replies(0x00, [0x1e, 0x95, 0x0f]));

        assert!(matches!(
            bootloader.handshake(),
            Err(Error::NotABootloader {
                expected: 0x03,
                got: 0x00
            })
        ));
    }

    #[test]
    fn handshake_rejects_unknown_signature() {
        let mut bootloader = bootloader(handshake_replies(0x03, [0x1e, 0x98, 0x01]));

        assert!(matches!(
            bootloader.handshake(),
            Err(Error::UnrecognizedSignature([0x1e, 0x98, 0x01]))
        ));
    }

    #[test]
    fn signature_allow_list() {
        assert_eq!(
            Device::from_signature([0x1e, 0x95, 0x14]),
            Some(Device::Atmega328)
        );
        assert_eq!(Device::from_signature([0x1e, 0x95, 0x15]), None);
        assert_eq!(SUPPORTED_DEVICES, &["atmega168", "atmega328p", "atmega328"]);
    }

    #[test]
    fn program_page_writes_and_verifies() {
        let data = [0xaa; 8];
        let mut bootloader = bootloader(vec![ok(&[]), ok(&[]), ok(&data)]);

        bootloader.program_page(0x0040, &data).unwrap();

        let frames = &bootloader.connection_mut().transport_mut().frames;
        assert_eq!(frames[0], vec![0x55, 0x40, 0x00, 0x20]);
        assert_eq!(
            frames[1],
            [&[0x64, 0x00, 0x08, 0x46][..], &data, &[0x20]].concat()
        );
        assert_eq!(frames[2], vec![0x74, 0x00, 0x08, 0x46, 0x20]);
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn program_page_reports_first_mismatch() {
        let data = [1, 2, 3, 4];
        let mut bootloader = bootloader(vec![ok(&[]), ok(&[]), ok(&[1, 2, 0, 4])]);

        assert!(matches!(
            bootloader.program_page(0x0080, &data),
            Err(Error::VerifyFailed {
                word_address: 0x0080,
                offset: 2
            })
        ));
    }

    #[test]
    fn program_page_rejects_oversized_page() {
        let mut bootloader = bootloader(vec![]);

        assert!(matches!(
            bootloader.program_page(0, &[0; PAGE_SIZE + 1]),
            Err(Error::PageTooLarge(129))
        ));
        assert!(bootloader.connection_mut().transport_mut().tx.is_empty());
    }

    #[test]
    fn verify_checks_length() {
        assert!(matches!(
            verify(0, &[1, 2], &[1]),
            Err(Error::ReadBackLength {
                expected: 2,
                got: 1
            })
        ));
    }
}
