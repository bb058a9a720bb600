//! Commands understood by an STK500v1 (Optiboot) bootloader

use std::io::Write;

use strum::Display;

/// Start of every successful reply
pub const STK_INSYNC: u8 = 0x14;
/// End of every successful reply
pub const STK_OK: u8 = 0x10;
/// Terminates every command
pub const CRC_EOP: u8 = 0x20;

/// Major firmware version parameter
pub const PARAM_SW_MAJOR: u8 = 0x81;
/// Minor firmware version parameter
pub const PARAM_SW_MINOR: u8 = 0x82;
/// A parameter Optiboot does not know; it answers with [UNKNOWN_PARAM_REPLY]
pub const PARAM_PROBE: u8 = 0x83;
/// What Optiboot echoes for any parameter it does not understand
pub const UNKNOWN_PARAM_REPLY: u8 = 0x03;

/// Memory type marker for flash in a program/read page command ('F')
pub const MEMTYPE_FLASH: u8 = 0x46;

/// Types of commands that can be sent to the bootloader
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    GetParameter = 0x41,
    EnterProgMode = 0x50,
    LeaveProgMode = 0x51,
    LoadAddress = 0x55,
    ProgPage = 0x64,
    ReadPage = 0x74,
    ReadSign = 0x75,
}

/// Available commands
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub enum Command<'a> {
    GetParameter { parameter: u8 },
    EnterProgMode,
    LeaveProgMode,
    /// Word address, little endian on the wire
    LoadAddress { word_address: u16 },
    ProgPage { data: &'a [u8] },
    ReadPage { len: u8 },
    ReadSign,
}

impl Command<'_> {
    /// Return the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::GetParameter { .. } => CommandType::GetParameter,
            Command::EnterProgMode => CommandType::EnterProgMode,
            Command::LeaveProgMode => CommandType::LeaveProgMode,
            Command::LoadAddress { .. } => CommandType::LoadAddress,
            Command::ProgPage { .. } => CommandType::ProgPage,
            Command::ReadPage { .. } => CommandType::ReadPage,
            Command::ReadSign => CommandType::ReadSign,
        }
    }

    /// Number of data bytes the bootloader sends between `STK_INSYNC` and
    /// `STK_OK`
    pub fn reply_len(&self) -> usize {
        match self {
            Command::GetParameter { .. } => 1,
            Command::ReadPage { len } => *len as usize,
            Command::ReadSign => 3,
            _ => 0,
        }
    }

    /// Write the command, its payload and the end-of-packet marker
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&[self.command_type() as u8])?;
        match *self {
            Command::GetParameter { parameter } => {
                writer.write_all(&[parameter])?;
            }
            Command::LoadAddress { word_address } => {
                writer.write_all(&word_address.to_le_bytes())?;
            }
            Command::ProgPage { data } => {
                page_header(&mut writer, data.len() as u8)?;
                writer.write_all(data)?;
            }
            Command::ReadPage { len } => {
                page_header(&mut writer, len)?;
            }
            Command::EnterProgMode | Command::LeaveProgMode | Command::ReadSign => {}
        }
        writer.write_all(&[CRC_EOP])?;
        Ok(())
    }
}

/// Reserved zero, length, memory type
fn page_header<W: Write>(mut writer: W, len: u8) -> std::io::Result<()> {
    writer.write_all(&[0, len, MEMTYPE_FLASH])
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn encode(command: Command) -> Vec<u8> {
        let mut out = Vec::new();
        command.write(&mut out).unwrap();
        out
    }

    #[test]
    fn load_address_is_little_endian() {
        assert_eq!(
            encode(Command::LoadAddress {
                word_address: 0x00c0
            }),
            vec![0x55, 0xc0, 0x00, 0x20]
        );
    }

    #[test]
    fn prog_page_carries_header_and_data() {
        let data = [0x0c, 0x94, 0x5c, 0x00];
        assert_eq!(
            encode(Command::ProgPage { data: &data }),
            vec![0x64, 0x00, 0x04, 0x46, 0x0c, 0x94, 0x5c, 0x00, 0x20]
        );
    }

    #[test]
    fn read_page_requests_length() {
        let command = Command::ReadPage { len: 128 };
        assert_eq!(encode(command), vec![0x74, 0x00, 0x80, 0x46, 0x20]);
        assert_eq!(command.reply_len(), 128);
    }

    #[test]
    fn bare_commands() {
        assert_eq!(encode(Command::EnterProgMode), vec![0x50, 0x20]);
        assert_eq!(encode(Command::LeaveProgMode), vec![0x51, 0x20]);
        assert_eq!(encode(Command::ReadSign), vec![0x75, 0x20]);
        assert_eq!(Command::ReadSign.reply_len(), 3);
        assert_eq!(Command::EnterProgMode.reply_len(), 0);
    }
}
