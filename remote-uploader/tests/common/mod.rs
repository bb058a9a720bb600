#![allow(dead_code)]

use std::{collections::VecDeque, io, time::Duration};

use remote_uploader::{
    connection::{reset::ResetLine, Transport},
    Config,
    Dispatcher,
    Error,
    Flasher,
    MemoryStore,
    StagingStore,
};

pub const ATMEGA328P: [u8; 3] = [0x1e, 0x95, 0x0f];

const INSYNC: u8 = 0x14;
const OK: u8 = 0x10;
const EOP: u8 = 0x20;

/// An Optiboot bootloader answering on the other end of the serial link
pub struct Optiboot {
    pub signature: [u8; 3],
    pub probe_reply: u8,
    /// Never answer anything
    pub silent: bool,
    /// Flip a bit in the read-back of the n-th page (zero based)
    pub corrupt_read: Option<usize>,
    pub flash: Vec<u8>,
    pub baud: Option<u32>,
    /// Every word address loaded, in order
    pub loaded: Vec<u16>,
    /// Word address of every page programmed, in order
    pub programmed: Vec<u16>,
    pub commands: Vec<u8>,
    address: u16,
    reads: usize,
    pending: Vec<u8>,
    rx: VecDeque<u8>,
}

impl Optiboot {
    pub fn new(signature: [u8; 3]) -> Self {
        Optiboot {
            signature,
            probe_reply: 0x03,
            silent: false,
            corrupt_read: None,
            flash: vec![0xff; 32 * 1024],
            baud: None,
            loaded: Vec::new(),
            programmed: Vec::new(),
            commands: Vec::new(),
            address: 0,
            reads: 0,
            pending: Vec::new(),
            rx: VecDeque::new(),
        }
    }

    fn respond(&mut self, frame: &[u8]) {
        let Some((&command, rest)) = frame.split_first() else {
            return;
        };
        self.commands.push(command);

        if self.silent || rest.last() != Some(&EOP) {
            return;
        }

        let mut reply = vec![INSYNC];
        match command {
            0x41 => reply.push(match rest[0] {
                0x81 => 8,
                0x82 => 3,
                _ => self.probe_reply,
            }),
            0x50 | 0x51 => {}
            0x55 => {
                self.address = u16::from_le_bytes([rest[0], rest[1]]);
                self.loaded.push(self.address);
            }
            0x64 => {
                let len = rest[1] as usize;
                let start = self.address as usize * 2;
                self.flash[start..start + len].copy_from_slice(&rest[3..3 + len]);
                self.programmed.push(self.address);
            }
            0x74 => {
                let len = rest[1] as usize;
                let start = self.address as usize * 2;
                let mut data = self.flash[start..start + len].to_vec();
                if self.corrupt_read == Some(self.reads) {
                    data[0] ^= 0x01;
                }
                self.reads += 1;
                reply.extend(data);
            }
            0x75 => reply.extend(self.signature),
            _ => return,
        }
        reply.push(OK);

        self.rx.extend(reply);
    }
}

impl Transport for Optiboot {
    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.pending.extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        let frame = std::mem::take(&mut self.pending);
        self.respond(&frame);
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize, Error> {
        Ok(self.rx.len())
    }

    fn read_byte(&mut self) -> Result<u8, Error> {
        self.rx
            .pop_front()
            .ok_or_else(|| io::Error::from(io::ErrorKind::TimedOut).into())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), Error> {
        self.baud = Some(baud);
        Ok(())
    }
}

/// Reset line that only records its pulses
#[derive(Debug, Default)]
pub struct RecordingReset {
    pub pulses: Vec<(Duration, Duration)>,
}

impl ResetLine for RecordingReset {
    fn pulse(&mut self, assert: Duration, release: Duration) -> Result<(), Error> {
        self.pulses.push((assert, release));
        Ok(())
    }
}

pub type Programmer<S = MemoryStore> = Dispatcher<S, Flasher<Optiboot, RecordingReset>>;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_config() -> Config {
    Config {
        reply_timeout_ms: 50,
        ..Config::default()
    }
}

pub fn programmer_with_store<S: StagingStore>(store: S, target: Optiboot) -> Programmer<S> {
    init_logger();

    let config = test_config();
    let flasher = Flasher::from_config(target, RecordingReset::default(), &config);
    Dispatcher::from_config(store, flasher, &config)
}

pub fn programmer(target: Optiboot) -> Programmer {
    programmer_with_store(MemoryStore::default(), target)
}

pub fn target<S: StagingStore>(programmer: &mut Programmer<S>) -> &mut Optiboot {
    programmer
        .flasher_mut()
        .bootloader_mut()
        .connection_mut()
        .transport_mut()
}

pub fn reset_line<S: StagingStore>(programmer: &mut Programmer<S>) -> &mut RecordingReset {
    programmer.flasher_mut().reset_line_mut()
}

/// A recognizable image of `len` bytes
pub fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31) ^ 0x5a).collect()
}
