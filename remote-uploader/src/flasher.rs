//! Write a staged image to the target device
//!
//! The [Flasher] resets the target, identifies its bootloader and programs the
//! image page by page straight from the [StagingStore]. The first page that
//! fails aborts the whole operation.

use std::{cmp::min, time::Instant};

use log::{debug, info, warn};

use crate::{
    bootloader::{Bootloader, BootloaderInfo},
    config::Config,
    connection::{
        reset::{PulseTiming, ResetLine},
        Connection,
        Transport,
    },
    error::Error,
    session::ProgrammingSession,
    storage::StagingStore,
};
#[cfg(feature = "serialport")]
use crate::connection::{reset::SerialReset, serial::SerialTransport};

/// Bytes written per page
pub const PAGE_SIZE: usize = 128;

/// Baud rate Optiboot listens at on 16 MHz boards
pub const DEFAULT_BOOTLOADER_BAUD: u32 = 115_200;

/// Progress update callbacks
pub trait ProgressCallbacks {
    /// Flashing of `total` bytes staged at `addr` has started
    fn init(&mut self, addr: u32, total: usize);
    /// `current` bytes have been programmed and verified
    fn update(&mut self, current: usize);
    /// Every page has been programmed
    fn finish(&mut self);
}

/// A chunk of the image bound for one flash page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Word (16-bit) address of the page on the target
    pub word_address: u16,
    pub data: heapless::Vec<u8, PAGE_SIZE>,
}

impl Page {
    /// Read the page starting at `address` from `store`
    ///
    /// `start` is where the image begins in the store; the word address is
    /// relative to it.
    pub fn read(
        store: &mut dyn StagingStore,
        start: u32,
        address: u32,
        len: usize,
    ) -> Result<Self, Error> {
        let mut buf = [0u8; PAGE_SIZE];
        let len = min(len, PAGE_SIZE);
        store.read(address, &mut buf[..len])?;

        let data = heapless::Vec::from_slice(&buf[..len]).map_err(|_| Error::PageTooLarge(len))?;

        Ok(Page {
            word_address: ((address - start) / 2) as u16,
            data,
        })
    }
}

/// Something that can write a staged image to a target device
///
/// On success the caller resets the session. Implementations reset it
/// themselves when the target could not be identified, since the upload can
/// not succeed until the wiring is fixed.
pub trait FlashTarget {
    fn flash(
        &mut self,
        store: &mut dyn StagingStore,
        session: &mut ProgrammingSession,
        start: u32,
        size: u32,
    ) -> Result<(), Error>;
}

impl<F: FlashTarget + ?Sized> FlashTarget for &mut F {
    fn flash(
        &mut self,
        store: &mut dyn StagingStore,
        session: &mut ProgrammingSession,
        start: u32,
        size: u32,
    ) -> Result<(), Error> {
        (**self).flash(store, session, start, size)
    }
}

impl<F: FlashTarget + ?Sized> FlashTarget for Box<F> {
    fn flash(
        &mut self,
        store: &mut dyn StagingStore,
        session: &mut ProgrammingSession,
        start: u32,
        size: u32,
    ) -> Result<(), Error> {
        (**self).flash(store, session, start, size)
    }
}

/// Programs a target device through its Optiboot bootloader
pub struct Flasher<T, R> {
    bootloader: Bootloader<T>,
    reset: R,
    pulse: PulseTiming,
    baud: u32,
    page_retries: u8,
    progress: Option<Box<dyn ProgressCallbacks>>,
}

impl<T: Transport, R: ResetLine> Flasher<T, R> {
    /// A flasher using the default timing and baud rate
    pub fn new(transport: T, reset: R) -> Self {
        Self::from_config(transport, reset, &Config::default())
    }

    pub fn from_config(transport: T, reset: R, config: &Config) -> Self {
        let mut connection = Connection::new(transport);
        connection.set_timeout(config.reply_timeout());

        Flasher {
            bootloader: Bootloader::new(connection),
            reset,
            pulse: config.pulse_timing(),
            baud: config.bootloader_baud,
            page_retries: config.page_retries,
            progress: None,
        }
    }

    /// Report progress of every flash operation to `progress`
    pub fn set_progress(&mut self, progress: Box<dyn ProgressCallbacks>) {
        self.progress = Some(progress);
    }

    pub fn bootloader_mut(&mut self) -> &mut Bootloader<T> {
        &mut self.bootloader
    }

    pub fn reset_line_mut(&mut self) -> &mut R {
        &mut self.reset
    }

    /// Reset the target and switch the link to the bootloader's baud rate
    pub fn reset_target(&mut self) -> Result<(), Error> {
        self.reset.pulse(self.pulse.assert, self.pulse.release)?;
        // The link runs at radio speed until the target is in reset
        self.bootloader.connection_mut().set_baud(self.baud)
    }

    /// Identify the bootloader of a freshly reset target
    pub fn handshake(&mut self) -> Result<BootloaderInfo, Error> {
        self.bootloader.handshake()
    }

    /// Program `size` bytes staged at `start` into the target
    pub fn write_image(
        &mut self,
        store: &mut dyn StagingStore,
        start: u32,
        size: u32,
    ) -> Result<(), Error> {
        self.bootloader.enter_program_mode()?;

        if let Some(cb) = self.progress.as_mut() {
            cb.init(start, size as usize)
        }

        let end = start + size;
        let mut address = start;
        while address < end {
            let len = min((end - address) as usize, PAGE_SIZE);
            let page = Page::read(store, start, address, len)?;
            self.program_page(&page)?;

            address += page.data.len() as u32;

            if let Some(cb) = self.progress.as_mut() {
                cb.update((address - start) as usize)
            }
        }

        self.bootloader.leave_program_mode()?;

        if let Some(cb) = self.progress.as_mut() {
            cb.finish()
        }

        Ok(())
    }

    fn program_page(&mut self, page: &Page) -> Result<(), Error> {
        let mut attempt = 0;
        loop {
            match self.bootloader.program_page(page.word_address, &page.data) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.page_retries => {
                    attempt += 1;
                    warn!(
                        "Page at word address {:#06x} failed ({}), retry {} of {}",
                        page.word_address, e, attempt, self.page_retries
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
impl Flasher<SerialTransport, SerialReset> {
    /// A flasher on a serial port, resetting the target through the
    /// configured modem control line
    pub fn from_serial(transport: SerialTransport, config: &Config) -> Result<Self, Error> {
        let reset = transport.reset_line(config.reset_line)?;
        Ok(Self::from_config(transport, reset, config))
    }
}

impl<T: Transport, R: ResetLine> FlashTarget for Flasher<T, R> {
    fn flash(
        &mut self,
        store: &mut dyn StagingStore,
        session: &mut ProgrammingSession,
        start: u32,
        size: u32,
    ) -> Result<(), Error> {
        let started = Instant::now();
        debug!("Flashing {} bytes staged at {:#06x}", size, start);

        self.reset_target()?;
        if let Err(e) = self.handshake() {
            warn!("Bootloader handshake failed: {}", e);
            session.reset();
            return Err(e);
        }

        self.write_image(store, start, size)?;

        info!(
            "Flashed {} bytes in {}ms",
            size,
            started.elapsed().as_millis()
        );

        Ok(())
    }
}
