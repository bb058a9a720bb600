//! Turn programming packets into session transitions
//!
//! The [Dispatcher] owns the [ProgrammingSession] and routes every packet to
//! the staging store or the flasher, answering each one with a single
//! [ReplyCode]:
//!
//! - a start packet always begins a new upload, abandoning any previous one
//! - data packets are only accepted while an upload is in progress and must
//!   not leave a gap behind the write cursor
//! - a flash packet is only honored once exactly the announced number of
//!   bytes has been staged
//!
//! Data ahead of the cursor is accepted with a warning. The host never sends
//! it in practice, but nothing stops a reordered packet from landing ahead of
//! its predecessor; the size check on the flash packet is the only guard.

use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::{
    config::Config,
    connection::command::CommandType,
    error::Error,
    flasher::FlashTarget,
    packet::{Packet, ReplyCode, StartHeader},
    session::ProgrammingSession,
    storage::StagingStore,
};

/// Inactivity after which an upload is abandoned
pub const DEFAULT_PACKET_TIMEOUT: Duration = Duration::from_millis(5000);

/// Programming packet state machine
pub struct Dispatcher<S, F> {
    session: ProgrammingSession,
    store: S,
    flasher: F,
    packet_timeout: Duration,
}

impl<S: StagingStore, F: FlashTarget> Dispatcher<S, F> {
    pub fn new(store: S, flasher: F) -> Self {
        Self::from_config(store, flasher, &Config::default())
    }

    pub fn from_config(store: S, flasher: F, config: &Config) -> Self {
        Dispatcher {
            session: ProgrammingSession::new(config.staging_offset),
            store,
            flasher,
            packet_timeout: config.packet_timeout(),
        }
    }

    /// Handle one programming packet
    pub fn dispatch(&mut self, packet: &[u8]) -> ReplyCode {
        self.dispatch_at(packet, Instant::now())
    }

    /// Handle one programming packet received at `now`
    pub fn dispatch_at(&mut self, packet: &[u8], now: Instant) -> ReplyCode {
        let reply = self.process(packet, now);
        self.session.touch(now);

        debug!("Replying {} ({:#04x})", reply, u8::from(reply));
        reply
    }

    fn process(&mut self, bytes: &[u8], now: Instant) -> ReplyCode {
        let packet = match Packet::parse(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Discarding packet: {}", e);
                return ReplyCode::StartOver;
            }
        };

        match packet {
            Packet::Start(header) => self.start(&header, now),
            Packet::Data { address, payload } if self.session.in_progress() => {
                self.stage(address, payload)
            }
            Packet::Flash { size } if self.session.in_progress() => self.flash(size),
            Packet::Unknown(control) => {
                warn!("Unknown control code {:#04x}", control);
                ReplyCode::StartOver
            }
            _ => {
                warn!("No upload in progress, ignoring {:?}", packet);
                ReplyCode::StartOver
            }
        }
    }

    fn start(&mut self, header: &StartHeader, now: Instant) -> ReplyCode {
        if self.session.in_progress() {
            warn!(
                "New upload started while one was in progress ({} of {} bytes staged)",
                self.session.staged_len(),
                self.session.program_size()
            );
        }

        self.session.begin(header, now);
        info!(
            "Receiving {} bytes in {} packets of {} bytes",
            header.program_size, header.num_pages, header.bytes_per_page
        );
        if let Some(secs) = header.timeout_secs {
            debug!(
                "Host asked for a {}s packet timeout, using {}ms",
                secs,
                self.packet_timeout.as_millis()
            );
        }

        ReplyCode::Ok
    }

    fn stage(&mut self, address: u16, payload: &[u8]) -> ReplyCode {
        self.session.count_packet();

        let target = self.session.offset() + address as u32;
        let end = target + payload.len() as u32;
        let cursor = self.session.write_cursor();

        if end < cursor {
            warn!(
                "Data at {:#06x} ends before the write cursor {:#06x}, upload must restart",
                target, cursor
            );
            return ReplyCode::StartOver;
        } else if target < cursor {
            debug!("Rewriting retransmitted data at {:#06x}", target);
        } else if target > cursor {
            warn!(
                "Data at {:#06x} is ahead of the write cursor {:#06x}",
                target, cursor
            );
        }

        if let Err(e) = self.store.write(target, payload) {
            error!("Failed to stage {} bytes at {:#06x}: {}", payload.len(), target, e);
            return ReplyCode::StoreWriteError;
        }

        self.session.advance(target, payload.len());
        debug!(
            "Staged packet {} of {}, {} bytes so far",
            self.session.packet_count(),
            self.session.expected_packet_count(),
            self.session.staged_len()
        );

        ReplyCode::Ok
    }

    fn flash(&mut self, size: u16) -> ReplyCode {
        let size = size as u32;
        let staged = self.session.staged_len();

        if size != staged {
            warn!("Flash requested for {} bytes but {} are staged", size, staged);
            return ReplyCode::StartOver;
        }
        if size != self.session.program_size() {
            warn!(
                "Flash requested for {} bytes but the upload announced {}",
                size,
                self.session.program_size()
            );
            return ReplyCode::StartOver;
        }

        let start = self.session.offset();
        match self
            .flasher
            .flash(&mut self.store, &mut self.session, start, size)
        {
            Ok(()) => {
                self.session.reset();
                ReplyCode::Ok
            }
            Err(e) => {
                error!("Flashing failed: {}", e);
                flash_error_reply(&e)
            }
        }
    }

    /// Abandon an upload that has been silent for longer than the packet
    /// timeout, returning the code to report to the host
    pub fn check_timeout(&mut self, now: Instant) -> Option<ReplyCode> {
        if !self.session.is_timed_out(now, self.packet_timeout) {
            return None;
        }

        warn!(
            "Upload timed out after {} of {} bytes",
            self.session.staged_len(),
            self.session.program_size()
        );
        self.session.reset();

        Some(ReplyCode::Timeout)
    }

    /// Whether an upload in progress has been silent for too long
    pub fn is_timed_out(&self, now: Instant) -> bool {
        self.session.is_timed_out(now, self.packet_timeout)
    }

    /// Abandon the current upload
    pub fn reset(&mut self) {
        self.session.reset();
    }

    pub fn session(&self) -> &ProgrammingSession {
        &self.session
    }

    pub fn packet_timeout(&self) -> Duration {
        self.packet_timeout
    }

    pub fn set_packet_timeout(&mut self, timeout: Duration) {
        self.packet_timeout = timeout;
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn flasher(&self) -> &F {
        &self.flasher
    }

    pub fn flasher_mut(&mut self) -> &mut F {
        &mut self.flasher
    }

    pub fn into_parts(self) -> (S, F) {
        (self.store, self.flasher)
    }
}

/// Map a failed flash operation to the code reported to the host
pub fn flash_error_reply(err: &Error) -> ReplyCode {
    match err {
        Error::NotABootloader { .. } | Error::UnrecognizedSignature(_) => ReplyCode::NoBootloader,
        Error::Exchange(e)
            if matches!(e.command, CommandType::GetParameter | CommandType::ReadSign) =>
        {
            ReplyCode::NoBootloader
        }
        Error::Exchange(e) if e.is_timeout() => ReplyCode::BootloaderReplyTimeout,
        Error::Exchange(_) => ReplyCode::BootloaderUnexpectedReply,
        Error::VerifyFailed { .. } | Error::ReadBackLength { .. } => ReplyCode::VerifyPageError,
        Error::Store(_) => ReplyCode::StoreReadError,
        _ => ReplyCode::FlashError,
    }
}
