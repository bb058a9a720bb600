//! State of the upload in progress

use std::time::{Duration, Instant};

use crate::packet::StartHeader;

/// Default start of the image in the staging store; the bytes below it are
/// reserved for a header
pub const DEFAULT_STAGING_OFFSET: u32 = 16;

/// Bookkeeping for a single upload, from start packet to flash or restart
#[derive(Debug, Clone)]
pub struct ProgrammingSession {
    offset: u32,
    in_progress: bool,
    packet_count: u32,
    expected_packet_count: u32,
    program_size: u32,
    started_at: Option<Instant>,
    last_packet_at: Option<Instant>,
    write_cursor: u32,
}

impl ProgrammingSession {
    /// An idle session staging images at `offset`
    pub fn new(offset: u32) -> Self {
        ProgrammingSession {
            offset,
            in_progress: false,
            packet_count: 0,
            expected_packet_count: 0,
            program_size: 0,
            started_at: None,
            last_packet_at: None,
            write_cursor: offset,
        }
    }

    /// Return to idle; staged bytes are left where they are
    pub fn reset(&mut self) {
        *self = ProgrammingSession::new(self.offset);
    }

    /// Start a new upload described by `header`
    pub fn begin(&mut self, header: &StartHeader, now: Instant) {
        self.reset();
        self.in_progress = true;
        self.program_size = header.program_size as u32;
        self.expected_packet_count = header.num_pages as u32;
        self.started_at = Some(now);
    }

    /// Count a received data packet
    pub(crate) fn count_packet(&mut self) {
        self.packet_count += 1;
    }

    /// Move the cursor just past bytes durably written at `address`
    pub(crate) fn advance(&mut self, address: u32, len: usize) {
        self.write_cursor = address + len as u32;
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_packet_at = Some(now);
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn packet_count(&self) -> u32 {
        self.packet_count
    }

    pub fn expected_packet_count(&self) -> u32 {
        self.expected_packet_count
    }

    pub fn program_size(&self) -> u32 {
        self.program_size
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn last_packet_at(&self) -> Option<Instant> {
        self.last_packet_at
    }

    /// Store address where the next contiguous byte lands
    pub fn write_cursor(&self) -> u32 {
        self.write_cursor
    }

    /// Bytes staged so far
    pub fn staged_len(&self) -> u32 {
        self.write_cursor - self.offset
    }

    /// Whether an upload in progress has been silent for longer than
    /// `threshold`
    pub fn is_timed_out(&self, now: Instant, threshold: Duration) -> bool {
        match (self.in_progress, self.last_packet_at) {
            (true, Some(last)) => now.saturating_duration_since(last) > threshold,
            _ => false,
        }
    }
}

impl Default for ProgrammingSession {
    fn default() -> Self {
        ProgrammingSession::new(DEFAULT_STAGING_OFFSET)
    }
}
