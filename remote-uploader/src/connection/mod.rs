//! Talk to the target device's bootloader
//!
//! The [Connection] struct abstracts over the serial link to the target and
//! the STK500 command/reply framing, and exposes a single [Connection::exchange]
//! operation to the higher layers.

use std::{
    thread::sleep,
    time::{Duration, Instant},
};

use log::{debug, trace, warn};

use self::command::{Command, CommandType, STK_INSYNC, STK_OK};
use crate::{
    error::{Error, ExchangeError, ExchangeErrorKind, ResultExt},
    flasher::PAGE_SIZE,
};

pub mod command;
pub mod reset;
#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
pub mod serial;

/// Largest reply the bootloader sends: a full page framed by
/// `STK_INSYNC`/`STK_OK`
pub const MAX_REPLY_LEN: usize = PAGE_SIZE + 2;

/// Data portion of a bootloader reply
pub type Reply = heapless::Vec<u8, MAX_REPLY_LEN>;

/// Poll interval while waiting for reply bytes
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A byte-oriented, half-duplex serial channel to the target device
pub trait Transport {
    /// Queue bytes for transmission
    fn write(&mut self, bytes: &[u8]) -> Result<(), Error>;

    /// Block until every queued byte has been transmitted
    fn flush(&mut self) -> Result<(), Error>;

    /// Number of received bytes that can be read without blocking
    fn bytes_available(&mut self) -> Result<usize, Error>;

    /// Read a single received byte, blocking until one arrives
    fn read_byte(&mut self) -> Result<u8, Error>;

    /// Reconfigure the line speed
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), Error>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        (**self).write(bytes)
    }

    fn flush(&mut self) -> Result<(), Error> {
        (**self).flush()
    }

    fn bytes_available(&mut self) -> Result<usize, Error> {
        (**self).bytes_available()
    }

    fn read_byte(&mut self) -> Result<u8, Error> {
        (**self).read_byte()
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), Error> {
        (**self).set_baud_rate(baud)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        (**self).write(bytes)
    }

    fn flush(&mut self) -> Result<(), Error> {
        (**self).flush()
    }

    fn bytes_available(&mut self) -> Result<usize, Error> {
        (**self).bytes_available()
    }

    fn read_byte(&mut self) -> Result<u8, Error> {
        (**self).read_byte()
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), Error> {
        (**self).set_baud_rate(baud)
    }
}

/// An established link with a target device's bootloader
pub struct Connection<T> {
    transport: T,
    timeout: Duration,
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T) -> Self {
        Connection {
            transport,
            timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    /// Set the time allowed for a complete reply to arrive
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Time allowed for a complete reply to arrive
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Set baud rate for the serial link
    pub fn set_baud(&mut self, speed: u32) -> Result<(), Error> {
        debug!("Switching link to {} baud", speed);
        self.transport.set_baud_rate(speed)
    }

    /// Discard everything waiting on the channel, returning the number of
    /// bytes thrown away
    ///
    /// Gives up after the reply timeout if the target keeps sending.
    pub fn drain(&mut self) -> Result<usize, Error> {
        let start = Instant::now();
        let mut count = 0;
        while self.transport.bytes_available()? > 0 {
            if start.elapsed() >= self.timeout {
                warn!(
                    "Target still sending after {}ms, stopped draining",
                    self.timeout.as_millis()
                );
                break;
            }
            self.transport.read_byte()?;
            count += 1;
        }

        if count > 0 {
            debug!("Discarded {} stale bytes", count);
        }

        Ok(count)
    }

    /// Write a command to the link
    pub fn write_command(&mut self, command: Command<'_>) -> Result<(), Error> {
        debug!("Writing command: {:?}", command.command_type());

        let mut frame = Vec::with_capacity(MAX_REPLY_LEN + 4);
        command.write(&mut frame)?;
        trace!("send -> {:02x?}", frame);

        self.transport.write(&frame)?;
        self.transport.flush()?;
        Ok(())
    }

    /// Write a command and read its reply
    ///
    /// Exactly `command.reply_len() + 2` bytes must arrive before the timeout.
    /// Anything still on the channel afterwards is discarded. On success the
    /// reply is returned without its `STK_INSYNC`/`STK_OK` framing.
    pub fn exchange(&mut self, command: Command<'_>) -> Result<Reply, Error> {
        let ty = command.command_type();
        self.write_command(command).for_command(ty)?;

        let expected = command.reply_len() + 2;
        let raw = self.read_reply(ty, expected).for_command(ty)?;
        trace!("reply <- {:02x?}", raw);

        let first = raw[0];
        let last = raw[raw.len() - 1];

        if first != STK_INSYNC {
            return Err(ExchangeError::new(ty, ExchangeErrorKind::NotInSync(first)).into());
        }
        if last != STK_OK {
            return Err(ExchangeError::new(ty, ExchangeErrorKind::NotOk(last)).into());
        }

        // Capacity of the stripped reply always fits the raw one
        let reply = Reply::from_slice(&raw[1..raw.len() - 1]).map_err(|_| {
            ExchangeError::new(
                ty,
                ExchangeErrorKind::UnexpectedLength {
                    expected,
                    got: raw.len(),
                },
            )
        })?;

        Ok(reply)
    }

    fn read_reply(&mut self, ty: CommandType, expected: usize) -> Result<Reply, Error> {
        if expected > MAX_REPLY_LEN {
            return Err(ExchangeError::new(
                ty,
                ExchangeErrorKind::UnexpectedLength {
                    expected,
                    got: 0,
                },
            )
            .into());
        }

        let mut raw = Reply::new();
        let start = Instant::now();

        while raw.len() < expected {
            if start.elapsed() >= self.timeout {
                warn!(
                    "Timed out waiting for {} reply, got {} of {} bytes",
                    ty,
                    raw.len(),
                    expected
                );
                if let Err(e) = self.drain() {
                    debug!("Failed to drain link after timeout: {}", e);
                }

                return Err(ExchangeError::new(
                    ty,
                    ExchangeErrorKind::Timeout {
                        expected,
                        got: raw.len(),
                    },
                )
                .into());
            }

            if self.transport.bytes_available()? > 0 {
                let byte = self.transport.read_byte()?;
                raw.push(byte).map_err(|_| {
                    ExchangeError::new(
                        ty,
                        ExchangeErrorKind::UnexpectedLength {
                            expected,
                            got: MAX_REPLY_LEN + 1,
                        },
                    )
                })?;
            } else {
                sleep(POLL_INTERVAL);
            }
        }

        self.drain()?;

        Ok(raw)
    }

    /// Borrow the underlying transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Turn the connection back into its transport
    pub fn into_transport(self) -> T {
        self.transport
    }
}

/// Default time allowed for a complete reply
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(1000);

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use pretty_assertions::assert_eq;

    use super::*;

    /// Transport that hands out one canned reply per flushed command
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        pub replies: VecDeque<Vec<u8>>,
        pub rx: VecDeque<u8>,
        pub tx: Vec<u8>,
        pub frames: Vec<Vec<u8>>,
        pub baud: Option<u32>,
        /// Keep sending this byte forever
        pub chatter: Option<u8>,
        /// Fail every query of the receive buffer
        pub broken: bool,
        pending: Vec<u8>,
    }

    impl ScriptedTransport {
        pub fn with_replies<I>(replies: I) -> Self
        where
            I: IntoIterator<Item = Vec<u8>>,
        {
            ScriptedTransport {
                replies: replies.into_iter().collect(),
                ..Default::default()
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
            self.tx.extend_from_slice(bytes);
            self.pending.extend_from_slice(bytes);
            Ok(())
        }

        fn flush(&mut self) -> Result<(), Error> {
            self.frames.push(std::mem::take(&mut self.pending));
            if let Some(reply) = self.replies.pop_front() {
                self.rx.extend(reply);
            }
            Ok(())
        }

        fn bytes_available(&mut self) -> Result<usize, Error> {
            if self.broken {
                return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe).into());
            }
            Ok(self.rx.len() + self.chatter.map_or(0, |_| 1))
        }

        fn read_byte(&mut self) -> Result<u8, Error> {
            self.rx
                .pop_front()
                .or(self.chatter)
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::TimedOut).into())
        }

        fn set_baud_rate(&mut self, baud: u32) -> Result<(), Error> {
            self.baud = Some(baud);
            Ok(())
        }
    }

    fn connection(replies: Vec<Vec<u8>>) -> Connection<ScriptedTransport> {
        let mut connection = Connection::new(ScriptedTransport::with_replies(replies));
        connection.set_timeout(Duration::from_millis(20));
        connection
    }

    #[test]
    fn exchange_strips_framing() {
        let mut connection = connection(vec![vec![STK_INSYNC, 0x1e, 0x95, 0x0f, STK_OK]]);

        let reply = connection.exchange(Command::ReadSign).unwrap();

        assert_eq!(reply.as_slice(), &[0x1e, 0x95, 0x0f]);
        assert_eq!(connection.transport_mut().tx, vec![0x75, 0x20]);
    }

    #[test]
    fn exchange_discards_trailing_bytes() {
        let mut connection = connection(vec![
            vec![STK_INSYNC, STK_OK, 0xaa, 0xbb],
            vec![STK_INSYNC, STK_OK],
        ]);

        connection.exchange(Command::EnterProgMode).unwrap();
        assert!(connection.transport_mut().rx.is_empty());

        // The leftovers must not be mistaken for the next reply
        connection.exchange(Command::LeaveProgMode).unwrap();
    }

    #[test]
    fn exchange_times_out_on_short_reply() {
        let mut connection = connection(vec![vec![STK_INSYNC, 0x1e]]);

        let err = connection.exchange(Command::ReadSign).unwrap_err();

        match err {
            Error::Exchange(e) => {
                assert_eq!(e.command, CommandType::ReadSign);
                assert_eq!(
                    e.kind,
                    ExchangeErrorKind::Timeout {
                        expected: 5,
                        got: 2
                    }
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn exchange_rejects_missing_insync() {
        let mut connection = connection(vec![vec![0x00, 0x10]]);

        let err = connection.exchange(Command::EnterProgMode).unwrap_err();

        assert!(matches!(
            err,
            Error::Exchange(ExchangeError {
                kind: ExchangeErrorKind::NotInSync(0x00),
                ..
            })
        ));
    }

    #[test]
    fn exchange_rejects_missing_ok() {
        let mut connection = connection(vec![vec![STK_INSYNC, 0x03, 0x11]]);

        let err = connection
            .exchange(Command::GetParameter { parameter: 0x81 })
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Exchange(ExchangeError {
                kind: ExchangeErrorKind::NotOk(0x11),
                ..
            })
        ));
    }

    #[test]
    fn drain_empties_channel() {
        let mut connection = connection(vec![]);
        connection.transport_mut().rx.extend([1, 2, 3]);

        assert_eq!(connection.drain().unwrap(), 3);
        assert_eq!(connection.drain().unwrap(), 0);
    }

    #[test]
    fn drain_gives_up_on_chattering_target() {
        let mut connection = connection(vec![]);
        connection.transport_mut().chatter = Some(0x55);

        let started = Instant::now();
        let count = connection.drain().unwrap();

        assert!(count > 0);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn timeout_survives_failed_drain() {
        let mut connection = connection(vec![]);
        connection.set_timeout(Duration::ZERO);
        connection.transport_mut().broken = true;

        let err = connection.exchange(Command::ReadSign).unwrap_err();

        assert!(matches!(
            err,
            Error::Exchange(ExchangeError {
                command: CommandType::ReadSign,
                kind: ExchangeErrorKind::Timeout {
                    expected: 5,
                    got: 0
                },
            })
        ));
    }
}
