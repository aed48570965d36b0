//! PIC Serial Programmer.
//!
//! Host side of a minimal byte oriented programming protocol spoken by a serial
//! bridge (typically an Arduino) wired to a PIC's ICSP pins. Firmware images are
//! exchanged as Intel HEX over a 16-bit word memory model.

use core::fmt::Debug;
use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod channel;
pub mod chunk;
pub mod hexfile;
pub mod memory;
pub mod profile;
pub mod protocol;
pub mod session;
pub mod sim;

pub use channel::{DeviceChannel, Mode, Retry};
pub use memory::{MemoryRegion, SparseMemory, Word, ERASED};
pub use profile::DeviceProfile;
pub use session::{Orchestrator, Report, Session};

use protocol::{Command, ACK};

pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError: Debug> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("negative acknowledgement (0x{0:02x})")]
    Nack(u8),

    #[error("timeout awaiting response")]
    ResponseTimeout,

    #[error("short read, expected {expected} bytes but received {received}")]
    ShortRead { expected: usize, received: usize },

    #[error("block of {0} bytes is not a valid word count")]
    InvalidLength(usize),
}

impl<SerialError: Debug> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not pulse DTR to reset the bridge on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for programmer responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "5000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for programmer responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait for the bridge to settle before starting a session
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "2000"))]
    pub init_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 5000,
            poll_delay_ms: 1,
            init_delay_ms: 2000,
        }
    }
}

pub struct Programmer<P, D, E> {
    options: Options,
    port: P,
    delay: D,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            options,
            port,
            delay,
            _err: PhantomData,
        }
    }

    /// Reset the bridge and enter programming mode
    pub fn connect(&mut self, mode: Mode) -> Result<(), Error<E>> {
        if !self.options.no_reset {
            debug!("Resetting device");

            self.port.set_dtr(true)?;
            self.delay.delay_ms(100u32);
            self.port.set_dtr(false)?;
        }

        // The bridge ignores input while it boots
        self.delay.delay_ms(self.options.init_delay_ms);

        debug!("Starting {} session", mode);

        self.command(mode.command(), &[])?;
        self.await_ack()
    }

    /// Leave programming mode
    pub fn disconnect(&mut self) -> Result<(), Error<E>> {
        debug!("Ending session");

        self.command(Command::End, &[])?;
        block!(self.port.flush())?;

        Ok(())
    }

    /// Write big-endian word data starting at `addr`
    pub fn write_block(&mut self, addr: u16, data: &[u8]) -> Result<(), Error<E>> {
        let count = word_count(data)?;

        self.command(Command::WriteBlock, &[addr, count])?;
        self.send(data)?;

        self.await_ack()
    }

    /// Read `count` words starting at `addr`, returned as big-endian bytes
    pub fn read_block(&mut self, addr: u16, count: u16) -> Result<Vec<u8>, Error<E>> {
        self.command(Command::ReadBlock, &[addr, count])?;

        let mut data = vec![0u8; count as usize * 2];
        self.read_exact(&mut data)?;

        Ok(data)
    }

    pub fn erase_row(&mut self, addr: u16) -> Result<(), Error<E>> {
        self.command(Command::EraseRow, &[addr])?;
        self.await_ack()
    }

    pub fn bulk_erase(&mut self, addr: u16) -> Result<(), Error<E>> {
        self.command(Command::BulkErase, &[addr])?;
        self.await_ack()
    }

    fn command(&mut self, command: Command, args: &[u16]) -> Result<(), Error<E>> {
        debug!("Sending {:?} {:04x?}", command, args);

        block!(self.port.write(command.opcode()))?;
        for a in args {
            self.send(&a.to_be_bytes())?;
        }

        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        Ok(())
    }

    /// Poll for a single byte, `None` on timeout
    fn read_byte(&mut self) -> Result<Option<u8>, Error<E>> {
        // Each poll counts as at least 1ms so the timeout always elapses
        let step = self.options.poll_delay_ms.max(1);
        let mut t = 0;

        loop {
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(Some(v)),
            };

            // Wait for delay period
            self.delay.delay_ms(step);
            t += step;

            if t > self.options.response_timeout_ms {
                return Ok(None);
            }
        }
    }

    fn await_ack(&mut self) -> Result<(), Error<E>> {
        match self.read_byte()? {
            Some(ACK) => {
                debug!("Received ack");
                Ok(())
            }
            Some(v) => {
                debug!("Received nack: 0x{:02x}", v);
                Err(Error::Nack(v))
            }
            None => {
                error!("Receive timeout");
                Err(Error::ResponseTimeout)
            }
        }
    }

    fn read_exact(&mut self, data: &mut [u8]) -> Result<(), Error<E>> {
        let expected = data.len();

        for (received, b) in data.iter_mut().enumerate() {
            match self.read_byte()? {
                Some(v) => *b = v,
                None => {
                    error!("Receive timeout after {} of {} bytes", received, expected);
                    return Err(Error::ShortRead { expected, received });
                }
            }
        }

        Ok(())
    }
}

fn word_count<E: Debug>(data: &[u8]) -> Result<u16, Error<E>> {
    if data.len() % 2 != 0 || data.len() / 2 > u16::MAX as usize {
        return Err(Error::InvalidLength(data.len()));
    }
    Ok((data.len() / 2) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct MockPort {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
        dtr: Vec<bool>,
        flushed: usize,
    }

    impl Read<u8> for MockPort {
        type Error = ();

        fn read(&mut self) -> nb::Result<u8, ()> {
            self.rx.pop_front().ok_or(nb::Error::WouldBlock)
        }
    }

    impl Write<u8> for MockPort {
        type Error = ();

        fn write(&mut self, word: u8) -> nb::Result<(), ()> {
            self.tx.push(word);
            Ok(())
        }

        fn flush(&mut self) -> nb::Result<(), ()> {
            self.flushed += 1;
            Ok(())
        }
    }

    impl SerialPort<()> for MockPort {
        fn set_dtr(&mut self, level: bool) -> Result<(), ()> {
            self.dtr.push(level);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockDelay {
        total_ms: u32,
    }

    impl DelayMs<u32> for MockDelay {
        fn delay_ms(&mut self, ms: u32) {
            self.total_ms += ms;
        }
    }

    fn programmer(rx: &[u8]) -> Programmer<MockPort, MockDelay, ()> {
        let port = MockPort {
            rx: rx.iter().cloned().collect(),
            ..Default::default()
        };
        let options = Options {
            response_timeout_ms: 10,
            ..Default::default()
        };
        Programmer::new(port, MockDelay::default(), options)
    }

    #[test]
    fn connect_resets_settles_and_starts_session() {
        let mut p = programmer(b"K");
        p.connect(Mode::LowVoltage).unwrap();

        assert_eq!(p.port.tx, b"l");
        assert_eq!(p.port.dtr, vec![true, false]);
        assert!(p.delay.total_ms >= 2000);

        let mut p = programmer(b"K");
        p.options.no_reset = true;
        p.connect(Mode::HighVoltage).unwrap();

        assert_eq!(p.port.tx, b"s");
        assert!(p.port.dtr.is_empty());
    }

    #[test]
    fn connect_without_ack_times_out() {
        let mut p = programmer(&[]);
        assert_eq!(p.connect(Mode::HighVoltage), Err(Error::ResponseTimeout));
    }

    #[test]
    fn zero_poll_delay_still_times_out() {
        let mut p = programmer(&[]);
        p.options.poll_delay_ms = 0;
        p.options.no_reset = true;
        p.options.init_delay_ms = 0;

        assert_eq!(p.connect(Mode::HighVoltage), Err(Error::ResponseTimeout));
        assert_eq!(p.delay.total_ms, 11);
    }

    #[test]
    fn timeout_matches_time_spent_polling() {
        let mut p = programmer(&[]);
        p.options.poll_delay_ms = 4;

        assert_eq!(p.erase_row(0), Err(Error::ResponseTimeout));
        assert_eq!(p.delay.total_ms, 12);
    }

    #[test]
    fn write_block_framing() {
        let mut p = programmer(b"K");
        p.write_block(0x0010, &[0x12, 0x34, 0xAB, 0xCD]).unwrap();

        assert_eq!(
            p.port.tx,
            vec![b'w', 0x00, 0x10, 0x00, 0x02, 0x12, 0x34, 0xAB, 0xCD]
        );
    }

    #[test]
    fn write_block_nack() {
        let mut p = programmer(b"E");
        assert_eq!(p.write_block(0, &[0, 0]), Err(Error::Nack(b'E')));
    }

    #[test]
    fn write_block_rejects_odd_length() {
        let mut p = programmer(b"K");
        assert_eq!(p.write_block(0, &[0, 0, 0]), Err(Error::InvalidLength(3)));
        assert!(p.port.tx.is_empty());
    }

    #[test]
    fn read_block_framing() {
        let mut p = programmer(&[0x3F, 0xFF, 0x12, 0x34]);
        let data = p.read_block(0x8007, 2).unwrap();

        assert_eq!(p.port.tx, vec![b'r', 0x80, 0x07, 0x00, 0x02]);
        assert_eq!(data, vec![0x3F, 0xFF, 0x12, 0x34]);
    }

    #[test]
    fn read_block_short() {
        let mut p = programmer(&[0x3F, 0xFF, 0x12]);
        assert_eq!(
            p.read_block(0, 2),
            Err(Error::ShortRead {
                expected: 4,
                received: 3
            })
        );
    }

    #[test]
    fn erase_commands() {
        let mut p = programmer(b"KK");
        p.erase_row(0x0400).unwrap();
        p.bulk_erase(protocol::BULK_ERASE_ADDR).unwrap();

        assert_eq!(p.port.tx, vec![b'e', 0x04, 0x00, b'b', 0x80, 0xFF]);
    }

    #[test]
    fn disconnect_sends_end_and_flushes() {
        let mut p = programmer(&[]);
        p.disconnect().unwrap();

        assert_eq!(p.port.tx, b"x");
        assert_eq!(p.port.flushed, 1);
    }
}
