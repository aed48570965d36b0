//! Device channel abstraction used by the programming workflows

use core::fmt::{self, Debug};

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::Command;
use crate::{Error, Programmer, SerialPort};

/// Programming entry mode
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Mode {
    HighVoltage,
    LowVoltage,
}

impl Mode {
    pub fn command(self) -> Command {
        match self {
            Mode::HighVoltage => Command::StartHighVoltage,
            Mode::LowVoltage => Command::StartLowVoltage,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::HighVoltage => write!(f, "HVP"),
            Mode::LowVoltage => write!(f, "LVP"),
        }
    }
}

/// Synchronous request / response link to a programmer.
///
/// Every call blocks until the device answers or times out, a timeout being
/// reported as an error like any negative acknowledgement.
pub trait DeviceChannel {
    type Error: Debug;

    fn connect(&mut self, mode: Mode) -> Result<(), Self::Error>;

    fn disconnect(&mut self) -> Result<(), Self::Error>;

    /// Write big-endian word data starting at word address `addr`
    fn write_block(&mut self, addr: u16, data: &[u8]) -> Result<(), Self::Error>;

    /// Read `count` words from `addr` as big-endian bytes
    fn read_block(&mut self, addr: u16, count: u16) -> Result<Vec<u8>, Self::Error>;

    fn erase_row(&mut self, addr: u16) -> Result<(), Self::Error>;

    fn bulk_erase(&mut self, addr: u16) -> Result<(), Self::Error>;
}

impl<P, D, E> DeviceChannel for Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    type Error = Error<E>;

    fn connect(&mut self, mode: Mode) -> Result<(), Self::Error> {
        Programmer::connect(self, mode)
    }

    fn disconnect(&mut self) -> Result<(), Self::Error> {
        Programmer::disconnect(self)
    }

    fn write_block(&mut self, addr: u16, data: &[u8]) -> Result<(), Self::Error> {
        Programmer::write_block(self, addr, data)
    }

    fn read_block(&mut self, addr: u16, count: u16) -> Result<Vec<u8>, Self::Error> {
        Programmer::read_block(self, addr, count)
    }

    fn erase_row(&mut self, addr: u16) -> Result<(), Self::Error> {
        Programmer::erase_row(self, addr)
    }

    fn bulk_erase(&mut self, addr: u16) -> Result<(), Self::Error> {
        Programmer::bulk_erase(self, addr)
    }
}

/// Bounded retry wrapper around a channel.
///
/// Block commands are attempted up to `attempts` times, session commands are
/// passed through once.
pub struct Retry<C> {
    inner: C,
    attempts: usize,
}

impl<C: DeviceChannel> Retry<C> {
    pub fn new(inner: C, attempts: usize) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }

    fn retry<T>(
        &mut self,
        what: &str,
        addr: u16,
        mut f: impl FnMut(&mut C) -> Result<T, C::Error>,
    ) -> Result<T, C::Error> {
        let mut attempt = 1;
        loop {
            match f(&mut self.inner) {
                Err(e) if attempt < self.attempts => {
                    warn!(
                        "{} at 0x{:04X} failed ({:?}), attempt {} of {}",
                        what, addr, e, attempt, self.attempts
                    );
                    attempt += 1;
                }
                r => return r,
            }
        }
    }
}

impl<C: DeviceChannel> DeviceChannel for Retry<C> {
    type Error = C::Error;

    fn connect(&mut self, mode: Mode) -> Result<(), Self::Error> {
        self.inner.connect(mode)
    }

    fn disconnect(&mut self) -> Result<(), Self::Error> {
        self.inner.disconnect()
    }

    fn write_block(&mut self, addr: u16, data: &[u8]) -> Result<(), Self::Error> {
        self.retry("Write", addr, |c| c.write_block(addr, data))
    }

    fn read_block(&mut self, addr: u16, count: u16) -> Result<Vec<u8>, Self::Error> {
        self.retry("Read", addr, |c| c.read_block(addr, count))
    }

    fn erase_row(&mut self, addr: u16) -> Result<(), Self::Error> {
        self.retry("Erase", addr, |c| c.erase_row(addr))
    }

    fn bulk_erase(&mut self, addr: u16) -> Result<(), Self::Error> {
        self.retry("Bulk erase", addr, |c| c.bulk_erase(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Simulator;

    #[test]
    fn retry_recovers_from_transient_nack() {
        let mut sim = Simulator::new();
        sim.fail_writes_at(&[0]);

        let mut c = Retry::new(sim, 3);
        c.write_block(0x10, &[0x12, 0x34]).unwrap();

        assert_eq!(c.inner().writes(), 2);
        assert_eq!(c.inner().word(0x10), 0x1234);
    }

    #[test]
    fn retry_gives_up_after_attempts() {
        let mut sim = Simulator::new();
        sim.fail_writes_at(&[0, 1, 2]);

        let mut c = Retry::new(sim, 2);
        assert!(c.write_block(0x10, &[0x12, 0x34]).is_err());
        assert_eq!(c.inner().writes(), 2);
    }

    #[test]
    fn single_attempt_passes_through() {
        let mut sim = Simulator::new();
        sim.fail_writes_at(&[0]);

        let mut c = Retry::new(sim, 0);
        assert!(c.write_block(0, &[0, 0]).is_err());
        assert_eq!(c.into_inner().writes(), 1);
    }
}
