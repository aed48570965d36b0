//! Flash, verify and dump workflows.
//!
//! An [`Orchestrator`] owns the device channel for one run. [`Orchestrator::run`]
//! connects, hands a [`Session`] to the caller and always ends the session
//! afterwards, whether the workflow succeeded, failed or panicked.
//!
//! Workflows are fail-fast within a phase: the first failed write, read or
//! readback comparison ends that phase. Nothing is rolled back, rows written
//! before a failure stay written.

use core::cmp::min;
use core::convert::TryFrom;
use core::fmt::{self, Debug};

use crate::channel::{DeviceChannel, Mode};
use crate::chunk::{chunk, Chunk};
use crate::memory::{be_bytes_to_words, SparseMemory, Word, ERASED};
use crate::profile::DeviceProfile;
use crate::protocol::READ_CHUNK;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum State {
    Idle,
    Connecting,
    Connected,
    Flashing,
    Verifying,
    Dumping,
    Disconnected,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Phase {
    /// Program flash, handled in device rows
    Flash,
    /// Configuration words, handled one word at a time
    Config,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Flash => write!(f, "program flash"),
            Phase::Config => write!(f, "configuration"),
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum FailureKind<E> {
    /// The channel rejected or timed out on a command
    Channel(E),
    /// Readback differs from the data written
    Mismatch { expected: Vec<u8>, actual: Vec<u8> },
    /// The channel returned fewer bytes than requested
    ShortRead { expected: usize, received: usize },
    /// Address or length does not fit the 16-bit command fields
    OutOfRange,
}

#[derive(Clone, PartialEq, Debug)]
pub struct Failure<E> {
    pub phase: Phase,
    pub address: u32,
    pub kind: FailureKind<E>,
}

impl<E> Failure<E> {
    fn new(phase: Phase, address: u32, kind: FailureKind<E>) -> Self {
        Self {
            phase,
            address,
            kind,
        }
    }
}

fn hex_bytes(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

impl<E: Debug> fmt::Display for Failure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at 0x{:04X}: ", self.phase, self.address)?;
        match &self.kind {
            FailureKind::Channel(e) => write!(f, "command failed ({:?})", e),
            FailureKind::Mismatch { expected, actual } => write!(
                f,
                "verify failed, expected {} got {}",
                hex_bytes(expected),
                hex_bytes(actual)
            ),
            FailureKind::ShortRead { expected, received } => {
                write!(f, "short read, {} of {} bytes", received, expected)
            }
            FailureKind::OutOfRange => write!(f, "outside the addressable range"),
        }
    }
}

/// Outcome of a single workflow phase
#[derive(Clone, PartialEq, Debug)]
pub enum PhaseResult<E> {
    /// Not attempted
    Skipped,
    Ok { blocks: usize },
    Failed(Failure<E>),
}

impl<E> PhaseResult<E> {
    pub fn is_failed(&self) -> bool {
        matches!(self, PhaseResult::Failed(_))
    }

    pub fn failure(&self) -> Option<&Failure<E>> {
        match self {
            PhaseResult::Failed(f) => Some(f),
            _ => None,
        }
    }
}

/// Per-phase outcome of a flash or verify workflow
#[derive(Clone, PartialEq, Debug)]
pub struct Report<E> {
    pub flash: PhaseResult<E>,
    pub config: PhaseResult<E>,
}

impl<E> Report<E> {
    /// True when no attempted phase failed
    pub fn is_success(&self) -> bool {
        !self.flash.is_failed() && !self.config.is_failed()
    }
}

/// Memory read back by a dump, erased program words removed
#[derive(Clone, PartialEq, Debug)]
pub struct Dump<E> {
    pub memory: SparseMemory,
    /// Blocks that could not be read, these are absent from `memory`
    pub failures: Vec<Failure<E>>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError<E: Debug> {
    #[error("connection failed: {0:?}")]
    Connection(E),

    #[error("session already closed")]
    Closed,
}

/// Called after each block with the phase, blocks completed and blocks in the phase
pub type Progress = Box<dyn FnMut(Phase, usize, usize)>;

pub struct Orchestrator<C: DeviceChannel> {
    channel: C,
    profile: DeviceProfile,
    simulate: bool,
    state: State,
    progress: Option<Progress>,
}

impl<C: DeviceChannel> Orchestrator<C> {
    pub fn new(channel: C, profile: DeviceProfile) -> Self {
        Self {
            channel,
            profile,
            simulate: false,
            state: State::Idle,
            progress: None,
        }
    }

    /// Skip readback after writes, for channels that do not hold data
    pub fn simulate(mut self, simulate: bool) -> Self {
        self.simulate = simulate;
        self
    }

    pub fn on_progress<F>(&mut self, f: F)
    where
        F: FnMut(Phase, usize, usize) + 'static,
    {
        self.progress = Some(Box::new(f));
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Connect, run `f` against the session, then disconnect.
    ///
    /// Disconnection is attempted on every path including a failed handshake.
    pub fn run<T, F>(&mut self, mode: Mode, f: F) -> Result<T, SessionError<C::Error>>
    where
        F: FnOnce(&mut Session<'_, C>) -> T,
    {
        if self.state != State::Idle {
            return Err(SessionError::Closed);
        }

        self.state = State::Connecting;
        info!("Connecting ({})", mode);

        if let Err(e) = self.channel.connect(mode) {
            error!("Connection failed: {:?}", e);
            self.release();
            return Err(SessionError::Connection(e));
        }

        self.state = State::Connected;
        info!("Connected to {}", self.profile.name());

        let mut session = Session { orch: self };
        Ok(f(&mut session))
    }

    fn release(&mut self) {
        if self.state == State::Disconnected {
            return;
        }

        if let Err(e) = self.channel.disconnect() {
            warn!("Disconnect failed: {:?}", e);
        }

        self.state = State::Disconnected;
        debug!("Disconnected");
    }
}

/// A connected programming session, released on drop
pub struct Session<'a, C: DeviceChannel> {
    orch: &'a mut Orchestrator<C>,
}

impl<C: DeviceChannel> Drop for Session<'_, C> {
    fn drop(&mut self) {
        self.orch.release();
    }
}

fn device_addr<E>(phase: Phase, addr: u32) -> Result<u16, Failure<E>> {
    u16::try_from(addr).map_err(|_| Failure::new(phase, addr, FailureKind::OutOfRange))
}

fn word_count<E>(phase: Phase, addr: u32, count: usize) -> Result<u16, Failure<E>> {
    u16::try_from(count).map_err(|_| Failure::new(phase, addr, FailureKind::OutOfRange))
}

impl<'a, C: DeviceChannel> Session<'a, C> {
    pub fn state(&self) -> State {
        self.orch.state
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.orch.profile
    }

    /// Write `memory` to the device.
    ///
    /// Program rows are written then read back one at a time. Config words
    /// follow individually, only when `write_config` is set and every program
    /// row succeeded. Addresses outside both regions are ignored.
    pub fn flash(&mut self, memory: &SparseMemory, write_config: bool) -> Report<C::Error> {
        self.orch.state = State::Flashing;

        let (flash, config) = self.orch.profile.partition(memory);
        let rows = chunk(&flash, self.orch.profile.words_per_write_row());

        info!("Flashing {} program blocks", rows.len());
        let flash = self.write_chunks(Phase::Flash, &rows);

        let config = if flash.is_failed() {
            info!("Program flash failed, not writing configuration");
            PhaseResult::Skipped
        } else if !write_config || config.is_empty() {
            PhaseResult::Skipped
        } else {
            info!("Writing {} configuration words", config.len());
            self.write_chunks(Phase::Config, &chunk(&config, 1))
        };

        self.orch.state = State::Connected;

        Report { flash, config }
    }

    /// Compare device contents against `memory`.
    ///
    /// Each phase stops at its first failure. Unlike flashing, the config
    /// phase runs even when program flash fails.
    pub fn verify(&mut self, memory: &SparseMemory) -> Report<C::Error> {
        self.orch.state = State::Verifying;

        let (flash, config) = self.orch.profile.partition(memory);
        let rows = chunk(&flash, self.orch.profile.words_per_write_row());

        info!("Verifying {} program blocks", rows.len());
        let flash = self.verify_chunks(Phase::Flash, &rows);

        let config = if config.is_empty() {
            PhaseResult::Skipped
        } else {
            info!("Verifying {} configuration words", config.len());
            self.verify_chunks(Phase::Config, &chunk(&config, 1))
        };

        self.orch.state = State::Connected;

        Report { flash, config }
    }

    /// Read program flash and the config region.
    ///
    /// Erased program words are dropped, config words are kept whatever their
    /// value. Unreadable blocks are logged and skipped.
    pub fn dump(&mut self) -> Dump<C::Error> {
        self.orch.state = State::Dumping;

        let total = self.orch.profile.total_flash_words();
        let config_region = self.orch.profile.config_region();

        let mut raw = SparseMemory::new();
        let mut failures = Vec::new();

        let blocks: Vec<(u32, u32)> = (0..total)
            .step_by(READ_CHUNK as usize)
            .map(|addr| (addr, min(READ_CHUNK as u32, total - addr)))
            .collect();

        info!("Dumping 0x0000-0x{:04X}", total);

        for (i, &(addr, count)) in blocks.iter().enumerate() {
            match self.read_range(Phase::Flash, addr, count) {
                Ok(words) => raw.extend(words),
                Err(f) => {
                    warn!("Error reading {}", f);
                    failures.push(f);
                }
            }
            self.progress(Phase::Flash, i + 1, blocks.len());
        }

        match config_region {
            Some(region) if !region.is_empty() => {
                info!("Reading configuration {}", region);
                match self.read_range(Phase::Config, region.start, region.len()) {
                    Ok(words) => raw.extend(words),
                    Err(f) => {
                        warn!("Error reading {}", f);
                        failures.push(f);
                    }
                }
                self.progress(Phase::Config, 1, 1);
            }
            _ => debug!("No configuration region, skipping"),
        }

        let read = raw.len();
        let profile = &self.orch.profile;
        let memory: SparseMemory = raw
            .into_iter()
            .filter(|(addr, word)| *word != ERASED || profile.is_config(*addr))
            .collect();

        info!("Filtered {} erased words", read - memory.len());

        self.orch.state = State::Connected;

        Dump { memory, failures }
    }

    /// Write data at `addr`, reading it back unless simulating
    pub fn write_words(&mut self, addr: u16, data: &[u8]) -> Result<(), Failure<C::Error>> {
        let phase = self.phase_of(addr as u32);

        let words = be_bytes_to_words(data);
        let c = Chunk {
            base: addr as u32,
            words,
        };

        self.write_verified(phase, &c)
    }

    /// Read `count` words from `addr` in [`READ_CHUNK`] word blocks
    pub fn read_words(&mut self, addr: u32, count: u32) -> Result<Vec<Word>, Failure<C::Error>> {
        let phase = self.phase_of(addr);
        let mut words = Vec::with_capacity(count as usize);

        let mut offset = 0;
        while offset < count {
            let n = min(READ_CHUNK as u32, count - offset);
            let block = self.read_range(phase, addr + offset, n)?;
            words.extend(block.into_iter().map(|(_, w)| w));
            offset += n;
        }

        Ok(words)
    }

    pub fn write_block(&mut self, addr: u16, data: &[u8]) -> Result<(), C::Error> {
        self.orch.channel.write_block(addr, data)
    }

    pub fn read_block(&mut self, addr: u16, count: u16) -> Result<Vec<u8>, C::Error> {
        self.orch.channel.read_block(addr, count)
    }

    pub fn erase_row(&mut self, addr: u16) -> Result<(), C::Error> {
        self.orch.channel.erase_row(addr)
    }

    pub fn bulk_erase(&mut self, addr: u16) -> Result<(), C::Error> {
        self.orch.channel.bulk_erase(addr)
    }

    fn phase_of(&self, addr: u32) -> Phase {
        if self.orch.profile.is_config(addr) {
            Phase::Config
        } else {
            Phase::Flash
        }
    }

    fn progress(&mut self, phase: Phase, done: usize, total: usize) {
        if let Some(p) = self.orch.progress.as_mut() {
            p(phase, done, total);
        }
    }

    fn write_chunks(&mut self, phase: Phase, chunks: &[Chunk]) -> PhaseResult<C::Error> {
        let total = chunks.len();

        let outcome = chunks.iter().enumerate().try_for_each(|(i, c)| -> Result<(), Failure<C::Error>> {
            self.write_verified(phase, c)?;
            self.progress(phase, i + 1, total);
            Ok(())
        });

        match outcome {
            Ok(()) => PhaseResult::Ok { blocks: total },
            Err(f) => {
                error!("{}", f);
                PhaseResult::Failed(f)
            }
        }
    }

    fn verify_chunks(&mut self, phase: Phase, chunks: &[Chunk]) -> PhaseResult<C::Error> {
        let total = chunks.len();

        let outcome = chunks.iter().enumerate().try_for_each(|(i, c)| -> Result<(), Failure<C::Error>> {
            debug!("Verifying 0x{:04X} ({})", c.base, phase);
            self.compare(phase, c.base, &c.to_bytes())?;
            self.progress(phase, i + 1, total);
            Ok(())
        });

        match outcome {
            Ok(()) => PhaseResult::Ok { blocks: total },
            Err(f) => {
                error!("{}", f);
                PhaseResult::Failed(f)
            }
        }
    }

    fn write_verified(&mut self, phase: Phase, c: &Chunk) -> Result<(), Failure<C::Error>> {
        let addr = device_addr(phase, c.base)?;
        let data = c.to_bytes();

        debug!("Writing 0x{:04X} ({} words)", addr, c.len());

        self.orch
            .channel
            .write_block(addr, &data)
            .map_err(|e| Failure::new(phase, c.base, FailureKind::Channel(e)))?;

        if self.orch.simulate {
            debug!("Simulated, skipping readback");
            return Ok(());
        }

        self.compare(phase, c.base, &data)
    }

    fn compare(&mut self, phase: Phase, base: u32, expected: &[u8]) -> Result<(), Failure<C::Error>> {
        let addr = device_addr(phase, base)?;
        let count = word_count(phase, base, expected.len() / 2)?;

        let actual = self
            .orch
            .channel
            .read_block(addr, count)
            .map_err(|e| Failure::new(phase, base, FailureKind::Channel(e)))?;

        if actual != expected {
            return Err(Failure::new(
                phase,
                base,
                FailureKind::Mismatch {
                    expected: expected.to_vec(),
                    actual,
                },
            ));
        }

        Ok(())
    }

    /// Read one block, returning address / word pairs
    fn read_range(
        &mut self,
        phase: Phase,
        base: u32,
        count: u32,
    ) -> Result<Vec<(u32, Word)>, Failure<C::Error>> {
        let addr = device_addr(phase, base)?;
        let n = word_count(phase, base, count as usize)?;

        debug!("Reading 0x{:04X} ({} words)", addr, n);

        let data = self
            .orch
            .channel
            .read_block(addr, n)
            .map_err(|e| Failure::new(phase, base, FailureKind::Channel(e)))?;

        if data.len() != n as usize * 2 {
            return Err(Failure::new(
                phase,
                base,
                FailureKind::ShortRead {
                    expected: n as usize * 2,
                    received: data.len(),
                },
            ));
        }

        Ok(be_bytes_to_words(&data)
            .into_iter()
            .enumerate()
            .map(|(i, w)| (base + i as u32, w))
            .collect())
    }
}
