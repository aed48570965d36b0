//! In-memory programmer, used for dry runs and testing.
//!
//! Writes are stored and echoed back by subsequent reads, un-written cells read
//! as [`ERASED`]. Individual commands can be made to fail and cells can be made
//! to read back a fixed value to exercise failure paths.

use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;

use crate::channel::{DeviceChannel, Mode};
use crate::memory::{be_bytes_to_words, words_to_be_bytes, SparseMemory, Word, ERASED};
use crate::Error;

/// Negative acknowledgement byte reported for injected failures
pub const SIM_NACK: u8 = b'N';

/// Commands observed by the simulator, in order
#[derive(Clone, PartialEq, Debug)]
pub enum Op {
    Connect(Mode),
    Disconnect,
    Write { addr: u16, count: u16 },
    Read { addr: u16, count: u16 },
    EraseRow(u16),
    BulkErase(u16),
}

#[derive(Clone, Debug)]
pub struct Simulator {
    memory: SparseMemory,
    row_size: u16,
    ops: Vec<Op>,
    writes: usize,
    reads: usize,
    fail_connect: bool,
    fail_writes: BTreeSet<usize>,
    fail_reads: BTreeSet<usize>,
    stuck: BTreeMap<u32, Word>,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    pub fn new() -> Self {
        Self {
            memory: SparseMemory::new(),
            row_size: 32,
            ops: Vec::new(),
            writes: 0,
            reads: 0,
            fail_connect: false,
            fail_writes: BTreeSet::new(),
            fail_reads: BTreeSet::new(),
            stuck: BTreeMap::new(),
        }
    }

    /// Row size used by [`DeviceChannel::erase_row`]
    pub fn with_row_size(mut self, row_size: u16) -> Self {
        self.row_size = row_size.max(1);
        self
    }

    /// Pre-load device contents
    pub fn with_memory(mut self, memory: SparseMemory) -> Self {
        self.memory = memory;
        self
    }

    /// Refuse the session start handshake
    pub fn fail_connect(&mut self) {
        self.fail_connect = true;
    }

    /// Nack the writes with the given zero based indices
    pub fn fail_writes_at(&mut self, indices: &[usize]) {
        self.fail_writes.extend(indices.iter().cloned());
    }

    /// Fail the reads with the given zero based indices with a short read
    pub fn fail_reads_at(&mut self, indices: &[usize]) {
        self.fail_reads.extend(indices.iter().cloned());
    }

    /// Make a cell ignore writes and always read as `value`
    pub fn stick(&mut self, addr: u32, value: Word) {
        self.stuck.insert(addr, value);
    }

    pub fn memory(&self) -> &SparseMemory {
        &self.memory
    }

    pub fn word(&self, addr: u32) -> Word {
        self.memory.get(&addr).cloned().unwrap_or(ERASED)
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Number of write commands received, including failed ones
    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn reads(&self) -> usize {
        self.reads
    }
}

impl DeviceChannel for Simulator {
    type Error = Error<Infallible>;

    fn connect(&mut self, mode: Mode) -> Result<(), Self::Error> {
        self.ops.push(Op::Connect(mode));

        if self.fail_connect {
            return Err(Error::ResponseTimeout);
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), Self::Error> {
        self.ops.push(Op::Disconnect);
        Ok(())
    }

    fn write_block(&mut self, addr: u16, data: &[u8]) -> Result<(), Self::Error> {
        if data.len() % 2 != 0 {
            return Err(Error::InvalidLength(data.len()));
        }

        let index = self.writes;
        self.writes += 1;
        self.ops.push(Op::Write {
            addr,
            count: (data.len() / 2) as u16,
        });

        if self.fail_writes.contains(&index) {
            return Err(Error::Nack(SIM_NACK));
        }

        for (i, w) in be_bytes_to_words(data).into_iter().enumerate() {
            self.memory.insert(addr as u32 + i as u32, w);
        }

        Ok(())
    }

    fn read_block(&mut self, addr: u16, count: u16) -> Result<Vec<u8>, Self::Error> {
        let index = self.reads;
        self.reads += 1;
        self.ops.push(Op::Read { addr, count });

        if self.fail_reads.contains(&index) {
            return Err(Error::ShortRead {
                expected: count as usize * 2,
                received: 0,
            });
        }

        let words: Vec<Word> = (0..count as u32)
            .map(|i| addr as u32 + i)
            .map(|a| self.stuck.get(&a).cloned().unwrap_or_else(|| self.word(a)))
            .collect();

        Ok(words_to_be_bytes(&words))
    }

    fn erase_row(&mut self, addr: u16) -> Result<(), Self::Error> {
        self.ops.push(Op::EraseRow(addr));

        let base = (addr - addr % self.row_size) as u32;
        let end = base + self.row_size as u32;
        self.memory = self
            .memory
            .iter()
            .filter(|(a, _)| **a < base || **a >= end)
            .map(|(a, w)| (*a, *w))
            .collect();

        Ok(())
    }

    fn bulk_erase(&mut self, addr: u16) -> Result<(), Self::Error> {
        self.ops.push(Op::BulkErase(addr));
        self.memory.clear();
        Ok(())
    }
}
