//! Grouping of sparse memory into row aligned write blocks

use std::collections::BTreeMap;

use crate::memory::{words_to_be_bytes, SparseMemory, Word, ERASED};

/// A row aligned block of words, unknown cells hold [`ERASED`]
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Chunk {
    pub base: u32,
    pub words: Vec<Word>,
}

impl Chunk {
    /// Wire representation, big-endian words from `base` upwards
    pub fn to_bytes(&self) -> Vec<u8> {
        words_to_be_bytes(&self.words)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Split `memory` into `chunk_size` word blocks, ordered by base address.
///
/// Each address lands in the chunk at `addr - addr % chunk_size`.
///
/// # Panics
///
/// If `chunk_size` is zero.
pub fn chunk(memory: &SparseMemory, chunk_size: u32) -> Vec<Chunk> {
    assert!(chunk_size > 0, "chunk size must be non-zero");

    let mut rows: BTreeMap<u32, Vec<Word>> = BTreeMap::new();

    for (&addr, &word) in memory {
        let offset = addr % chunk_size;
        let base = addr - offset;

        let row = rows
            .entry(base)
            .or_insert_with(|| vec![ERASED; chunk_size as usize]);
        row[offset as usize] = word;
    }

    rows.into_iter()
        .map(|(base, words)| Chunk { base, words })
        .collect()
}
