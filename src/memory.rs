//! Word addressed memory model

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A single 16-bit unit of target memory
pub type Word = u16;

/// Value of un-programmed flash
pub const ERASED: Word = 0x3FFF;

/// Sparse word-address to word mapping.
///
/// Backed by a `BTreeMap` so every consumer walks addresses in ascending order.
pub type SparseMemory = BTreeMap<u32, Word>;

/// Closed address interval `[start, end]`
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct MemoryRegion {
    pub start: u32,
    pub end: u32,
}

impl MemoryRegion {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.start <= addr && addr <= self.end
    }

    /// Number of words covered, zero for an inverted range
    pub fn len(&self) -> u32 {
        if self.end < self.start {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}-0x{:X}", self.start, self.end)
    }
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
#[error("invalid memory region '{0}', expected <start>-<end> in hex")]
pub struct RegionParseError(pub String);

/// Parses `start-end` where both bounds are hex, with or without a `0x` prefix
impl FromStr for MemoryRegion {
    type Err = RegionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || RegionParseError(s.to_string());

        let (start, end) = s.split_once('-').ok_or_else(err)?;
        let start = parse_hex(start).ok_or_else(err)?;
        let end = parse_hex(end).ok_or_else(err)?;

        Ok(Self { start, end })
    }
}

/// Parse a hex number, tolerating surrounding whitespace and a `0x` prefix
pub fn parse_hex(s: &str) -> Option<u32> {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(s, 16).ok()
}

/// Serialise words big-endian, the order used on the wire
pub fn words_to_be_bytes(words: &[Word]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

/// Deserialise big-endian wire bytes into words, a trailing odd byte is ignored
pub fn be_bytes_to_words(data: &[u8]) -> Vec<Word> {
    data.chunks_exact(2)
        .map(|b| Word::from_be_bytes([b[0], b[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_region() {
        let r: MemoryRegion = "2000-2001".parse().unwrap();
        assert_eq!(r, MemoryRegion::new(0x2000, 0x2001));
        assert_eq!(r.len(), 2);

        let r: MemoryRegion = "0x8007 - 0x8008".parse().unwrap();
        assert_eq!(r, MemoryRegion::new(0x8007, 0x8008));

        assert!("8007".parse::<MemoryRegion>().is_err());
        assert!("zz-10".parse::<MemoryRegion>().is_err());
    }

    #[test]
    fn region_bounds_are_inclusive() {
        let r = MemoryRegion::new(0x10, 0x12);
        assert!(!r.contains(0x0F));
        assert!(r.contains(0x10));
        assert!(r.contains(0x12));
        assert!(!r.contains(0x13));
        assert!(MemoryRegion::new(5, 4).is_empty());
    }

    #[test]
    fn word_bytes_are_big_endian() {
        let words = [0x1234, 0xABCD];
        let bytes = words_to_be_bytes(&words);
        assert_eq!(bytes, vec![0x12, 0x34, 0xAB, 0xCD]);
        assert_eq!(be_bytes_to_words(&bytes), words.to_vec());
    }
}
