//! Intel HEX codec over 16-bit word memory
//!
//! Decoding is permissive: records that fail to parse are skipped and checksums
//! are not checked unless [`DecodeOptions::strict`] is set. Word byte order is
//! configured separately for each direction, decoding defaults to little-endian
//! (the firmware's native layout) while encoding defaults to big-endian.

use std::mem;
use std::str::FromStr;

use ihex::Record;

use crate::memory::{SparseMemory, Word};

/// Maximum payload of an emitted data record
pub const MAX_RECORD_BYTES: usize = 16;

const RECORD_DATA: u8 = 0x00;
const RECORD_EXTENDED_LINEAR: u8 = 0x04;

/// Byte order used to interpret the two bytes of each word in a record
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn word_from_bytes(&self, b: [u8; 2]) -> Word {
        match self {
            ByteOrder::Little => Word::from_le_bytes(b),
            ByteOrder::Big => Word::from_be_bytes(b),
        }
    }

    pub fn word_to_bytes(&self, w: Word) -> [u8; 2] {
        match self {
            ByteOrder::Little => w.to_le_bytes(),
            ByteOrder::Big => w.to_be_bytes(),
        }
    }
}

impl FromStr for ByteOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "little" | "le" => Ok(ByteOrder::Little),
            "big" | "be" => Ok(ByteOrder::Big),
            _ => Err(format!("unknown byte order '{}', expected little or big", s)),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct DecodeOptions {
    pub byte_order: ByteOrder,
    /// Reject malformed records and checksum mismatches instead of skipping them
    pub strict: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            byte_order: ByteOrder::Little,
            strict: false,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct EncodeOptions {
    pub byte_order: ByteOrder,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            byte_order: ByteOrder::Big,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HexError {
    #[error("malformed record {record}")]
    Malformed { record: usize },

    #[error("checksum mismatch in record {record}: expected 0x{expected:02X}, found 0x{found:02X}")]
    Checksum {
        record: usize,
        expected: u8,
        found: u8,
    },

    #[error("word address 0x{0:X} is beyond the 32-bit byte address space")]
    AddressOverflow(u32),

    #[error("writing records: {0}")]
    Writer(#[from] ihex::WriterError),
}

struct RawRecord {
    offset: u16,
    kind: u8,
    data: Vec<u8>,
    checksum: Option<u8>,
}

impl RawRecord {
    fn expected_checksum(&self) -> u8 {
        let [hi, lo] = self.offset.to_be_bytes();
        let header = [self.data.len() as u8, hi, lo, self.kind];

        header
            .iter()
            .chain(self.data.iter())
            .fold(0u8, |acc, b| acc.wrapping_add(*b))
            .wrapping_neg()
    }
}

fn hex_byte(s: &str, at: usize) -> Option<u8> {
    let digits = s.get(at..at + 2)?;
    u8::from_str_radix(digits, 16).ok()
}

/// Parse the text following a `:` marker
fn parse_record(raw: &str) -> Option<RawRecord> {
    let raw = raw.trim();

    let count = hex_byte(raw, 0)? as usize;
    let offset = u16::from_be_bytes([hex_byte(raw, 2)?, hex_byte(raw, 4)?]);
    let kind = hex_byte(raw, 6)?;

    let data = (0..count)
        .map(|i| hex_byte(raw, 8 + i * 2))
        .collect::<Option<Vec<_>>>()?;

    let checksum = hex_byte(raw, 8 + count * 2);

    Some(RawRecord {
        offset,
        kind,
        data,
        checksum,
    })
}

/// Decode Intel HEX text into word addressed memory
pub fn decode(text: &str, options: &DecodeOptions) -> Result<SparseMemory, HexError> {
    let flat: String = text.chars().filter(|c| *c != '\r' && *c != '\n').collect();

    let mut memory = SparseMemory::new();

    // Word offset from the most recent extended linear address record
    let mut high_offset: u32 = 0;

    let records = flat.split(':').filter(|r| !r.is_empty());

    for (index, raw) in records.enumerate() {
        let number = index + 1;

        let record = match parse_record(raw) {
            Some(r) => r,
            None if options.strict => return Err(HexError::Malformed { record: number }),
            None => {
                warn!("Skipping malformed record {}", number);
                continue;
            }
        };

        if options.strict {
            let expected = record.expected_checksum();
            match record.checksum {
                Some(found) if found == expected => (),
                Some(found) => {
                    return Err(HexError::Checksum {
                        record: number,
                        expected,
                        found,
                    })
                }
                None => return Err(HexError::Malformed { record: number }),
            }
        }

        match record.kind {
            RECORD_EXTENDED_LINEAR if record.data.len() == 2 => {
                let high = u16::from_be_bytes([record.data[0], record.data[1]]) as u32;
                high_offset = (high << 16) / 2;
                debug!("Extended linear address 0x{:04X}", high);
            }
            RECORD_DATA => {
                let low = record.offset as u32 / 2;

                for (i, pair) in record.data.chunks(2).enumerate() {
                    let word = match *pair {
                        [a, b] => options.byte_order.word_from_bytes([a, b]),
                        [a] => a as Word,
                        _ => unreachable!(),
                    };
                    memory.insert(high_offset + low + i as u32, word);
                }
            }
            _ => (),
        }
    }

    Ok(memory)
}

/// Encode word addressed memory as Intel HEX text
pub fn encode(memory: &SparseMemory, options: &EncodeOptions) -> Result<String, HexError> {
    let mut records = Vec::new();

    let mut page: u16 = 0;
    let mut line: Vec<u8> = Vec::with_capacity(MAX_RECORD_BYTES);
    let mut line_start: u16 = 0;

    let flush = |records: &mut Vec<Record>, start: u16, line: &mut Vec<u8>| {
        if !line.is_empty() {
            records.push(Record::Data {
                offset: start,
                value: mem::take(line),
            });
        }
    };

    for (&addr, &word) in memory {
        let byte_addr = addr
            .checked_mul(2)
            .ok_or(HexError::AddressOverflow(addr))?;

        let high = (byte_addr >> 16) as u16;
        let low = (byte_addr & 0xFFFF) as u16;

        if high != page {
            flush(&mut records, line_start, &mut line);
            records.push(Record::ExtendedLinearAddress(high));
            page = high;
        }

        let contiguous =
            !line.is_empty() && low as usize == line_start as usize + line.len();

        if !contiguous || line.len() >= MAX_RECORD_BYTES {
            flush(&mut records, line_start, &mut line);
            line_start = low;
        }

        line.extend_from_slice(&options.byte_order.word_to_bytes(word));
    }

    flush(&mut records, line_start, &mut line);
    records.push(Record::EndOfFile);

    Ok(ihex::create_object_file_representation(&records)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records_of(text: &str) -> Vec<Record> {
        ihex::Reader::new(text)
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    fn sample_memory() -> SparseMemory {
        // Deterministic scatter across several 64K byte pages
        let mut m = SparseMemory::new();
        let mut x: u32 = 0x1234_5678;
        for _ in 0..500 {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            m.insert(x % (1 << 20), (x >> 8) as Word);
        }
        for a in 0x7FF0..0x8010 {
            m.insert(a, a as Word);
        }
        m
    }

    #[test]
    fn extended_address_shifts_word_address() {
        let text = ":020000040001F9\n:020000003412B8\n:00000001FF\n";
        let m = decode(text, &DecodeOptions::default()).unwrap();

        assert_eq!(m.len(), 1);
        assert_eq!(m.get(&0x8000), Some(&0x1234));
    }

    #[test]
    fn decode_defaults_to_little_endian() {
        let text = ":0400100034128131F4\n:00000001FF";

        let m = decode(text, &DecodeOptions::default()).unwrap();
        assert_eq!(m.get(&0x08), Some(&0x1234));
        assert_eq!(m.get(&0x09), Some(&0x3181));

        let big = DecodeOptions {
            byte_order: ByteOrder::Big,
            ..Default::default()
        };
        let m = decode(text, &big).unwrap();
        assert_eq!(m.get(&0x08), Some(&0x3412));
    }

    #[test]
    fn decode_tolerates_missing_newlines_and_bad_records() {
        // Two records on one line, one garbage record and a bad checksum
        let text = ":02000000341200:zz0000\r\n:020002007856FF\r\n:00000001FF";
        let m = decode(text, &DecodeOptions::default()).unwrap();

        assert_eq!(m.get(&0x0000), Some(&0x1234));
        assert_eq!(m.get(&0x0001), Some(&0x5678));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn strict_decode_rejects_bad_checksum() {
        let strict = DecodeOptions {
            strict: true,
            ..Default::default()
        };

        let good = ":020000003412B8\n:00000001FF\n";
        assert!(decode(good, &strict).is_ok());

        let bad = ":02000000341200\n:00000001FF\n";
        match decode(bad, &strict) {
            Err(HexError::Checksum {
                record: 1,
                expected: 0xB8,
                found: 0x00,
            }) => (),
            other => panic!("unexpected result {:?}", other),
        }

        let truncated = ":0400000034\n";
        assert!(matches!(
            decode(truncated, &strict),
            Err(HexError::Malformed { record: 1 })
        ));
    }

    #[test]
    fn odd_trailing_byte_becomes_a_word() {
        let text = ":0300000034125661
:00000001FF
";
        let strict = DecodeOptions {
            strict: true,
            ..Default::default()
        };
        let m = decode(text, &strict).unwrap();

        assert_eq!(m.len(), 2);
        assert_eq!(m.get(&0x0000), Some(&0x1234));
        assert_eq!(m.get(&0x0001), Some(&0x0056));
    }

    #[test]
    fn other_record_types_are_ignored() {
        // Start linear address and a short extended linear address
        let text = ":04000005000000CD2A\n:0100000400FB\n:020004003412B4\n:00000001FF";
        let m = decode(text, &DecodeOptions::default()).unwrap();

        assert_eq!(m.len(), 1);
        assert_eq!(m.get(&0x0002), Some(&0x1234));
    }

    #[test]
    fn round_trip_with_matched_byte_order() {
        let m = sample_memory();

        for order in [ByteOrder::Big, ByteOrder::Little].iter() {
            let text = encode(&m, &EncodeOptions { byte_order: *order }).unwrap();
            let decoded = decode(
                &text,
                &DecodeOptions {
                    byte_order: *order,
                    strict: true,
                },
            )
            .unwrap();
            assert_eq!(decoded, m);
        }
    }

    #[test]
    fn default_byte_orders_differ() {
        let mut m = SparseMemory::new();
        m.insert(0, 0x1234);

        let text = encode(&m, &EncodeOptions::default()).unwrap();
        let decoded = decode(&text, &DecodeOptions::default()).unwrap();

        assert_eq!(decoded.get(&0), Some(&0x3412));
    }

    #[test]
    fn encoded_records_checksum_to_zero() {
        let text = encode(&sample_memory(), &EncodeOptions::default()).unwrap();

        for line in text.lines().filter(|l| !l.is_empty()) {
            let body = line.strip_prefix(':').unwrap();
            let sum = (0..body.len() / 2)
                .map(|i| u8::from_str_radix(&body[i * 2..i * 2 + 2], 16).unwrap())
                .fold(0u8, |acc, b| acc.wrapping_add(b));
            assert_eq!(sum, 0, "record {}", line);
        }
    }

    #[test]
    fn encode_splits_on_gaps_size_and_pages() {
        let mut m = SparseMemory::new();
        for a in 0..10 {
            m.insert(a, 0x0100 + a as Word);
        }
        m.insert(0x20, 0xAAAA);
        m.insert(0x7FFF, 0xBBBB);
        m.insert(0x8000, 0xCCCC);

        let records = records_of(&encode(&m, &EncodeOptions::default()).unwrap());

        let expected = vec![
            Record::Data {
                offset: 0x0000,
                value: (0..8u16).flat_map(|a| (0x0100 + a).to_be_bytes()).collect(),
            },
            Record::Data {
                offset: 0x0010,
                value: vec![0x01, 0x08, 0x01, 0x09],
            },
            Record::Data {
                offset: 0x0040,
                value: vec![0xAA, 0xAA],
            },
            Record::Data {
                offset: 0xFFFE,
                value: vec![0xBB, 0xBB],
            },
            Record::ExtendedLinearAddress(0x0001),
            Record::Data {
                offset: 0x0000,
                value: vec![0xCC, 0xCC],
            },
            Record::EndOfFile,
        ];

        assert_eq!(records, expected);
    }

    #[test]
    fn empty_memory_encodes_to_eof() {
        let text = encode(&SparseMemory::new(), &EncodeOptions::default()).unwrap();
        assert_eq!(records_of(&text), vec![Record::EndOfFile]);
    }
}
