//! Device profiles
//!
//! Profiles are read from INI files holding a single device section:
//!
//! ```ini
//! [PIC16F1847]
//! FLASH_WRITE=20
//! ROMSIZE=2000
//! CONFIG=8000-8008
//! ```
//!
//! All values are hex. `FLASH_WRITE` is the row size in words (default `20`),
//! `ROMSIZE` the program flash size in words and `CONFIG` the optional
//! configuration word range.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::memory::{parse_hex, MemoryRegion, SparseMemory};

/// A programmable device.
///
/// Fields are only reachable through [`DeviceProfile::new`] so the row size is
/// always non-zero.
#[derive(Clone, PartialEq, Debug)]
pub struct DeviceProfile {
    name: String,
    words_per_write_row: u32,
    total_flash_words: u32,
    config_region: Option<MemoryRegion>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("reading profile: {0}")]
    Io(#[from] std::io::Error),

    #[error("no device sections found")]
    NoSection,

    #[error("multiple device sections found: {0:?}")]
    MultipleSections(Vec<String>),

    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error("row size must be non-zero")]
    ZeroRowSize,
}

impl DeviceProfile {
    pub fn new(
        name: &str,
        words_per_write_row: u32,
        total_flash_words: u32,
        config_region: Option<MemoryRegion>,
    ) -> Result<Self, ProfileError> {
        if words_per_write_row == 0 {
            return Err(ProfileError::ZeroRowSize);
        }

        Ok(Self {
            name: name.to_string(),
            words_per_write_row,
            total_flash_words,
            config_region,
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ProfileError> {
        let text = fs::read_to_string(path)?;
        Self::from_ini(&text)
    }

    /// Parse a profile from INI text, exactly one section is expected
    pub fn from_ini(text: &str) -> Result<Self, ProfileError> {
        let mut sections: Vec<(String, HashMap<String, String>)> = Vec::new();
        let mut current = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim();
                // Repeated sections merge
                current = match sections.iter().position(|(n, _)| n == name) {
                    Some(i) => Some(i),
                    None => {
                        sections.push((name.to_string(), HashMap::new()));
                        Some(sections.len() - 1)
                    }
                };
                continue;
            }

            let (key, value) = match line.find(|c| c == '=' || c == ':') {
                Some(i) => (&line[..i], &line[i + 1..]),
                None => continue,
            };

            if let Some(i) = current {
                sections[i]
                    .1
                    .insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        let (name, keys) = match sections.len() {
            0 => return Err(ProfileError::NoSection),
            1 => sections.remove(0),
            _ => {
                return Err(ProfileError::MultipleSections(
                    sections.into_iter().map(|(n, _)| n).collect(),
                ))
            }
        };

        let hex_key = |key: &str, default: &str| -> Result<u32, ProfileError> {
            let value = keys.get(key).map(String::as_str).unwrap_or(default);
            parse_hex(value).ok_or_else(|| ProfileError::InvalidValue {
                key: key.to_ascii_uppercase(),
                value: value.to_string(),
            })
        };

        let row = hex_key("flash_write", "20")?;
        let rom = hex_key("romsize", "0")?;

        let config = match keys.get("config").filter(|v| !v.is_empty()) {
            Some(v) => match v.parse::<MemoryRegion>() {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!("Ignoring config range: {}", e);
                    None
                }
            },
            None => None,
        };

        Self::new(&name, row, rom, config)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Row size in words, never zero
    pub fn words_per_write_row(&self) -> u32 {
        self.words_per_write_row
    }

    pub fn total_flash_words(&self) -> u32 {
        self.total_flash_words
    }

    pub fn config_region(&self) -> Option<MemoryRegion> {
        self.config_region
    }

    pub fn is_config(&self, addr: u32) -> bool {
        self.config_region.map(|r| r.contains(addr)).unwrap_or(false)
    }

    pub fn is_flash(&self, addr: u32) -> bool {
        addr < self.total_flash_words
    }

    /// Split memory into program flash and config words.
    ///
    /// The config region takes precedence where the two overlap, addresses in
    /// neither are dropped.
    pub fn partition(&self, memory: &SparseMemory) -> (SparseMemory, SparseMemory) {
        let mut flash = SparseMemory::new();
        let mut config = SparseMemory::new();

        for (&addr, &word) in memory {
            if self.is_config(addr) {
                config.insert(addr, word);
            } else if self.is_flash(addr) {
                flash.insert(addr, word);
            } else {
                trace!("Dropping word at 0x{:04X}", addr);
            }
        }

        (flash, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_single_section() {
        let text = "; devices\n[PIC16F1847]\nFLASH_WRITE = 20\nROMSIZE=2000\nconfig: 8000-8008\n";
        let p = DeviceProfile::from_ini(text).unwrap();

        assert_eq!(p.name(), "PIC16F1847");
        assert_eq!(p.words_per_write_row(), 0x20);
        assert_eq!(p.total_flash_words(), 0x2000);
        assert_eq!(p.config_region(), Some(MemoryRegion::new(0x8000, 0x8008)));
    }

    #[test]
    fn defaults_and_bad_config() {
        let p = DeviceProfile::from_ini("[X]\nCONFIG=nonsense\n").unwrap();

        assert_eq!(p.words_per_write_row(), 0x20);
        assert_eq!(p.total_flash_words(), 0);
        assert_eq!(p.config_region(), None);
    }

    #[test]
    fn section_count_is_checked() {
        assert!(matches!(
            DeviceProfile::from_ini("ROMSIZE=10\n"),
            Err(ProfileError::NoSection)
        ));
        assert!(matches!(
            DeviceProfile::from_ini("[A]\n[B]\n"),
            Err(ProfileError::MultipleSections(_))
        ));
    }

    #[test]
    fn invalid_values() {
        assert!(matches!(
            DeviceProfile::from_ini("[A]\nROMSIZE=xyz\n"),
            Err(ProfileError::InvalidValue { .. })
        ));
        assert!(matches!(
            DeviceProfile::from_ini("[A]\nFLASH_WRITE=0\n"),
            Err(ProfileError::ZeroRowSize)
        ));
        assert!(matches!(
            DeviceProfile::new("A", 0, 0x100, None),
            Err(ProfileError::ZeroRowSize)
        ));
    }

    #[test]
    fn partition_by_region() {
        let p =
            DeviceProfile::new("T", 4, 0x100, Some(MemoryRegion::new(0x2000, 0x2001))).unwrap();

        let memory: SparseMemory = vec![(0x0000, 1), (0x00FF, 2), (0x0100, 3), (0x2000, 4), (0x2001, 5), (0x2002, 6)]
            .into_iter()
            .collect();

        let (flash, config) = p.partition(&memory);

        assert_eq!(flash.keys().cloned().collect::<Vec<_>>(), vec![0x0000, 0x00FF]);
        assert_eq!(config.keys().cloned().collect::<Vec<_>>(), vec![0x2000, 0x2001]);
    }

    #[test]
    fn config_wins_on_overlap() {
        let p = DeviceProfile::new("T", 4, 0x100, Some(MemoryRegion::new(0x10, 0x11))).unwrap();
        let memory: SparseMemory = vec![(0x10, 1)].into_iter().collect();

        let (flash, config) = p.partition(&memory);
        assert!(flash.is_empty());
        assert_eq!(config.len(), 1);
    }
}
