/// Acknowledgement byte returned by the programmer
pub const ACK: u8 = b'K';

/// Words fetched per read command when dumping or displaying memory,
/// independent of the device row size
pub const READ_CHUNK: u16 = 64;

/// Address passed to the bulk erase command to wipe program flash
pub const BULK_ERASE_ADDR: u16 = 0x80FF;

/// Command opcodes, each followed by big-endian arguments
#[derive(Debug, PartialEq, Copy, Clone)]
pub enum Command {
    /// Enter high-voltage programming mode, acknowledged
    StartHighVoltage = b's' as isize,

    /// Enter low-voltage programming mode, acknowledged
    StartLowVoltage = b'l' as isize,

    /// Leave programming mode, no response
    End = b'x' as isize,

    /// Write `count: u16` words from `addr: u16`, followed by `count * 2` data bytes, acknowledged
    WriteBlock = b'w' as isize,

    /// Read `count: u16` words from `addr: u16`, responds with `count * 2` bytes of big-endian words
    ReadBlock = b'r' as isize,

    /// Erase the row containing `addr: u16`, acknowledged
    EraseRow = b'e' as isize,

    /// Bulk erase selected by `addr: u16`, acknowledged
    BulkErase = b'b' as isize,
}

impl Command {
    pub fn opcode(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes() {
        assert_eq!(Command::StartHighVoltage.opcode(), b's');
        assert_eq!(Command::StartLowVoltage.opcode(), b'l');
        assert_eq!(Command::End.opcode(), b'x');
        assert_eq!(Command::WriteBlock.opcode(), b'w');
        assert_eq!(Command::ReadBlock.opcode(), b'r');
        assert_eq!(Command::EraseRow.opcode(), b'e');
        assert_eq!(Command::BulkErase.opcode(), b'b');
    }
}
