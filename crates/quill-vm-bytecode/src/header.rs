//! Story header (the first 64 bytes of the image)

use serde::Serialize;

use crate::error::{BytecodeError, Result};
use crate::memory::Memory;

/// Fixed header field offsets.
pub mod offsets {
    /// Format version
    pub const VERSION: usize = 0x00;
    /// Flags 1
    pub const FLAGS1: usize = 0x01;
    /// Release number
    pub const RELEASE: usize = 0x02;
    /// Base of high memory
    pub const HIGH_MEMORY: usize = 0x04;
    /// Initial program counter (packed main routine in v6)
    pub const INITIAL_PC: usize = 0x06;
    /// Dictionary address
    pub const DICTIONARY: usize = 0x08;
    /// Object table address
    pub const OBJECT_TABLE: usize = 0x0a;
    /// Global variable table address
    pub const GLOBALS: usize = 0x0c;
    /// Base of static memory
    pub const STATIC_MEMORY: usize = 0x0e;
    /// Flags 2
    pub const FLAGS2: usize = 0x10;
    /// Serial number (six ASCII characters)
    pub const SERIAL: usize = 0x12;
    /// Abbreviations table address
    pub const ABBREVIATIONS: usize = 0x18;
    /// File length (scaled)
    pub const FILE_LENGTH: usize = 0x1a;
    /// File checksum
    pub const CHECKSUM: usize = 0x1c;
    /// Interpreter number
    pub const INTERPRETER_NUMBER: usize = 0x1e;
    /// Interpreter version
    pub const INTERPRETER_VERSION: usize = 0x1f;
    /// Screen height in lines
    pub const SCREEN_HEIGHT_LINES: usize = 0x20;
    /// Screen width in characters
    pub const SCREEN_WIDTH_CHARS: usize = 0x21;
    /// Routines offset (v6-7)
    pub const ROUTINES_OFFSET: usize = 0x28;
    /// Strings offset (v6-7)
    pub const STRINGS_OFFSET: usize = 0x2a;
    /// Terminating characters table (v5+)
    pub const TERMINATING_CHARS: usize = 0x2e;
    /// Standard revision number
    pub const STANDARD_REVISION: usize = 0x32;
    /// Custom alphabet table (v5+)
    pub const ALPHABET_TABLE: usize = 0x34;
}

/// Size of the header block.
pub const HEADER_SIZE: usize = 64;

/// Header fields read once when a story is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Header {
    /// Format version (1-8)
    pub version: u8,
    /// Release number
    pub release: u16,
    /// Serial number text
    pub serial: String,
    /// Base of high memory
    pub high_memory_base: u16,
    /// Initial program counter word
    pub initial_pc: u16,
    /// Dictionary address
    pub dictionary: u16,
    /// Object table address
    pub object_table: u16,
    /// Global variable table address
    pub globals: u16,
    /// Base of static memory
    pub static_memory_base: u16,
    /// Abbreviations table address
    pub abbreviations: u16,
    /// File length in bytes (already scaled)
    pub file_length: usize,
    /// Header checksum
    pub checksum: u16,
    /// Routines offset (v6-7 only, else 0)
    pub routines_offset: u16,
    /// Strings offset (v6-7 only, else 0)
    pub strings_offset: u16,
    /// Terminating characters table (v5+, else 0)
    pub terminating_chars: u16,
    /// Custom alphabet table (v5+, else 0)
    pub alphabet_table: u16,
}

impl Header {
    /// Parse the header of `memory`.
    pub fn read(memory: &Memory) -> Result<Self> {
        if memory.len() < HEADER_SIZE {
            return Err(BytecodeError::TruncatedHeader(memory.len()));
        }

        let version = memory.read_byte(offsets::VERSION)?;
        if !(1..=8).contains(&version) {
            return Err(BytecodeError::UnsupportedVersion(version));
        }

        let serial = memory
            .read_bytes(offsets::SERIAL, 6)?
            .iter()
            .map(|&b| b as char)
            .collect();

        let length_scale = match version {
            1..=3 => 2,
            4 | 5 => 4,
            _ => 8,
        };

        let v6_or_v7 = matches!(version, 6 | 7);
        let word = |offset| memory.read_word(offset);

        Ok(Self {
            version,
            release: word(offsets::RELEASE)?,
            serial,
            high_memory_base: word(offsets::HIGH_MEMORY)?,
            initial_pc: word(offsets::INITIAL_PC)?,
            dictionary: word(offsets::DICTIONARY)?,
            object_table: word(offsets::OBJECT_TABLE)?,
            globals: word(offsets::GLOBALS)?,
            static_memory_base: word(offsets::STATIC_MEMORY)?,
            abbreviations: word(offsets::ABBREVIATIONS)?,
            file_length: word(offsets::FILE_LENGTH)? as usize * length_scale,
            checksum: word(offsets::CHECKSUM)?,
            routines_offset: if v6_or_v7 { word(offsets::ROUTINES_OFFSET)? } else { 0 },
            strings_offset: if v6_or_v7 { word(offsets::STRINGS_OFFSET)? } else { 0 },
            terminating_chars: if version >= 5 { word(offsets::TERMINATING_CHARS)? } else { 0 },
            alphabet_table: if version >= 5 { word(offsets::ALPHABET_TABLE)? } else { 0 },
        })
    }

    /// Packed-address multiplier for this version.
    #[inline]
    pub fn packed_multiplier(&self) -> u32 {
        packed_multiplier(self.version)
    }

    /// Expand a packed routine address.
    #[inline]
    pub fn unpack_routine_address(&self, packed: u16) -> u32 {
        let base = packed as u32 * self.packed_multiplier();
        if matches!(self.version, 6 | 7) {
            base + self.routines_offset as u32 * 8
        } else {
            base
        }
    }

    /// Expand a packed string address.
    #[inline]
    pub fn unpack_string_address(&self, packed: u16) -> u32 {
        let base = packed as u32 * self.packed_multiplier();
        if matches!(self.version, 6 | 7) {
            base + self.strings_offset as u32 * 8
        } else {
            base
        }
    }

    /// Address of the main routine's header (locals-count byte).
    ///
    /// Outside v6 the header stores the address of the first instruction,
    /// preceded by a zero-locals routine header byte.
    pub fn main_routine_address(&self) -> u32 {
        if self.version == 6 {
            self.unpack_routine_address(self.initial_pc)
        } else {
            (self.initial_pc as u32).saturating_sub(1)
        }
    }
}

/// Packed-address multiplier for `version`.
#[inline]
pub const fn packed_multiplier(version: u8) -> u32 {
    match version {
        1..=3 => 2,
        4..=7 => 4,
        _ => 8,
    }
}
