//! Output stream selection
//!
//! Stream 1 is the screen, stream 2 the transcript (a Flags 2 bit the story
//! may also flip directly), stream 3 redirects into a table in memory and
//! suppresses the others while active. Stream 4 is accepted and ignored.

use quill_vm_bytecode::Memory;
use quill_vm_bytecode::header::offsets;

use crate::error::{VmError, VmResult};
use crate::host::Host;
use crate::text::{ZSCII_NEWLINE, ZText};

/// Maximum nesting of memory streams
pub const MAX_MEMORY_STREAMS: usize = 16;

/// Flags 2 transcript bit
const TRANSCRIPT_BIT: u16 = 0x0001;

/// Current output stream state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputStreams {
    screen: bool,
    tables: Vec<u32>,
}

impl Default for OutputStreams {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputStreams {
    /// Screen on, no redirection.
    pub fn new() -> Self {
        Self {
            screen: true,
            tables: Vec::new(),
        }
    }

    /// Whether stream 1 is selected.
    pub fn screen(&self) -> bool {
        self.screen
    }

    /// Active memory stream tables, outermost first.
    pub fn tables(&self) -> &[u32] {
        &self.tables
    }

    /// Whether output currently goes to a memory table.
    pub fn redirecting(&self) -> bool {
        !self.tables.is_empty()
    }

    /// Whether the transcript bit is set.
    pub fn transcript(memory: &Memory) -> VmResult<bool> {
        Ok(memory.read_word(offsets::FLAGS2)? & TRANSCRIPT_BIT != 0)
    }

    /// `output_stream number table`
    pub fn select(&mut self, memory: &mut Memory, number: i16, table: Option<u16>) -> VmResult<()> {
        match number {
            1 => self.screen = true,
            -1 => self.screen = false,
            2 | -2 => {
                let flags = memory.read_word(offsets::FLAGS2)?;
                let flags = if number > 0 {
                    flags | TRANSCRIPT_BIT
                } else {
                    flags & !TRANSCRIPT_BIT
                };
                memory.write_word(offsets::FLAGS2, flags)?;
            }
            3 => {
                if self.tables.len() >= MAX_MEMORY_STREAMS {
                    return Err(VmError::StreamDepth(MAX_MEMORY_STREAMS));
                }
                let table = table.unwrap_or(0) as u32;
                memory.write_word(table as usize, 0)?;
                self.tables.push(table);
            }
            -3 => {
                self.tables.pop();
            }
            _ => tracing::trace!(number, "ignoring output stream"),
        }
        Ok(())
    }

    /// Send text to whichever streams are active.
    pub fn write(
        &mut self,
        memory: &mut Memory,
        host: &mut dyn Host,
        text: &ZText,
        output: &str,
    ) -> VmResult<()> {
        if output.is_empty() {
            return Ok(());
        }
        if let Some(&table) = self.tables.last() {
            let mut count = memory.read_word(table as usize)?;
            for ch in output.chars() {
                let code = text.char_to_zscii(ch).unwrap_or(b'?' as u16);
                let code = if ch == '\n' { ZSCII_NEWLINE } else { code };
                memory.write_byte(table as usize + 2 + count as usize, code as u8)?;
                count = count.wrapping_add(1);
            }
            memory.write_word(table as usize, count)?;
            return Ok(());
        }
        if self.screen {
            host.print(output);
        }
        if Self::transcript(memory)? {
            host.transcript(output);
        }
        Ok(())
    }

    /// Back to screen-only output.
    pub fn reset(&mut self) {
        self.screen = true;
        self.tables.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::BufferedHost;
    use quill_vm_bytecode::{Assembler, Header};

    fn fixture() -> (Memory, ZText, u32) {
        let mut asm = Assembler::new(5);
        let table = asm.zeros(64);
        let memory = Memory::new(asm.finish().unwrap());
        let text = ZText::new(&memory, &Header::read(&memory).unwrap()).unwrap();
        (memory, text, table)
    }

    #[test]
    fn memory_stream_captures_and_nests() {
        let (mut memory, text, table) = fixture();
        let mut host = BufferedHost::new();
        let mut streams = OutputStreams::new();

        streams.select(&mut memory, 3, Some(table as u16)).unwrap();
        streams.write(&mut memory, &mut host, &text, "ab").unwrap();
        streams.select(&mut memory, 3, Some(table as u16 + 32)).unwrap();
        streams.write(&mut memory, &mut host, &text, "c\n").unwrap();
        streams.select(&mut memory, -3, None).unwrap();
        streams.write(&mut memory, &mut host, &text, "d").unwrap();
        streams.select(&mut memory, -3, None).unwrap();
        streams.write(&mut memory, &mut host, &text, "e").unwrap();

        assert_eq!(memory.read_word(table as usize).unwrap(), 3);
        assert_eq!(memory.read_bytes(table as usize + 2, 3).unwrap(), b"abd");
        assert_eq!(memory.read_word(table as usize + 32).unwrap(), 2);
        assert_eq!(memory.read_bytes(table as usize + 34, 2).unwrap(), &[b'c', 13]);
        assert_eq!(host.output, "e");
    }

    #[test]
    fn screen_and_transcript_toggles() {
        let (mut memory, text, _) = fixture();
        let mut host = BufferedHost::new();
        let mut streams = OutputStreams::new();

        streams.select(&mut memory, 2, None).unwrap();
        assert!(OutputStreams::transcript(&memory).unwrap());
        streams.select(&mut memory, -1, None).unwrap();
        streams.write(&mut memory, &mut host, &text, "x").unwrap();
        assert_eq!(host.output, "");
        assert_eq!(host.transcript, "x");
    }

    #[test]
    fn nesting_is_limited() {
        let (mut memory, _, table) = fixture();
        let mut streams = OutputStreams::new();
        for _ in 0..MAX_MEMORY_STREAMS {
            streams.select(&mut memory, 3, Some(table as u16)).unwrap();
        }
        assert_eq!(
            streams.select(&mut memory, 3, Some(table as u16)),
            Err(VmError::StreamDepth(MAX_MEMORY_STREAMS))
        );
    }
}
