//! Dictionary lookup and tokenisation

use std::cmp::Ordering;

use quill_vm_bytecode::Memory;

use crate::error::VmResult;
use crate::text::ZText;

/// Parsed dictionary header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dictionary {
    /// Dictionary address
    pub address: u32,
    /// Word-separator ZSCII codes
    pub separators: Vec<u8>,
    /// Bytes per entry
    pub entry_length: u8,
    /// Number of entries
    pub entry_count: u16,
    /// Entries are sorted (positive count in the header)
    pub sorted: bool,
    /// Address of the first entry
    pub entries: u32,
}

impl Dictionary {
    /// Read the dictionary header at `address`.
    pub fn read(memory: &Memory, address: u32) -> VmResult<Self> {
        let mut reader = memory.reader(address as usize);
        let separator_count = reader.next_byte()? as usize;
        let separators = reader.next_bytes(separator_count)?.to_vec();
        let entry_length = reader.next_byte()?;
        let raw_count = reader.next_word()? as i16;
        Ok(Self {
            address,
            separators,
            entry_length,
            entry_count: raw_count.unsigned_abs(),
            sorted: raw_count >= 0,
            entries: reader.address() as u32,
        })
    }

    fn entry_address(&self, index: u16) -> u32 {
        self.entries + index as u32 * self.entry_length as u32
    }

    fn compare(memory: &Memory, address: u32, encoded: &[u16]) -> VmResult<Ordering> {
        let stored = memory.read_words(address as usize, encoded.len())?;
        Ok(stored.as_slice().cmp(encoded))
    }

    /// Address of the entry matching `encoded`, or 0.
    pub fn lookup(&self, memory: &Memory, encoded: &[u16]) -> VmResult<u32> {
        if self.sorted {
            let (mut low, mut high) = (0i32, self.entry_count as i32 - 1);
            while low <= high {
                let middle = (low + high) / 2;
                let address = self.entry_address(middle as u16);
                match Self::compare(memory, address, encoded)? {
                    Ordering::Equal => return Ok(address),
                    Ordering::Less => low = middle + 1,
                    Ordering::Greater => high = middle - 1,
                }
            }
        } else {
            for index in 0..self.entry_count {
                let address = self.entry_address(index);
                if Self::compare(memory, address, encoded)? == Ordering::Equal {
                    return Ok(address);
                }
            }
        }
        Ok(0)
    }
}

/// Word found in a text buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Offset of the first letter from the start of the text buffer
    pub position: u8,
    /// ZSCII letters
    pub text: Vec<u8>,
}

/// Split ZSCII `input` into words; separators are words of their own.
///
/// `start` is the offset of `input[0]` within the text buffer.
pub fn split_words(input: &[u8], separators: &[u8], start: u8) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current: Option<Token> = None;
    for (index, &byte) in input.iter().enumerate() {
        let position = start.wrapping_add(index as u8);
        if byte == b' ' {
            tokens.extend(current.take());
        } else if separators.contains(&byte) {
            tokens.extend(current.take());
            tokens.push(Token {
                position,
                text: vec![byte],
            });
        } else {
            current
                .get_or_insert_with(|| Token {
                    position,
                    text: Vec::new(),
                })
                .text
                .push(byte);
        }
    }
    tokens.extend(current);
    tokens
}

/// Read the typed letters out of a text buffer, returning them with the
/// offset of the first letter.
pub fn text_buffer_contents(memory: &Memory, version: u8, buffer: u32) -> VmResult<(Vec<u8>, u8)> {
    if version >= 5 {
        let len = memory.read_byte(buffer as usize + 1)? as usize;
        Ok((memory.read_bytes(buffer as usize + 2, len)?.to_vec(), 2))
    } else {
        let max = memory.read_byte(buffer as usize)? as usize;
        let bytes = memory.read_bytes(buffer as usize + 1, max.max(1))?;
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok((bytes[..len].to_vec(), 1))
    }
}

/// Tokenise a text buffer into a parse buffer.
///
/// When `skip_unknown` is set, entries for words not in the dictionary are
/// left untouched (their slot is still counted).
pub fn tokenise(
    memory: &mut Memory,
    text: &ZText,
    dictionary: &Dictionary,
    text_buffer: u32,
    parse_buffer: u32,
    skip_unknown: bool,
) -> VmResult<()> {
    let (letters, start) = text_buffer_contents(memory, text.version(), text_buffer)?;
    let max_words = memory.read_byte(parse_buffer as usize)? as usize;
    let tokens = split_words(&letters, &dictionary.separators, start);
    let count = tokens.len().min(max_words);

    for (index, token) in tokens.iter().take(count).enumerate() {
        let encoded = text.encode_word(&token.text);
        let entry = dictionary.lookup(memory, &encoded)?;
        if entry == 0 && skip_unknown {
            continue;
        }
        let block = parse_buffer as usize + 2 + index * 4;
        memory.write_word(block, entry as u16)?;
        memory.write_byte(block + 2, token.text.len() as u8)?;
        memory.write_byte(block + 3, token.position)?;
    }
    memory.write_byte(parse_buffer as usize + 1, count as u8)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_vm_bytecode::header::offsets;
    use quill_vm_bytecode::{Assembler, Header};

    /// Builds a v3 story with a sorted dictionary and returns
    /// `(memory, text, dictionary, text buffer, parse buffer)`.
    fn fixture(words: &[&str], sorted: bool) -> (Memory, ZText, Dictionary, u32, u32) {
        let probe = Memory::new(Assembler::new(3).finish().unwrap());
        let probe_text = ZText::new(&probe, &Header::read(&probe).unwrap()).unwrap();
        let mut encoded: Vec<Vec<u16>> = words.iter().map(|w| probe_text.encode_word(w.as_bytes())).collect();
        if sorted {
            encoded.sort();
        }

        let mut asm = Assembler::new(3);
        let dictionary = asm.position();
        asm.byte(2).bytes(b".,").byte(7);
        let count = encoded.len() as i16;
        let stored = if sorted { count } else { -count };
        asm.word(stored as u16);
        for entry in &encoded {
            asm.text(entry).bytes(&[0, 0, 0]);
        }
        asm.set_header_word(offsets::DICTIONARY, dictionary as u16);
        let text_buffer = asm.zeros(32);
        let parse_buffer = asm.zeros(2 + 4 * 8);
        let mut image = asm.finish().unwrap();
        image[text_buffer as usize] = 30;
        image[parse_buffer as usize] = 8;

        let memory = Memory::new(image);
        let text = ZText::new(&memory, &Header::read(&memory).unwrap()).unwrap();
        let dictionary = Dictionary::read(&memory, dictionary).unwrap();
        (memory, text, dictionary, text_buffer, parse_buffer)
    }

    #[test]
    fn reads_header_and_looks_up() {
        let (memory, text, dictionary, ..) = fixture(&["north", "lamp", "take", "go"], true);
        assert_eq!(dictionary.separators, b".,");
        assert_eq!(dictionary.entry_count, 4);
        assert!(dictionary.sorted);
        for word in ["north", "lamp", "take", "go"] {
            assert_ne!(dictionary.lookup(&memory, &text.encode_word(word.as_bytes())).unwrap(), 0);
        }
        assert_eq!(dictionary.lookup(&memory, &text.encode_word(b"xyzzy")).unwrap(), 0);
    }

    #[test]
    fn unsorted_dictionaries_search_linearly() {
        let (memory, text, dictionary, ..) = fixture(&["zebra", "apple"], false);
        assert!(!dictionary.sorted);
        assert_ne!(dictionary.lookup(&memory, &text.encode_word(b"apple")).unwrap(), 0);
    }

    #[test]
    fn splits_on_spaces_and_separators() {
        let tokens = split_words(b"take lamp,go", b".,", 1);
        let texts: Vec<&[u8]> = tokens.iter().map(|t| t.text.as_slice()).collect();
        assert_eq!(texts, vec![&b"take"[..], b"lamp", b",", b"go"]);
        assert_eq!(tokens[1].position, 6);
        assert_eq!(tokens[2].position, 10);
    }

    #[test]
    fn tokenise_fills_parse_buffer() {
        let (mut memory, text, dictionary, text_buffer, parse_buffer) =
            fixture(&["take", "lamp"], true);
        memory.write_bytes(text_buffer as usize + 1, b"take the lamp\0").unwrap();
        tokenise(&mut memory, &text, &dictionary, text_buffer, parse_buffer, false).unwrap();

        let parse = parse_buffer as usize;
        assert_eq!(memory.read_byte(parse + 1).unwrap(), 3);
        let take = dictionary.lookup(&memory, &text.encode_word(b"take")).unwrap();
        assert_eq!(memory.read_word(parse + 2).unwrap(), take as u16);
        assert_eq!(memory.read_byte(parse + 4).unwrap(), 4);
        assert_eq!(memory.read_byte(parse + 5).unwrap(), 1);
        assert_eq!(memory.read_word(parse + 6).unwrap(), 0);
        assert_eq!(memory.read_byte(parse + 13).unwrap(), 10);

        memory.write_word(parse + 6, 0xffff).unwrap();
        tokenise(&mut memory, &text, &dictionary, text_buffer, parse_buffer, true).unwrap();
        assert_eq!(memory.read_word(parse + 6).unwrap(), 0xffff);
    }
}
