//! Z-string text
//!
//! Decoding of packed Z-character strings (alphabets, shifts,
//! abbreviations, ZSCII escapes) and encoding of dictionary words.

use quill_vm_bytecode::{Header, Memory};

use crate::error::{VmError, VmResult};

/// Header extension table pointer (v5+)
const HEADER_EXTENSION: usize = 0x36;

/// ZSCII newline
pub const ZSCII_NEWLINE: u16 = 13;

/// First ZSCII code of the extra-characters range
const EXTRA_FIRST: u16 = 155;
/// Last ZSCII code of the extra-characters range
const EXTRA_LAST: u16 = 251;

/// Default translation of ZSCII 155-223
const DEFAULT_UNICODE: &str = "äöüÄÖÜß»«ëïÿËÏáéíóúýÁÉÍÓÚÝàèìòùÀÈÌÒÙâêîôûÂÊÎÔÛåÅøØãñõÃÑÕæÆçÇþðÞÐ£œŒ¡¿";

const A0: &[u8; 26] = b"abcdefghijklmnopqrstuvwxyz";
const A1: &[u8; 26] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const A2: &[u8; 26] = b" \r0123456789.,!?_#'\"/\\-:()";
const A2_V1: &[u8; 26] = b" 0123456789.,!?_#'\"/\\<-:()";

/// Text decoder and encoder bound to one story
#[derive(Debug, Clone)]
pub struct ZText {
    version: u8,
    abbreviations: u32,
    alphabets: [[u8; 26]; 3],
    unicode: Vec<char>,
}

impl ZText {
    /// Read alphabet, abbreviation and Unicode tables for a story.
    pub fn new(memory: &Memory, header: &Header) -> VmResult<Self> {
        let version = header.version;
        let mut alphabets = [*A0, *A1, if version == 1 { *A2_V1 } else { *A2 }];

        if version >= 5 && header.alphabet_table != 0 {
            let table = memory.read_bytes(header.alphabet_table as usize, 78)?;
            for (index, alphabet) in alphabets.iter_mut().enumerate() {
                alphabet.copy_from_slice(&table[index * 26..index * 26 + 26]);
            }
            alphabets[2][1] = ZSCII_NEWLINE as u8;
        }

        let mut unicode: Vec<char> = DEFAULT_UNICODE.chars().collect();
        if version >= 5 {
            if let Some(custom) = Self::unicode_table(memory)? {
                unicode = custom;
            }
        }

        Ok(Self {
            version,
            abbreviations: header.abbreviations as u32,
            alphabets,
            unicode,
        })
    }

    fn unicode_table(memory: &Memory) -> VmResult<Option<Vec<char>>> {
        let extension = memory.read_word(HEADER_EXTENSION)? as usize;
        if extension == 0 || memory.read_word(extension)? < 3 {
            return Ok(None);
        }
        let table = memory.read_word(extension + 6)? as usize;
        if table == 0 {
            return Ok(None);
        }
        let count = memory.read_byte(table)? as usize;
        let chars = memory
            .read_words(table + 1, count)?
            .into_iter()
            .map(|unit| char::from_u32(unit as u32).unwrap_or('?'))
            .collect();
        Ok(Some(chars))
    }

    /// Story version.
    #[inline]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Words in an encoded dictionary entry (2 before v4, 3 after).
    #[inline]
    pub fn dictionary_words(&self) -> usize {
        if self.version <= 3 { 2 } else { 3 }
    }

    /// Decode the string at `address`; also returns its length in bytes.
    pub fn decode(&self, memory: &Memory, address: u32) -> VmResult<(String, u32)> {
        let words = read_zstring(memory, address)?;
        let text = self.decode_words(memory, &words)?;
        Ok((text, words.len() as u32 * 2))
    }

    /// Decode already-read Z-string words.
    pub fn decode_words(&self, memory: &Memory, words: &[u16]) -> VmResult<String> {
        let mut out = String::new();
        self.decode_zchars(memory, &unpack(words), &mut out, false)?;
        Ok(out)
    }

    fn decode_zchars(
        &self,
        memory: &Memory,
        zchars: &[u8],
        out: &mut String,
        nested: bool,
    ) -> VmResult<()> {
        let mut lock = 0usize;
        let mut shift: Option<usize> = None;
        let mut chars = zchars.iter().copied();

        while let Some(z) = chars.next() {
            let alphabet = shift.take().unwrap_or(lock);
            match (z, self.version) {
                (0, _) => out.push(' '),
                (1, 1) => out.push('\n'),
                (1, 2) | (1..=3, 3..) => {
                    let Some(index) = chars.next() else { break };
                    if !nested {
                        let entry = 32 * (z as u32 - 1) + index as u32;
                        self.abbreviation(memory, entry, out)?;
                    }
                }
                (2 | 3, 1 | 2) => shift = Some((lock + z as usize - 1) % 3),
                (4 | 5, 1 | 2) => lock = (lock + z as usize - 3) % 3,
                (4, _) => shift = Some(1),
                (5, _) => shift = Some(2),
                (6, _) if alphabet == 2 => {
                    let (Some(high), Some(low)) = (chars.next(), chars.next()) else {
                        break;
                    };
                    let code = ((high as u16) << 5) | low as u16;
                    self.push_zscii(out, code);
                }
                _ => {
                    let code = self.alphabets[alphabet][z as usize - 6];
                    self.push_zscii(out, code as u16);
                }
            }
        }
        Ok(())
    }

    fn abbreviation(&self, memory: &Memory, entry: u32, out: &mut String) -> VmResult<()> {
        let pointer = memory.read_word((self.abbreviations + entry * 2) as usize)?;
        let words = read_zstring(memory, pointer as u32 * 2)?;
        self.decode_zchars(memory, &unpack(&words), out, true)
    }

    fn push_zscii(&self, out: &mut String, code: u16) {
        if let Some(ch) = self.zscii_to_char(code) {
            out.push(ch);
        }
    }

    /// Translate an output ZSCII code. Returns `None` for codes with no
    /// printable form.
    pub fn zscii_to_char(&self, code: u16) -> Option<char> {
        match code {
            0 => None,
            9 if self.version == 6 => Some('\t'),
            11 if self.version == 6 => Some(' '),
            ZSCII_NEWLINE => Some('\n'),
            32..=126 => Some(code as u8 as char),
            EXTRA_FIRST..=EXTRA_LAST => Some(
                self.unicode
                    .get((code - EXTRA_FIRST) as usize)
                    .copied()
                    .unwrap_or('?'),
            ),
            _ => Some('?'),
        }
    }

    /// Translate an input character to ZSCII.
    pub fn char_to_zscii(&self, ch: char) -> Option<u16> {
        match ch {
            '\n' | '\r' => Some(ZSCII_NEWLINE),
            ' '..='~' => Some(ch as u16),
            _ => self
                .unicode
                .iter()
                .position(|&c| c == ch)
                .map(|index| EXTRA_FIRST + index as u16),
        }
    }

    /// Encode ZSCII text as a dictionary word, truncated and padded to the
    /// dictionary resolution.
    pub fn encode_word(&self, zscii: &[u8]) -> Vec<u16> {
        let resolution = self.dictionary_words() * 3;
        let (shift1, shift2) = if self.version <= 2 { (2, 3) } else { (4, 5) };
        let mut zchars = Vec::with_capacity(resolution + 3);

        for &byte in zscii {
            if zchars.len() >= resolution {
                break;
            }
            let byte = byte.to_ascii_lowercase();
            if byte == b' ' {
                zchars.push(0);
            } else if let Some(index) = self.alphabets[0].iter().position(|&c| c == byte) {
                zchars.push(index as u8 + 6);
            } else if let Some(index) = self.alphabets[1].iter().position(|&c| c == byte) {
                zchars.extend([shift1, index as u8 + 6]);
            } else if let Some(index) = self.alphabets[2]
                .iter()
                .skip(1)
                .position(|&c| c == byte)
                .map(|i| i + 1)
            {
                zchars.extend([shift2, index as u8 + 6]);
            } else {
                zchars.extend([shift2, 6, byte >> 5, byte & 0x1f]);
            }
        }
        zchars.resize(resolution, 5);

        let mut words: Vec<u16> = zchars
            .chunks_exact(3)
            .map(|c| ((c[0] as u16) << 10) | ((c[1] as u16) << 5) | c[2] as u16)
            .collect();
        if let Some(last) = words.last_mut() {
            *last |= 0x8000;
        }
        words
    }
}

/// Read Z-string words up to and including the one with the end bit.
pub fn read_zstring(memory: &Memory, address: u32) -> VmResult<Vec<u16>> {
    let mut reader = memory.reader(address as usize);
    let mut words = Vec::new();
    loop {
        let word = reader.next_word()?;
        words.push(word);
        if word & 0x8000 != 0 {
            return Ok(words);
        }
        if words.len() > memory.len() / 2 {
            return Err(VmError::InvalidText(format!(
                "unterminated string at {address:#x}"
            )));
        }
    }
}

fn unpack(words: &[u16]) -> Vec<u8> {
    words
        .iter()
        .flat_map(|&w| [(w >> 10) as u8 & 0x1f, (w >> 5) as u8 & 0x1f, w as u8 & 0x1f])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_vm_bytecode::Assembler;
    use quill_vm_bytecode::assembler::encode_zstring;
    use quill_vm_bytecode::header::offsets;

    fn story(version: u8, build: impl FnOnce(&mut Assembler)) -> (Memory, ZText) {
        let mut asm = Assembler::new(version);
        build(&mut asm);
        let memory = Memory::new(asm.finish().unwrap());
        let header = Header::read(&memory).unwrap();
        let text = ZText::new(&memory, &header).unwrap();
        (memory, text)
    }

    #[test]
    fn decodes_all_alphabets() {
        let mut address = 0;
        let (memory, text) = story(3, |asm| {
            address = asm.string("Hello, World 42!\nbye");
        });
        let (decoded, len) = text.decode(&memory, address).unwrap();
        assert_eq!(decoded, "Hello, World 42!\nbye");
        assert_eq!(len % 2, 0);
    }

    #[test]
    fn zscii_escape_and_unicode() {
        let mut address = 0;
        let (memory, text) = story(5, |asm| {
            address = asm.string("a@b");
        });
        assert_eq!(text.decode(&memory, address).unwrap().0, "a@b");
        assert_eq!(text.zscii_to_char(155), Some('ä'));
        assert_eq!(text.zscii_to_char(223), Some('¿'));
        assert_eq!(text.char_to_zscii('é'), Some(170));
        assert_eq!(text.char_to_zscii('\n'), Some(ZSCII_NEWLINE));
    }

    #[test]
    fn abbreviations_expand_once() {
        let mut address = 0;
        let (memory, text) = story(3, |asm| {
            asm.align(2);
            let table = asm.zeros(96 * 2);
            asm.set_header_word(offsets::ABBREVIATIONS, table as u16);
            let the = asm.string("the ");
            asm.patch_word(table + 2, (the / 2) as u16);
            address = asm.position();
            // abbreviation 1 (bank 1, index 1), then "end"
            let words = [(1 << 10) | (1 << 5) | 10, 0x8000 | (19 << 10) | (9 << 5) | 5];
            asm.text(&words);
        });
        assert_eq!(text.decode(&memory, address).unwrap().0, "the end");
    }

    #[test]
    fn version_one_and_two_shift_locks() {
        let words = encode_zstring("aB", 2);
        let (memory, text) = story(2, |_| {});
        assert_eq!(text.decode_words(&memory, &words).unwrap(), "aB");

        // shift lock up twice (to A2) then "1"
        let word = 0x8000 | (4 << 10) | (4 << 5) | 9;
        assert_eq!(text.decode_words(&memory, &[word]).unwrap(), "1");
    }

    #[test]
    fn dictionary_encoding_truncates() {
        let (_, v3) = story(3, |_| {});
        let (_, v5) = story(5, |_| {});
        assert_eq!(v3.encode_word(b"lantern").len(), 2);
        assert_eq!(v3.encode_word(b"lanter"), v3.encode_word(b"lantern"));
        assert_eq!(v5.encode_word(b"lantern").len(), 3);
        assert_eq!(v3.encode_word(b"Go"), v3.encode_word(b"go"));
        let words = v5.encode_word(b"");
        assert_eq!(words, vec![0x14a5, 0x14a5, 0x94a5]);
    }
}
