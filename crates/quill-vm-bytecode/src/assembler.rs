//! Minimal Z-code assembler
//!
//! Builds complete story images in memory for tests and benchmarks. Errors
//! are collected while emitting and reported once by [`Assembler::finish`],
//! so call chains stay short.

use crate::error::{AssembleError, BytecodeError, Result};
use crate::header::{HEADER_SIZE, offsets, packed_multiplier};
use crate::opcode::{Opcode, OpcodeKind};
use crate::operand::{Operand, OperandKind, Variable};

/// Forward-referenceable code position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy)]
enum FixupKind {
    Branch { condition: bool },
    Jump,
}

#[derive(Debug, Clone, Copy)]
struct Fixup {
    at: usize,
    label: Label,
    kind: FixupKind,
}

/// Object description for [`Assembler::object_table`]
#[derive(Debug, Clone, Default)]
pub struct ObjectEntry {
    /// Attributes to set
    pub attributes: Vec<u8>,
    /// Parent object number
    pub parent: u16,
    /// Sibling object number
    pub sibling: u16,
    /// First child object number
    pub child: u16,
    /// Short name
    pub name: String,
    /// `(number, payload)` pairs in any order
    pub properties: Vec<(u8, Vec<u8>)>,
}

/// Story image builder
#[derive(Debug, Clone)]
pub struct Assembler {
    version: u8,
    bytes: Vec<u8>,
    labels: Vec<Option<u32>>,
    fixups: Vec<Fixup>,
    error: Option<AssembleError>,
}

/// Small constant operand
pub const fn small(value: u8) -> Operand {
    Operand::SmallConstant(value)
}

/// Large constant operand
pub const fn large(value: u16) -> Operand {
    Operand::LargeConstant(value)
}

/// Stack operand
pub const fn sp() -> Operand {
    Operand::Variable(Variable::Stack)
}

/// Local variable operand (zero-based)
pub const fn local(index: u8) -> Operand {
    Operand::Variable(Variable::Local(index))
}

/// Global variable operand (zero-based)
pub const fn global(index: u8) -> Operand {
    Operand::Variable(Variable::Global(index))
}

impl Assembler {
    /// Start an image with an empty header for `version`.
    pub fn new(version: u8) -> Self {
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[offsets::VERSION] = version;
        Self {
            version,
            bytes,
            labels: Vec::new(),
            fixups: Vec::new(),
            error: None,
        }
    }

    /// Target version.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Address the next byte lands at.
    pub fn position(&self) -> u32 {
        self.bytes.len() as u32
    }

    /// Overwrite a header byte.
    pub fn set_header_byte(&mut self, offset: usize, value: u8) -> &mut Self {
        self.bytes[offset] = value;
        self
    }

    /// Overwrite a header word.
    pub fn set_header_word(&mut self, offset: usize, value: u16) -> &mut Self {
        self.bytes[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
        self
    }

    /// Overwrite a word anywhere already emitted.
    pub fn patch_word(&mut self, address: u32, value: u16) -> &mut Self {
        let at = address as usize;
        self.bytes[at..at + 2].copy_from_slice(&value.to_be_bytes());
        self
    }

    /// Emit one byte.
    pub fn byte(&mut self, value: u8) -> &mut Self {
        self.bytes.push(value);
        self
    }

    /// Emit one big-endian word.
    pub fn word(&mut self, value: u16) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Emit raw bytes.
    pub fn bytes(&mut self, values: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(values);
        self
    }

    /// Emit `len` zero bytes and return their start.
    pub fn zeros(&mut self, len: usize) -> u32 {
        let start = self.position();
        self.bytes.resize(self.bytes.len() + len, 0);
        start
    }

    /// Pad with zeros to a multiple of `alignment`.
    pub fn align(&mut self, alignment: usize) -> &mut Self {
        while self.bytes.len() % alignment != 0 {
            self.bytes.push(0);
        }
        self
    }

    /// Reserve the 240-word global table, seed it, and point the header at it.
    pub fn globals(&mut self, initial: &[u16]) -> u32 {
        let start = self.zeros(240 * 2);
        for (index, value) in initial.iter().take(240).enumerate() {
            self.patch_word(start + index as u32 * 2, *value);
        }
        self.set_header_word(offsets::GLOBALS, start as u16);
        start
    }

    /// Start a routine with the given locals and return its header address.
    ///
    /// Local initial values are only stored before v5.
    pub fn routine(&mut self, locals: &[u16]) -> u32 {
        self.align(packed_multiplier(self.version) as usize);
        let start = self.position();
        self.byte(locals.len() as u8);
        if self.version < 5 {
            for value in locals {
                self.word(*value);
            }
        }
        start
    }

    /// Pack a routine or string address.
    pub fn pack(&self, address: u32) -> u16 {
        (address / packed_multiplier(self.version)) as u16
    }

    /// Point the header at `routine` as the main routine.
    pub fn set_main(&mut self, routine: u32) -> &mut Self {
        let value = if self.version == 6 {
            self.pack(routine)
        } else {
            let locals = self.bytes[routine as usize] as u32;
            let defaults = if self.version < 5 { locals * 2 } else { 0 };
            (routine + 1 + defaults) as u16
        };
        self.set_header_word(offsets::INITIAL_PC, value)
    }

    /// Create an unbound label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current position.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.position());
        self
    }

    /// Create a label bound here.
    pub fn here(&mut self) -> Label {
        let label = self.label();
        self.bind(label);
        label
    }

    fn fail(&mut self, error: AssembleError) -> &mut Self {
        self.error.get_or_insert(error);
        self
    }

    /// Emit an opcode and its operands. Store, branch and text follow with
    /// [`store`](Self::store), [`branch`](Self::branch) and [`text`](Self::text).
    pub fn op(&mut self, opcode: Opcode, operands: &[Operand]) -> &mut Self {
        let Some((kind, number)) = opcode.encoding(self.version) else {
            return self.fail(AssembleError::NotEncodable {
                opcode: opcode.to_string(),
                version: self.version,
            });
        };
        let count_error = || AssembleError::OperandCount {
            opcode: opcode.to_string(),
            count: operands.len(),
        };

        match kind {
            OpcodeKind::Op0 => {
                if !operands.is_empty() {
                    return self.fail(count_error());
                }
                self.byte(0xb0 | number);
            }
            OpcodeKind::Op1 => {
                let [operand] = operands else {
                    return self.fail(count_error());
                };
                self.byte(0x80 | (operand.kind().bits() << 4) | number);
                self.operand(*operand);
            }
            OpcodeKind::Op2
                if operands.len() == 2
                    && operands.iter().all(|o| o.kind() != OperandKind::LargeConstant) =>
            {
                let flag = |operand: &Operand, bit: u8| {
                    if operand.kind() == OperandKind::Variable { bit } else { 0 }
                };
                self.byte(number | flag(&operands[0], 0x40) | flag(&operands[1], 0x20));
                self.operand(operands[0]).operand(operands[1]);
            }
            OpcodeKind::Op2 | OpcodeKind::Var | OpcodeKind::Ext => {
                let limit = if opcode.is_double_variable() { 8 } else { 4 };
                if operands.len() > limit || (kind == OpcodeKind::Op2 && operands.len() < 2) {
                    return self.fail(count_error());
                }
                match kind {
                    OpcodeKind::Op2 => self.byte(0xc0 | number),
                    OpcodeKind::Var => self.byte(0xe0 | number),
                    _ => self.byte(0xbe).byte(number),
                };
                self.kind_bytes(operands, limit / 4);
                for operand in operands {
                    self.operand(*operand);
                }
            }
        }
        self
    }

    fn kind_bytes(&mut self, operands: &[Operand], count: usize) {
        for chunk in 0..count {
            let mut byte = 0u8;
            for slot in 0..4 {
                let kind = operands
                    .get(chunk * 4 + slot)
                    .map_or(OperandKind::Omitted, |o| o.kind());
                byte |= kind.bits() << (6 - slot * 2);
            }
            self.byte(byte);
        }
    }

    fn operand(&mut self, operand: Operand) -> &mut Self {
        match operand {
            Operand::LargeConstant(value) => self.word(value),
            Operand::SmallConstant(value) => self.byte(value),
            Operand::Variable(variable) => self.byte(variable.to_byte()),
        }
    }

    /// Emit a store target.
    pub fn store(&mut self, variable: Variable) -> &mut Self {
        self.byte(variable.to_byte())
    }

    /// Emit a two-byte branch to `label`.
    pub fn branch(&mut self, condition: bool, label: Label) -> &mut Self {
        let at = self.bytes.len();
        self.fixups.push(Fixup {
            at,
            label,
            kind: FixupKind::Branch { condition },
        });
        self.word(0)
    }

    /// Emit a branch that returns `value` from the routine.
    pub fn branch_return(&mut self, condition: bool, value: bool) -> &mut Self {
        self.branch_offset(condition, value as i16)
    }

    /// Emit a branch with a literal offset, short form when it fits.
    pub fn branch_offset(&mut self, condition: bool, offset: i16) -> &mut Self {
        let polarity = if condition { 0x80 } else { 0 };
        if (0..=63).contains(&offset) {
            self.byte(polarity | 0x40 | offset as u8)
        } else {
            let raw = (offset as u16) & 0x3fff;
            self.byte(polarity | (raw >> 8) as u8).byte(raw as u8)
        }
    }

    /// Emit `jump label`.
    pub fn jump(&mut self, label: Label) -> &mut Self {
        self.byte(0x8c);
        let at = self.bytes.len();
        self.fixups.push(Fixup {
            at,
            label,
            kind: FixupKind::Jump,
        });
        self.word(0)
    }

    /// Emit pre-encoded Z-string words.
    pub fn text(&mut self, words: &[u16]) -> &mut Self {
        for word in words {
            self.word(*word);
        }
        self
    }

    /// Emit `print "text"`.
    pub fn print(&mut self, text: &str) -> &mut Self {
        let words = encode_zstring(text, self.version);
        self.op(Opcode::Print, &[]).text(&words)
    }

    /// Emit an encoded string at the current position and return its address.
    pub fn string(&mut self, text: &str) -> u32 {
        let start = self.position();
        let words = encode_zstring(text, self.version);
        self.text(&words);
        start
    }

    /// Lay out an object table and point the header at it.
    pub fn object_table(&mut self, defaults: &[u16], objects: &[ObjectEntry]) -> u32 {
        let (default_count, entry_size) = if self.version <= 3 { (31, 9) } else { (63, 14) };
        let table = self.position();
        for index in 0..default_count {
            self.word(defaults.get(index).copied().unwrap_or(0));
        }
        let entries = self.zeros(objects.len() * entry_size);

        for (index, object) in objects.iter().enumerate() {
            let entry = (entries as usize) + index * entry_size;
            for &attribute in &object.attributes {
                self.bytes[entry + attribute as usize / 8] |= 0x80 >> (attribute % 8);
            }
            let properties = self.property_table(object);
            if self.version <= 3 {
                self.bytes[entry + 4] = object.parent as u8;
                self.bytes[entry + 5] = object.sibling as u8;
                self.bytes[entry + 6] = object.child as u8;
                self.patch_word(entry as u32 + 7, properties as u16);
            } else {
                self.patch_word(entry as u32 + 6, object.parent);
                self.patch_word(entry as u32 + 8, object.sibling);
                self.patch_word(entry as u32 + 10, object.child);
                self.patch_word(entry as u32 + 12, properties as u16);
            }
        }

        self.set_header_word(offsets::OBJECT_TABLE, table as u16);
        table
    }

    fn property_table(&mut self, object: &ObjectEntry) -> u32 {
        let start = self.position();
        if object.name.is_empty() {
            self.byte(0);
        } else {
            let name = encode_zstring(&object.name, self.version);
            self.byte(name.len() as u8).text(&name);
        }

        let mut properties = object.properties.clone();
        properties.sort_by(|a, b| b.0.cmp(&a.0));
        for (number, data) in &properties {
            let len = data.len();
            if self.version <= 3 {
                if !(1..=8).contains(&len) {
                    self.fail(AssembleError::PropertyLength { number: *number, len });
                    continue;
                }
                self.byte(((len as u8 - 1) << 5) | (number & 0x1f));
            } else {
                match len {
                    1 => self.byte(number & 0x3f),
                    2 => self.byte(0x40 | (number & 0x3f)),
                    3..=64 => self.byte(0x80 | (number & 0x3f)).byte(0x80 | (len as u8 & 0x3f)),
                    _ => {
                        self.fail(AssembleError::PropertyLength { number: *number, len });
                        continue;
                    }
                };
            }
            self.bytes(data);
        }
        self.byte(0);
        start
    }

    /// Resolve labels, set file length and checksum, and return the image.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        if let Some(error) = self.error.take() {
            return Err(error.into());
        }

        for fixup in std::mem::take(&mut self.fixups) {
            let target = self.labels[fixup.label.0]
                .ok_or(AssembleError::UnboundLabel(fixup.label.0))?;
            let next = fixup.at as i64 + 2;
            let offset = target as i64 - next + 2;
            match fixup.kind {
                FixupKind::Branch { condition } => {
                    if !(-8192..=8191).contains(&offset) {
                        return Err(BytecodeError::from(AssembleError::BranchOutOfRange {
                            at: fixup.at,
                            target,
                        }));
                    }
                    let raw = (offset as u16) & 0x3fff;
                    let polarity = if condition { 0x80 } else { 0 };
                    self.bytes[fixup.at] = polarity | (raw >> 8) as u8;
                    self.bytes[fixup.at + 1] = raw as u8;
                }
                FixupKind::Jump => {
                    let raw = (offset as i16).to_be_bytes();
                    self.bytes[fixup.at..fixup.at + 2].copy_from_slice(&raw);
                }
            }
        }

        let scale = match self.version {
            1..=3 => 2,
            4 | 5 => 4,
            _ => 8,
        };
        self.align(scale);
        let length = (self.bytes.len() / scale) as u16;
        self.set_header_word(offsets::FILE_LENGTH, length);
        let checksum = self.bytes[HEADER_SIZE..]
            .iter()
            .fold(0u16, |sum, &b| sum.wrapping_add(b as u16));
        self.set_header_word(offsets::CHECKSUM, checksum);
        Ok(self.bytes)
    }
}

const A0: &str = "abcdefghijklmnopqrstuvwxyz";
const A1: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const A2_V1: &str = " 0123456789.,!?_#'\"/\\<-:()";
const A2: &str = " \n0123456789.,!?_#'\"/\\-:()";

/// Encode text with the default alphabets into Z-string words.
///
/// Characters outside the alphabets use the 10-bit ZSCII escape. The last
/// word carries the end bit.
pub fn encode_zstring(text: &str, version: u8) -> Vec<u16> {
    let a2 = if version == 1 { A2_V1 } else { A2 };
    let (shift1, shift2) = if version <= 2 { (2, 3) } else { (4, 5) };

    let mut zchars: Vec<u8> = Vec::new();
    for ch in text.chars() {
        if ch == ' ' {
            zchars.push(0);
        } else if ch == '\n' && version == 1 {
            zchars.push(1);
        } else if let Some(index) = A0.find(ch) {
            zchars.push(index as u8 + 6);
        } else if let Some(index) = A1.find(ch) {
            zchars.extend([shift1, index as u8 + 6]);
        } else if let Some(index) = a2.find(ch).filter(|&i| i > 0) {
            zchars.extend([shift2, index as u8 + 6]);
        } else {
            let code = ch as u32 as u16 & 0x3ff;
            zchars.extend([shift2, 6, (code >> 5) as u8, (code & 0x1f) as u8]);
        }
    }
    while zchars.is_empty() || zchars.len() % 3 != 0 {
        zchars.push(5);
    }

    let mut words: Vec<u16> = zchars
        .chunks_exact(3)
        .map(|c| ((c[0] as u16) << 10) | ((c[1] as u16) << 5) | c[2] as u16)
        .collect();
    if let Some(last) = words.last_mut() {
        *last |= 0x8000;
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode;
    use crate::header::Header;
    use crate::instruction::BranchTarget;
    use crate::memory::Memory;
    use proptest::prelude::*;

    #[test]
    fn assembles_a_small_routine() {
        let mut asm = Assembler::new(3);
        asm.globals(&[]);
        let main = asm.routine(&[]);
        let done = asm.label();
        asm.op(Opcode::Add, &[small(1), small(2)]).store(Variable::Global(0));
        asm.op(Opcode::Je, &[global(0), small(3)]).branch(true, done);
        asm.op(Opcode::Quit, &[]);
        asm.bind(done);
        asm.op(Opcode::Rtrue, &[]);
        asm.set_main(main);
        let image = asm.finish().unwrap();

        let memory = Memory::new(image);
        let header = Header::read(&memory).unwrap();
        assert_eq!(header.main_routine_address(), main);

        let add = decode(&memory, 3, main + 1).unwrap();
        assert_eq!(add.opcode, Opcode::Add);
        let je = decode(&memory, 3, add.next_address()).unwrap();
        let quit = decode(&memory, 3, je.next_address()).unwrap();
        assert_eq!(
            je.branch.unwrap().target,
            BranchTarget::Address(quit.next_address())
        );
    }

    #[test]
    fn jump_backwards() {
        let mut asm = Assembler::new(5);
        let routine = asm.routine(&[0]);
        let top = asm.here();
        asm.op(Opcode::Inc, &[small(1)]);
        asm.jump(top);
        let image = asm.finish().unwrap();
        let memory = Memory::new(image);
        let inc = decode(&memory, 5, routine + 1).unwrap();
        let jump = decode(&memory, 5, inc.next_address()).unwrap();
        assert_eq!(jump.jump_target(), Some(inc.address));
    }

    #[test]
    fn errors_are_reported_at_finish() {
        let mut asm = Assembler::new(3);
        asm.op(Opcode::Catch, &[]);
        assert!(matches!(
            asm.finish(),
            Err(BytecodeError::Assemble(AssembleError::NotEncodable { .. }))
        ));

        let mut asm = Assembler::new(3);
        let nowhere = asm.label();
        asm.op(Opcode::Jz, &[small(0)]).branch(true, nowhere);
        assert!(matches!(
            asm.finish(),
            Err(BytecodeError::Assemble(AssembleError::UnboundLabel(0)))
        ));
    }

    #[test]
    fn zstring_packing() {
        // "hi" -> h(13) i(14) pad(5)
        assert_eq!(encode_zstring("hi", 3), vec![0x8000 | (13 << 10) | (14 << 5) | 5]);
        assert_eq!(encode_zstring("", 3), vec![0x94a5]);
        // 'A' needs a shift
        assert_eq!(encode_zstring("A", 5), vec![0x8000 | (4 << 10) | (6 << 5) | 5]);
    }

    proptest! {
        #[test]
        fn branch_offsets_round_trip(condition in any::<bool>(), offset in -8192i16..=8191) {
            let mut asm = Assembler::new(3);
            let start = asm.position();
            asm.op(Opcode::Jz, &[small(0)]).branch_offset(condition, offset);
            let memory = Memory::new(asm.finish().unwrap());
            let branch = decode(&memory, 3, start).unwrap().branch.unwrap();
            prop_assert_eq!(branch.condition, condition);
            prop_assert_eq!(branch.offset, offset);
        }
    }
}
