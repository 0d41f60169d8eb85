//! Instruction decoder
//!
//! Decoding is a pure function of the memory contents, the address and the
//! story version, so results are memoized per address.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::Result;
use crate::instruction::{Branch, Instruction, Operands};
use crate::memory::{Memory, MemoryReader};
use crate::opcode::{Opcode, OpcodeKind};
use crate::operand::{Operand, OperandKind, Variable};

/// First byte of an extended instruction (v5+)
pub const EXTENDED_PREFIX: u8 = 0xbe;

/// Caching instruction decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    version: u8,
    cache: FxHashMap<u32, Arc<Instruction>>,
    cache_floor: u32,
    hits: u64,
    misses: u64,
}

impl Decoder {
    /// Create a decoder for a story version.
    pub fn new(version: u8) -> Self {
        Self::with_cache_floor(version, 0)
    }

    /// Create a decoder that only caches instructions at or above `floor`.
    ///
    /// Instructions below the floor are decoded fresh on every call, so
    /// writes to that region never need invalidation.
    pub fn with_cache_floor(version: u8, floor: u32) -> Self {
        Self {
            version,
            cache: FxHashMap::default(),
            cache_floor: floor,
            hits: 0,
            misses: 0,
        }
    }

    /// Story version this decoder targets.
    #[inline]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Decode the instruction at `address`, reusing a cached result.
    pub fn decode(&mut self, memory: &Memory, address: u32) -> Result<Arc<Instruction>> {
        if address < self.cache_floor {
            return Ok(Arc::new(decode(memory, self.version, address)?));
        }
        if let Some(instruction) = self.cache.get(&address) {
            self.hits += 1;
            return Ok(Arc::clone(instruction));
        }
        self.misses += 1;
        let instruction = Arc::new(decode(memory, self.version, address)?);
        self.cache.insert(address, Arc::clone(&instruction));
        Ok(instruction)
    }

    /// Decode without touching the cache.
    pub fn decode_uncached(&self, memory: &Memory, address: u32) -> Result<Instruction> {
        decode(memory, self.version, address)
    }

    /// Drop cached instructions overlapping `[address, address + len)`.
    pub fn invalidate(&mut self, address: u32, len: u32) {
        let end = address.saturating_add(len);
        self.cache
            .retain(|&start, instruction| start >= end || instruction.next_address() <= address);
    }

    /// Drop every cached instruction.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Number of cached instructions.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// `(hits, misses)` since creation.
    pub fn cache_stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

/// Decode one instruction at `address`.
pub fn decode(memory: &Memory, version: u8, address: u32) -> Result<Instruction> {
    let mut reader = memory.reader(address as usize);
    let first = reader.next_byte()?;

    let mut kinds: SmallVec<[OperandKind; 8]> = SmallVec::new();
    let opcode;

    if first == EXTENDED_PREFIX && version >= 5 {
        let number = reader.next_byte()?;
        opcode = Opcode::lookup(OpcodeKind::Ext, number, version);
        read_kind_byte(&mut reader, &mut kinds)?;
    } else {
        match first >> 6 {
            0b11 => {
                let kind = if first & 0x20 == 0 {
                    OpcodeKind::Op2
                } else {
                    OpcodeKind::Var
                };
                opcode = Opcode::lookup(kind, first & 0x1f, version);
                read_kind_byte(&mut reader, &mut kinds)?;
                if opcode.is_double_variable() {
                    read_kind_byte(&mut reader, &mut kinds)?;
                }
            }
            0b10 => {
                let operand_kind = OperandKind::from_bits(first >> 4);
                if operand_kind == OperandKind::Omitted {
                    opcode = Opcode::lookup(OpcodeKind::Op0, first & 0x0f, version);
                } else {
                    opcode = Opcode::lookup(OpcodeKind::Op1, first & 0x0f, version);
                    kinds.push(operand_kind);
                }
            }
            _ => {
                opcode = Opcode::lookup(OpcodeKind::Op2, first & 0x1f, version);
                for mask in [0x40, 0x20] {
                    kinds.push(if first & mask == 0 {
                        OperandKind::SmallConstant
                    } else {
                        OperandKind::Variable
                    });
                }
            }
        }
    }

    let mut operands = Operands::new();
    for kind in kinds.iter().copied().take_while(|&k| k != OperandKind::Omitted) {
        operands.push(match kind {
            OperandKind::LargeConstant => Operand::LargeConstant(reader.next_word()?),
            OperandKind::SmallConstant => Operand::SmallConstant(reader.next_byte()?),
            OperandKind::Variable => Operand::Variable(Variable::from_byte(reader.next_byte()?)),
            OperandKind::Omitted => unreachable!("omitted operands end the list"),
        });
    }

    let store = if opcode.has_store(version) {
        Some(Variable::from_byte(reader.next_byte()?))
    } else {
        None
    };

    let branch = if opcode.has_branch(version) {
        let (condition, offset) = read_branch(&mut reader)?;
        Some(Branch::new(condition, offset, reader.address() as u32))
    } else {
        None
    };

    let text = if opcode.has_text() {
        let mut words = Vec::new();
        loop {
            let word = reader.next_word()?;
            words.push(word);
            if word & 0x8000 != 0 {
                break;
            }
        }
        Some(words)
    } else {
        None
    };

    Ok(Instruction {
        address,
        length: reader.address() as u32 - address,
        opcode,
        operands,
        store,
        branch,
        text,
    })
}

fn read_kind_byte(
    reader: &mut MemoryReader<'_>,
    kinds: &mut SmallVec<[OperandKind; 8]>,
) -> Result<()> {
    let byte = reader.next_byte()?;
    for shift in [6, 4, 2, 0] {
        kinds.push(OperandKind::from_bits(byte >> shift));
    }
    Ok(())
}

/// Read branch bytes, returning `(condition, offset)`.
///
/// The short form carries an unsigned 6-bit offset; the long form a 14-bit
/// two's-complement offset.
fn read_branch(reader: &mut MemoryReader<'_>) -> Result<(bool, i16)> {
    let first = reader.next_byte()?;
    let condition = first & 0x80 != 0;
    if first & 0x40 != 0 {
        return Ok((condition, (first & 0x3f) as i16));
    }
    let raw = (((first & 0x3f) as u16) << 8) | reader.next_byte()? as u16;
    let offset = if raw & 0x2000 != 0 {
        (raw | 0xc000) as i16
    } else {
        raw as i16
    };
    Ok((condition, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::BranchTarget;
    use proptest::prelude::*;

    fn at(bytes: &[u8]) -> Memory {
        let mut image = vec![0u8; 0x40];
        image.extend_from_slice(bytes);
        image.extend_from_slice(&[0; 8]);
        Memory::new(image)
    }

    #[test]
    fn long_form_add_with_store() {
        // add L00 #05 -> SP
        let memory = at(&[0x54, 0x01, 0x05, 0x00]);
        let instruction = decode(&memory, 3, 0x40).unwrap();
        assert_eq!(instruction.opcode, Opcode::Add);
        assert_eq!(
            instruction.operands.as_slice(),
            &[
                Operand::Variable(Variable::Local(0)),
                Operand::SmallConstant(5)
            ]
        );
        assert_eq!(instruction.store, Some(Variable::Stack));
        assert_eq!(instruction.length, 4);
    }

    #[test]
    fn short_form_and_zero_op() {
        // jz G00 ?~rtrue
        let memory = at(&[0xa0, 0x10, 0x41]);
        let instruction = decode(&memory, 3, 0x40).unwrap();
        assert_eq!(instruction.opcode, Opcode::Jz);
        let branch = instruction.branch.unwrap();
        assert!(!branch.condition);
        assert_eq!(branch.target, BranchTarget::ReturnTrue);

        let memory = at(&[0xb0]);
        let instruction = decode(&memory, 3, 0x40).unwrap();
        assert_eq!(instruction.opcode, Opcode::Rtrue);
        assert!(instruction.operands.is_empty());
        assert_eq!(instruction.length, 1);
    }

    #[test]
    fn variable_form_call_stops_at_omitted() {
        // call #1234 L01 -> G00
        let memory = at(&[0xe0, 0x2f, 0x12, 0x34, 0x02, 0x10]);
        let instruction = decode(&memory, 3, 0x40).unwrap();
        assert_eq!(instruction.opcode, Opcode::CallVS);
        assert_eq!(instruction.operands.len(), 2);
        assert_eq!(instruction.store, Some(Variable::Global(0)));
        assert_eq!(instruction.length, 6);
    }

    #[test]
    fn double_variable_call_reads_two_kind_bytes() {
        // call_vs2 #1234 #01 #02 #03 #04 -> SP
        let memory = at(&[
            0xec, 0x15, 0x7f, 0x12, 0x34, 0x01, 0x02, 0x03, 0x04, 0x00,
        ]);
        let instruction = decode(&memory, 5, 0x40).unwrap();
        assert_eq!(instruction.opcode, Opcode::CallVS2);
        assert_eq!(instruction.operands.len(), 5);
        assert_eq!(instruction.length, 10);
    }

    #[test]
    fn extended_form() {
        // log_shift #01 #02 -> SP
        let memory = at(&[0xbe, 0x02, 0x5f, 0x01, 0x02, 0x00]);
        let instruction = decode(&memory, 5, 0x40).unwrap();
        assert_eq!(instruction.opcode, Opcode::LogShift);
        assert_eq!(instruction.operands.len(), 2);
        assert_eq!(instruction.length, 6);
    }

    #[test]
    fn long_branch_sign_extends() {
        // je #01 #01 ?(raw 0x2000)
        let memory = at(&[0x01, 0x01, 0x01, 0xa0, 0x00]);
        let branch = decode(&memory, 3, 0x40).unwrap().branch.unwrap();
        assert!(branch.condition);
        assert_eq!(branch.offset, -8192);

        let memory = at(&[0x01, 0x01, 0x01, 0x9f, 0xff]);
        let branch = decode(&memory, 3, 0x40).unwrap().branch.unwrap();
        assert_eq!(branch.offset, 8191);
    }

    #[test]
    fn embedded_text_ends_on_high_bit() {
        let memory = at(&[0xb2, 0x11, 0xaa, 0x46, 0x34, 0x96, 0x45, 0xb0]);
        let instruction = decode(&memory, 3, 0x40).unwrap();
        assert_eq!(instruction.opcode, Opcode::Print);
        assert_eq!(instruction.text.as_deref(), Some(&[0x11aa, 0x4634, 0x9645][..]));
        assert_eq!(instruction.length, 7);
    }

    #[test]
    fn truncated_instruction_is_out_of_range() {
        let memory = Memory::new(vec![0xe0, 0x0f]);
        assert!(decode(&memory, 3, 0).is_err());
    }

    #[test]
    fn cache_returns_the_same_instruction() {
        let memory = at(&[0x54, 0x01, 0x05, 0x00]);
        let mut decoder = Decoder::new(3);
        let first = decoder.decode(&memory, 0x40).unwrap();
        let second = decoder.decode(&memory, 0x40).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(decoder.cache_stats(), (1, 1));

        decoder.invalidate(0x42, 1);
        assert_eq!(decoder.cached(), 0);
    }

    #[test]
    fn below_the_cache_floor_decodes_fresh() {
        let mut memory = at(&[0x54, 0x01, 0x05, 0x00]);
        let mut decoder = Decoder::with_cache_floor(3, 0x100);
        assert_eq!(decoder.decode(&memory, 0x40).unwrap().opcode, Opcode::Add);
        assert_eq!(decoder.cached(), 0);

        memory.write_byte(0x40, 0x55).unwrap();
        assert_eq!(decoder.decode(&memory, 0x40).unwrap().opcode, Opcode::Sub);
    }

    proptest! {
        #[test]
        fn decoding_is_idempotent(bytes in proptest::collection::vec(any::<u8>(), 1..64), version in 1u8..=8) {
            let memory = Memory::new(bytes);
            let mut decoder = Decoder::new(version);
            for address in 0..memory.len() as u32 {
                let plain = decoder.decode_uncached(&memory, address);
                let cached = decoder.decode(&memory, address);
                let again = decoder.decode(&memory, address);
                match (plain, cached, again) {
                    (Ok(plain), Ok(cached), Ok(again)) => {
                        prop_assert_eq!(&plain, cached.as_ref());
                        prop_assert_eq!(&plain, again.as_ref());
                    }
                    (Err(a), Err(b), Err(c)) => {
                        prop_assert_eq!(&a, &b);
                        prop_assert_eq!(&a, &c);
                    }
                    _ => prop_assert!(false, "cached and uncached decodes disagree"),
                }
            }
        }
    }
}
