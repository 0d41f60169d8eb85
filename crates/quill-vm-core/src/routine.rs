//! Routines and the routine table
//!
//! A routine runs from its header byte through the last instruction that can
//! be reached by falling through or by a forward branch. Routine boundaries
//! are discovered by following constant call targets from the main routine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use quill_vm_bytecode::{Decoder, Header, Instruction, Memory, Operand};
use serde::Serialize;

use crate::error::{VmError, VmResult};
use crate::stack::MAX_LOCALS;

/// Instructions scanned before a routine is considered malformed
const MAX_ROUTINE_INSTRUCTIONS: usize = 0x4000;

/// A decoded routine
#[derive(Debug, Clone)]
pub struct Routine {
    address: u32,
    defaults: Vec<u16>,
    instructions: Vec<Arc<Instruction>>,
}

impl PartialEq for Routine {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Routine {}

impl std::hash::Hash for Routine {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl Routine {
    /// Decode the routine whose header is at `address`.
    pub fn read(memory: &Memory, decoder: &mut Decoder, address: u32) -> VmResult<Self> {
        let version = decoder.version();
        let mut reader = memory.reader(address as usize);
        let local_count = reader.next_byte()? as usize;
        if local_count > MAX_LOCALS {
            return Err(VmError::InvalidRoutine(address));
        }
        let defaults = if version <= 4 {
            reader.next_words(local_count)?
        } else {
            vec![0; local_count]
        };

        let mut pc = reader.address() as u32;
        let mut furthest = pc;
        let mut instructions = Vec::new();
        loop {
            if instructions.len() >= MAX_ROUTINE_INSTRUCTIONS {
                return Err(VmError::InvalidRoutine(address));
            }
            let instruction = decoder.decode(memory, pc)?;
            let next = instruction.next_address();
            for target in instruction.targets() {
                if target > furthest {
                    furthest = target;
                }
            }
            let terminal = instruction.opcode.is_terminal();
            instructions.push(instruction);
            if terminal && next > furthest {
                break;
            }
            pc = next;
        }

        Ok(Self {
            address,
            defaults,
            instructions,
        })
    }

    /// Header address.
    #[inline]
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Declared local count.
    #[inline]
    pub fn local_count(&self) -> u8 {
        self.defaults.len() as u8
    }

    /// Initial local values.
    #[inline]
    pub fn defaults(&self) -> &[u16] {
        &self.defaults
    }

    /// Decoded instructions in address order.
    #[inline]
    pub fn instructions(&self) -> &[Arc<Instruction>] {
        &self.instructions
    }

    /// Address of the first instruction.
    pub fn entry(&self) -> u32 {
        self.instructions.first().map_or(self.address, |i| i.address)
    }

    /// Address just past the last instruction.
    pub fn end(&self) -> u32 {
        self.instructions
            .last()
            .map_or(self.address, |i| i.next_address())
    }

    /// Index of the instruction starting at `address`.
    pub fn index_of(&self, address: u32) -> Option<usize> {
        self.instructions
            .binary_search_by_key(&address, |i| i.address)
            .ok()
    }

    /// Unpacked addresses of routines called with a constant target.
    pub fn calls(&self, header: &Header) -> Vec<u32> {
        let mut calls: Vec<u32> = self
            .instructions
            .iter()
            .filter(|i| i.opcode.is_call())
            .filter_map(|i| match i.operands.first() {
                Some(Operand::LargeConstant(0) | Operand::SmallConstant(0)) => None,
                Some(operand) => operand
                    .constant()
                    .map(|packed| header.unpack_routine_address(packed)),
                None => None,
            })
            .collect();
        calls.sort_unstable();
        calls.dedup();
        calls
    }

    /// Serializable summary.
    pub fn summary(&self, name: String) -> RoutineSummary {
        RoutineSummary {
            address: self.address,
            name,
            locals: self.local_count(),
            instructions: self.instructions.len(),
            length: self.end() - self.address,
        }
    }
}

/// Routine listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutineSummary {
    /// Header address
    pub address: u32,
    /// Display name
    pub name: String,
    /// Declared locals
    pub locals: u8,
    /// Instruction count
    pub instructions: usize,
    /// Bytes from header to end
    pub length: u32,
}

/// Routines discovered so far, keyed by address
#[derive(Debug, Clone, Default)]
pub struct RoutineTable {
    main: u32,
    routines: BTreeMap<u32, Arc<Routine>>,
    called: BTreeSet<u32>,
    stale: Vec<u32>,
}

impl RoutineTable {
    /// Empty table for a story whose main routine is at `main`.
    pub fn new(main: u32) -> Self {
        Self {
            main,
            routines: BTreeMap::new(),
            called: BTreeSet::new(),
            stale: Vec::new(),
        }
    }

    /// Read `root` and every routine transitively reachable through
    /// constant calls. Failures below the root are logged and skipped.
    pub fn add(
        &mut self,
        memory: &Memory,
        header: &Header,
        decoder: &mut Decoder,
        root: u32,
    ) -> VmResult<Arc<Routine>> {
        if let Some(routine) = self.routines.get(&root) {
            return Ok(Arc::clone(routine));
        }
        let routine = Arc::new(Routine::read(memory, decoder, root)?);
        self.routines.insert(root, Arc::clone(&routine));

        let mut pending = routine.calls(header);
        while let Some(address) = pending.pop() {
            if self.routines.contains_key(&address) || address as usize >= memory.len() {
                continue;
            }
            match Routine::read(memory, decoder, address) {
                Ok(found) => {
                    pending.extend(found.calls(header));
                    self.routines.insert(address, Arc::new(found));
                }
                Err(error) => {
                    tracing::debug!(address = format_args!("{address:#x}"), %error, "skipping routine");
                }
            }
        }
        tracing::debug!(
            root = format_args!("{root:#x}"),
            total = self.routines.len(),
            "routine discovery"
        );
        Ok(routine)
    }

    /// Read every routine recorded by [`Self::record_call`] that is not
    /// yet in the table.
    pub fn resolve_called(&mut self, memory: &Memory, header: &Header, decoder: &mut Decoder) {
        let called: Vec<u32> = self.called.iter().copied().collect();
        for address in called {
            if let Err(error) = self.add(memory, header, decoder, address) {
                tracing::debug!(address = format_args!("{address:#x}"), %error, "skipping routine");
            }
        }
    }

    /// Note that `address` was called at runtime; true if first seen.
    #[inline]
    pub fn record_call(&mut self, address: u32) -> bool {
        self.called.insert(address)
    }

    /// Addresses called at runtime.
    pub fn called(&self) -> impl Iterator<Item = u32> + '_ {
        self.called.iter().copied()
    }

    /// Forget every routine whose bytes overlap `[address, address + len)`.
    ///
    /// Routines are laid out without overlap, so only the ones starting
    /// before the end of the range need checking. Dropped addresses are
    /// kept until [`Self::take_stale`].
    pub fn invalidate(&mut self, address: u32, len: u32) -> usize {
        let end = address.saturating_add(len);
        let overlapping: Vec<u32> = self
            .routines
            .range(..end)
            .rev()
            .take_while(|(_, routine)| routine.end() > address)
            .map(|(&start, _)| start)
            .collect();
        for start in &overlapping {
            self.routines.remove(start);
            tracing::debug!(address = format_args!("{start:#x}"), "routine rewritten");
        }
        self.stale.extend_from_slice(&overlapping);
        overlapping.len()
    }

    /// Addresses dropped by [`Self::invalidate`] since the last call.
    pub fn take_stale(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.stale)
    }

    /// Routine at `address`, if discovered.
    pub fn get(&self, address: u32) -> Option<&Arc<Routine>> {
        self.routines.get(&address)
    }

    /// All routines in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Routine>> {
        self.routines.values()
    }

    /// Number of routines.
    pub fn len(&self) -> usize {
        self.routines.len()
    }

    /// Whether no routine has been read.
    pub fn is_empty(&self) -> bool {
        self.routines.is_empty()
    }

    /// Main routine address.
    pub fn main(&self) -> u32 {
        self.main
    }

    /// Display name for a routine.
    pub fn name(&self, address: u32) -> String {
        if address == self.main {
            "Main".to_string()
        } else {
            format!("R{address:05x}")
        }
    }

    /// Summaries of every routine in address order.
    pub fn summaries(&self) -> Vec<RoutineSummary> {
        self.iter()
            .map(|r| r.summary(self.name(r.address())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_vm_bytecode::assembler::{large, local, small};
    use quill_vm_bytecode::{Assembler, Opcode, Variable};

    fn load(image: Vec<u8>) -> (Memory, Header, Decoder) {
        let memory = Memory::new(image);
        let header = Header::read(&memory).unwrap();
        let decoder = Decoder::new(header.version);
        (memory, header, decoder)
    }

    #[test]
    fn reads_through_forward_branches() {
        let mut asm = Assembler::new(3);
        let routine = asm.routine(&[5, 6]);
        let done = asm.label();
        asm.op(Opcode::Jz, &[local(0)]).branch(true, done);
        asm.op(Opcode::Rtrue, &[]);
        asm.bind(done);
        asm.op(Opcode::Ret, &[local(1)]);
        let (memory, _, mut decoder) = load(asm.finish().unwrap());

        let routine = Routine::read(&memory, &mut decoder, routine).unwrap();
        assert_eq!(routine.local_count(), 2);
        assert_eq!(routine.defaults(), &[5, 6]);
        assert_eq!(routine.instructions().len(), 3);
        assert_eq!(routine.instructions()[2].opcode, Opcode::Ret);
        assert_eq!(routine.index_of(routine.instructions()[1].address), Some(1));
    }

    #[test]
    fn v5_locals_are_zero() {
        let mut asm = Assembler::new(5);
        let routine = asm.routine(&[0, 0, 0]);
        asm.op(Opcode::Rfalse, &[]);
        let (memory, _, mut decoder) = load(asm.finish().unwrap());
        let routine = Routine::read(&memory, &mut decoder, routine).unwrap();
        assert_eq!(routine.defaults(), &[0, 0, 0]);
        assert_eq!(routine.entry(), routine.address() + 1);
    }

    #[test]
    fn discovers_callees_transitively() {
        let mut asm = Assembler::new(3);
        let leaf = asm.routine(&[]);
        asm.op(Opcode::Rtrue, &[]);
        let middle = asm.routine(&[]);
        let leaf_packed = asm.pack(leaf);
        asm.op(Opcode::CallVS, &[large(leaf_packed)])
            .store(Variable::Stack);
        asm.op(Opcode::CallVS, &[small(0)]).store(Variable::Stack);
        asm.op(Opcode::RetPopped, &[]);
        let main = asm.routine(&[]);
        let middle_packed = asm.pack(middle);
        asm.op(Opcode::CallVS, &[large(middle_packed)])
            .store(Variable::Stack);
        asm.op(Opcode::Quit, &[]);
        asm.set_main(main);
        let (memory, header, mut decoder) = load(asm.finish().unwrap());

        let mut table = RoutineTable::new(header.main_routine_address());
        table.add(&memory, &header, &mut decoder, main).unwrap();
        let addresses: Vec<u32> = table.iter().map(|r| r.address()).collect();
        assert_eq!(addresses, vec![leaf, middle, main]);
        assert_eq!(table.name(main), "Main");
        assert_eq!(table.name(leaf), format!("R{leaf:05x}"));
        assert_eq!(table.summaries()[0].instructions, 1);

        let inside = table.get(middle).unwrap().entry() + 1;
        assert_eq!(table.invalidate(inside, 2), 1);
        assert!(table.get(middle).is_none());
        assert!(table.get(leaf).is_some());
        assert!(table.get(main).is_some());
        assert_eq!(table.take_stale(), vec![middle]);
        assert!(table.take_stale().is_empty());
        assert_eq!(table.invalidate(main - 1, 1), 0);
    }
}
