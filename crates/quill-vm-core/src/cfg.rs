//! Basic blocks of a routine

use std::collections::BTreeSet;
use std::ops::Range;

use smallvec::SmallVec;

use crate::routine::Routine;

/// Maximal straight-line run of instructions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    /// Address of the first instruction
    pub start: u32,
    /// Instruction indices into [`Routine::instructions`]
    pub range: Range<usize>,
    /// Some branch or jump lands here
    pub is_target: bool,
    /// Addresses control may continue at (fallthrough first)
    pub successors: SmallVec<[u32; 2]>,
}

/// Blocks of one routine in address order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFlowGraph {
    blocks: Vec<CodeBlock>,
    external_targets: Vec<u32>,
}

impl ControlFlowGraph {
    /// Partition `routine` into blocks.
    ///
    /// A block ends after any branch, jump, return or call, and just before
    /// any instruction that is a branch or jump target.
    pub fn build(routine: &Routine) -> Self {
        let instructions = routine.instructions();
        let mut targets = BTreeSet::new();
        let mut external_targets = Vec::new();
        for instruction in instructions {
            for target in instruction.targets() {
                if routine.index_of(target).is_some() {
                    targets.insert(target);
                } else {
                    external_targets.push(target);
                }
            }
        }

        let mut blocks: Vec<CodeBlock> = Vec::new();
        let mut start = 0;
        for (index, instruction) in instructions.iter().enumerate() {
            let opcode = instruction.opcode;
            let last = index + 1 == instructions.len();
            let ends = last
                || instruction.branch.is_some()
                || opcode.is_terminal()
                || opcode.is_call()
                || targets.contains(&instructions[index + 1].address);
            if !ends {
                continue;
            }

            let mut successors = SmallVec::new();
            if !opcode.is_terminal() && !last {
                successors.push(instruction.next_address());
            }
            for target in instruction.targets() {
                if !successors.contains(&target) {
                    successors.push(target);
                }
            }
            let first = &instructions[start];
            blocks.push(CodeBlock {
                start: first.address,
                range: start..index + 1,
                is_target: targets.contains(&first.address),
                successors,
            });
            start = index + 1;
        }

        external_targets.sort_unstable();
        external_targets.dedup();
        Self {
            blocks,
            external_targets,
        }
    }

    /// Blocks in address order.
    #[inline]
    pub fn blocks(&self) -> &[CodeBlock] {
        &self.blocks
    }

    /// Number of blocks.
    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the routine had no instructions.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Block starting at `address`.
    pub fn block_at(&self, address: u32) -> Option<&CodeBlock> {
        self.blocks
            .binary_search_by_key(&address, |b| b.start)
            .ok()
            .map(|index| &self.blocks[index])
    }

    /// Index of the block starting at `address`.
    pub fn block_index(&self, address: u32) -> Option<usize> {
        self.blocks.binary_search_by_key(&address, |b| b.start).ok()
    }

    /// Branch or jump destinations that are not instruction starts inside
    /// the routine.
    pub fn external_targets(&self) -> &[u32] {
        &self.external_targets
    }
}
