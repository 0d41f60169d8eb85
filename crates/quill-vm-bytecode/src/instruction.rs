//! Decoded instructions

use serde::Serialize;
use smallvec::SmallVec;

use crate::error::{BytecodeError, Result};
use crate::opcode::Opcode;
use crate::operand::{Operand, Variable};

/// Operand list (at most 8, usually 4 or fewer)
pub type Operands = SmallVec<[Operand; 4]>;

/// Where a taken branch goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BranchTarget {
    /// Offset 0: return false from the current routine
    ReturnFalse,
    /// Offset 1: return true from the current routine
    ReturnTrue,
    /// Any other offset: continue at this address
    Address(u32),
}

/// Branch suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Branch {
    /// Branch when the test result equals this
    pub condition: bool,
    /// Signed offset as encoded
    pub offset: i16,
    /// Resolved destination
    pub target: BranchTarget,
}

impl Branch {
    /// Build a branch for an instruction ending at `next_address`.
    pub fn new(condition: bool, offset: i16, next_address: u32) -> Self {
        let target = match offset {
            0 => BranchTarget::ReturnFalse,
            1 => BranchTarget::ReturnTrue,
            _ => BranchTarget::Address(relative_target(next_address, offset)),
        };
        Self {
            condition,
            offset,
            target,
        }
    }

    /// Destination address, if the branch does not return.
    #[inline]
    pub fn address(&self) -> Option<u32> {
        match self.target {
            BranchTarget::Address(address) => Some(address),
            _ => None,
        }
    }
}

/// `next + offset - 2`, wrapping inside the 32-bit address space.
#[inline]
pub fn relative_target(next_address: u32, offset: i16) -> u32 {
    (next_address as i64 + offset as i64 - 2) as u32
}

/// One decoded instruction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Instruction {
    /// Address of the first byte
    pub address: u32,
    /// Encoded length in bytes
    pub length: u32,
    /// Resolved opcode
    pub opcode: Opcode,
    /// Operands in encoding order
    pub operands: Operands,
    /// Result variable
    pub store: Option<Variable>,
    /// Branch suffix
    pub branch: Option<Branch>,
    /// Embedded Z-string words (last word has bit 15 set)
    pub text: Option<Vec<u16>>,
}

impl Instruction {
    /// Address of the following instruction.
    #[inline]
    pub fn next_address(&self) -> u32 {
        self.address + self.length
    }

    /// Operand `index`, failing if the instruction does not carry it.
    #[inline]
    pub fn operand(&self, index: usize) -> Result<Operand> {
        self.operands
            .get(index)
            .copied()
            .ok_or(BytecodeError::OmittedOperand(self.address as usize))
    }

    /// Target of a `jump`, whose operand is a signed offset.
    pub fn jump_target(&self) -> Option<u32> {
        if self.opcode != Opcode::Jump {
            return None;
        }
        let offset = self.operands.first()?.constant()? as i16;
        Some(relative_target(self.next_address(), offset))
    }

    /// All in-routine addresses control may reach besides fallthrough.
    pub fn targets(&self) -> SmallVec<[u32; 2]> {
        let mut targets = SmallVec::new();
        if let Some(address) = self.branch.as_ref().and_then(Branch::address) {
            targets.push(address);
        }
        if let Some(address) = self.jump_target() {
            targets.push(address);
        }
        targets
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:05x}: {}", self.address, self.opcode)?;
        if let Some(target) = self.jump_target() {
            return write!(f, " {target:05x}");
        }
        for operand in &self.operands {
            write!(f, " {operand}")?;
        }
        if let Some(store) = self.store {
            write!(f, " -> {store}")?;
        }
        if let Some(branch) = &self.branch {
            let polarity = if branch.condition { "" } else { "~" };
            match branch.target {
                BranchTarget::ReturnFalse => write!(f, " ?{polarity}rfalse")?,
                BranchTarget::ReturnTrue => write!(f, " ?{polarity}rtrue")?,
                BranchTarget::Address(address) => write!(f, " ?{polarity}{address:05x}")?,
            }
        }
        if let Some(text) = &self.text {
            write!(f, " [{} word(s)]", text.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn special_branch_offsets_return() {
        assert_eq!(Branch::new(true, 0, 0x100).target, BranchTarget::ReturnFalse);
        assert_eq!(Branch::new(false, 1, 0x100).target, BranchTarget::ReturnTrue);
        assert_eq!(
            Branch::new(true, 2, 0x100).target,
            BranchTarget::Address(0x100)
        );
        assert_eq!(
            Branch::new(true, -8192, 0x4000).target,
            BranchTarget::Address(0x4000 - 8192 - 2)
        );
    }

    #[test]
    fn jump_uses_signed_operand() {
        let jump = Instruction {
            address: 0x200,
            length: 3,
            opcode: Opcode::Jump,
            operands: smallvec![Operand::LargeConstant((-10i16) as u16)],
            store: None,
            branch: None,
            text: None,
        };
        assert_eq!(jump.jump_target(), Some(0x203 - 12));
        assert_eq!(jump.targets().as_slice(), &[0x203 - 12]);
        assert!(matches!(
            jump.operand(1),
            Err(BytecodeError::OmittedOperand(0x200))
        ));
    }
}
