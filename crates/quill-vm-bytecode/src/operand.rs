//! Instruction operands

use serde::{Deserialize, Serialize};

/// Two-bit operand kind as encoded in instruction kind bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperandKind {
    /// 16-bit constant (two bytes)
    LargeConstant,
    /// 8-bit constant (one byte)
    SmallConstant,
    /// Variable reference (one byte)
    Variable,
    /// No operand
    Omitted,
}

impl OperandKind {
    /// Decode the low two bits of `bits`.
    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::LargeConstant,
            1 => Self::SmallConstant,
            2 => Self::Variable,
            _ => Self::Omitted,
        }
    }

    /// Encode as two bits.
    #[inline]
    pub const fn bits(self) -> u8 {
        match self {
            Self::LargeConstant => 0,
            Self::SmallConstant => 1,
            Self::Variable => 2,
            Self::Omitted => 3,
        }
    }

    /// Encoded operand size in bytes.
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::LargeConstant => 2,
            Self::SmallConstant | Self::Variable => 1,
            Self::Omitted => 0,
        }
    }
}

/// Variable reference (0 = stack, 1-15 = locals, 16-255 = globals)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variable {
    /// Top of the evaluation stack
    Stack,
    /// Local variable, zero-based (`L00`..`L14`)
    Local(u8),
    /// Global variable, zero-based (`G00`..`Gef`)
    Global(u8),
}

impl Variable {
    /// Decode a variable byte.
    #[inline]
    pub const fn from_byte(byte: u8) -> Self {
        match byte {
            0 => Self::Stack,
            1..=15 => Self::Local(byte - 1),
            _ => Self::Global(byte - 16),
        }
    }

    /// Encode as a variable byte.
    #[inline]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Stack => 0,
            Self::Local(index) => index + 1,
            Self::Global(index) => index.wrapping_add(16),
        }
    }

    /// Whether this is the stack pseudo-variable.
    #[inline]
    pub const fn is_stack(self) -> bool {
        matches!(self, Self::Stack)
    }
}

impl std::fmt::Display for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stack => write!(f, "SP"),
            Self::Local(index) => write!(f, "L{index:02}"),
            Self::Global(index) => write!(f, "G{index:02x}"),
        }
    }
}

/// Decoded operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    /// 16-bit literal
    LargeConstant(u16),
    /// 8-bit literal
    SmallConstant(u8),
    /// Value read from a variable at execution time
    Variable(Variable),
}

impl Operand {
    /// Kind this operand was encoded with.
    #[inline]
    pub const fn kind(self) -> OperandKind {
        match self {
            Self::LargeConstant(_) => OperandKind::LargeConstant,
            Self::SmallConstant(_) => OperandKind::SmallConstant,
            Self::Variable(_) => OperandKind::Variable,
        }
    }

    /// Literal value, if the operand is a constant.
    #[inline]
    pub const fn constant(self) -> Option<u16> {
        match self {
            Self::LargeConstant(value) => Some(value),
            Self::SmallConstant(value) => Some(value as u16),
            Self::Variable(_) => None,
        }
    }

    /// Referenced variable, if the operand is one.
    #[inline]
    pub const fn variable(self) -> Option<Variable> {
        match self {
            Self::Variable(variable) => Some(variable),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LargeConstant(value) => write!(f, "#{value:04x}"),
            Self::SmallConstant(value) => write!(f, "#{value:02x}"),
            Self::Variable(variable) => write!(f, "{variable}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_bytes_round_trip() {
        for byte in 0..=255u8 {
            assert_eq!(Variable::from_byte(byte).to_byte(), byte);
        }
        assert_eq!(Variable::from_byte(0), Variable::Stack);
        assert_eq!(Variable::from_byte(15), Variable::Local(14));
        assert_eq!(Variable::from_byte(16), Variable::Global(0));
    }

    #[test]
    fn operand_accessors() {
        assert_eq!(Operand::SmallConstant(7).constant(), Some(7));
        assert_eq!(Operand::LargeConstant(0xffff).constant(), Some(0xffff));
        assert_eq!(
            Operand::Variable(Variable::Local(2)).variable(),
            Some(Variable::Local(2))
        );
        assert_eq!(Operand::Variable(Variable::Stack).constant(), None);
        assert_eq!(Operand::Variable(Variable::Global(0x10)).to_string(), "G10");
    }
}
