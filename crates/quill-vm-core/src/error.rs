//! VM error types

use quill_vm_bytecode::{BytecodeError, Opcode};
use thiserror::Error;

/// VM execution errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    /// Memory or decode error
    #[error("{0}")]
    Bytecode(#[from] BytecodeError),

    /// Pop or peek below the current frame's region of the stack
    #[error("stack underflow for this frame")]
    StackUnderflow,

    /// Push past the fixed stack capacity
    #[error("stack overflow (capacity {0} words)")]
    StackOverflow(usize),

    /// Call nesting exceeded the frame limit
    #[error("call depth exceeded ({0} frames)")]
    CallDepthExceeded(usize),

    /// Return or local access with no active frame
    #[error("no active call frame")]
    NoFrame,

    /// Local variable outside the frame's declared locals
    #[error("local variable L{index:02} out of range ({count} local(s))")]
    InvalidLocal {
        /// Zero-based local index
        index: u8,
        /// Locals declared by the routine
        count: u8,
    },

    /// Object number zero or beyond the table
    #[error("invalid object number {0}")]
    InvalidObject(u16),

    /// Property walk on an object that does not have the property
    #[error("object {object} has no property {property}")]
    MissingProperty {
        /// Object number
        object: u16,
        /// Property number
        property: u16,
    },

    /// Attribute number beyond the attribute bitset
    #[error("invalid attribute {0}")]
    InvalidAttribute(u16),

    /// Opcode has no meaning in this story version
    #[error("unknown opcode {0}")]
    UnknownOpcode(Opcode),

    /// An operand the opcode needs was not encoded
    #[error("'{opcode}' is missing operand {index}")]
    MissingOperand {
        /// Opcode being executed
        opcode: Opcode,
        /// Zero-based operand position
        index: usize,
    },

    /// Compiled code hit an opcode the compiler does not translate
    #[error("opcode '{0}' is not implemented by compiled code")]
    NotImplemented(&'static str),

    /// Division or remainder by zero
    #[error("division by zero")]
    DivisionByZero,

    /// Malformed Z-string or ZSCII character
    #[error("invalid text: {0}")]
    InvalidText(String),

    /// `step` called while input is outstanding, or input supplied when none was requested
    #[error("input state mismatch: {0}")]
    InputState(&'static str),

    /// `throw` to a frame that no longer exists
    #[error("throw to stale frame {0}")]
    InvalidThrow(u16),

    /// Routine header or body could not be read
    #[error("malformed routine at {0:#07x}")]
    InvalidRoutine(u32),

    /// Compiled code needed input the host could not supply synchronously
    #[error("input requested but the host has none available")]
    InputUnavailable,

    /// Output stream 3 nested too deeply
    #[error("memory output stream nested more than {0} deep")]
    StreamDepth(usize),

    /// A routine could not be compiled and interpreter fallback is off
    #[error("routine at {address:#07x} failed to compile: {reason}")]
    Compile {
        /// Routine header address
        address: u32,
        /// Compiler error text
        reason: String,
    },

    /// Execution was interrupted between steps
    #[error("execution interrupted")]
    Interrupted,

    /// The story has quit
    #[error("story has quit")]
    Quit,

    /// A step failed; carries the instruction address
    #[error("at {address:#07x}: {source}")]
    Step {
        /// Address of the failing instruction
        address: u32,
        /// Underlying error
        source: Box<VmError>,
    },
}

impl VmError {
    /// Attach an instruction address, unless one is already attached.
    pub fn at(self, address: u32) -> Self {
        match self {
            step @ VmError::Step { .. } => step,
            other => VmError::Step {
                address,
                source: Box::new(other),
            },
        }
    }

    /// The error without any address wrapping.
    pub fn root(&self) -> &VmError {
        match self {
            VmError::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// Address of the failing instruction, when known.
    pub fn address(&self) -> Option<u32> {
        match self {
            VmError::Step { address, .. } => Some(*address),
            _ => None,
        }
    }
}

/// Result type for VM operations
pub type VmResult<T> = std::result::Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_wrapping_is_idempotent() {
        let error = VmError::StackUnderflow.at(0x7dd).at(0x900);
        assert_eq!(error.address(), Some(0x7dd));
        assert_eq!(error.root(), &VmError::StackUnderflow);
        assert_eq!(error.to_string(), "at 0x007dd: stack underflow for this frame");
    }
}
