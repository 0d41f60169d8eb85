//! Sentinel results of compiled routines.
//!
//! A compiled routine returns its 16-bit result as a non-negative `i64`.
//! Anything negative is a sentinel, and every helper call site in generated
//! code forwards a negative helper result straight to its own caller.
//!
//! ```text
//! compiled code:
//!   r = helper(ctx, ...)
//!   if r < 0 → return r            (FAULT / QUIT / INTERRUPTED)
//!
//! runtime:
//!   r = routine(ctx, args, argc)
//!   FAULT       → take the error recorded in the context
//!   QUIT        → the story executed `quit`
//!   INTERRUPTED → a cancel request was seen at a call boundary
//! ```

/// An error was recorded in the runtime context.
pub const FAULT: i64 = -1;

/// The story quit.
pub const QUIT: i64 = -2;

/// Execution was cancelled between routine calls.
pub const INTERRUPTED: i64 = -3;

/// Reason code passed to the trap helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum TrapReason {
    /// Opcode the compiler does not translate; detail is the opcode id.
    NotImplemented = 0,
    /// `div` or `mod` by zero.
    DivisionByZero = 1,
    /// Local variable beyond the routine's locals; detail is `index << 8 | count`.
    InvalidLocal = 2,
}

impl TrapReason {
    /// Decode a reason code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::NotImplemented),
            1 => Some(Self::DivisionByZero),
            2 => Some(Self::InvalidLocal),
            _ => None,
        }
    }
}

/// How a compiled routine finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Normal return with a value
    Return(u16),
    /// See [`FAULT`]
    Fault,
    /// See [`QUIT`]
    Quit,
    /// See [`INTERRUPTED`]
    Interrupted,
}

impl Completion {
    /// Classify a raw result.
    #[inline]
    pub fn from_raw(value: i64) -> Self {
        match value {
            QUIT => Self::Quit,
            INTERRUPTED => Self::Interrupted,
            v if v < 0 => Self::Fault,
            v => Self::Return(v as u16),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_negative_and_distinct() {
        for sentinel in [FAULT, QUIT, INTERRUPTED] {
            assert!(sentinel < 0);
        }
        assert_ne!(FAULT, QUIT);
        assert_ne!(QUIT, INTERRUPTED);
    }

    #[test]
    fn classifies_raw_results() {
        assert_eq!(Completion::from_raw(0), Completion::Return(0));
        assert_eq!(Completion::from_raw(0xffff), Completion::Return(0xffff));
        assert_eq!(Completion::from_raw(FAULT), Completion::Fault);
        assert_eq!(Completion::from_raw(QUIT), Completion::Quit);
        assert_eq!(Completion::from_raw(INTERRUPTED), Completion::Interrupted);
        assert_eq!(TrapReason::from_code(1), Some(TrapReason::DivisionByZero));
        assert_eq!(TrapReason::from_code(9), None);
    }
}
