//! # Quill VM JIT
//!
//! Cranelift compiler for hot Z-machine routines. Routines are translated a
//! control flow block at a time; anything beyond locals, arithmetic and
//! control flow calls back into the VM through [`runtime_helpers`].

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod compiler;
pub mod runtime_helpers;
pub mod stats;
pub mod trap;
pub mod translator;

pub use compiler::{CompileEnv, CompiledRoutine, JitCompiler, JitError};
pub use runtime_helpers::{HelperKind, RuntimeHelpers};
pub use stats::CompileStatistics;
pub use trap::{Completion, TrapReason};
pub use translator::{Requirements, is_untranslated};
