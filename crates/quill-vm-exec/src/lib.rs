//! # Quill VM Exec
//!
//! Execution strategies and the session run loop:
//! - [`Executable`] with interpreted and compiled implementations
//! - the compiled-code runtime (routine cache and helper bodies)
//! - [`Session`], which drives a story in batches with cooperative cancellation

#![warn(clippy::all)]
#![warn(missing_docs)]

mod error;
mod executable;
mod jit_runtime;
mod session;

pub use error::ExecError;
pub use executable::{Compiled, Executable, ExecutionMode, Interpreted};
pub use jit_runtime::{JitRuntime, JitRuntimeStats, runtime_helpers};
pub use session::{RunOutcome, Session, SessionOptions, SessionState};
