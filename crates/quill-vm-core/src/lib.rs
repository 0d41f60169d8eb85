//! # Quill VM Core
//!
//! Interpreted execution engine for Z-machine stories.
//!
//! ## Design Principles
//!
//! - **Flat stack**: one evaluation stack, frames record where theirs starts
//! - **Closed opcodes**: every instruction is an exhaustive `match` arm
//! - **Host boundary**: all screen and keyboard traffic goes through [`Host`]
//! - **Shared semantics**: [`Processor::perform`] is also what compiled code calls

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod cfg;
pub mod dictionary;
pub mod error;
pub mod events;
pub mod host;
pub mod objects;
pub mod processor;
pub mod random;
pub mod routine;
pub mod stack;
pub mod streams;
pub mod text;

pub use cfg::{CodeBlock, ControlFlowGraph};
pub use error::{VmError, VmResult};
pub use events::{ChannelObserver, EventBus, ExecutionEvent, ExecutionObserver, SubscriptionId};
pub use host::{BufferedHost, Host, ScreenCommand, StatusLine, StatusRight};
pub use processor::{InputRequest, Outcome, Processor, ProcessorOptions, ProcessorState};
pub use routine::{Routine, RoutineSummary, RoutineTable};
pub use stack::{CallStack, StackFrame};
pub use text::ZText;
