//! # Quill VM Bytecode
//!
//! Memory image and instruction format for the Quill Z-machine.
//!
//! ## Contents
//!
//! - **Memory**: flat big-endian image with bounds checks and write observers
//! - **Header**: story header fields and packed-address rules
//! - **Decoder**: variable-length instruction decoding with a per-address cache
//! - **Container**: `FORM`/`IFRS` resource files holding a story
//! - **Assembler**: in-memory story builder for tests and benchmarks

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod assembler;
pub mod container;
pub mod decoder;
pub mod error;
pub mod header;
pub mod instruction;
pub mod memory;
pub mod opcode;
pub mod operand;

pub use assembler::{Assembler, Label, ObjectEntry};
pub use container::{Container, StoryIdentity, load_story_bytes};
pub use decoder::Decoder;
pub use error::{AssembleError, BytecodeError, ContainerError, Result};
pub use header::Header;
pub use instruction::{Branch, BranchTarget, Instruction, Operands};
pub use memory::{Memory, MemoryChange, MemoryObserver, MemoryReader, ObserverId};
pub use opcode::{Opcode, OpcodeKind};
pub use operand::{Operand, OperandKind, Variable};
