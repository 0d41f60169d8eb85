//! Bytecode errors

use thiserror::Error;

/// Errors that can occur while reading or decoding a memory image
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BytecodeError {
    /// Access of `len` bytes at `address` falls outside the image
    #[error("memory access out of range: {len} byte(s) at {address:#06x} (size {size:#06x})")]
    OutOfRange {
        /// First byte of the access
        address: usize,
        /// Width of the access in bytes
        len: usize,
        /// Size of the memory image
        size: usize,
    },

    /// Unsupported format version in the header
    #[error("unsupported story version: {0}")]
    UnsupportedVersion(u8),

    /// The decoder was asked to materialize an omitted operand
    #[error("attempted to read omitted operand at {0:#06x}")]
    OmittedOperand(usize),

    /// Image is too small to hold a header
    #[error("memory image too small for a header ({0} bytes)")]
    TruncatedHeader(usize),

    /// Malformed resource container
    #[error("container error: {0}")]
    Container(#[from] ContainerError),

    /// Assembler misuse
    #[error("assembly error: {0}")]
    Assemble(#[from] AssembleError),
}

/// Errors reported by the [`Assembler`](crate::assembler::Assembler).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssembleError {
    /// The opcode has no encoding in the target version
    #[error("opcode '{opcode}' does not exist in version {version}")]
    NotEncodable {
        /// Mnemonic
        opcode: String,
        /// Target version
        version: u8,
    },

    /// Too many or too few operands for the form
    #[error("opcode '{opcode}' cannot take {count} operand(s)")]
    OperandCount {
        /// Mnemonic
        opcode: String,
        /// Operands supplied
        count: usize,
    },

    /// A label was referenced but never bound
    #[error("label {0} is never bound")]
    UnboundLabel(usize),

    /// A branch offset does not fit in 14 bits
    #[error("branch at {at:#x} to {target:#x} is out of range")]
    BranchOutOfRange {
        /// Offset bytes position
        at: usize,
        /// Destination
        target: u32,
    },

    /// A property payload cannot be encoded in this version
    #[error("property {number} of length {len} cannot be encoded")]
    PropertyLength {
        /// Property number
        number: u8,
        /// Payload length
        len: usize,
    },
}

/// Errors raised while parsing a resource container (`FORM`/`IFRS`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContainerError {
    /// Missing `FORM` magic
    #[error("not a FORM container")]
    NotAForm,

    /// `FORM` is not of type `IFRS`
    #[error("FORM type is '{0}', expected 'IFRS'")]
    NotResourceFile(String),

    /// A chunk claims more bytes than the container holds
    #[error("chunk '{tag}' at {offset:#x} overruns the container")]
    ChunkOverrun {
        /// Chunk tag
        tag: String,
        /// Chunk start offset
        offset: usize,
    },

    /// A required chunk is absent
    #[error("missing required chunk '{0}'")]
    MissingChunk(&'static str),

    /// A chunk is shorter than its fixed layout
    #[error("chunk '{tag}' too short: {len} byte(s)")]
    ShortChunk {
        /// Chunk tag
        tag: String,
        /// Actual chunk length
        len: usize,
    },

    /// A resource index entry points at no chunk start
    #[error("resource index entry points at {0:#x}, which is not a chunk")]
    UnresolvedResource(usize),
}

/// Result type for bytecode operations
pub type Result<T> = std::result::Result<T, BytecodeError>;
