//! Runtime helper infrastructure for compiled code → VM callbacks.
//!
//! Generated code keeps locals in its own stack frame and does integer
//! arithmetic, comparisons and control flow inline. Everything that touches
//! VM state (the evaluation stack, globals, memory, objects, the host) goes
//! through `extern "C"` helpers imported into the Cranelift module.
//!
//! # Architecture
//!
//! ```text
//! quill-vm-jit (defines helper kinds + signatures)
//!       ↑
//! quill-vm-exec (implements helpers, constructs RuntimeHelpers)
//! ```
//!
//! # ABI
//!
//! Compiled routines have signature `extern "C" fn(*mut u8, *const i64, u32) -> i64`:
//! - `ctx`: opaque runtime context pointer
//! - `args`/`argc`: call arguments as zero-extended words
//! - return: the routine's 16-bit result, or a negative [`crate::trap`] sentinel
//!
//! Every helper takes `ctx` first, then i64 operands, and returns i64.
//! Negative helper results are sentinels and are propagated unchanged.

use cranelift_codegen::ir::{self, AbiParam, types};
use cranelift_jit::JITBuilder;
use cranelift_module::{FuncId, Linkage, Module};
use quill_vm_bytecode::{Opcode, OpcodeKind};
use quill_vm_core::Outcome;

use crate::JitError;

/// Bit set in a [`HelperKind::Perform`] result when the branch test passed.
pub const OUTCOME_TEST_BIT: i64 = 1 << 16;

// ---------------------------------------------------------------------------
// Helper kind enumeration
// ---------------------------------------------------------------------------

/// Identifies a runtime helper function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HelperKind {
    /// `(ctx, reason, detail) -> FAULT`
    Trap = 0,
    /// `(ctx, value) -> 0`
    Push = 1,
    /// `(ctx) -> value`
    Pop = 2,
    /// `(ctx) -> value`
    Peek = 3,
    /// `(ctx, value) -> 0`
    ReplaceTop = 4,
    /// `(ctx, index) -> value`; index is zero-based from G00
    ReadGlobal = 5,
    /// `(ctx, index, value) -> 0`
    WriteGlobal = 6,
    /// `(ctx, array, index) -> value`
    LoadWord = 7,
    /// `(ctx, array, index) -> value`
    LoadByte = 8,
    /// `(ctx, array, index, value) -> 0`
    StoreWord = 9,
    /// `(ctx, array, index, value) -> 0`
    StoreByte = 10,
    /// `(ctx, locals_ptr, local_count, variable) -> value`; reads the stack top in place
    ReadVariable = 11,
    /// `(ctx, locals_ptr, local_count, variable, value) -> 0`; replaces the stack top in place
    WriteVariable = 12,
    /// `(ctx, address, argc, argv_ptr) -> value`; unpacked routine address
    CallDirect = 13,
    /// `(ctx, packed, argc, argv_ptr) -> value`; packed 0 yields 0
    CallPacked = 14,
    /// `(ctx, opcode_id, argc, argv_ptr) -> encoded outcome`
    Perform = 15,
    /// `(ctx, literal_id) -> 0`
    PrintLiteral = 16,
    /// `(ctx, text_buffer, parse_buffer) -> terminator`
    ReadLine = 17,
    /// `(ctx) -> zscii`
    ReadChar = 18,
    /// `(ctx) -> QUIT`
    Quit = 19,
}

/// Total number of helper kinds.
pub const HELPER_COUNT: usize = 20;

/// Which part of the VM a helper touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperGroup {
    /// Always wired
    Core,
    /// Evaluation stack
    Stack,
    /// Globals and memory tables
    Memory,
    /// Printing and input
    Screen,
}

impl HelperKind {
    /// Every kind in discriminant order.
    pub const ALL: [HelperKind; HELPER_COUNT] = [
        Self::Trap,
        Self::Push,
        Self::Pop,
        Self::Peek,
        Self::ReplaceTop,
        Self::ReadGlobal,
        Self::WriteGlobal,
        Self::LoadWord,
        Self::LoadByte,
        Self::StoreWord,
        Self::StoreByte,
        Self::ReadVariable,
        Self::WriteVariable,
        Self::CallDirect,
        Self::CallPacked,
        Self::Perform,
        Self::PrintLiteral,
        Self::ReadLine,
        Self::ReadChar,
        Self::Quit,
    ];

    /// Symbol name used for Cranelift import resolution.
    pub fn symbol_name(self) -> &'static str {
        match self {
            Self::Trap => "quill_rt_trap",
            Self::Push => "quill_rt_push",
            Self::Pop => "quill_rt_pop",
            Self::Peek => "quill_rt_peek",
            Self::ReplaceTop => "quill_rt_replace_top",
            Self::ReadGlobal => "quill_rt_read_global",
            Self::WriteGlobal => "quill_rt_write_global",
            Self::LoadWord => "quill_rt_load_word",
            Self::LoadByte => "quill_rt_load_byte",
            Self::StoreWord => "quill_rt_store_word",
            Self::StoreByte => "quill_rt_store_byte",
            Self::ReadVariable => "quill_rt_read_variable",
            Self::WriteVariable => "quill_rt_write_variable",
            Self::CallDirect => "quill_rt_call_direct",
            Self::CallPacked => "quill_rt_call_packed",
            Self::Perform => "quill_rt_perform",
            Self::PrintLiteral => "quill_rt_print_literal",
            Self::ReadLine => "quill_rt_read_line",
            Self::ReadChar => "quill_rt_read_char",
            Self::Quit => "quill_rt_quit",
        }
    }

    /// Number of parameters (INCLUDING the ctx pointer).
    pub fn param_count(self) -> usize {
        match self {
            Self::Pop | Self::Peek | Self::ReadChar | Self::Quit => 1,
            Self::Push | Self::ReplaceTop | Self::ReadGlobal | Self::PrintLiteral => 2,
            Self::Trap
            | Self::WriteGlobal
            | Self::LoadWord
            | Self::LoadByte
            | Self::ReadLine => 3,
            Self::StoreWord
            | Self::StoreByte
            | Self::ReadVariable
            | Self::CallDirect
            | Self::CallPacked
            | Self::Perform => 4,
            Self::WriteVariable => 5,
        }
    }

    /// Helper group, used to skip declaring imports a routine never calls.
    pub fn group(self) -> HelperGroup {
        match self {
            Self::Push | Self::Pop | Self::Peek | Self::ReplaceTop => HelperGroup::Stack,
            Self::ReadGlobal
            | Self::WriteGlobal
            | Self::LoadWord
            | Self::LoadByte
            | Self::StoreWord
            | Self::StoreByte => HelperGroup::Memory,
            Self::PrintLiteral | Self::ReadLine | Self::ReadChar => HelperGroup::Screen,
            Self::Trap
            | Self::ReadVariable
            | Self::WriteVariable
            | Self::CallDirect
            | Self::CallPacked
            | Self::Perform
            | Self::Quit => HelperGroup::Core,
        }
    }

    /// Build the Cranelift IR signature for this helper.
    pub fn make_signature(self) -> ir::Signature {
        let call_conv = cranelift_codegen::isa::CallConv::SystemV;
        let mut sig = ir::Signature::new(call_conv);
        for _ in 0..self.param_count() {
            sig.params.push(AbiParam::new(types::I64));
        }
        sig.returns.push(AbiParam::new(types::I64));
        sig
    }
}

// ---------------------------------------------------------------------------
// Opcode ids and outcome encoding shared with the runtime
// ---------------------------------------------------------------------------

fn kind_index(kind: OpcodeKind) -> i64 {
    match kind {
        OpcodeKind::Op0 => 0,
        OpcodeKind::Op1 => 1,
        OpcodeKind::Op2 => 2,
        OpcodeKind::Var => 3,
        OpcodeKind::Ext => 4,
    }
}

/// Stable id of `opcode` as passed to [`HelperKind::Perform`] and the trap helper.
pub fn opcode_id(opcode: Opcode, version: u8) -> Option<i64> {
    let (kind, number) = opcode.encoding(version)?;
    Some(kind_index(kind) << 8 | i64::from(number))
}

/// Inverse of [`opcode_id`].
pub fn opcode_from_id(id: i64, version: u8) -> Option<Opcode> {
    let kind = match id >> 8 {
        0 => OpcodeKind::Op0,
        1 => OpcodeKind::Op1,
        2 => OpcodeKind::Op2,
        3 => OpcodeKind::Var,
        4 => OpcodeKind::Ext,
        _ => return None,
    };
    Some(Opcode::lookup(kind, (id & 0xff) as u8, version))
}

/// Pack an [`Outcome`] into a non-negative helper result.
#[inline]
pub fn encode_outcome(outcome: Outcome) -> i64 {
    match outcome {
        Outcome::Continue => 0,
        Outcome::Value(value) => i64::from(value),
        Outcome::Test(test) => i64::from(test) * OUTCOME_TEST_BIT,
        Outcome::ValueTest(value, test) => i64::from(test) * OUTCOME_TEST_BIT | i64::from(value),
    }
}

// ---------------------------------------------------------------------------
// Helper address table
// ---------------------------------------------------------------------------

/// Table of runtime helper function pointers.
///
/// When a slot is `None`, routines that need that helper fail to compile
/// with [`JitError::MissingHelper`].
#[derive(Clone)]
pub struct RuntimeHelpers {
    ptrs: [Option<*const u8>; HELPER_COUNT],
}

// SAFETY: function pointers are `Send + Sync` by nature.
unsafe impl Send for RuntimeHelpers {}
unsafe impl Sync for RuntimeHelpers {}

impl Default for RuntimeHelpers {
    fn default() -> Self {
        Self {
            ptrs: [None; HELPER_COUNT],
        }
    }
}

impl RuntimeHelpers {
    /// Create an empty helper table (all helpers unset).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a helper function pointer.
    ///
    /// # Safety
    ///
    /// The function pointer must have the correct `extern "C"` signature
    /// matching the [`HelperKind`] parameter conventions.
    pub unsafe fn set(&mut self, kind: HelperKind, ptr: *const u8) {
        self.ptrs[kind as usize] = Some(ptr);
    }

    /// Get a helper function pointer.
    pub fn get(&self, kind: HelperKind) -> Option<*const u8> {
        self.ptrs[kind as usize]
    }

    /// Whether every helper is set.
    pub fn is_complete(&self) -> bool {
        self.ptrs.iter().all(Option::is_some)
    }

    /// Register all non-None helper pointers as symbols on the JIT builder.
    pub fn register_symbols(&self, builder: &mut JITBuilder) {
        for kind in HelperKind::ALL {
            if let Some(ptr) = self.get(kind) {
                builder.symbol(kind.symbol_name(), ptr);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Module-level helper declarations
// ---------------------------------------------------------------------------

/// Module-level function IDs for declared helper imports.
/// Created once per [`crate::JitCompiler`].
pub(crate) struct HelperFuncIds {
    ids: [Option<FuncId>; HELPER_COUNT],
}

impl HelperFuncIds {
    /// Declare all available helpers as imported functions on the module.
    pub fn declare<M: Module>(helpers: &RuntimeHelpers, module: &mut M) -> Result<Self, JitError> {
        let mut ids = [None; HELPER_COUNT];
        for kind in HelperKind::ALL {
            if helpers.get(kind).is_some() {
                let sig = kind.make_signature();
                let func_id = module.declare_function(kind.symbol_name(), Linkage::Import, &sig)?;
                ids[kind as usize] = Some(func_id);
            }
        }
        Ok(Self { ids })
    }
}

// ---------------------------------------------------------------------------
// Per-function helper references
// ---------------------------------------------------------------------------

/// Per-compiled-function helper references.
pub(crate) struct HelperRefs {
    refs: [Option<ir::FuncRef>; HELPER_COUNT],
}

impl HelperRefs {
    /// Declare the helpers of the wanted groups into a function's IR.
    pub fn declare<M: Module>(
        func_ids: &HelperFuncIds,
        module: &mut M,
        func: &mut ir::Function,
        wanted: impl Fn(HelperGroup) -> bool,
    ) -> Self {
        let mut refs = [None; HELPER_COUNT];
        for kind in HelperKind::ALL {
            if !wanted(kind.group()) {
                continue;
            }
            if let Some(func_id) = func_ids.ids[kind as usize] {
                refs[kind as usize] = Some(module.declare_func_in_func(func_id, func));
            }
        }
        Self { refs }
    }

    /// Get the FuncRef for a helper kind (None if not available).
    pub fn get(&self, kind: HelperKind) -> Option<ir::FuncRef> {
        self.refs[kind as usize]
    }

    /// Get the FuncRef, or fail with [`JitError::MissingHelper`].
    pub fn require(&self, kind: HelperKind, address: u32) -> Result<ir::FuncRef, JitError> {
        self.get(kind).ok_or(JitError::MissingHelper {
            address,
            helper: kind.symbol_name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_is_in_discriminant_order() {
        for (index, kind) in HelperKind::ALL.iter().enumerate() {
            assert_eq!(*kind as usize, index);
            assert!(kind.symbol_name().starts_with("quill_rt_"));
            assert_eq!(kind.make_signature().params.len(), kind.param_count());
        }
    }

    #[test]
    fn opcode_ids_round_trip_per_version() {
        for (opcode, version) in [
            (Opcode::Add, 3),
            (Opcode::Save, 3),
            (Opcode::PrintUnicode, 5),
            (Opcode::CallVS2, 4),
            (Opcode::Not, 3),
            (Opcode::Not, 5),
        ] {
            let id = opcode_id(opcode, version).unwrap();
            assert_eq!(opcode_from_id(id, version), Some(opcode), "{opcode} v{version}");
        }
        assert_eq!(opcode_from_id(9 << 8, 5), None);
    }

    #[test]
    fn outcomes_encode_value_and_test() {
        assert_eq!(encode_outcome(Outcome::Continue), 0);
        assert_eq!(encode_outcome(Outcome::Value(0xffff)), 0xffff);
        assert_eq!(encode_outcome(Outcome::Test(true)), OUTCOME_TEST_BIT);
        assert_eq!(
            encode_outcome(Outcome::ValueTest(7, true)),
            OUTCOME_TEST_BIT | 7
        );
        assert_eq!(encode_outcome(Outcome::ValueTest(7, false)), 7);
    }

    #[test]
    fn empty_table_registers_nothing() {
        let helpers = RuntimeHelpers::new();
        assert!(!helpers.is_complete());
        assert!(helpers.get(HelperKind::Perform).is_none());
    }
}
