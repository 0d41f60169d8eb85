//! Cranelift compiler for Z-machine routines.

use std::time::Instant;

use cranelift_codegen::ir::{AbiParam, UserFuncName, types};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module, ModuleError, default_libcall_names};
use quill_vm_bytecode::{Header, Memory};
use quill_vm_core::{Processor, Routine, VmError, ZText};

use crate::runtime_helpers::{HelperFuncIds, HelperRefs, RuntimeHelpers};
use crate::stats::CompileStatistics;
use crate::translator::{self, Requirements};

/// Story state a routine is translated against.
#[derive(Clone, Copy)]
pub struct CompileEnv<'a> {
    /// Story memory, for embedded text
    pub memory: &'a Memory,
    /// Header, for packed addresses and the version
    pub header: &'a Header,
    /// Text decoder for `print` and `print_ret`
    pub text: &'a ZText,
}

impl<'a> CompileEnv<'a> {
    /// Borrow everything from a processor.
    pub fn from_processor(processor: &'a Processor) -> Self {
        Self {
            memory: processor.memory(),
            header: processor.header(),
            text: processor.text(),
        }
    }
}

/// Native code for one routine.
#[derive(Debug, Clone)]
pub struct CompiledRoutine {
    /// Routine header address
    pub address: u32,
    /// Entry pointer, `extern "C" fn(*mut u8, *const i64, u32) -> i64`
    pub code_ptr: *const u8,
    /// What the compile produced
    pub statistics: CompileStatistics,
}

/// Errors produced by the routine compiler.
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    /// Cranelift module-level error.
    #[error("cranelift module error: {0}")]
    Module(Box<ModuleError>),

    /// Failed to create the JIT builder.
    #[error("jit builder initialization failed: {0}")]
    Builder(String),

    /// The routine calls a runtime helper this compiler was built without.
    #[error("instruction at {address:#07x} needs helper {helper}")]
    MissingHelper {
        /// Instruction address
        address: u32,
        /// Helper symbol
        helper: &'static str,
    },

    /// Branch or jump lands outside the routine's instructions.
    #[error("invalid jump target {target:#07x} from {address:#07x}")]
    InvalidJumpTarget {
        /// Instruction address
        address: u32,
        /// Destination
        target: u32,
    },

    /// The routine itself is malformed.
    #[error(transparent)]
    Vm(#[from] VmError),
}

impl From<ModuleError> for JitError {
    fn from(value: ModuleError) -> Self {
        Self::Module(Box::new(value))
    }
}

fn builder_error(error: impl std::fmt::Display) -> JitError {
    JitError::Builder(error.to_string())
}

/// Host ISA with optimisation on.
fn jit_builder() -> Result<JITBuilder, JitError> {
    let mut flags = settings::builder();
    flags
        .set("use_colocated_libcalls", "false")
        .map_err(builder_error)?;
    flags.set("is_pic", "false").map_err(builder_error)?;
    flags.set("opt_level", "speed").map_err(builder_error)?;
    let isa = cranelift_native::builder()
        .map_err(builder_error)?
        .finish(settings::Flags::new(flags))
        .map_err(builder_error)?;
    Ok(JITBuilder::with_isa(isa, default_libcall_names()))
}

/// Cranelift-backed routine compiler.
pub struct JitCompiler {
    module: JITModule,
    function_builder_ctx: FunctionBuilderContext,
    context: cranelift_codegen::Context,
    next_function_id: u64,
    helper_func_ids: Option<HelperFuncIds>,
    literals: Vec<String>,
}

impl JitCompiler {
    /// Create a compiler with no runtime helpers.
    ///
    /// Only routines that keep to locals, arithmetic and control flow compile.
    pub fn new() -> Result<Self, JitError> {
        let module = JITModule::new(jit_builder()?);
        Ok(Self {
            module,
            function_builder_ctx: FunctionBuilderContext::new(),
            context: cranelift_codegen::Context::new(),
            next_function_id: 0,
            helper_func_ids: None,
            literals: Vec::new(),
        })
    }

    /// Create a compiler whose routines call back into the VM.
    pub fn new_with_helpers(helpers: RuntimeHelpers) -> Result<Self, JitError> {
        let mut builder = jit_builder()?;
        helpers.register_symbols(&mut builder);
        let mut module = JITModule::new(builder);
        let helper_func_ids = HelperFuncIds::declare(&helpers, &mut module)?;
        Ok(Self {
            module,
            function_builder_ctx: FunctionBuilderContext::new(),
            context: cranelift_codegen::Context::new(),
            next_function_id: 0,
            helper_func_ids: Some(helper_func_ids),
            literals: Vec::new(),
        })
    }

    /// Whether runtime helpers are available for compilation.
    pub fn has_helpers(&self) -> bool {
        self.helper_func_ids.is_some()
    }

    /// Embedded string `id`, as printed by compiled `print` instructions.
    pub fn literal(&self, id: usize) -> Option<&str> {
        self.literals.get(id).map(String::as_str)
    }

    /// Number of pooled strings.
    pub fn literal_count(&self) -> usize {
        self.literals.len()
    }

    /// Compile a routine into native code.
    pub fn compile(
        &mut self,
        routine: &Routine,
        env: &CompileEnv<'_>,
    ) -> Result<CompiledRoutine, JitError> {
        let started = Instant::now();
        let needs = Requirements::scan(routine);
        let mut statistics = CompileStatistics {
            address: routine.address(),
            locals: routine.local_count(),
            uses_stack: needs.stack,
            uses_memory: needs.memory,
            uses_screen: needs.screen,
            uses_streams: needs.streams,
            ..CompileStatistics::default()
        };

        let mut signature = self.module.make_signature();
        // Signature: (ctx: I64, args_ptr: I64, argc: I32) -> I64
        signature.params.push(AbiParam::new(types::I64)); // ctx pointer
        signature.params.push(AbiParam::new(types::I64)); // args_ptr
        signature.params.push(AbiParam::new(types::I32)); // argc
        signature.returns.push(AbiParam::new(types::I64));

        let name = format!("quill_{:05x}_{}", routine.address(), self.next_function_id);
        self.next_function_id = self.next_function_id.saturating_add(1);

        let func_id = self
            .module
            .declare_function(&name, Linkage::Local, &signature)?;

        self.context.func = cranelift_codegen::ir::Function::with_name_signature(
            UserFuncName::user(0, func_id.as_u32()),
            signature,
        );

        let helper_refs = self.helper_func_ids.as_ref().map(|func_ids| {
            HelperRefs::declare(func_ids, &mut self.module, &mut self.context.func, |group| {
                needs.wants(group)
            })
        });

        let translated = {
            let mut builder =
                FunctionBuilder::new(&mut self.context.func, &mut self.function_builder_ctx);
            let result = translator::translate_routine(
                &mut builder,
                routine,
                env,
                helper_refs.as_ref(),
                &mut self.literals,
                &mut statistics,
            );
            if result.is_ok() {
                builder.finalize();
            }
            result
        };
        if let Err(error) = translated {
            self.function_builder_ctx = FunctionBuilderContext::new();
            self.module.clear_context(&mut self.context);
            return Err(error);
        }

        statistics.operations = self.context.func.dfg.num_insts();
        if let Err(error) = self.module.define_function(func_id, &mut self.context) {
            self.module.clear_context(&mut self.context);
            return Err(error.into());
        }
        statistics.code_size = self
            .context
            .compiled_code()
            .map_or(0, |code| code.code_buffer().len());
        self.module.clear_context(&mut self.context);
        self.module.finalize_definitions()?;

        let code_ptr = self.module.get_finalized_function(func_id);
        statistics.elapsed = started.elapsed();
        tracing::debug!(
            address = format_args!("{:#x}", routine.address()),
            instructions = statistics.instructions,
            code_size = statistics.code_size,
            "compiled routine"
        );
        Ok(CompiledRoutine {
            address: routine.address(),
            code_ptr,
            statistics,
        })
    }

    /// Run a routine compiled without helpers, passing a null context.
    ///
    /// Returns `None` when this compiler has helpers, since such routines
    /// may dereference the context.
    pub fn execute_pure(&self, compiled: &CompiledRoutine, args: &[i64]) -> Option<i64> {
        if self.has_helpers() {
            return None;
        }
        let func: extern "C" fn(*mut u8, *const i64, u32) -> i64 = unsafe {
            // SAFETY: routines are produced by this compiler with signature
            // `(*mut u8, *const i64, u32) -> i64`, and without helpers they
            // never touch the context pointer.
            std::mem::transmute(compiled.code_ptr)
        };
        Some(func(std::ptr::null_mut(), args.as_ptr(), args.len() as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_vm_bytecode::assembler::{local, small, sp};
    use quill_vm_bytecode::{Assembler, Decoder, Opcode, Variable};

    struct Story {
        memory: Memory,
        header: Header,
        text: ZText,
        routine: Routine,
    }

    impl Story {
        fn build(version: u8, locals: &[u16], body: impl FnOnce(&mut Assembler)) -> Self {
            let mut asm = Assembler::new(version);
            let address = asm.routine(locals);
            body(&mut asm);
            let memory = Memory::new(asm.finish().unwrap());
            let header = Header::read(&memory).unwrap();
            let text = ZText::new(&memory, &header).unwrap();
            let mut decoder = Decoder::new(version);
            let routine = Routine::read(&memory, &mut decoder, address).unwrap();
            Self {
                memory,
                header,
                text,
                routine,
            }
        }

        fn env(&self) -> CompileEnv<'_> {
            CompileEnv {
                memory: &self.memory,
                header: &self.header,
                text: &self.text,
            }
        }

        fn run(&self, args: &[i64]) -> i64 {
            let mut compiler = JitCompiler::new().unwrap();
            let compiled = compiler.compile(&self.routine, &self.env()).unwrap();
            compiler.execute_pure(&compiled, args).unwrap()
        }
    }

    #[test]
    fn adds_arguments() {
        let story = Story::build(5, &[0, 0], |asm| {
            asm.op(Opcode::Add, &[local(0), local(1)])
                .store(Variable::Local(0));
            asm.op(Opcode::Ret, &[local(0)]);
        });
        assert_eq!(story.run(&[3, 4]), 7);
    }

    #[test]
    fn v3_defaults_fill_missing_arguments() {
        let story = Story::build(3, &[10, 20], |asm| {
            asm.op(Opcode::Add, &[local(0), local(1)])
                .store(Variable::Local(0));
            asm.op(Opcode::Ret, &[local(0)]);
        });
        assert_eq!(story.run(&[1]), 21);
        assert_eq!(story.run(&[]), 30);
    }

    #[test]
    fn arithmetic_wraps_to_sixteen_bits() {
        let story = Story::build(5, &[0], |asm| {
            asm.op(Opcode::Mul, &[local(0), local(0)])
                .store(Variable::Local(0));
            asm.op(Opcode::Ret, &[local(0)]);
        });
        // 300 * 300 = 90000 = 0x15f90
        assert_eq!(story.run(&[300]), 0x5f90);
    }

    #[test]
    fn signed_compare_sees_negative_words() {
        let story = Story::build(5, &[0], |asm| {
            asm.op(Opcode::Sub, &[small(0), small(1)])
                .store(Variable::Local(0));
            asm.op(Opcode::Jl, &[local(0), small(0)])
                .branch_return(true, true);
            asm.op(Opcode::Rfalse, &[]);
        });
        assert_eq!(story.run(&[]), 1);
    }

    #[test]
    fn loop_sums_down_to_zero() {
        let story = Story::build(5, &[0, 0], |asm| {
            let top = asm.here();
            let done = asm.label();
            asm.op(Opcode::Jz, &[local(0)]).branch(true, done);
            asm.op(Opcode::Add, &[local(1), local(0)])
                .store(Variable::Local(1));
            asm.op(Opcode::Dec, &[small(1)]);
            asm.jump(top);
            asm.bind(done);
            asm.op(Opcode::Ret, &[local(1)]);
        });
        assert_eq!(story.run(&[4]), 10);
        assert_eq!(story.run(&[0]), 0);
    }

    #[test]
    fn indirect_locals_use_the_slot_array() {
        let story = Story::build(5, &[0, 0], |asm| {
            asm.op(Opcode::Store, &[small(2), small(9)]);
            asm.op(Opcode::IncChk, &[small(2), small(9)])
                .branch_return(true, true);
            asm.op(Opcode::Rfalse, &[]);
        });
        assert_eq!(story.run(&[]), 1);
    }

    #[test]
    fn stack_access_requires_helpers() {
        let story = Story::build(5, &[], |asm| {
            asm.op(Opcode::Push, &[small(1)]);
            asm.op(Opcode::Ret, &[sp()]);
        });
        let mut compiler = JitCompiler::new().unwrap();
        let error = compiler.compile(&story.routine, &story.env()).unwrap_err();
        assert!(matches!(error, JitError::MissingHelper { .. }));

        // the compiler stays usable after a failed translation
        let pure = Story::build(5, &[], |asm| {
            asm.op(Opcode::Rtrue, &[]);
        });
        let compiled = compiler.compile(&pure.routine, &pure.env()).unwrap();
        assert_eq!(compiler.execute_pure(&compiled, &[]), Some(1));
    }

    #[test]
    fn statistics_describe_the_routine() {
        let story = Story::build(5, &[0, 0, 0], |asm| {
            asm.op(Opcode::Add, &[local(0), small(1)])
                .store(Variable::Local(2));
            asm.op(Opcode::Ret, &[local(2)]);
        });
        let mut compiler = JitCompiler::new().unwrap();
        let compiled = compiler.compile(&story.routine, &story.env()).unwrap();
        let stats = &compiled.statistics;
        assert_eq!(stats.address, story.routine.address());
        assert_eq!(stats.instructions, 2);
        assert_eq!(stats.locals, 3);
        assert!(stats.operations > 0);
        assert!(stats.code_size > 0);
        assert!(!stats.uses_stack && !stats.uses_memory);
    }
}
