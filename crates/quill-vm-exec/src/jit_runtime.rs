//! Runtime side of compiled routines: the routine cache and the bodies of
//! the helpers generated code calls.
//!
//! Every helper receives the context pointer built by [`JitRuntime::invoke`]
//! as its first argument. The context lives on the invoking Rust frame and
//! stays valid for the whole native call; a nested call builds a fresh
//! context over the same processor and host.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use quill_vm_bytecode::{Opcode, Variable};
use quill_vm_core::{Host, Processor, VmError, VmResult};
use quill_vm_jit::runtime_helpers::{HelperKind, RuntimeHelpers, encode_outcome, opcode_from_id};
use quill_vm_jit::trap::{Completion, FAULT, INTERRUPTED, QUIT, TrapReason};
use quill_vm_jit::{CompileEnv, CompileStatistics, CompiledRoutine, JitCompiler, JitError, Requirements};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Signature of every compiled routine.
type RoutineFn = extern "C" fn(*mut u8, *const i64, u32) -> i64;

/// Arguments a call can carry
const MAX_CALL_ARGS: usize = 7;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Snapshot of runtime counters for diagnostics.
pub struct JitRuntimeStats {
    /// Routines compiled to native code.
    pub compiled: u64,
    /// Routines Cranelift rejected.
    pub compile_errors: u64,
    /// Routines left to the interpreter.
    pub interpreted_routines: u64,
    /// Calls that entered native code.
    pub native_calls: u64,
    /// Calls that ran interpreted.
    pub interpreted_calls: u64,
    /// Native calls that ended in a fault.
    pub faults: u64,
    /// Cached routines dropped because the story rewrote them.
    pub evicted: u64,
}

enum RoutineTier {
    Compiled(CompiledRoutine),
    Interpreted,
}

/// Compiles routines on first call and runs them natively.
pub struct JitRuntime {
    compiler: JitCompiler,
    /// Keyed by routine header address.
    cache: FxHashMap<u32, RoutineTier>,
    fallback: bool,
    interrupt: Arc<AtomicBool>,
    stats: JitRuntimeStats,
}

impl JitRuntime {
    /// Create a runtime. With `fallback`, routines the compiler cannot
    /// handle run interpreted instead of failing.
    pub fn new(fallback: bool, interrupt: Arc<AtomicBool>) -> Result<Self, JitError> {
        Ok(Self {
            compiler: JitCompiler::new_with_helpers(runtime_helpers())?,
            cache: FxHashMap::default(),
            fallback,
            interrupt,
            stats: JitRuntimeStats::default(),
        })
    }

    /// Current counters.
    pub fn stats(&self) -> JitRuntimeStats {
        self.stats
    }

    /// Statistics of every routine compiled so far.
    pub fn compiled(&self) -> impl Iterator<Item = &CompileStatistics> {
        self.cache.values().filter_map(|tier| match tier {
            RoutineTier::Compiled(compiled) => Some(&compiled.statistics),
            RoutineTier::Interpreted => None,
        })
    }

    /// True if the routine at `address` has native code.
    pub fn is_compiled(&self, address: u32) -> bool {
        matches!(self.cache.get(&address), Some(RoutineTier::Compiled(_)))
    }

    /// Run the routine at unpacked `address` to completion, compiling it
    /// first if this is its first call. Returns `None` if the story quit.
    pub fn invoke(
        &mut self,
        processor: &mut Processor,
        host: &mut dyn Host,
        address: u32,
        args: &[u16],
    ) -> VmResult<Option<u16>> {
        if self.interrupt.load(Ordering::Relaxed) {
            return Err(VmError::Interrupted);
        }
        if address == 0 {
            return Ok(Some(0));
        }
        let Some(code_ptr) = self.prepare(processor, address)? else {
            self.stats.interpreted_calls += 1;
            return processor.run_routine(host, address, args);
        };

        let args = &args[..args.len().min(MAX_CALL_ARGS)];
        processor.enter_compiled_frame(address, args)?;
        let argv: SmallVec<[i64; MAX_CALL_ARGS]> = args.iter().map(|&arg| i64::from(arg)).collect();
        self.stats.native_calls += 1;

        #[allow(unsafe_code)]
        // SAFETY: `code_ptr` was finalized by `JitCompiler::compile`, which
        // always emits the `RoutineFn` signature.
        let routine: RoutineFn = unsafe { std::mem::transmute(code_ptr) };
        let mut context = JitContext {
            runtime: self as *mut JitRuntime,
            processor: processor as *mut Processor,
            host: host as *mut dyn Host,
            error: None,
        };
        let raw = routine(
            (&mut context as *mut JitContext<'_>).cast::<u8>(),
            argv.as_ptr(),
            argv.len() as u32,
        );

        match Completion::from_raw(raw) {
            Completion::Return(value) => {
                processor.leave_compiled_frame(value)?;
                Ok(Some(value))
            }
            Completion::Quit => {
                processor.quit();
                Ok(None)
            }
            Completion::Interrupted => Err(VmError::Interrupted),
            Completion::Fault => {
                self.stats.faults += 1;
                Err(context
                    .error
                    .take()
                    .unwrap_or(VmError::InvalidRoutine(address)))
            }
        }
    }

    /// Native entry for `address`, or `None` if it runs interpreted.
    fn prepare(&mut self, processor: &mut Processor, address: u32) -> VmResult<Option<*const u8>> {
        for stale in processor.take_stale_routines() {
            if self.cache.remove(&stale).is_some() {
                self.stats.evicted += 1;
                tracing::debug!(address = format_args!("{stale:#x}"), "dropping rewritten routine");
            }
        }
        if let Some(tier) = self.cache.get(&address) {
            return Ok(match tier {
                RoutineTier::Compiled(compiled) => Some(compiled.code_ptr),
                RoutineTier::Interpreted => None,
            });
        }

        processor.discover_routines(address)?;
        let routine = processor
            .routines()
            .get(address)
            .cloned()
            .ok_or(VmError::InvalidRoutine(address))?;

        if self.fallback
            && let Some(opcode) = Requirements::scan(&routine).untranslated
        {
            tracing::debug!(
                address = format_args!("{address:#x}"),
                opcode = %opcode,
                "routine left to the interpreter"
            );
            self.stats.interpreted_routines += 1;
            self.cache.insert(address, RoutineTier::Interpreted);
            return Ok(None);
        }

        let env = CompileEnv::from_processor(processor);
        match self.compiler.compile(&routine, &env) {
            Ok(compiled) => {
                let code_ptr = compiled.code_ptr;
                self.stats.compiled += 1;
                self.cache.insert(address, RoutineTier::Compiled(compiled));
                Ok(Some(code_ptr))
            }
            Err(error) => {
                self.stats.compile_errors += 1;
                if !self.fallback {
                    return Err(VmError::Compile {
                        address,
                        reason: error.to_string(),
                    });
                }
                tracing::warn!(
                    address = format_args!("{address:#x}"),
                    %error,
                    "compile failed, interpreting"
                );
                self.stats.interpreted_routines += 1;
                self.cache.insert(address, RoutineTier::Interpreted);
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for JitRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitRuntime")
            .field("cached", &self.cache.len())
            .field("fallback", &self.fallback)
            .field("stats", &self.stats)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Helper context
// ----------------------------------------------------------------------------

struct JitContext<'h> {
    runtime: *mut JitRuntime,
    processor: *mut Processor,
    host: *mut (dyn Host + 'h),
    error: Option<VmError>,
}

impl JitContext<'_> {
    fn fail(&mut self, error: VmError) -> i64 {
        match error {
            VmError::Interrupted => INTERRUPTED,
            error => {
                tracing::trace!(%error, "compiled code fault");
                self.error = Some(error);
                FAULT
            }
        }
    }

    fn finish(&mut self, result: VmResult<i64>) -> i64 {
        match result {
            Ok(value) => value,
            Err(error) => self.fail(error),
        }
    }
}

/// Recover the context passed to a helper.
///
/// # Safety
///
/// `ctx_raw` must be the pointer [`JitRuntime::invoke`] handed to the
/// routine currently running.
#[allow(unsafe_code)]
unsafe fn context<'c>(ctx_raw: i64) -> &'c mut JitContext<'c> {
    unsafe { &mut *(ctx_raw as *mut JitContext<'c>) }
}

#[allow(unsafe_code)]
fn processor_of<'c>(ctx: &JitContext<'c>) -> &'c mut Processor {
    // SAFETY: set from a live `&mut Processor` for the duration of the call.
    unsafe { &mut *ctx.processor }
}

#[allow(unsafe_code)]
fn host_of<'c>(ctx: &JitContext<'c>) -> &'c mut (dyn Host + 'c) {
    // SAFETY: as for the processor.
    unsafe { &mut *ctx.host }
}

#[allow(unsafe_code)]
fn runtime_of<'c>(ctx: &JitContext<'c>) -> &'c mut JitRuntime {
    // SAFETY: the runtime outlives every routine it invokes.
    unsafe { &mut *ctx.runtime }
}

/// Copy `argc` staged operands out of the scratch area.
#[allow(unsafe_code)]
fn staged(argc: i64, argv: i64) -> SmallVec<[u16; 8]> {
    let count = argc.clamp(0, 8) as usize;
    if count == 0 {
        return SmallVec::new();
    }
    // SAFETY: generated code stages at least `argc` words at `argv`.
    let values = unsafe { std::slice::from_raw_parts(argv as *const i64, count) };
    values.iter().map(|&value| value as u16).collect()
}

// ----------------------------------------------------------------------------
// Helper bodies
// ----------------------------------------------------------------------------

#[allow(unsafe_code)]
extern "C" fn quill_rt_trap(ctx_raw: i64, reason: i64, detail: i64) -> i64 {
    let ctx = unsafe { context(ctx_raw) };
    let version = processor_of(ctx).version();
    let error = match TrapReason::from_code(reason) {
        Some(TrapReason::DivisionByZero) => VmError::DivisionByZero,
        Some(TrapReason::InvalidLocal) => VmError::InvalidLocal {
            index: (detail >> 8) as u8,
            count: (detail & 0xff) as u8,
        },
        Some(TrapReason::NotImplemented) | None => match opcode_from_id(detail, version) {
            Some(opcode @ Opcode::Unknown(..)) => VmError::UnknownOpcode(opcode),
            Some(opcode) => VmError::NotImplemented(opcode.name()),
            None => VmError::NotImplemented("unknown"),
        },
    };
    ctx.fail(error)
}

#[allow(unsafe_code)]
extern "C" fn quill_rt_push(ctx_raw: i64, value: i64) -> i64 {
    let ctx = unsafe { context(ctx_raw) };
    let result = processor_of(ctx).stack_mut().push(value as u16).map(|()| 0);
    ctx.finish(result)
}

#[allow(unsafe_code)]
extern "C" fn quill_rt_pop(ctx_raw: i64) -> i64 {
    let ctx = unsafe { context(ctx_raw) };
    let result = processor_of(ctx).stack_mut().pop().map(i64::from);
    ctx.finish(result)
}

#[allow(unsafe_code)]
extern "C" fn quill_rt_peek(ctx_raw: i64) -> i64 {
    let ctx = unsafe { context(ctx_raw) };
    let result = processor_of(ctx).stack().peek().map(i64::from);
    ctx.finish(result)
}

#[allow(unsafe_code)]
extern "C" fn quill_rt_replace_top(ctx_raw: i64, value: i64) -> i64 {
    let ctx = unsafe { context(ctx_raw) };
    let result = processor_of(ctx)
        .stack_mut()
        .replace_top(value as u16)
        .map(|()| 0);
    ctx.finish(result)
}

#[allow(unsafe_code)]
extern "C" fn quill_rt_read_global(ctx_raw: i64, index: i64) -> i64 {
    let ctx = unsafe { context(ctx_raw) };
    let result = processor_of(ctx).read_global(index as u8).map(i64::from);
    ctx.finish(result)
}

#[allow(unsafe_code)]
extern "C" fn quill_rt_write_global(ctx_raw: i64, index: i64, value: i64) -> i64 {
    let ctx = unsafe { context(ctx_raw) };
    let result = processor_of(ctx)
        .write_global(index as u8, value as u16)
        .map(|()| 0);
    ctx.finish(result)
}

/// Memory helpers go through `perform` so bounds and write checks are the
/// interpreter's.
fn memory_op(ctx: &mut JitContext<'_>, opcode: Opcode, args: &[u16]) -> i64 {
    let processor = processor_of(ctx);
    let host = host_of(ctx);
    let result = processor.perform(host, opcode, args).map(encode_outcome);
    ctx.finish(result)
}

#[allow(unsafe_code)]
extern "C" fn quill_rt_load_word(ctx_raw: i64, array: i64, index: i64) -> i64 {
    let ctx = unsafe { context(ctx_raw) };
    memory_op(ctx, Opcode::Loadw, &[array as u16, index as u16])
}

#[allow(unsafe_code)]
extern "C" fn quill_rt_load_byte(ctx_raw: i64, array: i64, index: i64) -> i64 {
    let ctx = unsafe { context(ctx_raw) };
    memory_op(ctx, Opcode::Loadb, &[array as u16, index as u16])
}

#[allow(unsafe_code)]
extern "C" fn quill_rt_store_word(ctx_raw: i64, array: i64, index: i64, value: i64) -> i64 {
    let ctx = unsafe { context(ctx_raw) };
    memory_op(ctx, Opcode::Storew, &[array as u16, index as u16, value as u16])
}

#[allow(unsafe_code)]
extern "C" fn quill_rt_store_byte(ctx_raw: i64, array: i64, index: i64, value: i64) -> i64 {
    let ctx = unsafe { context(ctx_raw) };
    memory_op(ctx, Opcode::Storeb, &[array as u16, index as u16, value as u16])
}

/// Address of local `index` in the routine's slot array.
#[allow(unsafe_code)]
fn local_slot(locals: i64, count: i64, index: u8) -> VmResult<*mut i64> {
    if i64::from(index) >= count {
        return Err(VmError::InvalidLocal {
            index,
            count: count as u8,
        });
    }
    // SAFETY: the slot array holds `count` words.
    Ok(unsafe { (locals as *mut i64).add(index as usize) })
}

#[allow(unsafe_code)]
fn read_variable(processor: &Processor, locals: i64, count: i64, number: i64) -> VmResult<i64> {
    match Variable::from_byte(number as u8) {
        Variable::Stack => processor.stack().peek().map(i64::from),
        Variable::Local(index) => {
            let slot = local_slot(locals, count, index)?;
            // SAFETY: checked by `local_slot`.
            Ok(unsafe { slot.read() } & 0xffff)
        }
        Variable::Global(index) => processor.read_global(index).map(i64::from),
    }
}

#[allow(unsafe_code)]
fn write_variable(
    processor: &mut Processor,
    locals: i64,
    count: i64,
    number: i64,
    value: i64,
) -> VmResult<i64> {
    let value = value & 0xffff;
    match Variable::from_byte(number as u8) {
        Variable::Stack => processor.stack_mut().replace_top(value as u16)?,
        Variable::Local(index) => {
            let slot = local_slot(locals, count, index)?;
            // SAFETY: checked by `local_slot`.
            unsafe { slot.write(value) };
        }
        Variable::Global(index) => processor.write_global(index, value as u16)?,
    }
    Ok(0)
}

#[allow(unsafe_code)]
extern "C" fn quill_rt_read_variable(ctx_raw: i64, locals: i64, count: i64, number: i64) -> i64 {
    let ctx = unsafe { context(ctx_raw) };
    let result = read_variable(processor_of(ctx), locals, count, number);
    ctx.finish(result)
}

#[allow(unsafe_code)]
extern "C" fn quill_rt_write_variable(
    ctx_raw: i64,
    locals: i64,
    count: i64,
    number: i64,
    value: i64,
) -> i64 {
    let ctx = unsafe { context(ctx_raw) };
    let result = write_variable(processor_of(ctx), locals, count, number, value);
    ctx.finish(result)
}

fn call(ctx: &mut JitContext<'_>, address: u32, argc: i64, argv: i64) -> i64 {
    let args = staged(argc, argv);
    let runtime = runtime_of(ctx);
    let processor = processor_of(ctx);
    let host = host_of(ctx);
    match runtime.invoke(processor, host, address, &args) {
        Ok(Some(value)) => i64::from(value),
        Ok(None) => QUIT,
        Err(error) => ctx.fail(error),
    }
}

#[allow(unsafe_code)]
extern "C" fn quill_rt_call_direct(ctx_raw: i64, address: i64, argc: i64, argv: i64) -> i64 {
    let ctx = unsafe { context(ctx_raw) };
    call(ctx, address as u32, argc, argv)
}

#[allow(unsafe_code)]
extern "C" fn quill_rt_call_packed(ctx_raw: i64, packed: i64, argc: i64, argv: i64) -> i64 {
    let ctx = unsafe { context(ctx_raw) };
    let packed = packed as u16;
    if packed == 0 {
        return 0;
    }
    let address = processor_of(ctx).header().unpack_routine_address(packed);
    call(ctx, address, argc, argv)
}

#[allow(unsafe_code)]
extern "C" fn quill_rt_perform(ctx_raw: i64, id: i64, argc: i64, argv: i64) -> i64 {
    let ctx = unsafe { context(ctx_raw) };
    let processor = processor_of(ctx);
    let host = host_of(ctx);
    let result = match opcode_from_id(id, processor.version()) {
        Some(opcode) => processor
            .perform(host, opcode, &staged(argc, argv))
            .map(encode_outcome),
        None => Err(VmError::NotImplemented("unknown")),
    };
    ctx.finish(result)
}

#[allow(unsafe_code)]
extern "C" fn quill_rt_print_literal(ctx_raw: i64, id: i64) -> i64 {
    let ctx = unsafe { context(ctx_raw) };
    let runtime = runtime_of(ctx);
    let processor = processor_of(ctx);
    let host = host_of(ctx);
    let result = match runtime.compiler.literal(id as usize) {
        Some(text) => processor.print_str(host, text).map(|()| 0),
        None => Err(VmError::InvalidText(format!("no literal #{id}"))),
    };
    ctx.finish(result)
}

fn read_line(processor: &mut Processor, host: &mut dyn Host, text: u32, parse: u32) -> VmResult<i64> {
    if processor.version() <= 3 {
        host.show_status(&processor.status_line()?);
    }
    let capacity = processor.line_capacity(text)?;
    let line = host.read_line(capacity).ok_or(VmError::InputUnavailable)?;
    processor
        .finish_line_input(text, parse, &line)
        .map(i64::from)
}

#[allow(unsafe_code)]
extern "C" fn quill_rt_read_line(ctx_raw: i64, text: i64, parse: i64) -> i64 {
    let ctx = unsafe { context(ctx_raw) };
    let result = read_line(
        processor_of(ctx),
        host_of(ctx),
        text as u16 as u32,
        parse as u16 as u32,
    );
    ctx.finish(result)
}

#[allow(unsafe_code)]
extern "C" fn quill_rt_read_char(ctx_raw: i64) -> i64 {
    let ctx = unsafe { context(ctx_raw) };
    let processor = processor_of(ctx);
    let result = host_of(ctx)
        .read_char()
        .map(|ch| i64::from(processor.finish_char_input(ch)))
        .ok_or(VmError::InputUnavailable);
    ctx.finish(result)
}

#[allow(unsafe_code)]
extern "C" fn quill_rt_quit(ctx_raw: i64) -> i64 {
    let ctx = unsafe { context(ctx_raw) };
    processor_of(ctx).quit();
    QUIT
}

/// Helper table wired to this runtime's helper bodies.
#[allow(unsafe_code)]
pub fn runtime_helpers() -> RuntimeHelpers {
    let mut helpers = RuntimeHelpers::new();
    // SAFETY: each function matches the signature its `HelperKind` declares.
    unsafe {
        helpers.set(HelperKind::Trap, quill_rt_trap as *const u8);
        helpers.set(HelperKind::Push, quill_rt_push as *const u8);
        helpers.set(HelperKind::Pop, quill_rt_pop as *const u8);
        helpers.set(HelperKind::Peek, quill_rt_peek as *const u8);
        helpers.set(HelperKind::ReplaceTop, quill_rt_replace_top as *const u8);
        helpers.set(HelperKind::ReadGlobal, quill_rt_read_global as *const u8);
        helpers.set(HelperKind::WriteGlobal, quill_rt_write_global as *const u8);
        helpers.set(HelperKind::LoadWord, quill_rt_load_word as *const u8);
        helpers.set(HelperKind::LoadByte, quill_rt_load_byte as *const u8);
        helpers.set(HelperKind::StoreWord, quill_rt_store_word as *const u8);
        helpers.set(HelperKind::StoreByte, quill_rt_store_byte as *const u8);
        helpers.set(HelperKind::ReadVariable, quill_rt_read_variable as *const u8);
        helpers.set(HelperKind::WriteVariable, quill_rt_write_variable as *const u8);
        helpers.set(HelperKind::CallDirect, quill_rt_call_direct as *const u8);
        helpers.set(HelperKind::CallPacked, quill_rt_call_packed as *const u8);
        helpers.set(HelperKind::Perform, quill_rt_perform as *const u8);
        helpers.set(HelperKind::PrintLiteral, quill_rt_print_literal as *const u8);
        helpers.set(HelperKind::ReadLine, quill_rt_read_line as *const u8);
        helpers.set(HelperKind::ReadChar, quill_rt_read_char as *const u8);
        helpers.set(HelperKind::Quit, quill_rt_quit as *const u8);
    }
    debug_assert!(helpers.is_complete());
    helpers
}
