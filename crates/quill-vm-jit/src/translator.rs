//! Routine to Cranelift IR translation.
//!
//! Words travel as zero-extended `i64`. Locals live in one explicit stack
//! slot, eight bytes each, so the runtime can address them by number when an
//! instruction names its variable through a computed operand. Each block of
//! the routine's control flow graph becomes one Cranelift block.
//!
//! Arithmetic, comparisons, local access and control flow are emitted
//! inline. Everything else calls a runtime helper, and every helper result is
//! checked: a negative value is a [`crate::trap`] sentinel and leaves the
//! routine unchanged through the shared exit block.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::instructions::BlockArg;
use cranelift_codegen::ir::{
    Block, InstBuilder, MemFlags, StackSlot, StackSlotData, StackSlotKind, Value, types,
};
use cranelift_frontend::FunctionBuilder;
use quill_vm_bytecode::{BranchTarget, Instruction, Opcode, Operand, Variable};
use quill_vm_core::{ControlFlowGraph, Routine, VmError};
use smallvec::SmallVec;

use crate::JitError;
use crate::compiler::CompileEnv;
use crate::runtime_helpers::{HelperGroup, HelperKind, HelperRefs, OUTCOME_TEST_BIT, opcode_id};
use crate::stats::CompileStatistics;
use crate::trap::TrapReason;

const WORD_MASK: i64 = 0xffff;

/// Operands staged in memory for call and perform helpers
const SCRATCH_WORDS: u32 = 8;

/// Arguments a routine can receive
const MAX_ARGS: usize = 7;

/// What a routine needs from the runtime, found before translation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Requirements {
    /// Evaluation stack helpers
    pub stack: bool,
    /// Global and table helpers
    pub memory: bool,
    /// Printing or input
    pub screen: bool,
    /// Stream selection
    pub streams: bool,
    /// First instruction that compiles to a not-implemented trap
    pub untranslated: Option<Opcode>,
}

/// Opcodes compiled code does not translate; reaching one traps.
pub fn is_untranslated(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Restart
            | Opcode::Catch
            | Opcode::Throw
            | Opcode::Save
            | Opcode::Restore
            | Opcode::SaveExt
            | Opcode::RestoreExt
            | Opcode::SaveUndo
            | Opcode::RestoreUndo
            | Opcode::EncodeText
            | Opcode::PrintTable
            | Opcode::InputStream
            | Opcode::SoundEffect
            | Opcode::Unknown(..)
    )
}

impl Requirements {
    /// Scan `routine` for the helper groups its translation will call.
    pub fn scan(routine: &Routine) -> Self {
        let mut needs = Self::default();
        for instruction in routine.instructions() {
            let variables = instruction
                .operands
                .iter()
                .filter_map(|operand| operand.variable())
                .chain(instruction.store);
            for variable in variables {
                needs.touch(variable);
            }
            let opcode = instruction.opcode;
            let computed_jump = opcode == Opcode::Jump && instruction.jump_target().is_none();
            if needs.untranslated.is_none() && (is_untranslated(opcode) || computed_jump) {
                needs.untranslated = Some(opcode);
            }
            if opcode.has_indirect_variable() {
                if let Some(number) = instruction.operands.first().and_then(|o| o.constant()) {
                    needs.touch(Variable::from_byte(number as u8));
                }
            }
            match opcode {
                Opcode::Push | Opcode::Pop | Opcode::RetPopped => needs.stack = true,
                Opcode::Pull => {
                    needs.stack = true;
                    needs.memory = true;
                }
                Opcode::Loadw | Opcode::Loadb | Opcode::Storew | Opcode::Storeb => {
                    needs.memory = true
                }
                Opcode::Print
                | Opcode::PrintRet
                | Opcode::NewLine
                | Opcode::Sread
                | Opcode::Aread
                | Opcode::ReadChar
                | Opcode::PrintChar
                | Opcode::PrintNum
                | Opcode::PrintAddr
                | Opcode::PrintPaddr
                | Opcode::PrintObj
                | Opcode::PrintUnicode
                | Opcode::ShowStatus
                | Opcode::SplitWindow
                | Opcode::SetWindow
                | Opcode::EraseWindow
                | Opcode::EraseLine
                | Opcode::SetCursor
                | Opcode::GetCursor
                | Opcode::SetTextStyle
                | Opcode::BufferMode
                | Opcode::SetColour
                | Opcode::SetTrueColour
                | Opcode::SetFont => needs.screen = true,
                Opcode::OutputStream | Opcode::InputStream => needs.streams = true,
                _ => {}
            }
        }
        needs
    }

    fn touch(&mut self, variable: Variable) {
        match variable {
            Variable::Stack => self.stack = true,
            Variable::Global(_) => self.memory = true,
            Variable::Local(_) => {}
        }
    }

    /// Whether helpers of `group` have to be declared.
    pub fn wants(&self, group: HelperGroup) -> bool {
        match group {
            HelperGroup::Core => true,
            HelperGroup::Stack => self.stack,
            HelperGroup::Memory => self.memory,
            HelperGroup::Screen => self.screen,
        }
    }
}

/// Where an indirect instruction's variable comes from
#[derive(Clone, Copy)]
enum Target {
    Direct(Variable),
    Computed(Value),
}

/// Initialize a local from argv, or its default when the argument is missing.
fn init_local(
    builder: &mut FunctionBuilder<'_>,
    args_ptr: Value,
    argc: Value,
    index: usize,
    default: Value,
) -> Value {
    let load_block = builder.create_block();
    let default_block = builder.create_block();
    let merge_block = builder.create_block();
    builder.append_block_param(merge_block, types::I64);

    let idx = builder.ins().iconst(types::I32, index as i64);
    let has_arg = builder.ins().icmp(IntCC::UnsignedGreaterThan, argc, idx);
    builder
        .ins()
        .brif(has_arg, load_block, &[], default_block, &[]);

    builder.switch_to_block(load_block);
    let loaded = builder
        .ins()
        .load(types::I64, MemFlags::trusted(), args_ptr, (index * 8) as i32);
    let loaded = builder.ins().band_imm(loaded, WORD_MASK);
    builder.ins().jump(merge_block, &[BlockArg::Value(loaded)]);

    builder.switch_to_block(default_block);
    builder.ins().jump(merge_block, &[BlockArg::Value(default)]);

    builder.switch_to_block(merge_block);
    builder.block_params(merge_block)[0]
}

/// Translate a routine into Cranelift IR.
pub(crate) fn translate_routine(
    builder: &mut FunctionBuilder<'_>,
    routine: &Routine,
    env: &CompileEnv<'_>,
    helpers: Option<&HelperRefs>,
    literals: &mut Vec<String>,
    stats: &mut CompileStatistics,
) -> Result<(), JitError> {
    let cfg = ControlFlowGraph::build(routine);
    let local_count = routine.local_count();

    let locals = builder.create_sized_stack_slot(StackSlotData::new(
        StackSlotKind::ExplicitSlot,
        u32::from(local_count.max(1)) * 8,
        3,
    ));
    let scratch = builder.create_sized_stack_slot(StackSlotData::new(
        StackSlotKind::ExplicitSlot,
        SCRATCH_WORDS * 8,
        3,
    ));

    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    let exit = builder.create_block();
    builder.append_block_param(exit, types::I64);
    let return_false = builder.create_block();
    let return_true = builder.create_block();
    let blocks: Vec<Block> = cfg.blocks().iter().map(|_| builder.create_block()).collect();

    builder.switch_to_block(entry);
    let entry_params = builder.block_params(entry);
    let (ctx, args_ptr, argc) = (entry_params[0], entry_params[1], entry_params[2]);
    for (index, &default) in routine.defaults().iter().enumerate() {
        let default = builder.ins().iconst(types::I64, i64::from(default));
        let init = if index < MAX_ARGS {
            init_local(builder, args_ptr, argc, index, default)
        } else {
            default
        };
        builder.ins().stack_store(init, locals, (index * 8) as i32);
    }
    match blocks.first() {
        Some(&first) => {
            builder.ins().jump(first, &[]);
        }
        None => {
            let zero = builder.ins().iconst(types::I64, 0);
            builder.ins().return_(&[zero]);
        }
    }

    for (block, value) in [(return_false, 0), (return_true, 1)] {
        builder.switch_to_block(block);
        let value = builder.ins().iconst(types::I64, value);
        builder.ins().return_(&[value]);
    }
    builder.switch_to_block(exit);
    let code = builder.block_params(exit)[0];
    builder.ins().return_(&[code]);

    let mut translator = Translator {
        builder,
        helpers,
        env,
        literals,
        stats,
        cfg: &cfg,
        blocks: &blocks,
        version: env.header.version,
        local_count,
        ctx,
        locals,
        scratch,
        exit,
        return_false,
        return_true,
        address: routine.address(),
        terminated: false,
    };

    let instructions = routine.instructions();
    for (index, block) in cfg.blocks().iter().enumerate() {
        translator.builder.switch_to_block(blocks[index]);
        translator.terminated = false;
        for instruction in &instructions[block.range.clone()] {
            translator.address = instruction.address;
            translator.stats.instructions += 1;
            translator.instruction(instruction)?;
            if translator.terminated {
                break;
            }
        }
        if !translator.terminated {
            let last = &instructions[block.range.end - 1];
            let next = translator.block_for(last.next_address())?;
            translator.builder.ins().jump(next, &[]);
        }
    }

    translator.builder.seal_all_blocks();
    Ok(())
}

struct Translator<'a, 'f> {
    builder: &'a mut FunctionBuilder<'f>,
    helpers: Option<&'a HelperRefs>,
    env: &'a CompileEnv<'a>,
    literals: &'a mut Vec<String>,
    stats: &'a mut CompileStatistics,
    cfg: &'a ControlFlowGraph,
    blocks: &'a [Block],
    version: u8,
    local_count: u8,
    ctx: Value,
    locals: StackSlot,
    scratch: StackSlot,
    exit: Block,
    return_false: Block,
    return_true: Block,
    /// Instruction being translated
    address: u32,
    /// The current block already ends in a terminator
    terminated: bool,
}

impl Translator<'_, '_> {
    fn instruction(&mut self, instruction: &Instruction) -> Result<(), JitError> {
        let opcode = instruction.opcode;
        match opcode {
            Opcode::Nop => {}
            Opcode::Rtrue => self.leave_block(self.return_true),
            Opcode::Rfalse => self.leave_block(self.return_false),
            Opcode::Ret => {
                let values = self.operands(instruction)?;
                let value = self.arg(opcode, &values, 0)?;
                self.leave(value);
            }
            Opcode::RetPopped => {
                let value = self.helper(HelperKind::Pop, &[])?;
                self.leave(value);
            }
            Opcode::Jump => self.jump(instruction)?,
            Opcode::Print | Opcode::PrintRet => {
                let words = instruction.text.as_deref().unwrap_or(&[]);
                let mut text = self.env.text.decode_words(self.env.memory, words)?;
                if opcode == Opcode::PrintRet {
                    text.push('\n');
                }
                self.print(text)?;
                if opcode == Opcode::PrintRet {
                    self.leave_block(self.return_true);
                }
            }
            Opcode::NewLine => self.print("\n".to_string())?,
            Opcode::Quit => {
                let func = self.require(HelperKind::Quit)?;
                let call = self.builder.ins().call(func, &[self.ctx]);
                let code = self.builder.inst_results(call)[0];
                self.builder.ins().jump(self.exit, &[BlockArg::Value(code)]);
                self.terminated = true;
            }
            Opcode::Pop => {
                self.helper(HelperKind::Pop, &[])?;
            }
            Opcode::Push => {
                let values = self.operands(instruction)?;
                let value = self.arg(opcode, &values, 0)?;
                self.helper(HelperKind::Push, &[value])?;
            }
            op if op.is_call() => self.call(instruction)?,
            Opcode::Pull if instruction.store.is_some() => self.pull_store(instruction)?,
            op if op.has_indirect_variable() => self.indirect(instruction)?,
            Opcode::Sread | Opcode::Aread => {
                let values = self.operands(instruction)?;
                let text = self.arg(opcode, &values, 0)?;
                let parse = match values.get(1) {
                    Some(&parse) => parse,
                    None => self.builder.ins().iconst(types::I64, 0),
                };
                let terminator = self.helper(HelperKind::ReadLine, &[text, parse])?;
                self.store_result(instruction, terminator)?;
            }
            Opcode::ReadChar => {
                self.operands(instruction)?;
                let code = self.helper(HelperKind::ReadChar, &[])?;
                self.store_result(instruction, code)?;
            }
            op if is_untranslated(op) => {
                let id = opcode_id(opcode, self.version).unwrap_or(-1);
                self.trap(TrapReason::NotImplemented, id)?;
                if opcode.is_terminal() {
                    self.terminated = true;
                }
            }
            _ => self.data(instruction)?,
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data opcodes
    // ------------------------------------------------------------------

    fn data(&mut self, instruction: &Instruction) -> Result<(), JitError> {
        let opcode = instruction.opcode;
        let values = self.operands(instruction)?;
        match (opcode, values.len()) {
            (Opcode::Add | Opcode::Sub | Opcode::Mul, 2) => {
                let (a, b) = (values[0], values[1]);
                let raw = match opcode {
                    Opcode::Add => self.builder.ins().iadd(a, b),
                    Opcode::Sub => self.builder.ins().isub(a, b),
                    _ => self.builder.ins().imul(a, b),
                };
                let value = self.builder.ins().band_imm(raw, WORD_MASK);
                self.store_result(instruction, value)
            }
            (Opcode::Div | Opcode::Mod, 2) => {
                let value = self.divide(opcode, values[0], values[1])?;
                self.store_result(instruction, value)
            }
            (Opcode::And, 2) => {
                let value = self.builder.ins().band(values[0], values[1]);
                self.store_result(instruction, value)
            }
            (Opcode::Or, 2) => {
                let value = self.builder.ins().bor(values[0], values[1]);
                self.store_result(instruction, value)
            }
            (Opcode::Not, 1) => {
                let value = self.builder.ins().bxor_imm(values[0], WORD_MASK);
                self.store_result(instruction, value)
            }
            (Opcode::Je, count) if count >= 2 => {
                let first = values[0];
                let mut test = self.builder.ins().icmp(IntCC::Equal, first, values[1]);
                for &other in &values[2..] {
                    let equal = self.builder.ins().icmp(IntCC::Equal, first, other);
                    test = self.builder.ins().bor(test, equal);
                }
                self.branch(instruction, test)
            }
            (Opcode::Jl | Opcode::Jg, 2) => {
                let a = self.signed(values[0]);
                let b = self.signed(values[1]);
                let cc = if opcode == Opcode::Jl {
                    IntCC::SignedLessThan
                } else {
                    IntCC::SignedGreaterThan
                };
                let test = self.builder.ins().icmp(cc, a, b);
                self.branch(instruction, test)
            }
            (Opcode::Jz, 1) => {
                let test = self.builder.ins().icmp_imm(IntCC::Equal, values[0], 0);
                self.branch(instruction, test)
            }
            (Opcode::Test, 2) => {
                let masked = self.builder.ins().band(values[0], values[1]);
                let test = self.builder.ins().icmp(IntCC::Equal, masked, values[1]);
                self.branch(instruction, test)
            }
            (Opcode::Loadw | Opcode::Loadb, 2) => {
                let kind = if opcode == Opcode::Loadw {
                    HelperKind::LoadWord
                } else {
                    HelperKind::LoadByte
                };
                let value = self.helper(kind, &[values[0], values[1]])?;
                self.store_result(instruction, value)
            }
            (Opcode::Storew | Opcode::Storeb, 3) => {
                let kind = if opcode == Opcode::Storew {
                    HelperKind::StoreWord
                } else {
                    HelperKind::StoreByte
                };
                self.helper(kind, &values)?;
                Ok(())
            }
            _ => self.perform(instruction, &values),
        }
    }

    /// Everything without an inline lowering goes through the shared
    /// opcode implementation.
    fn perform(&mut self, instruction: &Instruction, values: &[Value]) -> Result<(), JitError> {
        let opcode = instruction.opcode;
        let id = opcode_id(opcode, self.version).unwrap_or(-1);
        let id = self.builder.ins().iconst(types::I64, id);
        let (argc, argv) = self.stage(values);
        let outcome = self.helper(HelperKind::Perform, &[id, argc, argv])?;
        if instruction.store.is_some() {
            let value = self.builder.ins().band_imm(outcome, WORD_MASK);
            self.store_result(instruction, value)?;
        }
        if instruction.branch.is_some() {
            let bit = self.builder.ins().band_imm(outcome, OUTCOME_TEST_BIT);
            let test = self.builder.ins().icmp_imm(IntCC::NotEqual, bit, 0);
            self.branch(instruction, test)?;
        }
        Ok(())
    }

    fn divide(
        &mut self,
        opcode: Opcode,
        dividend: Value,
        divisor: Value,
    ) -> Result<Value, JitError> {
        let trap_block = self.builder.create_block();
        let ok_block = self.builder.create_block();
        let zero = self.builder.ins().icmp_imm(IntCC::Equal, divisor, 0);
        self.builder
            .ins()
            .brif(zero, trap_block, &[], ok_block, &[]);

        self.builder.switch_to_block(trap_block);
        self.emit_trap(TrapReason::DivisionByZero, 0)?;

        self.builder.switch_to_block(ok_block);
        let a = self.signed(dividend);
        let b = self.signed(divisor);
        let raw = if opcode == Opcode::Div {
            self.builder.ins().sdiv(a, b)
        } else {
            self.builder.ins().srem(a, b)
        };
        Ok(self.builder.ins().band_imm(raw, WORD_MASK))
    }

    // ------------------------------------------------------------------
    // Indirect variables
    // ------------------------------------------------------------------

    fn indirect(&mut self, instruction: &Instruction) -> Result<(), JitError> {
        let opcode = instruction.opcode;
        let values = self.operands(instruction)?;
        let named = self.arg(opcode, &values, 0)?;
        let target = match instruction.operands[0].constant() {
            Some(number) => Target::Direct(Variable::from_byte(number as u8)),
            None => Target::Computed(named),
        };
        match opcode {
            Opcode::Inc | Opcode::Dec => {
                let delta = if opcode == Opcode::Inc { 1 } else { -1 };
                let current = self.peek(target)?;
                let stepped = self.builder.ins().iadd_imm(current, delta);
                let value = self.builder.ins().band_imm(stepped, WORD_MASK);
                self.replace(target, value)
            }
            Opcode::IncChk | Opcode::DecChk => {
                let limit = self.arg(opcode, &values, 1)?;
                let delta = if opcode == Opcode::IncChk { 1 } else { -1 };
                let current = self.peek(target)?;
                let stepped = self.builder.ins().iadd_imm(current, delta);
                let value = self.builder.ins().band_imm(stepped, WORD_MASK);
                self.replace(target, value)?;
                let a = self.signed(value);
                let b = self.signed(limit);
                let cc = if opcode == Opcode::IncChk {
                    IntCC::SignedGreaterThan
                } else {
                    IntCC::SignedLessThan
                };
                let test = self.builder.ins().icmp(cc, a, b);
                self.branch(instruction, test)
            }
            Opcode::Store => {
                let value = self.arg(opcode, &values, 1)?;
                self.replace(target, value)
            }
            Opcode::Pull => {
                let value = self.helper(HelperKind::Pop, &[])?;
                self.replace(target, value)
            }
            _ => {
                let value = self.peek(target)?;
                self.store_result(instruction, value)
            }
        }
    }

    /// v6 `pull` with a store: from the evaluation stack, or from a user
    /// stack table whose first word counts free slots.
    fn pull_store(&mut self, instruction: &Instruction) -> Result<(), JitError> {
        let values = self.operands(instruction)?;
        let value = match values.first() {
            None => self.helper(HelperKind::Pop, &[])?,
            Some(&table) => {
                let zero = self.builder.ins().iconst(types::I64, 0);
                let free = self.helper(HelperKind::LoadWord, &[table, zero])?;
                let free = self.builder.ins().iadd_imm(free, 1);
                let free = self.builder.ins().band_imm(free, WORD_MASK);
                let value = self.helper(HelperKind::LoadWord, &[table, free])?;
                self.helper(HelperKind::StoreWord, &[table, zero, free])?;
                value
            }
        };
        self.store_result(instruction, value)
    }

    fn peek(&mut self, target: Target) -> Result<Value, JitError> {
        match target {
            Target::Direct(Variable::Stack) => self.helper(HelperKind::Peek, &[]),
            Target::Direct(variable) => self.read(variable),
            Target::Computed(number) => {
                self.stats.calculated_loads += 1;
                let (locals, count) = self.locals_view();
                self.helper(HelperKind::ReadVariable, &[locals, count, number])
            }
        }
    }

    fn replace(&mut self, target: Target, value: Value) -> Result<(), JitError> {
        match target {
            Target::Direct(Variable::Stack) => {
                self.helper(HelperKind::ReplaceTop, &[value])?;
                Ok(())
            }
            Target::Direct(variable) => self.write(variable, value),
            Target::Computed(number) => {
                self.stats.calculated_stores += 1;
                let (locals, count) = self.locals_view();
                self.helper(HelperKind::WriteVariable, &[locals, count, number, value])?;
                Ok(())
            }
        }
    }

    fn locals_view(&mut self) -> (Value, Value) {
        let locals = self.builder.ins().stack_addr(types::I64, self.locals, 0);
        let count = self
            .builder
            .ins()
            .iconst(types::I64, i64::from(self.local_count));
        (locals, count)
    }

    // ------------------------------------------------------------------
    // Calls and control flow
    // ------------------------------------------------------------------

    fn call(&mut self, instruction: &Instruction) -> Result<(), JitError> {
        let opcode = instruction.opcode;
        let values = self.operands(instruction)?;
        let callee = self.arg(opcode, &values, 0)?;
        let args = &values[1..];
        let result = match instruction.operands[0].constant() {
            Some(0) => self.builder.ins().iconst(types::I64, 0),
            Some(packed) => {
                let address = self.env.header.unpack_routine_address(packed);
                let address = self.builder.ins().iconst(types::I64, i64::from(address));
                let (argc, argv) = self.stage(args);
                self.helper(HelperKind::CallDirect, &[address, argc, argv])?
            }
            None => {
                let (argc, argv) = self.stage(args);
                self.helper(HelperKind::CallPacked, &[callee, argc, argv])?
            }
        };
        self.store_result(instruction, result)
    }

    fn jump(&mut self, instruction: &Instruction) -> Result<(), JitError> {
        match instruction.jump_target() {
            Some(target) => {
                let block = self.block_for(target)?;
                self.builder.ins().jump(block, &[]);
            }
            None => {
                // Computed jump offsets are rare enough to leave to the interpreter.
                let id = opcode_id(Opcode::Jump, self.version).unwrap_or(-1);
                self.trap(TrapReason::NotImplemented, id)?;
                let zero = self.builder.ins().iconst(types::I64, 0);
                self.builder.ins().jump(self.exit, &[BlockArg::Value(zero)]);
            }
        }
        self.terminated = true;
        Ok(())
    }

    fn branch(&mut self, instruction: &Instruction, test: Value) -> Result<(), JitError> {
        let Some(branch) = instruction.branch else {
            return Ok(());
        };
        let taken = match branch.target {
            BranchTarget::ReturnFalse => self.return_false,
            BranchTarget::ReturnTrue => self.return_true,
            BranchTarget::Address(target) => self.block_for(target)?,
        };
        let fallthrough = self.block_for(instruction.next_address())?;
        if branch.condition {
            self.builder.ins().brif(test, taken, &[], fallthrough, &[]);
        } else {
            self.builder.ins().brif(test, fallthrough, &[], taken, &[]);
        }
        self.terminated = true;
        Ok(())
    }

    fn block_for(&self, target: u32) -> Result<Block, JitError> {
        self.cfg
            .block_index(target)
            .map(|index| self.blocks[index])
            .ok_or(JitError::InvalidJumpTarget {
                address: self.address,
                target,
            })
    }

    fn leave(&mut self, value: Value) {
        self.builder.ins().return_(&[value]);
        self.terminated = true;
    }

    fn leave_block(&mut self, block: Block) {
        self.builder.ins().jump(block, &[]);
        self.terminated = true;
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    fn operands(&mut self, instruction: &Instruction) -> Result<SmallVec<[Value; 8]>, JitError> {
        let mut values = SmallVec::new();
        for operand in &instruction.operands {
            values.push(self.operand(*operand)?);
        }
        Ok(values)
    }

    fn operand(&mut self, operand: Operand) -> Result<Value, JitError> {
        match operand {
            Operand::LargeConstant(value) => {
                Ok(self.builder.ins().iconst(types::I64, i64::from(value)))
            }
            Operand::SmallConstant(value) => {
                Ok(self.builder.ins().iconst(types::I64, i64::from(value)))
            }
            Operand::Variable(variable) => self.read(variable),
        }
    }

    fn arg(&self, opcode: Opcode, values: &[Value], index: usize) -> Result<Value, JitError> {
        values
            .get(index)
            .copied()
            .ok_or(JitError::Vm(VmError::MissingOperand { opcode, index }))
    }

    /// Read a variable; the stack variable pops.
    fn read(&mut self, variable: Variable) -> Result<Value, JitError> {
        match variable {
            Variable::Stack => self.helper(HelperKind::Pop, &[]),
            Variable::Local(index) => {
                if self.check_local(index)? {
                    Ok(self
                        .builder
                        .ins()
                        .stack_load(types::I64, self.locals, i32::from(index) * 8))
                } else {
                    Ok(self.builder.ins().iconst(types::I64, 0))
                }
            }
            Variable::Global(index) => {
                let index = self.builder.ins().iconst(types::I64, i64::from(index));
                self.helper(HelperKind::ReadGlobal, &[index])
            }
        }
    }

    /// Write a variable; the stack variable pushes.
    fn write(&mut self, variable: Variable, value: Value) -> Result<(), JitError> {
        match variable {
            Variable::Stack => {
                self.helper(HelperKind::Push, &[value])?;
            }
            Variable::Local(index) => {
                if self.check_local(index)? {
                    self.builder
                        .ins()
                        .stack_store(value, self.locals, i32::from(index) * 8);
                }
            }
            Variable::Global(index) => {
                let index = self.builder.ins().iconst(types::I64, i64::from(index));
                self.helper(HelperKind::WriteGlobal, &[index, value])?;
            }
        }
        Ok(())
    }

    /// Emits a trap for locals the routine does not declare.
    fn check_local(&mut self, index: u8) -> Result<bool, JitError> {
        if index < self.local_count {
            return Ok(true);
        }
        let detail = i64::from(index) << 8 | i64::from(self.local_count);
        self.trap(TrapReason::InvalidLocal, detail)?;
        Ok(false)
    }

    fn store_result(&mut self, instruction: &Instruction, value: Value) -> Result<(), JitError> {
        match instruction.store {
            Some(variable) => self.write(variable, value),
            None => Ok(()),
        }
    }

    fn signed(&mut self, value: Value) -> Value {
        let narrow = self.builder.ins().ireduce(types::I16, value);
        self.builder.ins().sextend(types::I64, narrow)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn require(&self, kind: HelperKind) -> Result<cranelift_codegen::ir::FuncRef, JitError> {
        match self.helpers {
            Some(helpers) => helpers.require(kind, self.address),
            None => Err(JitError::MissingHelper {
                address: self.address,
                helper: kind.symbol_name(),
            }),
        }
    }

    /// Call a helper and leave the routine if it returned a sentinel.
    fn helper(&mut self, kind: HelperKind, args: &[Value]) -> Result<Value, JitError> {
        let func = self.require(kind)?;
        let mut call_args: SmallVec<[Value; 6]> = SmallVec::new();
        call_args.push(self.ctx);
        call_args.extend_from_slice(args);
        let call = self.builder.ins().call(func, &call_args);
        let result = self.builder.inst_results(call)[0];

        let continue_block = self.builder.create_block();
        let failed = self.builder.ins().icmp_imm(IntCC::SignedLessThan, result, 0);
        self.builder.ins().brif(
            failed,
            self.exit,
            &[BlockArg::Value(result)],
            continue_block,
            &[],
        );
        self.builder.switch_to_block(continue_block);
        Ok(result)
    }

    /// Stage operands in the scratch slot; returns `(argc, argv)`.
    fn stage(&mut self, values: &[Value]) -> (Value, Value) {
        for (index, &value) in values.iter().take(SCRATCH_WORDS as usize).enumerate() {
            self.builder
                .ins()
                .stack_store(value, self.scratch, (index * 8) as i32);
        }
        let count = values.len().min(SCRATCH_WORDS as usize) as i64;
        let argc = self.builder.ins().iconst(types::I64, count);
        let argv = self.builder.ins().stack_addr(types::I64, self.scratch, 0);
        (argc, argv)
    }

    fn print(&mut self, text: String) -> Result<(), JitError> {
        let id = match self.literals.iter().position(|existing| *existing == text) {
            Some(id) => id,
            None => {
                self.literals.push(text);
                self.literals.len() - 1
            }
        };
        let id = self.builder.ins().iconst(types::I64, id as i64);
        self.helper(HelperKind::PrintLiteral, &[id])?;
        Ok(())
    }

    /// Trap in the current block, then continue in an unreachable block.
    fn trap(&mut self, reason: TrapReason, detail: i64) -> Result<(), JitError> {
        self.emit_trap(reason, detail)?;
        let dead = self.builder.create_block();
        self.builder.switch_to_block(dead);
        Ok(())
    }

    /// Call the trap helper and leave with its sentinel.
    fn emit_trap(&mut self, reason: TrapReason, detail: i64) -> Result<(), JitError> {
        let func = self.require(HelperKind::Trap)?;
        let reason = self.builder.ins().iconst(types::I64, reason as i64);
        let detail = self.builder.ins().iconst(types::I64, detail);
        let call = self.builder.ins().call(func, &[self.ctx, reason, detail]);
        let code = self.builder.inst_results(call)[0];
        self.builder.ins().jump(self.exit, &[BlockArg::Value(code)]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_vm_bytecode::assembler::{global, large, local, small, sp};
    use quill_vm_bytecode::{Assembler, Decoder, Header, Memory};

    fn routine_of(build: impl FnOnce(&mut Assembler)) -> Routine {
        let mut asm = Assembler::new(5);
        let address = asm.routine(&[0, 0]);
        build(&mut asm);
        let memory = Memory::new(asm.finish().unwrap());
        let header = Header::read(&memory).unwrap();
        let mut decoder = Decoder::new(header.version);
        Routine::read(&memory, &mut decoder, address).unwrap()
    }

    #[test]
    fn pure_local_arithmetic_needs_only_core_helpers() {
        let routine = routine_of(|asm| {
            asm.op(Opcode::Add, &[local(0), small(1)])
                .store(Variable::Local(1));
            asm.op(Opcode::Ret, &[local(1)]);
        });
        assert_eq!(Requirements::scan(&routine), Requirements::default());
    }

    #[test]
    fn scan_finds_stack_memory_screen_and_streams() {
        let routine = routine_of(|asm| {
            asm.op(Opcode::Push, &[small(1)]);
            asm.op(Opcode::Add, &[global(3), sp()])
                .store(Variable::Local(0));
            asm.op(Opcode::OutputStream, &[small(3), large(0x400)]);
            asm.op(Opcode::NewLine, &[]);
            asm.op(Opcode::Rtrue, &[]);
        });
        let needs = Requirements::scan(&routine);
        assert!(needs.stack && needs.memory && needs.screen && needs.streams);
        assert!(needs.wants(HelperGroup::Core));
    }

    #[test]
    fn indirect_constant_operand_names_the_variable() {
        let routine = routine_of(|asm| {
            asm.op(Opcode::Inc, &[small(0x10)]);
            asm.op(Opcode::Rtrue, &[]);
        });
        let needs = Requirements::scan(&routine);
        assert!(needs.memory);
        assert!(!needs.stack);
        assert_eq!(needs.untranslated, None);
    }

    #[test]
    fn scan_reports_untranslated_opcodes() {
        let routine = routine_of(|asm| {
            asm.op(Opcode::Catch, &[]).store(Variable::Local(0));
            asm.op(Opcode::Restart, &[]);
        });
        let needs = Requirements::scan(&routine);
        assert_eq!(needs.untranslated, Some(Opcode::Catch));
        assert!(is_untranslated(Opcode::Throw));
        assert!(!is_untranslated(Opcode::Add));
    }
}
