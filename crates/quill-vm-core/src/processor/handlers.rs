//! Opcode semantics
//!
//! [`Processor::execute`] handles control flow (calls, returns, jumps,
//! indirect variables, input) itself and hands every other opcode to
//! [`Processor::perform`], which works on already-resolved operand values.
//! Compiled code calls `perform` for the same opcodes, so both strategies
//! share one definition of them.

use quill_vm_bytecode::header::HEADER_SIZE;
use quill_vm_bytecode::instruction::relative_target;
use quill_vm_bytecode::{Instruction, Opcode, Variable};

use super::{InputRequest, Processor, ProcessorState};
use crate::dictionary::{self, Dictionary};
use crate::error::{VmError, VmResult};
use crate::events::ExecutionEvent;
use crate::host::{Host, ScreenCommand};

/// Result of a data opcode, applied to the instruction's store and branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing to store or test
    Continue,
    /// Store this value
    Value(u16),
    /// Branch on this result
    Test(bool),
    /// Store the value, then branch on the result
    ValueTest(u16, bool),
}

#[inline]
fn arg(opcode: Opcode, args: &[u16], index: usize) -> VmResult<u16> {
    args.get(index)
        .copied()
        .ok_or(VmError::MissingOperand { opcode, index })
}

#[inline]
fn signed(value: u16) -> i16 {
    value as i16
}

impl Processor {
    /// Execute a decoded instruction whose operands have not been read yet.
    /// The program counter already points past it.
    pub(super) fn execute(&mut self, host: &mut dyn Host, instruction: &Instruction) -> VmResult<()> {
        let opcode = instruction.opcode;
        match opcode {
            Opcode::Inc
            | Opcode::Dec
            | Opcode::IncChk
            | Opcode::DecChk
            | Opcode::Store
            | Opcode::Load => self.execute_indirect(instruction),
            Opcode::Pull => self.execute_pull(instruction),

            Opcode::CallVS
            | Opcode::CallVN
            | Opcode::CallVS2
            | Opcode::CallVN2
            | Opcode::Call1S
            | Opcode::Call1N
            | Opcode::Call2S
            | Opcode::Call2N => {
                let args = self.operand_values(instruction)?;
                let packed = arg(opcode, &args, 0)?;
                self.call_packed(
                    packed,
                    &args[1..],
                    instruction.store,
                    instruction.next_address(),
                )
            }

            Opcode::Rtrue => self.return_from(1),
            Opcode::Rfalse => self.return_from(0),
            Opcode::Ret => {
                let args = self.operand_values(instruction)?;
                self.return_from(arg(opcode, &args, 0)?)
            }
            Opcode::RetPopped => {
                let value = self.stack.pop()?;
                self.return_from(value)
            }
            Opcode::Jump => {
                let args = self.operand_values(instruction)?;
                let offset = signed(arg(opcode, &args, 0)?);
                self.pc = relative_target(instruction.next_address(), offset);
                Ok(())
            }
            Opcode::Print => self.print_embedded(host, instruction),
            Opcode::PrintRet => {
                self.print_embedded(host, instruction)?;
                self.print_str(host, "\n")?;
                self.return_from(1)
            }
            Opcode::Quit => {
                self.quit();
                Ok(())
            }
            Opcode::Restart => self.restart(),
            Opcode::Pop => self.stack.pop().map(drop),
            Opcode::Catch => {
                let token = self.stack.depth() as u16;
                self.apply(instruction, Outcome::Value(token))
            }
            Opcode::Throw => {
                let args = self.operand_values(instruction)?;
                self.throw(arg(opcode, &args, 0)?, arg(opcode, &args, 1)?)
            }
            Opcode::Sread | Opcode::Aread => self.read_line(host, instruction),
            Opcode::ReadChar => self.read_char(host, instruction),
            Opcode::Unknown(..) => Err(VmError::UnknownOpcode(opcode)),
            _ => {
                let args = self.operand_values(instruction)?;
                let outcome = self.perform(host, opcode, &args)?;
                self.apply(instruction, outcome)
            }
        }
    }

    /// Write the store target and take the branch an outcome asks for.
    fn apply(&mut self, instruction: &Instruction, outcome: Outcome) -> VmResult<()> {
        let (value, test) = match outcome {
            Outcome::Continue => (None, None),
            Outcome::Value(value) => (Some(value), None),
            Outcome::Test(test) => (None, Some(test)),
            Outcome::ValueTest(value, test) => (Some(value), Some(test)),
        };
        if let (Some(value), Some(store)) = (value, instruction.store) {
            self.write_variable(store, value)?;
        }
        if let Some(test) = test {
            self.branch(instruction, test)?;
        }
        Ok(())
    }

    fn print_embedded(&mut self, host: &mut dyn Host, instruction: &Instruction) -> VmResult<()> {
        match &instruction.text {
            Some(words) => self.print_words(host, words),
            None => Ok(()),
        }
    }

    /// Opcodes whose first operand names a variable. The stack variable is
    /// read and written in place.
    fn execute_indirect(&mut self, instruction: &Instruction) -> VmResult<()> {
        let opcode = instruction.opcode;
        let args = self.operand_values(instruction)?;
        let variable = Variable::from_byte(arg(opcode, &args, 0)? as u8);
        match opcode {
            Opcode::Inc | Opcode::Dec => {
                let delta: i16 = if opcode == Opcode::Inc { 1 } else { -1 };
                let value = signed(self.peek_variable(variable)?).wrapping_add(delta);
                self.replace_variable(variable, value as u16)
            }
            Opcode::IncChk | Opcode::DecChk => {
                let limit = signed(arg(opcode, &args, 1)?);
                let current = signed(self.peek_variable(variable)?);
                let (value, result) = if opcode == Opcode::IncChk {
                    let value = current.wrapping_add(1);
                    (value, value > limit)
                } else {
                    let value = current.wrapping_sub(1);
                    (value, value < limit)
                };
                self.replace_variable(variable, value as u16)?;
                self.branch(instruction, result)
            }
            Opcode::Store => self.replace_variable(variable, arg(opcode, &args, 1)?),
            _ => {
                let value = self.peek_variable(variable)?;
                self.apply(instruction, Outcome::Value(value))
            }
        }
    }

    /// `pull`: v1-5 name a variable; v6 stores, optionally from a user stack.
    fn execute_pull(&mut self, instruction: &Instruction) -> VmResult<()> {
        let args = self.operand_values(instruction)?;
        match instruction.store {
            Some(store) => {
                let value = match args.first() {
                    Some(&table) => self.pull_user_stack(table as u32)?,
                    None => self.stack.pop()?,
                };
                self.write_variable(store, value)
            }
            None => {
                let variable = Variable::from_byte(arg(Opcode::Pull, &args, 0)? as u8);
                let value = self.stack.pop()?;
                self.replace_variable(variable, value)
            }
        }
    }

    fn pull_user_stack(&mut self, table: u32) -> VmResult<u16> {
        let free = self.memory.read_word(table as usize)?.wrapping_add(1);
        let value = self.memory.read_word(table as usize + free as usize * 2)?;
        self.store_word(table, free)?;
        Ok(value)
    }

    fn throw(&mut self, value: u16, token: u16) -> VmResult<()> {
        let target = token as usize;
        if target == 0 || target > self.stack.depth() {
            return Err(VmError::InvalidThrow(token));
        }
        while self.stack.depth() > target {
            let frame = self.stack.pop_frame()?;
            self.events.emit(ExecutionEvent::FrameExited {
                address: frame.address,
                return_address: frame.return_address,
            });
        }
        self.return_from(value)
    }

    fn read_line(&mut self, host: &mut dyn Host, instruction: &Instruction) -> VmResult<()> {
        let opcode = instruction.opcode;
        let args = self.operand_values(instruction)?;
        let text_buffer = arg(opcode, &args, 0)? as u32;
        let parse_buffer = args.get(1).copied().unwrap_or(0) as u32;
        if self.header.version <= 3 {
            let status = self.status_line()?;
            host.show_status(&status);
        }
        let request = InputRequest::Line {
            text_buffer,
            parse_buffer,
            store: instruction.store,
        };
        match host.read_line(self.line_capacity(text_buffer)?) {
            Some(line) => {
                let terminator = self.finish_line_input(text_buffer, parse_buffer, &line)?;
                self.apply(instruction, Outcome::Value(terminator))
            }
            None => self.suspend(request),
        }
    }

    fn read_char(&mut self, host: &mut dyn Host, instruction: &Instruction) -> VmResult<()> {
        self.operand_values(instruction)?;
        match host.read_char() {
            Some(ch) => {
                let code = self.finish_char_input(ch);
                self.apply(instruction, Outcome::Value(code))
            }
            None => self.suspend(InputRequest::Char {
                store: instruction.store,
            }),
        }
    }

    fn suspend(&mut self, request: InputRequest) -> VmResult<()> {
        if self.nested > 0 {
            return Err(VmError::InputUnavailable);
        }
        tracing::trace!(?request, "awaiting input");
        self.state = ProcessorState::AwaitingInput(request);
        Ok(())
    }

    /// Execute a data opcode on resolved operand values.
    pub fn perform(&mut self, host: &mut dyn Host, opcode: Opcode, args: &[u16]) -> VmResult<Outcome> {
        let a = |index| arg(opcode, args, index);
        let outcome = match opcode {
            // ---- comparison and arithmetic -------------------------------
            Opcode::Je => {
                let first = a(0)?;
                Outcome::Test(args.iter().skip(1).any(|&other| other == first))
            }
            Opcode::Jl => Outcome::Test(signed(a(0)?) < signed(a(1)?)),
            Opcode::Jg => Outcome::Test(signed(a(0)?) > signed(a(1)?)),
            Opcode::Jz => Outcome::Test(a(0)? == 0),
            Opcode::Test => {
                let flags = a(1)?;
                Outcome::Test(a(0)? & flags == flags)
            }
            Opcode::Or => Outcome::Value(a(0)? | a(1)?),
            Opcode::And => Outcome::Value(a(0)? & a(1)?),
            Opcode::Not => Outcome::Value(!a(0)?),
            Opcode::Add => Outcome::Value(signed(a(0)?).wrapping_add(signed(a(1)?)) as u16),
            Opcode::Sub => Outcome::Value(signed(a(0)?).wrapping_sub(signed(a(1)?)) as u16),
            Opcode::Mul => Outcome::Value(signed(a(0)?).wrapping_mul(signed(a(1)?)) as u16),
            Opcode::Div | Opcode::Mod => {
                let divisor = signed(a(1)?);
                if divisor == 0 {
                    return Err(VmError::DivisionByZero);
                }
                let dividend = signed(a(0)?);
                let value = if opcode == Opcode::Div {
                    dividend.wrapping_div(divisor)
                } else {
                    dividend.wrapping_rem(divisor)
                };
                Outcome::Value(value as u16)
            }
            Opcode::LogShift => {
                let value = a(0)?;
                let places = signed(a(1)?);
                Outcome::Value(match places {
                    0..=15 => value << places,
                    -15..=-1 => value >> -places,
                    _ => 0,
                })
            }
            Opcode::ArtShift => {
                let value = signed(a(0)?);
                let places = signed(a(1)?);
                Outcome::Value(match places {
                    0..=15 => (value << places) as u16,
                    -15..=-1 => (value >> -places) as u16,
                    _ if value < 0 && places < 0 => 0xffff,
                    _ => 0,
                })
            }

            // ---- objects -------------------------------------------------
            Opcode::Jin => {
                let parent = self.objects.parent(&self.memory, a(0)?)?;
                Outcome::Test(parent == a(1)?)
            }
            Opcode::TestAttr => {
                Outcome::Test(self.objects.attribute(&self.memory, a(0)?, a(1)?)?)
            }
            Opcode::SetAttr | Opcode::ClearAttr => {
                let value = opcode == Opcode::SetAttr;
                self.objects
                    .set_attribute(&mut self.memory, a(0)?, a(1)?, value)?;
                Outcome::Continue
            }
            Opcode::InsertObj => {
                self.objects.insert(&mut self.memory, a(0)?, a(1)?)?;
                Outcome::Continue
            }
            Opcode::RemoveObj => {
                self.objects.remove(&mut self.memory, a(0)?)?;
                Outcome::Continue
            }
            Opcode::GetSibling => {
                let sibling = self.objects.sibling(&self.memory, a(0)?)?;
                Outcome::ValueTest(sibling, sibling != 0)
            }
            Opcode::GetChild => {
                let child = self.objects.child(&self.memory, a(0)?)?;
                Outcome::ValueTest(child, child != 0)
            }
            Opcode::GetParent => Outcome::Value(self.objects.parent(&self.memory, a(0)?)?),
            Opcode::GetProp => Outcome::Value(self.objects.property(&self.memory, a(0)?, a(1)?)?),
            Opcode::GetPropAddr => {
                let address = self.objects.property_address(&self.memory, a(0)?, a(1)?)?;
                Outcome::Value(address as u16)
            }
            Opcode::GetNextProp => {
                Outcome::Value(self.objects.next_property(&self.memory, a(0)?, a(1)?)?)
            }
            Opcode::GetPropLen => {
                Outcome::Value(self.objects.property_length(&self.memory, a(0)? as u32)?)
            }
            Opcode::PutProp => {
                self.objects
                    .set_property(&mut self.memory, a(0)?, a(1)?, a(2)?)?;
                Outcome::Continue
            }

            // ---- memory and stack ----------------------------------------
            Opcode::Loadw => {
                let address = a(0)?.wrapping_add(a(1)?.wrapping_mul(2));
                Outcome::Value(self.memory.read_word(address as usize)?)
            }
            Opcode::Loadb => {
                let address = a(0)?.wrapping_add(a(1)?);
                Outcome::Value(self.memory.read_byte(address as usize)? as u16)
            }
            Opcode::Storew => {
                let address = a(0)?.wrapping_add(a(1)?.wrapping_mul(2));
                self.store_word(address as u32, a(2)?)?;
                Outcome::Continue
            }
            Opcode::Storeb => {
                let address = a(0)?.wrapping_add(a(1)?);
                self.store_byte(address as u32, a(2)? as u8)?;
                Outcome::Continue
            }
            Opcode::Push => {
                self.stack.push(a(0)?)?;
                Outcome::Continue
            }
            Opcode::ScanTable => self.scan_table(a(0)?, a(1)?, a(2)?, args.get(3).copied())?,
            Opcode::CopyTable => {
                self.copy_table(a(0)?, a(1)?, signed(a(2)?))?;
                Outcome::Continue
            }
            Opcode::CheckArgCount => {
                let supplied = self.stack.current()?.argument_count() as u16;
                Outcome::Test(a(0)? <= supplied)
            }
            Opcode::Random => {
                let range = signed(a(0)?);
                if range > 0 {
                    Outcome::Value(self.random.next_in(range as u16))
                } else {
                    self.random.reseed(range);
                    Outcome::Value(0)
                }
            }

            // ---- text ----------------------------------------------------
            Opcode::NewLine => {
                self.print_str(host, "\n")?;
                Outcome::Continue
            }
            Opcode::PrintChar => {
                if let Some(ch) = self.text.zscii_to_char(a(0)?) {
                    let mut buffer = [0u8; 4];
                    self.print_str(host, ch.encode_utf8(&mut buffer))?;
                }
                Outcome::Continue
            }
            Opcode::PrintUnicode => {
                let ch = char::from_u32(a(0)? as u32).unwrap_or('?');
                let mut buffer = [0u8; 4];
                self.print_str(host, ch.encode_utf8(&mut buffer))?;
                Outcome::Continue
            }
            Opcode::CheckUnicode => {
                let code = match char::from_u32(a(0)? as u32) {
                    Some(ch) if self.text.char_to_zscii(ch).is_some() => 3,
                    Some(ch) if !ch.is_control() => 1,
                    _ => 0,
                };
                Outcome::Value(code)
            }
            Opcode::PrintNum => {
                let text = signed(a(0)?).to_string();
                self.print_str(host, &text)?;
                Outcome::Continue
            }
            Opcode::PrintAddr => {
                self.print_zstring(host, a(0)? as u32)?;
                Outcome::Continue
            }
            Opcode::PrintPaddr => {
                let address = self.header.unpack_string_address(a(0)?);
                self.print_zstring(host, address)?;
                Outcome::Continue
            }
            Opcode::PrintObj => {
                let (address, _) = self.objects.short_name(&self.memory, a(0)?)?;
                self.print_zstring(host, address)?;
                Outcome::Continue
            }
            Opcode::PrintTable => {
                let height = args.get(2).copied().unwrap_or(1);
                let skip = args.get(3).copied().unwrap_or(0);
                self.print_table(host, a(0)?, a(1)?, height, skip)?;
                Outcome::Continue
            }
            Opcode::Tokenise => {
                let dictionary = match args.get(2).copied().unwrap_or(0) {
                    0 => self.header.dictionary as u32,
                    custom => custom as u32,
                };
                let skip_unknown = args.get(3).copied().unwrap_or(0) != 0;
                let dictionary = Dictionary::read(&self.memory, dictionary)?;
                dictionary::tokenise(
                    &mut self.memory,
                    &self.text,
                    &dictionary,
                    a(0)? as u32,
                    a(1)? as u32,
                    skip_unknown,
                )?;
                Outcome::Continue
            }
            Opcode::EncodeText => {
                let (text, length, from, coded) = (a(0)?, a(1)?, a(2)?, a(3)?);
                let start = text.wrapping_add(from) as usize;
                let letters = self.memory.read_bytes(start, length as usize)?.to_vec();
                let words = self.text.encode_word(&letters);
                for (index, word) in words.iter().enumerate() {
                    self.store_word(coded as u32 + index as u32 * 2, *word)?;
                }
                Outcome::Continue
            }

            // ---- streams and screen --------------------------------------
            Opcode::OutputStream => {
                let table = args.get(1).copied();
                self.streams
                    .select(&mut self.memory, signed(a(0)?), table)?;
                Outcome::Continue
            }
            Opcode::InputStream => {
                tracing::trace!(stream = a(0)?, "input stream selection ignored");
                Outcome::Continue
            }
            Opcode::ShowStatus => {
                if self.header.version <= 3 {
                    let status = self.status_line()?;
                    host.show_status(&status);
                }
                Outcome::Continue
            }
            Opcode::SplitWindow => self.screen(host, ScreenCommand::SplitWindow(a(0)?)),
            Opcode::SetWindow => self.screen(host, ScreenCommand::SetWindow(a(0)?)),
            Opcode::EraseWindow => self.screen(host, ScreenCommand::EraseWindow(signed(a(0)?))),
            Opcode::EraseLine => self.screen(host, ScreenCommand::EraseLine(a(0)?)),
            Opcode::SetCursor => self.screen(
                host,
                ScreenCommand::SetCursor {
                    line: signed(a(0)?),
                    column: args.get(1).copied().unwrap_or(1),
                },
            ),
            Opcode::GetCursor => {
                let (line, column) = host.cursor();
                let table = a(0)? as u32;
                self.store_word(table, line)?;
                self.store_word(table + 2, column)?;
                Outcome::Continue
            }
            Opcode::SetTextStyle => self.screen(host, ScreenCommand::SetTextStyle(a(0)?)),
            Opcode::BufferMode => self.screen(host, ScreenCommand::BufferMode(a(0)? != 0)),
            Opcode::SetColour => self.screen(
                host,
                ScreenCommand::SetColour {
                    foreground: a(0)?,
                    background: a(1)?,
                },
            ),
            Opcode::SetTrueColour => self.screen(
                host,
                ScreenCommand::SetTrueColour {
                    foreground: a(0)?,
                    background: a(1)?,
                },
            ),
            Opcode::SoundEffect => self.screen(
                host,
                ScreenCommand::SoundEffect {
                    number: args.first().copied().unwrap_or(1),
                    effect: args.get(1).copied().unwrap_or(0),
                    volume: args.get(2).copied().unwrap_or(0),
                },
            ),
            Opcode::SetFont => Outcome::Value(host.set_font(a(0)?)),
            Opcode::DrawPicture | Opcode::ErasePicture | Opcode::SetMargins => {
                tracing::trace!(%opcode, "picture opcode ignored");
                Outcome::Continue
            }
            Opcode::PictureData => Outcome::Test(false),

            // ---- story file ----------------------------------------------
            Opcode::Verify => Outcome::Test(self.verify()),
            Opcode::Piracy => Outcome::Test(true),
            Opcode::Nop => Outcome::Continue,
            Opcode::Save | Opcode::Restore => {
                if self.header.version <= 3 {
                    Outcome::Test(false)
                } else {
                    Outcome::Value(0)
                }
            }
            Opcode::SaveExt | Opcode::RestoreExt | Opcode::RestoreUndo => Outcome::Value(0),
            Opcode::SaveUndo => Outcome::Value(0xffff),

            other => return Err(VmError::UnknownOpcode(other)),
        };
        Ok(outcome)
    }

    fn screen(&mut self, host: &mut dyn Host, command: ScreenCommand) -> Outcome {
        host.screen(command);
        Outcome::Continue
    }

    fn scan_table(&self, value: u16, table: u16, length: u16, form: Option<u16>) -> VmResult<Outcome> {
        let form = form.unwrap_or(0x82);
        let words = form & 0x80 != 0;
        let stride = (form & 0x7f) as u32;
        for index in 0..length as u32 {
            let address = table as u32 + index * stride;
            let entry = if words {
                self.memory.read_word(address as usize)?
            } else {
                self.memory.read_byte(address as usize)? as u16
            };
            if entry == value {
                return Ok(Outcome::ValueTest(address as u16, true));
            }
        }
        Ok(Outcome::ValueTest(0, false))
    }

    fn copy_table(&mut self, first: u16, second: u16, size: i16) -> VmResult<()> {
        let len = size.unsigned_abs() as u32;
        let (first, second) = (first as u32, second as u32);
        if second == 0 {
            for offset in 0..len {
                self.store_byte(first + offset, 0)?;
            }
        } else if size < 0 || second <= first {
            for offset in 0..len {
                let byte = self.memory.read_byte((first + offset) as usize)?;
                self.store_byte(second + offset, byte)?;
            }
        } else {
            for offset in (0..len).rev() {
                let byte = self.memory.read_byte((first + offset) as usize)?;
                self.store_byte(second + offset, byte)?;
            }
        }
        Ok(())
    }

    fn print_table(
        &mut self,
        host: &mut dyn Host,
        table: u16,
        width: u16,
        height: u16,
        skip: u16,
    ) -> VmResult<()> {
        let mut address = table as u32;
        for row in 0..height {
            if row > 0 {
                self.print_str(host, "\n")?;
            }
            let bytes = self.memory.read_bytes(address as usize, width as usize)?;
            let line: String = bytes
                .iter()
                .filter_map(|&code| self.text.zscii_to_char(code as u16))
                .collect();
            self.print_str(host, &line)?;
            address += width as u32 + skip as u32;
        }
        Ok(())
    }

    /// Checksum of the loaded image from the end of the header to the
    /// declared file length.
    fn verify(&self) -> bool {
        let end = match self.header.file_length {
            0 => self.pristine.len(),
            length => length.min(self.pristine.len()),
        };
        let sum = self
            .pristine
            .get(HEADER_SIZE..end)
            .unwrap_or_default()
            .iter()
            .fold(0u16, |sum, &byte| sum.wrapping_add(byte as u16));
        sum == self.header.checksum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelObserver;
    use crate::host::BufferedHost;
    use crate::processor::ProcessorOptions;
    use quill_vm_bytecode::assembler::{global, large, local, small, sp};
    use quill_vm_bytecode::header::offsets;
    use proptest::prelude::*;
    use quill_vm_bytecode::{Assembler, ObjectEntry};
    use std::sync::mpsc;

    fn options() -> ProcessorOptions {
        ProcessorOptions {
            random_seed: Some(7),
            ..ProcessorOptions::default()
        }
    }

    /// Assemble a story whose main routine is built by `body`.
    fn story(version: u8, body: impl FnOnce(&mut Assembler)) -> Processor {
        let mut asm = Assembler::new(version);
        asm.globals(&[]);
        let main = asm.routine(&[]);
        asm.set_main(main);
        body(&mut asm);
        Processor::new(asm.finish().unwrap(), options()).unwrap()
    }

    fn run(processor: &mut Processor, host: &mut BufferedHost) {
        processor.run_batch(host, 10_000).unwrap();
    }

    #[test]
    fn arithmetic_wraps_and_stores() {
        let mut processor = story(3, |asm| {
            asm.op(Opcode::Add, &[large(0x7fff), small(1)]).store(Variable::Global(0));
            asm.op(Opcode::Div, &[large(0xfff9), small(2)]).store(Variable::Global(1));
            asm.op(Opcode::Mod, &[large(0xfff9), small(2)]).store(Variable::Global(2));
            asm.op(Opcode::Mul, &[large(300), large(300)]).store(Variable::Global(3));
            asm.op(Opcode::Quit, &[]);
        });
        run(&mut processor, &mut BufferedHost::new());
        assert_eq!(processor.read_global(0).unwrap(), 0x8000);
        assert_eq!(processor.read_global(1).unwrap() as i16, -3);
        assert_eq!(processor.read_global(2).unwrap() as i16, -1);
        assert_eq!(processor.read_global(3).unwrap(), (90000u32 & 0xffff) as u16);
        assert_eq!(processor.state(), ProcessorState::Quit);
    }

    #[test]
    fn division_by_zero_reports_the_instruction() {
        let mut processor = story(3, |asm| {
            asm.op(Opcode::Div, &[small(1), small(0)]).store(Variable::Stack);
        });
        let pc = processor.pc();
        let error = processor.step(&mut BufferedHost::new()).unwrap_err();
        assert_eq!(error.address(), Some(pc));
        assert_eq!(error.root(), &VmError::DivisionByZero);
    }

    #[test]
    fn first_step_fires_events_in_order() {
        let mut processor = story(3, |asm| {
            asm.op(Opcode::NewLine, &[]);
        });
        let (sender, receiver) = mpsc::channel();
        processor.subscribe(Box::new(ChannelObserver(sender)));
        let pc = processor.pc();
        processor.step(&mut BufferedHost::new()).unwrap();
        let events: Vec<_> = receiver.try_iter().collect();
        assert_eq!(
            events,
            vec![
                ExecutionEvent::Stepping { pc },
                ExecutionEvent::Stepped {
                    old_pc: pc,
                    new_pc: pc + 1
                },
            ]
        );
    }

    #[test]
    fn call_to_zero_stores_zero_without_a_frame() {
        let mut processor = story(3, |asm| {
            asm.op(Opcode::CallVS, &[large(0)]).store(Variable::Global(1));
        });
        processor.write_global(1, 99).unwrap();
        let (sender, receiver) = mpsc::channel();
        processor.subscribe(Box::new(ChannelObserver(sender)));
        processor.step(&mut BufferedHost::new()).unwrap();

        assert_eq!(processor.read_global(1).unwrap(), 0);
        assert_eq!(processor.stack().depth(), 1);
        assert!(
            !receiver
                .try_iter()
                .any(|e| matches!(e, ExecutionEvent::FrameEntered { .. }))
        );
    }

    #[test]
    fn call_and_return_restore_the_stack() {
        let mut asm = Assembler::new(3);
        asm.globals(&[]);
        let callee = asm.routine(&[10, 20, 30]);
        asm.op(Opcode::Add, &[local(0), local(2)]).store(Variable::Stack);
        asm.op(Opcode::RetPopped, &[]);
        let main = asm.routine(&[]);
        asm.set_main(main);
        let packed = asm.pack(callee);
        asm.op(Opcode::Push, &[small(5)]);
        asm.op(Opcode::CallVS, &[large(packed), small(1), small(2)])
            .store(Variable::Global(4));
        asm.op(Opcode::Quit, &[]);
        let mut processor = Processor::new(asm.finish().unwrap(), options()).unwrap();
        let mut host = BufferedHost::new();

        processor.step(&mut host).unwrap();
        let (depth, len) = (processor.stack().depth(), processor.stack().len());
        processor.step(&mut host).unwrap();
        assert_eq!(processor.stack().depth(), depth + 1);
        assert_eq!(processor.stack().current().unwrap().locals(), &[1, 2, 30]);
        processor.step(&mut host).unwrap();
        processor.step(&mut host).unwrap();

        assert_eq!(processor.stack().depth(), depth);
        assert_eq!(processor.stack().len(), len);
        assert_eq!(processor.read_global(4).unwrap(), 31);
    }

    #[test]
    fn v5_locals_start_at_zero() {
        let mut asm = Assembler::new(5);
        asm.globals(&[]);
        let callee = asm.routine(&[0, 0]);
        asm.op(Opcode::Ret, &[local(1)]);
        let main = asm.routine(&[]);
        asm.set_main(main);
        let packed = asm.pack(callee);
        asm.op(Opcode::CallVS, &[large(packed), small(9)])
            .store(Variable::Global(0));
        asm.op(Opcode::Quit, &[]);
        let mut processor = Processor::new(asm.finish().unwrap(), options()).unwrap();
        run(&mut processor, &mut BufferedHost::new());
        assert_eq!(processor.read_global(0).unwrap(), 0);
    }

    #[test]
    fn indirect_stack_access_works_in_place() {
        let mut processor = story(5, |asm| {
            asm.op(Opcode::Push, &[small(10)]);
            asm.op(Opcode::Push, &[small(20)]);
            asm.op(Opcode::Inc, &[small(0)]);
            asm.op(Opcode::Load, &[small(0)]).store(Variable::Global(0));
            asm.op(Opcode::Store, &[small(0), small(7)]);
        });
        let mut host = BufferedHost::new();
        for _ in 0..5 {
            processor.step(&mut host).unwrap();
        }
        assert_eq!(processor.stack().frame_values(), &[10, 7]);
        assert_eq!(processor.read_global(0).unwrap(), 21);
    }

    #[test]
    fn popping_an_empty_frame_region_fails() {
        let mut processor = story(3, |asm| {
            asm.op(Opcode::Add, &[sp(), small(1)]).store(Variable::Stack);
        });
        let error = processor.step(&mut BufferedHost::new()).unwrap_err();
        assert_eq!(error.root(), &VmError::StackUnderflow);
    }

    #[test]
    fn branches_and_loops() {
        let mut processor = story(3, |asm| {
            let top = asm.here();
            asm.op(Opcode::IncChk, &[small(16), small(4)]).branch(false, top);
            asm.op(Opcode::Je, &[global(0), small(3), small(5)])
                .branch(true, top);
            asm.op(Opcode::Quit, &[]);
        });
        run(&mut processor, &mut BufferedHost::new());
        assert_eq!(processor.read_global(0).unwrap(), 6);
    }

    #[test]
    fn branch_offsets_zero_and_one_return() {
        let mut asm = Assembler::new(3);
        asm.globals(&[]);
        let callee = asm.routine(&[]);
        asm.op(Opcode::Jz, &[small(0)]).branch_return(true, true);
        asm.op(Opcode::Rfalse, &[]);
        let main = asm.routine(&[]);
        asm.set_main(main);
        let packed = asm.pack(callee);
        asm.op(Opcode::CallVS, &[large(packed)]).store(Variable::Global(0));
        asm.op(Opcode::Quit, &[]);
        let mut processor = Processor::new(asm.finish().unwrap(), options()).unwrap();
        run(&mut processor, &mut BufferedHost::new());
        assert_eq!(processor.read_global(0).unwrap(), 1);
    }

    #[test]
    fn print_forms_reach_the_host() {
        let mut processor = story(3, |asm| {
            asm.print("Hello");
            asm.op(Opcode::PrintChar, &[small(b',')]);
            asm.op(Opcode::PrintNum, &[large(0xffff)]);
            asm.op(Opcode::NewLine, &[]);
            asm.op(Opcode::Quit, &[]);
        });
        let mut host = BufferedHost::new();
        run(&mut processor, &mut host);
        assert_eq!(host.output, "Hello,-1\n");
    }

    #[test]
    fn object_opcodes_move_and_query() {
        let mut asm = Assembler::new(3);
        asm.globals(&[]);
        let mut objects = vec![ObjectEntry::default(); 3];
        objects[1].parent = 1;
        objects[0].child = 2;
        objects[1].name = "box".to_string();
        objects[1].properties = vec![(7, vec![0, 42])];
        asm.object_table(&[0; 31], &objects);
        let main = asm.routine(&[]);
        asm.set_main(main);
        asm.op(Opcode::InsertObj, &[small(2), small(3)]);
        asm.op(Opcode::GetParent, &[small(2)]).store(Variable::Global(0));
        asm.op(Opcode::GetChild, &[small(1)]).store(Variable::Global(1)).branch_offset(true, 2);
        asm.op(Opcode::GetProp, &[small(2), small(7)]).store(Variable::Global(2));
        asm.op(Opcode::SetAttr, &[small(2), small(3)]);
        asm.op(Opcode::TestAttr, &[small(2), small(3)]).branch_offset(false, 2);
        asm.op(Opcode::PrintObj, &[small(2)]);
        asm.op(Opcode::Quit, &[]);
        let mut processor = Processor::new(asm.finish().unwrap(), options()).unwrap();
        let mut host = BufferedHost::new();
        run(&mut processor, &mut host);

        assert_eq!(processor.read_global(0).unwrap(), 3);
        assert_eq!(processor.read_global(1).unwrap(), 0);
        assert_eq!(processor.read_global(2).unwrap(), 42);
        assert_eq!(host.output, "box");
    }

    #[test]
    fn insert_into_own_descendant_faults() {
        let mut asm = Assembler::new(3);
        asm.globals(&[]);
        let mut objects = vec![ObjectEntry::default(); 2];
        objects[1].parent = 1;
        objects[0].child = 2;
        asm.object_table(&[0; 31], &objects);
        let main = asm.routine(&[]);
        asm.set_main(main);
        asm.op(Opcode::InsertObj, &[small(1), small(2)]);
        asm.op(Opcode::Quit, &[]);
        let mut processor = Processor::new(asm.finish().unwrap(), options()).unwrap();

        let pc = processor.pc();
        let error = processor.step(&mut BufferedHost::new()).unwrap_err();
        assert_eq!(error.address(), Some(pc));
        assert_eq!(error.root(), &VmError::InvalidObject(1));

        let objects = processor.objects();
        assert_eq!(objects.parent(processor.memory(), 1).unwrap(), 0);
        assert_eq!(objects.child(processor.memory(), 1).unwrap(), 2);
        assert_eq!(objects.parent(processor.memory(), 2).unwrap(), 1);
        assert_eq!(objects.child(processor.memory(), 2).unwrap(), 0);
    }

    #[test]
    fn line_input_suspends_and_resumes() {
        let mut asm = Assembler::new(5);
        asm.globals(&[]);
        let dictionary = asm.position();
        asm.byte(0).byte(7).word(0);
        asm.set_header_word(offsets::DICTIONARY, dictionary as u16);
        let text = asm.zeros(20);
        let parse = asm.zeros(2 + 4 * 4);
        asm.patch_word(text, 0x1000);
        asm.patch_word(parse, 0x0400);
        let main = asm.routine(&[]);
        asm.set_main(main);
        asm.op(Opcode::Aread, &[large(text as u16), large(parse as u16)])
            .store(Variable::Global(0));
        asm.op(Opcode::Quit, &[]);
        let mut processor = Processor::new(asm.finish().unwrap(), options()).unwrap();
        let mut host = BufferedHost::new();

        processor.step(&mut host).unwrap();
        assert!(matches!(
            processor.state(),
            ProcessorState::AwaitingInput(InputRequest::Line { .. })
        ));
        assert_eq!(
            processor.step(&mut host),
            Err(VmError::InputState("step while awaiting input"))
        );
        processor.provide_line_input("Look Around").unwrap();
        assert_eq!(processor.state(), ProcessorState::Running);
        assert_eq!(processor.read_global(0).unwrap(), 13);
        let memory = processor.memory();
        assert_eq!(memory.read_byte(text as usize + 1).unwrap(), 11);
        assert_eq!(memory.read_bytes(text as usize + 2, 4).unwrap(), b"look");
        assert_eq!(memory.read_byte(parse as usize + 1).unwrap(), 2);
    }

    #[test]
    fn catch_and_throw_unwind_frames() {
        let mut asm = Assembler::new(5);
        asm.globals(&[]);
        let inner = asm.routine(&[0]);
        asm.op(Opcode::Throw, &[small(77), local(0)]);
        let outer = asm.routine(&[0]);
        asm.op(Opcode::Catch, &[]).store(Variable::Local(0));
        let inner_packed = asm.pack(inner);
        asm.op(Opcode::CallVN, &[large(inner_packed), local(0)]);
        asm.op(Opcode::Rfalse, &[]);
        let main = asm.routine(&[]);
        asm.set_main(main);
        let outer_packed = asm.pack(outer);
        asm.op(Opcode::CallVS, &[large(outer_packed)]).store(Variable::Global(0));
        asm.op(Opcode::Quit, &[]);
        let mut processor = Processor::new(asm.finish().unwrap(), options()).unwrap();
        run(&mut processor, &mut BufferedHost::new());
        assert_eq!(processor.read_global(0).unwrap(), 77);
        assert_eq!(processor.stack().depth(), 1);
    }

    #[test]
    fn run_routine_returns_the_value() {
        let mut asm = Assembler::new(5);
        asm.globals(&[]);
        let callee = asm.routine(&[0, 0]);
        asm.op(Opcode::Mul, &[local(0), local(1)]).store(Variable::Stack);
        asm.op(Opcode::RetPopped, &[]);
        let main = asm.routine(&[]);
        asm.set_main(main);
        asm.op(Opcode::Quit, &[]);
        let mut processor = Processor::new(asm.finish().unwrap(), options()).unwrap();
        let before = processor.pc();
        let result = processor
            .run_routine(&mut BufferedHost::new(), callee, &[6, 7])
            .unwrap();
        assert_eq!(result, Some(42));
        assert_eq!(processor.pc(), before);
        assert_eq!(processor.stack().depth(), 1);
    }

    #[test]
    fn memory_stream_and_random() {
        let mut asm = Assembler::new(5);
        asm.globals(&[]);
        let table = asm.zeros(16);
        let main = asm.routine(&[]);
        asm.set_main(main);
        asm.op(Opcode::OutputStream, &[small(3), large(table as u16)]);
        asm.print("abc");
        asm.op(Opcode::OutputStream, &[large(0xfffd)]);
        asm.op(Opcode::Random, &[large(0xfffd)]).store(Variable::Global(0));
        asm.op(Opcode::Random, &[small(10)]).store(Variable::Global(1));
        asm.op(Opcode::Random, &[small(10)]).store(Variable::Global(2));
        asm.op(Opcode::Quit, &[]);
        let mut processor = Processor::new(asm.finish().unwrap(), options()).unwrap();
        let mut host = BufferedHost::new();
        run(&mut processor, &mut host);
        assert_eq!(host.output, "");
        assert_eq!(processor.memory().read_word(table as usize).unwrap(), 3);
        assert_eq!(processor.read_global(0).unwrap(), 0);
        assert_eq!(processor.read_global(1).unwrap(), 1);
        assert_eq!(processor.read_global(2).unwrap(), 2);
    }

    #[test]
    fn restart_preserves_transcript_bit() {
        let mut processor = story(3, |asm| {
            asm.op(Opcode::Storew, &[small(0), small(8), small(1)]);
            asm.op(Opcode::Restart, &[]);
        });
        let mut host = BufferedHost::new();
        let start = processor.pc();
        processor.write_global(0, 5).unwrap();
        processor.step(&mut host).unwrap();
        processor.step(&mut host).unwrap();
        assert_eq!(processor.pc(), start);
        assert_eq!(processor.read_global(0).unwrap(), 0);
        assert_eq!(processor.memory().read_word(offsets::FLAGS2).unwrap() & 1, 1);
    }

    #[test]
    fn verify_checks_the_pristine_image() {
        let mut processor = story(3, |asm| {
            asm.op(Opcode::Verify, &[]).branch_offset(true, 1);
            asm.op(Opcode::Rfalse, &[]);
        });
        processor.write_global(0, 1).unwrap();
        assert!(processor.verify());
    }

    #[test]
    fn main_routine_return_quits() {
        let mut processor = story(5, |asm| {
            asm.op(Opcode::Rtrue, &[]);
        });
        processor.step(&mut BufferedHost::new()).unwrap();
        assert_eq!(processor.state(), ProcessorState::Quit);
        assert_eq!(processor.step(&mut BufferedHost::new()), Err(VmError::Quit));
    }

    proptest! {
        #[test]
        fn arithmetic_matches_signed_words(a in any::<u16>(), b in any::<u16>()) {
            let mut processor = story(5, |asm| {
                asm.op(Opcode::Quit, &[]);
            });
            let mut host = BufferedHost::new();
            let (x, y) = (a as i16, b as i16);
            prop_assert_eq!(
                processor.perform(&mut host, Opcode::Sub, &[a, b]).unwrap(),
                Outcome::Value(x.wrapping_sub(y) as u16)
            );
            prop_assert_eq!(
                processor.perform(&mut host, Opcode::Jl, &[a, b]).unwrap(),
                Outcome::Test(x < y)
            );
            let quotient = processor.perform(&mut host, Opcode::Div, &[a, b]);
            if y == 0 {
                prop_assert_eq!(quotient, Err(VmError::DivisionByZero));
            } else {
                prop_assert_eq!(quotient.unwrap(), Outcome::Value(x.wrapping_div(y) as u16));
            }
        }
    }
}
