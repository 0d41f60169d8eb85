//! Interpreted executor
//!
//! The [`Processor`] owns everything a running story touches: memory, the
//! call stack, decoded instructions, output streams and the random source.
//! Each [`step`](Processor::step) decodes one instruction, advances the
//! program counter past it and dispatches on the opcode.
//!
//! # Events
//!
//! ```text
//! step():
//!   emit Stepping { pc }
//!   execute            (FrameEntered / FrameExited / Quit fire here)
//!   emit Stepped { old_pc, new_pc }
//! ```

mod handlers;

use std::sync::Arc;

use quill_vm_bytecode::header::offsets;
use quill_vm_bytecode::{
    BranchTarget, Decoder, Header, Instruction, Memory, MemoryObserver, ObserverId, Operand,
    Variable,
};
use serde::Serialize;
use smallvec::SmallVec;

use crate::dictionary::{self, Dictionary};
use crate::error::{VmError, VmResult};
use crate::events::{EventBus, ExecutionEvent, ExecutionObserver, SubscriptionId};
use crate::host::{Host, StatusLine, StatusRight};
use crate::objects::ObjectTable;
use crate::random::RandomSource;
use crate::routine::RoutineTable;
use crate::stack::{CallStack, DEFAULT_STACK_SIZE, MAX_LOCALS, StackFrame};
use crate::streams::OutputStreams;
use crate::text::{ZSCII_NEWLINE, ZText};

pub use handlers::Outcome;

/// Flags 2 bits that survive `restart` (transcript and fixed-pitch)
const RESTART_PRESERVED_FLAGS2: u16 = 0x0003;

/// Flags 1 bit selecting a time status line (v1-3)
const STATUS_TIME_BIT: u8 = 0x02;

/// Processor construction options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorOptions {
    /// Evaluation stack capacity in words
    pub stack_size: usize,
    /// Fixed seed for the random source; `None` seeds from the OS
    pub random_seed: Option<u64>,
    /// Interpreter number written to the header
    pub interpreter_number: u8,
    /// Interpreter version letter written to the header
    pub interpreter_version: u8,
    /// Screen height in lines
    pub screen_height: u8,
    /// Screen width in characters
    pub screen_width: u8,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            random_seed: None,
            interpreter_number: 6,
            interpreter_version: b'A',
            screen_height: 25,
            screen_width: 80,
        }
    }
}

/// Outstanding input request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InputRequest {
    /// `sread` / `aread`
    Line {
        /// Text buffer address
        text_buffer: u32,
        /// Parse buffer address (0 = do not tokenise)
        parse_buffer: u32,
        /// Where the terminator goes (v5+)
        store: Option<Variable>,
    },
    /// `read_char`
    Char {
        /// Where the character code goes
        store: Option<Variable>,
    },
}

/// Observable processor state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessorState {
    /// Ready to step
    Running,
    /// Suspended until the host supplies input
    AwaitingInput(InputRequest),
    /// The story quit
    Quit,
}

/// Interpreted Z-machine
#[derive(Debug)]
pub struct Processor {
    memory: Memory,
    pristine: Arc<[u8]>,
    header: Header,
    decoder: Decoder,
    stack: CallStack,
    pc: u32,
    objects: ObjectTable,
    text: ZText,
    streams: OutputStreams,
    random: RandomSource,
    routines: RoutineTable,
    events: EventBus,
    state: ProcessorState,
    options: ProcessorOptions,
    nested: usize,
    last_return: Option<u16>,
}

impl Processor {
    /// Load a story image and prepare the initial call to its main routine.
    pub fn new(image: Vec<u8>, options: ProcessorOptions) -> VmResult<Self> {
        let pristine: Arc<[u8]> = Arc::from(image.as_slice());
        let memory = Memory::new(image);
        let header = Header::read(&memory)?;
        let objects = ObjectTable::new(&memory, &header);
        let text = ZText::new(&memory, &header)?;
        let random = options
            .random_seed
            .map_or_else(RandomSource::new, RandomSource::seeded);

        let mut processor = Self {
            decoder: Decoder::with_cache_floor(header.version, header.static_memory_base as u32),
            routines: RoutineTable::new(header.main_routine_address()),
            stack: CallStack::new(options.stack_size),
            memory,
            pristine,
            header,
            pc: 0,
            objects,
            text,
            streams: OutputStreams::new(),
            random,
            events: EventBus::default(),
            state: ProcessorState::Running,
            options,
            nested: 0,
            last_return: None,
        };
        processor.write_interpreter_header()?;
        processor.start()?;
        tracing::debug!(
            version = processor.header.version,
            release = processor.header.release,
            serial = %processor.header.serial,
            main = format_args!("{:#x}", processor.header.main_routine_address()),
            "story loaded"
        );
        Ok(processor)
    }

    fn write_interpreter_header(&mut self) -> VmResult<()> {
        let version = self.header.version;
        let memory = &mut self.memory;
        memory.write_byte(offsets::INTERPRETER_NUMBER, self.options.interpreter_number)?;
        memory.write_byte(offsets::INTERPRETER_VERSION, self.options.interpreter_version)?;
        if version <= 3 {
            // status line available, screen splitting available
            let flags = memory.read_byte(offsets::FLAGS1)?;
            memory.write_byte(offsets::FLAGS1, (flags & !0x10) | 0x20)?;
        } else {
            memory.write_byte(offsets::SCREEN_HEIGHT_LINES, self.options.screen_height)?;
            memory.write_byte(offsets::SCREEN_WIDTH_CHARS, self.options.screen_width)?;
        }
        if version >= 5 {
            memory.write_word(0x22, self.options.screen_width as u16)?;
            memory.write_word(0x24, self.options.screen_height as u16)?;
            memory.write_byte(0x26, 1)?;
            memory.write_byte(0x27, 1)?;
        }
        memory.write_word(offsets::STANDARD_REVISION, 0x0101)?;
        Ok(())
    }

    /// Reset the call stack and enter the main routine.
    fn start(&mut self) -> VmResult<()> {
        self.stack.clear();
        self.nested = 0;
        self.last_return = None;
        self.state = ProcessorState::Running;
        let main = self.header.main_routine_address();
        self.routines.record_call(main);
        if self.header.version == 6 {
            self.call_routine(main, &[], None, 0)
        } else {
            self.stack
                .push_frame(StackFrame::new(main, 0, None, &[], &[], 0))?;
            self.pc = self.header.initial_pc as u32;
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Story memory.
    #[inline]
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// The image as loaded, before any execution.
    pub fn pristine(&self) -> &[u8] {
        &self.pristine
    }

    /// Parsed header.
    #[inline]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Story version.
    #[inline]
    pub fn version(&self) -> u8 {
        self.header.version
    }

    /// Program counter.
    #[inline]
    pub fn pc(&self) -> u32 {
        self.pc
    }

    /// Move the program counter.
    #[inline]
    pub fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    /// Call stack.
    #[inline]
    pub fn stack(&self) -> &CallStack {
        &self.stack
    }

    /// Call stack, mutably.
    #[inline]
    pub fn stack_mut(&mut self) -> &mut CallStack {
        &mut self.stack
    }

    /// Object table accessor.
    #[inline]
    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    /// Text codec.
    #[inline]
    pub fn text(&self) -> &ZText {
        &self.text
    }

    /// Output stream state.
    #[inline]
    pub fn streams(&self) -> &OutputStreams {
        &self.streams
    }

    /// Instruction decoder.
    #[inline]
    pub fn decoder_mut(&mut self) -> &mut Decoder {
        &mut self.decoder
    }

    /// Routines discovered or called so far.
    #[inline]
    pub fn routines(&self) -> &RoutineTable {
        &self.routines
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> ProcessorState {
        self.state
    }

    /// Value returned by the most recent routine return.
    #[inline]
    pub fn last_return(&self) -> Option<u16> {
        self.last_return
    }

    /// Read the routine at `address` and everything it calls into the
    /// routine table.
    pub fn discover_routines(&mut self, address: u32) -> VmResult<()> {
        self.routines
            .add(&self.memory, &self.header, &mut self.decoder, address)?;
        Ok(())
    }

    /// Addresses of routines dropped from the routine table because the
    /// story rewrote their bytes. Compiled copies of them are out of date.
    pub fn take_stale_routines(&mut self) -> Vec<u32> {
        self.routines.take_stale()
    }

    /// Read every routine called so far into the routine table.
    pub fn resolve_called_routines(&mut self) {
        self.routines
            .resolve_called(&self.memory, &self.header, &mut self.decoder);
    }

    /// Subscribe to execution events.
    pub fn subscribe(&mut self, observer: Box<dyn ExecutionObserver>) -> SubscriptionId {
        self.events.subscribe(observer)
    }

    /// Remove an execution observer.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Subscribe to memory writes.
    pub fn subscribe_memory(&mut self, observer: Box<dyn MemoryObserver>) -> ObserverId {
        self.memory.subscribe(observer)
    }

    /// Remove a memory observer.
    pub fn unsubscribe_memory(&mut self, id: ObserverId) -> bool {
        self.memory.unsubscribe(id)
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    /// Write a byte on behalf of the story.
    pub fn store_byte(&mut self, address: u32, value: u8) -> VmResult<()> {
        self.memory.write_byte(address as usize, value)?;
        self.touched(address, 1);
        Ok(())
    }

    /// Write a word on behalf of the story.
    pub fn store_word(&mut self, address: u32, value: u16) -> VmResult<()> {
        self.memory.write_word(address as usize, value)?;
        self.touched(address, 2);
        Ok(())
    }

    /// Decoded routines and cached instructions overlapping a write are
    /// dropped. The decoder never caches below static memory.
    #[inline]
    fn touched(&mut self, address: u32, len: u32) {
        self.routines.invalidate(address, len);
        if address + len > self.header.static_memory_base as u32 {
            self.decoder.invalidate(address, len);
        }
    }

    fn fetch(&mut self, address: u32) -> VmResult<Arc<Instruction>> {
        Ok(self.decoder.decode(&self.memory, address)?)
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    /// Global variable `index` (zero-based).
    #[inline]
    pub fn read_global(&self, index: u8) -> VmResult<u16> {
        let address = self.header.globals as usize + index as usize * 2;
        Ok(self.memory.read_word(address)?)
    }

    /// Set global variable `index` (zero-based).
    #[inline]
    pub fn write_global(&mut self, index: u8, value: u16) -> VmResult<()> {
        let address = self.header.globals as u32 + index as u32 * 2;
        self.store_word(address, value)
    }

    /// Read a variable; the stack variable pops.
    pub fn read_variable(&mut self, variable: Variable) -> VmResult<u16> {
        match variable {
            Variable::Stack => self.stack.pop(),
            Variable::Local(index) => self.stack.current()?.local(index),
            Variable::Global(index) => self.read_global(index),
        }
    }

    /// Write a variable; the stack variable pushes.
    pub fn write_variable(&mut self, variable: Variable, value: u16) -> VmResult<()> {
        match variable {
            Variable::Stack => self.stack.push(value),
            Variable::Local(index) => self.stack.current_mut()?.set_local(index, value),
            Variable::Global(index) => self.write_global(index, value),
        }
    }

    /// Indirect read; the stack variable peeks.
    pub fn peek_variable(&self, variable: Variable) -> VmResult<u16> {
        match variable {
            Variable::Stack => self.stack.peek(),
            Variable::Local(index) => self.stack.current()?.local(index),
            Variable::Global(index) => self.read_global(index),
        }
    }

    /// Indirect write; the stack variable is replaced in place.
    pub fn replace_variable(&mut self, variable: Variable, value: u16) -> VmResult<()> {
        match variable {
            Variable::Stack => self.stack.replace_top(value),
            Variable::Local(index) => self.stack.current_mut()?.set_local(index, value),
            Variable::Global(index) => self.write_global(index, value),
        }
    }

    /// Resolve an operand to its value.
    #[inline]
    pub fn operand_value(&mut self, operand: Operand) -> VmResult<u16> {
        match operand {
            Operand::LargeConstant(value) => Ok(value),
            Operand::SmallConstant(value) => Ok(value as u16),
            Operand::Variable(variable) => self.read_variable(variable),
        }
    }

    fn operand_values(&mut self, instruction: &Instruction) -> VmResult<SmallVec<[u16; 8]>> {
        let mut values = SmallVec::new();
        for operand in &instruction.operands {
            values.push(self.operand_value(*operand)?);
        }
        Ok(values)
    }

    // ------------------------------------------------------------------
    // Calls and returns
    // ------------------------------------------------------------------

    /// Local defaults and first instruction address of the routine whose
    /// header is at `address`.
    pub fn routine_header(&self, address: u32) -> VmResult<(SmallVec<[u16; MAX_LOCALS]>, u32)> {
        let mut reader = self.memory.reader(address as usize);
        let count = reader.next_byte()? as usize;
        if count > MAX_LOCALS {
            return Err(VmError::InvalidRoutine(address));
        }
        let mut defaults = SmallVec::new();
        if self.header.version <= 4 {
            for _ in 0..count {
                defaults.push(reader.next_word()?);
            }
        } else {
            defaults.resize(count, 0);
        }
        Ok((defaults, reader.address() as u32))
    }

    /// Push a frame for the routine at unpacked `address` and jump to its
    /// first instruction.
    pub fn call_routine(
        &mut self,
        address: u32,
        args: &[u16],
        store: Option<Variable>,
        return_address: u32,
    ) -> VmResult<()> {
        let (defaults, entry) = self.routine_header(address)?;
        let frame = StackFrame::new(
            address,
            return_address,
            store,
            &defaults,
            args,
            self.stack.len(),
        );
        self.stack.push_frame(frame)?;
        self.routines.record_call(address);
        self.pc = entry;
        self.events.emit(ExecutionEvent::FrameEntered {
            address,
            return_address,
        });
        Ok(())
    }

    /// Call through a packed address; packed 0 stores 0 without a frame.
    fn call_packed(
        &mut self,
        packed: u16,
        args: &[u16],
        store: Option<Variable>,
        return_address: u32,
    ) -> VmResult<()> {
        if packed == 0 {
            if let Some(store) = store {
                self.write_variable(store, 0)?;
            }
            return Ok(());
        }
        let address = self.header.unpack_routine_address(packed);
        self.call_routine(address, args, store, return_address)
    }

    /// Return `value` from the current routine.
    pub fn return_from(&mut self, value: u16) -> VmResult<()> {
        let main_return = self.stack.depth() <= 1 && self.nested == 0;
        let frame = self.stack.pop_frame()?;
        self.last_return = Some(value);
        self.events.emit(ExecutionEvent::FrameExited {
            address: frame.address,
            return_address: frame.return_address,
        });
        if main_return {
            self.quit();
            return Ok(());
        }
        self.pc = frame.return_address;
        if let Some(store) = frame.store {
            self.write_variable(store, value)?;
        }
        Ok(())
    }

    /// Push a frame record for a routine running as compiled code.
    pub fn enter_compiled_frame(&mut self, address: u32, args: &[u16]) -> VmResult<()> {
        let (defaults, _) = self.routine_header(address)?;
        let frame = StackFrame::new(address, self.pc, None, &defaults, args, self.stack.len());
        self.stack.push_frame(frame)?;
        self.routines.record_call(address);
        self.events.emit(ExecutionEvent::FrameEntered {
            address,
            return_address: self.pc,
        });
        Ok(())
    }

    /// Pop the frame record of a compiled routine.
    pub fn leave_compiled_frame(&mut self, value: u16) -> VmResult<()> {
        let frame = self.stack.pop_frame()?;
        self.last_return = Some(value);
        self.events.emit(ExecutionEvent::FrameExited {
            address: frame.address,
            return_address: frame.return_address,
        });
        Ok(())
    }

    /// Apply a branch decision.
    fn branch(&mut self, instruction: &Instruction, result: bool) -> VmResult<()> {
        let Some(branch) = instruction.branch else {
            return Ok(());
        };
        if result != branch.condition {
            return Ok(());
        }
        match branch.target {
            BranchTarget::ReturnFalse => self.return_from(0),
            BranchTarget::ReturnTrue => self.return_from(1),
            BranchTarget::Address(address) => {
                self.pc = address;
                Ok(())
            }
        }
    }

    /// Mark the story as quit.
    pub fn quit(&mut self) {
        if self.state != ProcessorState::Quit {
            tracing::debug!(pc = format_args!("{:#x}", self.pc), "story quit");
            self.state = ProcessorState::Quit;
            self.events.emit(ExecutionEvent::Quit);
        }
    }

    /// Reload dynamic memory and start over, keeping the transcript and
    /// fixed-pitch bits.
    pub fn restart(&mut self) -> VmResult<()> {
        let preserved = self.memory.read_word(offsets::FLAGS2)? & RESTART_PRESERVED_FLAGS2;
        let pristine = Arc::clone(&self.pristine);
        self.memory.reload(&pristine)?;
        let flags2 = self.memory.read_word(offsets::FLAGS2)?;
        self.memory.write_word(
            offsets::FLAGS2,
            (flags2 & !RESTART_PRESERVED_FLAGS2) | preserved,
        )?;
        self.decoder.clear();
        self.routines.invalidate(0, self.header.static_memory_base as u32);
        self.streams.reset();
        self.write_interpreter_header()?;
        tracing::debug!("restart");
        self.start()
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Execute one instruction.
    pub fn step(&mut self, host: &mut dyn Host) -> VmResult<()> {
        match self.state {
            ProcessorState::Running => {}
            ProcessorState::AwaitingInput(_) => {
                return Err(VmError::InputState("step while awaiting input"));
            }
            ProcessorState::Quit => return Err(VmError::Quit),
        }
        let old_pc = self.pc;
        self.events.emit(ExecutionEvent::Stepping { pc: old_pc });
        self.execute_at(host, old_pc).map_err(|error| error.at(old_pc))?;
        self.events.emit(ExecutionEvent::Stepped {
            old_pc,
            new_pc: self.pc,
        });
        Ok(())
    }

    fn execute_at(&mut self, host: &mut dyn Host, address: u32) -> VmResult<()> {
        let instruction = self.fetch(address)?;
        self.pc = instruction.next_address();
        self.execute(host, &instruction)
    }

    /// Step up to `limit` instructions, stopping early when the processor
    /// leaves the running state. Returns the number executed.
    pub fn run_batch(&mut self, host: &mut dyn Host, limit: usize) -> VmResult<usize> {
        let mut executed = 0;
        while executed < limit && self.state == ProcessorState::Running {
            self.step(host)?;
            executed += 1;
        }
        Ok(executed)
    }

    /// Run the routine at unpacked `address` to completion and return its
    /// result, or `None` if the story quit meanwhile.
    ///
    /// Input requested while nested must be available immediately.
    pub fn run_routine(
        &mut self,
        host: &mut dyn Host,
        address: u32,
        args: &[u16],
    ) -> VmResult<Option<u16>> {
        if address == 0 {
            return Ok(Some(0));
        }
        let floor = self.stack.depth();
        let resume = self.pc;
        self.call_routine(address, args, None, resume)?;
        self.nested += 1;
        let result = self.run_to_depth(host, floor);
        self.nested -= 1;
        result?;
        if self.state == ProcessorState::Quit {
            return Ok(None);
        }
        self.pc = resume;
        Ok(self.last_return)
    }

    fn run_to_depth(&mut self, host: &mut dyn Host, floor: usize) -> VmResult<()> {
        while self.stack.depth() > floor {
            match self.state {
                ProcessorState::Running => self.step(host)?,
                ProcessorState::Quit => break,
                ProcessorState::AwaitingInput(_) => return Err(VmError::InputUnavailable),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    /// Send text through the active output streams.
    pub fn print_str(&mut self, host: &mut dyn Host, text: &str) -> VmResult<()> {
        self.streams.write(&mut self.memory, host, &self.text, text)
    }

    /// Print the Z-string at byte `address`.
    pub fn print_zstring(&mut self, host: &mut dyn Host, address: u32) -> VmResult<()> {
        let (text, _) = self.text.decode(&self.memory, address)?;
        self.print_str(host, &text)
    }

    /// Print encoded words.
    pub fn print_words(&mut self, host: &mut dyn Host, words: &[u16]) -> VmResult<()> {
        let text = self.text.decode_words(&self.memory, words)?;
        self.print_str(host, &text)
    }

    /// Status line for v1-3 stories.
    pub fn status_line(&self) -> VmResult<StatusLine> {
        let location = match self.read_global(0)? {
            0 => String::new(),
            object => {
                let (address, _) = self.objects.short_name(&self.memory, object)?;
                self.text.decode(&self.memory, address)?.0
            }
        };
        let first = self.read_global(1)?;
        let second = self.read_global(2)?;
        let time = self.memory.read_byte(offsets::FLAGS1)? & STATUS_TIME_BIT != 0;
        let right = if time {
            StatusRight::Time {
                hours: first,
                minutes: second,
            }
        } else {
            StatusRight::Score {
                score: first as i16,
                turns: second,
            }
        };
        Ok(StatusLine { location, right })
    }

    // ------------------------------------------------------------------
    // Input
    // ------------------------------------------------------------------

    /// Letters the text buffer at `text_buffer` can hold.
    pub fn line_capacity(&self, text_buffer: u32) -> VmResult<usize> {
        let max = self.memory.read_byte(text_buffer as usize)? as usize;
        Ok(if self.header.version <= 4 {
            max.saturating_sub(1)
        } else {
            max
        })
    }

    /// Store a typed line into a text buffer, tokenise it into the parse
    /// buffer if one was given, and return the terminating character.
    pub fn finish_line_input(
        &mut self,
        text_buffer: u32,
        parse_buffer: u32,
        line: &str,
    ) -> VmResult<u16> {
        let capacity = self.line_capacity(text_buffer)?;
        let letters: Vec<u8> = line
            .trim_end_matches(['\n', '\r'])
            .chars()
            .flat_map(char::to_lowercase)
            .filter_map(|ch| self.text.char_to_zscii(ch))
            .filter(|&code| code != ZSCII_NEWLINE && code <= 0xff)
            .map(|code| code as u8)
            .take(capacity)
            .collect();

        let buffer = text_buffer as usize;
        if self.header.version <= 4 {
            self.memory.write_bytes(buffer + 1, &letters)?;
            self.memory.write_byte(buffer + 1 + letters.len(), 0)?;
        } else {
            self.memory.write_byte(buffer + 1, letters.len() as u8)?;
            self.memory.write_bytes(buffer + 2, &letters)?;
        }

        if parse_buffer != 0 {
            let dictionary = Dictionary::read(&self.memory, self.header.dictionary as u32)?;
            dictionary::tokenise(
                &mut self.memory,
                &self.text,
                &dictionary,
                text_buffer,
                parse_buffer,
                false,
            )?;
        }
        Ok(ZSCII_NEWLINE)
    }

    /// ZSCII code for a key press.
    pub fn finish_char_input(&self, ch: char) -> u16 {
        self.text.char_to_zscii(ch).unwrap_or(b'?' as u16)
    }

    /// Resume after a line-input request.
    pub fn provide_line_input(&mut self, line: &str) -> VmResult<()> {
        let ProcessorState::AwaitingInput(InputRequest::Line {
            text_buffer,
            parse_buffer,
            store,
        }) = self.state
        else {
            return Err(VmError::InputState("no line input requested"));
        };
        self.state = ProcessorState::Running;
        let terminator = self.finish_line_input(text_buffer, parse_buffer, line)?;
        if let Some(store) = store {
            self.write_variable(store, terminator)?;
        }
        Ok(())
    }

    /// Resume after a character-input request.
    pub fn provide_char_input(&mut self, ch: char) -> VmResult<()> {
        let ProcessorState::AwaitingInput(InputRequest::Char { store }) = self.state else {
            return Err(VmError::InputState("no character input requested"));
        };
        self.state = ProcessorState::Running;
        let code = self.finish_char_input(ch);
        if let Some(store) = store {
            self.write_variable(store, code)?;
        }
        Ok(())
    }
}

