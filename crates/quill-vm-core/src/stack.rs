//! Call stack
//!
//! One flat evaluation stack of words shared by every frame. Each frame
//! remembers where its own region starts, so popping below that boundary is
//! an underflow even if older frames still hold values.

use quill_vm_bytecode::Variable;
use smallvec::SmallVec;

use crate::error::{VmError, VmResult};

/// Default evaluation stack capacity in words
pub const DEFAULT_STACK_SIZE: usize = 1024;

/// Maximum call nesting
pub const MAX_CALL_DEPTH: usize = 1024;

/// Maximum locals per routine
pub const MAX_LOCALS: usize = 15;

/// One routine activation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Routine header address
    pub address: u32,
    /// Caller's resume address
    pub return_address: u32,
    /// Where the caller wants the result
    pub store: Option<Variable>,
    /// Arguments actually supplied, clipped to the local count
    pub arguments: SmallVec<[u16; 7]>,
    /// Start of this frame's region of the evaluation stack
    pub stack_base: usize,
    locals: [u16; MAX_LOCALS],
    local_count: u8,
}

impl StackFrame {
    /// Build a frame whose locals start as `defaults` overlaid with `args`.
    pub fn new(
        address: u32,
        return_address: u32,
        store: Option<Variable>,
        defaults: &[u16],
        args: &[u16],
        stack_base: usize,
    ) -> Self {
        let local_count = defaults.len().min(MAX_LOCALS);
        let mut locals = [0u16; MAX_LOCALS];
        locals[..local_count].copy_from_slice(&defaults[..local_count]);
        let supplied = args.len().min(local_count);
        locals[..supplied].copy_from_slice(&args[..supplied]);
        Self {
            address,
            return_address,
            store,
            arguments: SmallVec::from_slice(&args[..supplied]),
            stack_base,
            locals,
            local_count: local_count as u8,
        }
    }

    /// Declared local count.
    #[inline]
    pub fn local_count(&self) -> u8 {
        self.local_count
    }

    /// Number of arguments supplied by the caller.
    #[inline]
    pub fn argument_count(&self) -> u8 {
        self.arguments.len() as u8
    }

    /// Declared locals.
    #[inline]
    pub fn locals(&self) -> &[u16] {
        &self.locals[..self.local_count as usize]
    }

    /// Read local `index` (zero-based).
    #[inline]
    pub fn local(&self, index: u8) -> VmResult<u16> {
        self.locals()
            .get(index as usize)
            .copied()
            .ok_or(VmError::InvalidLocal {
                index,
                count: self.local_count,
            })
    }

    /// Write local `index` (zero-based).
    #[inline]
    pub fn set_local(&mut self, index: u8, value: u16) -> VmResult<()> {
        if index >= self.local_count {
            return Err(VmError::InvalidLocal {
                index,
                count: self.local_count,
            });
        }
        self.locals[index as usize] = value;
        Ok(())
    }
}

/// Evaluation stack plus frame records
#[derive(Debug, Clone)]
pub struct CallStack {
    values: Vec<u16>,
    frames: Vec<StackFrame>,
    capacity: usize,
}

impl Default for CallStack {
    fn default() -> Self {
        Self::new(DEFAULT_STACK_SIZE)
    }
}

impl CallStack {
    /// Create a stack holding at most `capacity` words.
    pub fn new(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
            frames: Vec::new(),
            capacity,
        }
    }

    /// Capacity in words.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total words on the stack across all frames.
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the stack holds no words.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of active frames.
    #[inline]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    fn base(&self) -> usize {
        self.frames.last().map_or(0, |f| f.stack_base)
    }

    /// Push a word.
    #[inline]
    pub fn push(&mut self, value: u16) -> VmResult<()> {
        if self.values.len() >= self.capacity {
            return Err(VmError::StackOverflow(self.capacity));
        }
        self.values.push(value);
        Ok(())
    }

    /// Pop a word from the current frame's region.
    #[inline]
    pub fn pop(&mut self) -> VmResult<u16> {
        if self.values.len() <= self.base() {
            return Err(VmError::StackUnderflow);
        }
        self.values.pop().ok_or(VmError::StackUnderflow)
    }

    /// Read the top word of the current frame's region.
    #[inline]
    pub fn peek(&self) -> VmResult<u16> {
        if self.values.len() <= self.base() {
            return Err(VmError::StackUnderflow);
        }
        self.values.last().copied().ok_or(VmError::StackUnderflow)
    }

    /// Overwrite the top word of the current frame's region.
    #[inline]
    pub fn replace_top(&mut self, value: u16) -> VmResult<()> {
        if self.values.len() <= self.base() {
            return Err(VmError::StackUnderflow);
        }
        match self.values.last_mut() {
            Some(top) => {
                *top = value;
                Ok(())
            }
            None => Err(VmError::StackUnderflow),
        }
    }

    /// Words belonging to the current frame, bottom first.
    pub fn frame_values(&self) -> &[u16] {
        &self.values[self.base()..]
    }

    /// All words, bottom first.
    pub fn values(&self) -> &[u16] {
        &self.values
    }

    /// Push a frame record.
    pub fn push_frame(&mut self, frame: StackFrame) -> VmResult<()> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(VmError::CallDepthExceeded(MAX_CALL_DEPTH));
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Pop the current frame, discarding the words it left behind.
    pub fn pop_frame(&mut self) -> VmResult<StackFrame> {
        let frame = self.frames.pop().ok_or(VmError::NoFrame)?;
        self.values.truncate(frame.stack_base);
        Ok(frame)
    }

    /// Current frame.
    #[inline]
    pub fn current(&self) -> VmResult<&StackFrame> {
        self.frames.last().ok_or(VmError::NoFrame)
    }

    /// Current frame, mutably.
    #[inline]
    pub fn current_mut(&mut self) -> VmResult<&mut StackFrame> {
        self.frames.last_mut().ok_or(VmError::NoFrame)
    }

    /// All frames, outermost first.
    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    /// Drop all words and frames.
    pub fn clear(&mut self) {
        self.values.clear();
        self.frames.clear();
    }
}
