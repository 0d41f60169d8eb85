//! Session run loop.
//!
//! A [`Session`] owns one processor and drives it either in bounded batches
//! of interpreted steps or by running the main routine as compiled code.
//! Cancellation is cooperative: the interrupt flag is checked between steps
//! when interpreting and at routine calls when compiled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use quill_vm_core::{Host, InputRequest, Processor, ProcessorOptions, ProcessorState, VmError, VmResult};

use crate::error::ExecError;
use crate::executable::{Compiled, Executable, ExecutionMode};
use crate::jit_runtime::{JitRuntime, JitRuntimeStats};

/// Instructions per interpreted batch unless configured otherwise
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Session construction options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Processor options
    pub processor: ProcessorOptions,
    /// Execution strategy
    pub mode: ExecutionMode,
    /// Interpreted steps per [`Session::run`] call
    pub batch_size: usize,
    /// Run routines the compiler rejects interpreted instead of faulting
    pub fallback_to_interpreter: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            processor: ProcessorOptions::default(),
            mode: ExecutionMode::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            fallback_to_interpreter: true,
        }
    }
}

/// Observable session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Loaded, not yet run
    Ready,
    /// Between batches
    Running,
    /// Waiting for [`Session::provide_line_input`] or [`Session::provide_char_input`]
    AwaitingInput(InputRequest),
    /// The story quit
    Quit,
    /// An interrupt was observed
    Stopped,
    /// Execution failed; the session does not run again
    Faulted(VmError),
}

/// Result of one [`Session::run`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The batch ran out; call `run` again
    Yielded {
        /// Instructions executed in this batch
        executed: usize,
    },
    /// The story wants input
    AwaitingInput(InputRequest),
    /// The story quit
    Quit,
    /// Stopped by an interrupt
    Stopped,
    /// Execution failed
    Faulted(VmError),
}

enum Engine {
    Stepping,
    Native(Compiled),
}

/// A loaded story and the strategy running it.
pub struct Session {
    processor: Processor,
    engine: Engine,
    interrupt: Arc<AtomicBool>,
    state: SessionState,
    options: SessionOptions,
}

impl Session {
    /// Load a story image.
    pub fn new(image: Vec<u8>, options: SessionOptions) -> Result<Self, ExecError> {
        let processor = Processor::new(image, options.processor.clone())?;
        let interrupt = Arc::new(AtomicBool::new(false));
        let engine = match options.mode {
            ExecutionMode::Interpreted => Engine::Stepping,
            ExecutionMode::Compiled => Engine::Native(Compiled::new(JitRuntime::new(
                options.fallback_to_interpreter,
                Arc::clone(&interrupt),
            )?)),
        };
        tracing::debug!(mode = %options.mode, batch_size = options.batch_size, "session created");
        Ok(Self {
            processor,
            engine,
            interrupt,
            state: SessionState::Ready,
            options,
        })
    }

    /// Options the session was created with.
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Execution strategy.
    pub fn mode(&self) -> ExecutionMode {
        self.options.mode
    }

    /// Current state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The processor.
    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    /// The processor, mutably.
    pub fn processor_mut(&mut self) -> &mut Processor {
        &mut self.processor
    }

    /// Compiled-code counters, when running compiled.
    pub fn jit_stats(&self) -> Option<JitRuntimeStats> {
        match &self.engine {
            Engine::Stepping => None,
            Engine::Native(compiled) => Some(compiled.stats()),
        }
    }

    /// Shared interrupt flag, for setting from another thread or a signal
    /// handler.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Request a stop at the next check.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::Relaxed);
    }

    /// True if a stop has been requested.
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    /// Clear the interrupt flag. An interpreted session stopped by it can
    /// run again; a compiled one cannot.
    pub fn clear_interrupt(&mut self) {
        self.interrupt.store(false, Ordering::Relaxed);
        if self.state == SessionState::Stopped && matches!(self.engine, Engine::Stepping) {
            self.transition(SessionState::Running);
        }
    }

    /// Answer an outstanding line-input request.
    pub fn provide_line_input(&mut self, line: &str) -> VmResult<()> {
        self.processor.provide_line_input(line)?;
        self.transition(SessionState::Running);
        Ok(())
    }

    /// Answer an outstanding character-input request.
    pub fn provide_char_input(&mut self, ch: char) -> VmResult<()> {
        self.processor.provide_char_input(ch)?;
        self.transition(SessionState::Running);
        Ok(())
    }

    /// Run one slice: a batch of interpreted steps, or the whole main
    /// routine when compiled.
    pub fn run(&mut self, host: &mut dyn Host) -> RunOutcome {
        match &self.state {
            SessionState::Ready | SessionState::Running => {}
            SessionState::AwaitingInput(request) => return RunOutcome::AwaitingInput(*request),
            SessionState::Quit => return RunOutcome::Quit,
            SessionState::Stopped => return RunOutcome::Stopped,
            SessionState::Faulted(error) => return RunOutcome::Faulted(error.clone()),
        }
        if self.is_interrupted() {
            return self.stop();
        }
        self.transition(SessionState::Running);
        match self.engine {
            Engine::Stepping => self.run_batch(host),
            Engine::Native(_) => self.run_main(host),
        }
    }

    fn run_batch(&mut self, host: &mut dyn Host) -> RunOutcome {
        let mut executed = 0;
        while executed < self.options.batch_size {
            if self.processor.state() != ProcessorState::Running {
                break;
            }
            if self.is_interrupted() {
                return self.stop();
            }
            if let Err(error) = self.processor.step(host) {
                return self.fault(error);
            }
            executed += 1;
        }
        match self.processor.state() {
            ProcessorState::Running => RunOutcome::Yielded { executed },
            ProcessorState::AwaitingInput(request) => {
                self.transition(SessionState::AwaitingInput(request));
                RunOutcome::AwaitingInput(request)
            }
            ProcessorState::Quit => self.finish(),
        }
    }

    fn run_main(&mut self, host: &mut dyn Host) -> RunOutcome {
        let Engine::Native(compiled) = &mut self.engine else {
            return self.run_batch(host);
        };
        let main = self.processor.header().main_routine_address();
        tracing::debug!(
            strategy = compiled.name(),
            main = format_args!("{main:#x}"),
            "entering main routine"
        );
        match compiled.execute(&mut self.processor, host, main, &[]) {
            Ok(_) => {
                self.processor.quit();
                self.finish()
            }
            Err(VmError::Interrupted) => self.stop(),
            Err(error) => self.fault(error),
        }
    }

    fn finish(&mut self) -> RunOutcome {
        self.transition(SessionState::Quit);
        RunOutcome::Quit
    }

    fn stop(&mut self) -> RunOutcome {
        self.transition(SessionState::Stopped);
        RunOutcome::Stopped
    }

    fn fault(&mut self, error: VmError) -> RunOutcome {
        tracing::warn!(%error, "session faulted");
        self.transition(SessionState::Faulted(error.clone()));
        RunOutcome::Faulted(error)
    }

    fn transition(&mut self, state: SessionState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "session state");
            self.state = state;
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("mode", &self.options.mode)
            .field("state", &self.state)
            .field("pc", &self.processor.pc())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_vm_bytecode::assembler::{global, small};
    use quill_vm_bytecode::{Assembler, Opcode, Variable};
    use quill_vm_core::BufferedHost;

    fn image(version: u8, body: impl FnOnce(&mut Assembler)) -> Vec<u8> {
        let mut asm = Assembler::new(version);
        asm.globals(&[]);
        let main = asm.routine(&[]);
        asm.set_main(main);
        body(&mut asm);
        asm.finish().unwrap()
    }

    /// Count global 0 up to 100, print it, quit.
    fn counting_story() -> Vec<u8> {
        image(5, |asm| {
            let top = asm.here();
            asm.op(Opcode::Inc, &[small(16)]);
            asm.op(Opcode::Jl, &[global(0), small(100)])
                .branch(true, top);
            asm.op(Opcode::PrintNum, &[global(0)]);
            asm.op(Opcode::Quit, &[]);
        })
    }

    fn session(image: Vec<u8>, mode: ExecutionMode, batch_size: usize) -> Session {
        let options = SessionOptions {
            mode,
            batch_size,
            processor: ProcessorOptions {
                random_seed: Some(1),
                ..ProcessorOptions::default()
            },
            ..SessionOptions::default()
        };
        Session::new(image, options).unwrap()
    }

    #[test]
    fn interpreted_session_yields_between_batches() {
        let mut session = session(counting_story(), ExecutionMode::Interpreted, 50);
        let mut host = BufferedHost::new();

        assert_eq!(session.run(&mut host), RunOutcome::Yielded { executed: 50 });
        assert_eq!(session.state(), &SessionState::Running);

        let mut outcome = session.run(&mut host);
        while let RunOutcome::Yielded { .. } = outcome {
            outcome = session.run(&mut host);
        }
        assert_eq!(outcome, RunOutcome::Quit);
        assert_eq!(host.take_output(), "100");
        assert_eq!(session.run(&mut host), RunOutcome::Quit);
    }

    #[test]
    fn compiled_session_runs_main_to_quit() {
        let mut session = session(counting_story(), ExecutionMode::Compiled, 50);
        let mut host = BufferedHost::new();
        assert_eq!(session.run(&mut host), RunOutcome::Quit);
        assert_eq!(host.take_output(), "100");
        assert_eq!(session.processor().read_global(0).unwrap(), 100);
        assert_eq!(session.jit_stats().map(|stats| stats.compiled), Some(1));
    }

    #[test]
    fn main_return_quits_in_both_modes() {
        for mode in [ExecutionMode::Interpreted, ExecutionMode::Compiled] {
            let story = image(5, |asm| {
                asm.op(Opcode::Rtrue, &[]);
            });
            let mut session = session(story, mode, 100);
            assert_eq!(session.run(&mut BufferedHost::new()), RunOutcome::Quit, "{mode}");
        }
    }

    #[test]
    fn input_suspends_and_resumes() {
        let story = image(5, |asm| {
            asm.op(Opcode::ReadChar, &[small(1)]).store(Variable::Global(0));
            asm.op(Opcode::PrintChar, &[global(0)]);
            asm.op(Opcode::Quit, &[]);
        });
        let mut session = session(story, ExecutionMode::Interpreted, 100);
        let mut host = BufferedHost::new();

        let outcome = session.run(&mut host);
        assert!(matches!(
            outcome,
            RunOutcome::AwaitingInput(InputRequest::Char { .. })
        ));
        assert_eq!(session.run(&mut host), outcome);

        session.provide_char_input('z').unwrap();
        assert_eq!(session.run(&mut host), RunOutcome::Quit);
        assert_eq!(host.take_output(), "z");
    }

    #[test]
    fn interrupt_stops_and_resumes_interpreted() {
        let mut session = session(counting_story(), ExecutionMode::Interpreted, 10);
        let mut host = BufferedHost::new();
        session.run(&mut host);
        session.interrupt_handle().store(true, Ordering::Relaxed);
        assert_eq!(session.run(&mut host), RunOutcome::Stopped);
        assert_eq!(session.run(&mut host), RunOutcome::Stopped);

        session.clear_interrupt();
        assert_eq!(session.state(), &SessionState::Running);
        assert!(matches!(session.run(&mut host), RunOutcome::Yielded { .. }));
    }

    #[test]
    fn compiled_interrupt_is_final() {
        let mut session = session(counting_story(), ExecutionMode::Compiled, 10);
        session.interrupt();
        let mut host = BufferedHost::new();
        assert_eq!(session.run(&mut host), RunOutcome::Stopped);
        session.clear_interrupt();
        assert_eq!(session.state(), &SessionState::Stopped);
        assert_eq!(session.run(&mut host), RunOutcome::Stopped);
    }

    #[test]
    fn faults_are_reported_with_the_instruction() {
        for mode in [ExecutionMode::Interpreted, ExecutionMode::Compiled] {
            let story = image(5, |asm| {
                asm.op(Opcode::Div, &[small(1), small(0)])
                    .store(Variable::Global(0));
                asm.op(Opcode::Quit, &[]);
            });
            let mut session = session(story, mode, 100);
            let mut host = BufferedHost::new();
            let RunOutcome::Faulted(error) = session.run(&mut host) else {
                panic!("{mode} session should fault");
            };
            assert_eq!(error.root(), &VmError::DivisionByZero);
            assert!(matches!(session.state(), SessionState::Faulted(_)));
            assert_eq!(session.run(&mut host), RunOutcome::Faulted(error));
        }
    }
}
