//! Per-routine compile statistics

use std::time::Duration;

use serde::Serialize;

/// What one compile produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompileStatistics {
    /// Routine header address
    pub address: u32,
    /// Machine code bytes
    pub code_size: usize,
    /// Z-machine instructions translated
    pub instructions: usize,
    /// Cranelift IR instructions emitted
    pub operations: usize,
    /// Local variable slots
    pub locals: u8,
    /// Wall time spent translating and emitting
    pub elapsed: Duration,
    /// Variable reads whose index was only known at run time
    pub calculated_loads: u32,
    /// Variable writes whose index was only known at run time
    pub calculated_stores: u32,
    /// Touches the evaluation stack
    pub uses_stack: bool,
    /// Touches globals or memory tables
    pub uses_memory: bool,
    /// Prints or reads input
    pub uses_screen: bool,
    /// Selects output or input streams
    pub uses_streams: bool,
}

impl std::fmt::Display for CompileStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:05x}: {} instr -> {} ops, {} bytes, {} locals, {:?}",
            self.address,
            self.instructions,
            self.operations,
            self.code_size,
            self.locals,
            self.elapsed
        )?;
        if self.calculated_loads + self.calculated_stores > 0 {
            write!(
                f,
                ", computed vars {}r/{}w",
                self.calculated_loads, self.calculated_stores
            )?;
        }
        Ok(())
    }
}
