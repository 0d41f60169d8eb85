//! The two ways of running a routine.

use std::fmt;
use std::str::FromStr;

use quill_vm_core::{Host, Processor, VmResult};
use serde::{Deserialize, Serialize};

use crate::jit_runtime::{JitRuntime, JitRuntimeStats};

/// Runs a routine to completion against a processor.
///
/// Both implementations observe and leave the same memory, stack and
/// return value for the same routine and starting state.
pub trait Executable {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Run the routine at unpacked `address` with `args`. Returns `None`
    /// if the story quit before the routine returned.
    fn execute(
        &mut self,
        processor: &mut Processor,
        host: &mut dyn Host,
        address: u32,
        args: &[u16],
    ) -> VmResult<Option<u16>>;
}

/// Steps the processor through the routine.
#[derive(Debug, Default, Clone, Copy)]
pub struct Interpreted;

impl Executable for Interpreted {
    fn name(&self) -> &'static str {
        "interpreted"
    }

    fn execute(
        &mut self,
        processor: &mut Processor,
        host: &mut dyn Host,
        address: u32,
        args: &[u16],
    ) -> VmResult<Option<u16>> {
        processor.run_routine(host, address, args)
    }
}

/// Compiles the routine with Cranelift on first call and runs native code.
#[derive(Debug)]
pub struct Compiled {
    runtime: JitRuntime,
}

impl Compiled {
    /// Wrap a runtime.
    pub fn new(runtime: JitRuntime) -> Self {
        Self { runtime }
    }

    /// The underlying runtime.
    pub fn runtime(&self) -> &JitRuntime {
        &self.runtime
    }

    /// Runtime counters.
    pub fn stats(&self) -> JitRuntimeStats {
        self.runtime.stats()
    }
}

impl Executable for Compiled {
    fn name(&self) -> &'static str {
        "compiled"
    }

    fn execute(
        &mut self,
        processor: &mut Processor,
        host: &mut dyn Host,
        address: u32,
        args: &[u16],
    ) -> VmResult<Option<u16>> {
        self.runtime.invoke(processor, host, address, args)
    }
}

/// Which [`Executable`] a session uses
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// [`Interpreted`]
    #[default]
    Interpreted,
    /// [`Compiled`]
    Compiled,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionMode::Interpreted => "interpreted",
            ExecutionMode::Compiled => "compiled",
        })
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "interpreted" | "interpreter" => Ok(ExecutionMode::Interpreted),
            "compiled" | "jit" => Ok(ExecutionMode::Compiled),
            other => Err(format!(
                "unknown execution mode '{other}' (expected 'interpreted' or 'compiled')"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_aliases() {
        assert_eq!("JIT".parse::<ExecutionMode>(), Ok(ExecutionMode::Compiled));
        assert_eq!(
            "interpreter".parse::<ExecutionMode>(),
            Ok(ExecutionMode::Interpreted)
        );
        assert!("native".parse::<ExecutionMode>().is_err());
        assert_eq!(ExecutionMode::Compiled.to_string(), "compiled");
    }
}
