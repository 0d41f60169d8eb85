use quill_vm_core::VmError;
use quill_vm_jit::JitError;
use thiserror::Error;

/// Errors raised while setting up execution
#[derive(Debug, Error)]
pub enum ExecError {
    /// Story could not be loaded or started
    #[error(transparent)]
    Vm(#[from] VmError),

    /// Code generator could not be initialised
    #[error(transparent)]
    Jit(#[from] JitError),
}
