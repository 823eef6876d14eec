//! Runtime core: values, heap objects, the garbage-collected heap, and the
//! bytecode virtual machine.

use crate::runtime::{value::Value, vm::VM};

pub mod frame;
pub mod gc;
pub mod object;
pub mod stdlib;
pub mod table;
pub mod value;
pub mod vm;

/// Host function callable from scripts. On entry the arguments sit at
/// `sp - argc .. sp` (see [`VM::native_args`]); the returned value replaces
/// the callee and arguments on the stack. An `Err` unwinds through the
/// dispatch loop as a runtime error.
pub type NativeFn = fn(&mut VM, usize) -> Result<Value, String>;

/// Error-reporting callback, invoked with the fully formatted message.
pub type ErrorFn = fn(&VM, &str);

/// Result of running a chunk of source through the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    CompileError,
    RuntimeError,
}
