//! Base library natives registered by [`VM::load_stdlib`].

use std::time::{SystemTime, UNIX_EPOCH};

use crate::runtime::{value::Value, vm::VM};

impl VM {
    /// Registers the base library: `print` and `clock`.
    pub fn load_stdlib(&mut self) {
        self.register_native("print", print);
        self.register_native("clock", clock);
    }
}

/// `print(...)` writes the display form of every argument to stdout,
/// tab-separated and newline-terminated. Returns `nil`.
fn print(vm: &mut VM, argc: usize) -> Result<Value, String> {
    let mut out = String::new();
    for (i, value) in vm.native_args(argc).iter().enumerate() {
        if i > 0 {
            out.push('\t');
        }
        out.push_str(&vm.heap().display(*value));
    }
    println!("{}", out);
    Ok(Value::Nil)
}

/// `clock()` returns wall-clock seconds as a number; useful for timing
/// scripts.
fn clock(_vm: &mut VM, _argc: usize) -> Result<Value, String> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    Ok(Value::Num(seconds))
}
