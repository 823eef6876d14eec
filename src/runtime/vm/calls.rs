use crate::runtime::{frame::Frame, gc::GcHandle, object::HeapObject, value::Value};

use super::{FRAMES_MAX, VM};

impl VM {
    /// Invokes the value at `sp - argc - 1` with `argc` arguments on top of
    /// it. Closures get a fresh frame; natives run to completion on the
    /// spot and their result replaces the callee and arguments.
    pub(super) fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), String> {
        if let Value::Object(handle) = callee {
            match self.heap.get(handle) {
                HeapObject::Closure(_) => return self.call_closure(handle, argc),
                HeapObject::NativeClosure(_) => return self.call_native(handle, argc),
                _ => {}
            }
        }
        Err(format!(
            "Attempt to call a {} value.",
            self.heap.type_name(callee)
        ))
    }

    fn call_closure(&mut self, closure: GcHandle, argc: usize) -> Result<(), String> {
        let code_block = self.heap.closure(closure).code_block;
        let want = self.heap.code_block(code_block).num_params as usize;

        // Missing arguments are replaced with nil, extras are dropped.
        let mut argc = argc;
        while argc < want {
            self.push(Value::Nil)?;
            argc += 1;
        }
        while argc > want {
            self.pop();
            argc -= 1;
        }

        if self.frames.len() == FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }
        let base = self.sp - argc - 1;
        self.frames.push(Frame::new(closure, code_block, base));
        Ok(())
    }

    fn call_native(&mut self, native: GcHandle, argc: usize) -> Result<(), String> {
        let func = match self.heap.get(native) {
            HeapObject::NativeClosure(nc) => nc.func,
            _ => unreachable!("call_native on a non-native object"),
        };
        let result = func(self, argc)?;
        self.sp -= argc + 1;
        self.push(result)
    }
}
