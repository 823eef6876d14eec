use crate::{
    frontend::compiler,
    runtime::{
        frame::Frame,
        gc::{GcHandle, Heap},
        object::{hash_str, Closure, HeapObject, NativeClosure, Str},
        table::Table,
        value::Value,
        ErrorFn, ExitCode, NativeFn,
    },
};

mod calls;
mod dispatch;
mod upvalues;

/// Maximum call nesting depth.
pub const FRAMES_MAX: usize = 1024;
/// Value-stack capacity. The stack is allocated once and never resized, so
/// slot indices held by open upvalues stay stable.
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// The Ember virtual machine.
///
/// Owns the value stack, the call-frame stack, the garbage-collected heap,
/// the global-variable table, the string intern pool, and the list of open
/// upvalues. One instance runs one script at a time, single-threaded.
pub struct VM {
    stack: Vec<Value>,
    /// Always the first free slot; `sp - 1` is the top of the stack.
    sp: usize,
    frames: Vec<Frame>,
    pub(crate) heap: Heap,
    globals: Table,
    /// String intern pool: every live string is a key here, mapping to
    /// `true`. Keys are strong roots, so interned strings live until the
    /// VM is dropped.
    interned: Table,
    /// Open upvalues ordered ascending by stack slot; the deepest is last.
    open_upvalues: Vec<GcHandle>,
    /// The script's result after a successful run.
    pub return_value: Value,
    on_error: ErrorFn,
    last_error: Option<String>,
    trace: bool,
}

fn default_error_handler(_vm: &VM, message: &str) {
    eprintln!("{}", message);
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

impl VM {
    pub fn new() -> Self {
        Self {
            stack: vec![Value::Nil; STACK_MAX],
            sp: 0,
            frames: Vec::new(),
            heap: Heap::new(),
            globals: Table::new(),
            interned: Table::new(),
            open_upvalues: Vec::new(),
            return_value: Value::Nil,
            on_error: default_error_handler,
            last_error: None,
            trace: false,
        }
    }

    /// Compiles and runs a source string. On failure the error handler has
    /// already been invoked with the formatted message.
    pub fn interpret(&mut self, source: &str) -> ExitCode {
        self.last_error = None;
        let code_block = match compiler::compile(self, source) {
            Ok(handle) => handle,
            Err(err) => {
                let message = format!("[line {}]: {}", err.line, err.message);
                self.last_error = Some(message.clone());
                (self.on_error)(self, &message);
                return ExitCode::CompileError;
            }
        };
        self.execute_block(code_block)
    }

    /// Wraps a compiled top-level block in a closure, installs it as frame
    /// zero, and enters the dispatch loop. Takes over one protection of
    /// `code_block` and releases it once the block is rooted.
    pub(crate) fn execute_block(&mut self, code_block: GcHandle) -> ExitCode {
        self.sp = 0;
        self.frames.clear();
        self.open_upvalues.clear();
        self.return_value = Value::Nil;

        let closure = self.make(HeapObject::Closure(Closure {
            code_block,
            upvals: Vec::new(),
        }));
        self.heap.unprotect(code_block);
        self.stack[0] = Value::Object(closure);
        self.sp = 1;
        self.frames.push(Frame::new(closure, code_block, 0));
        self.run()
    }

    /// Registers a host function under a global name.
    pub fn register_native(&mut self, name: &str, func: NativeFn) {
        let name_handle = self.intern(name);
        let native = self.make(HeapObject::NativeClosure(NativeClosure {
            name: name_handle,
            func,
        }));
        let key = Value::Object(name_handle);
        let hash = self.heap.value_hash(key);
        self.globals.set(key, hash, Value::Object(native));
    }

    pub fn set_error_handler(&mut self, handler: ErrorFn) {
        self.on_error = handler;
    }

    /// Enables per-instruction disassembly and stack dumps on stdout.
    pub fn set_trace(&mut self, enabled: bool) {
        self.trace = enabled;
    }

    pub fn set_gc_enabled(&mut self, enabled: bool) {
        self.heap.set_enabled(enabled);
    }

    pub fn set_gc_threshold(&mut self, threshold: usize) {
        self.heap.set_next_gc(threshold);
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Current value-stack height; useful to embedders and tests probing
    /// stack discipline from inside a native.
    pub fn stack_depth(&self) -> usize {
        self.sp
    }

    /// The formatted message of the most recent compile or runtime error.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Arguments of the native call currently on top of the stack.
    pub fn native_args(&self, argc: usize) -> &[Value] {
        &self.stack[self.sp - argc..self.sp]
    }

    /// Returns the interned string for `chars`, allocating it on first use.
    /// Equal contents always yield the same handle.
    pub fn intern(&mut self, chars: &str) -> GcHandle {
        let hash = hash_str(chars);
        if let Some(handle) = self.interned.find_string(&self.heap, chars, hash) {
            return handle;
        }
        let handle = self.make(HeapObject::Str(Str {
            chars: chars.into(),
            hash,
        }));
        self.interned.set(Value::Object(handle), hash, Value::Bool(true));
        handle
    }

    /// The only allocation path: collects first if the budget is spent,
    /// then allocates. The caller must root the result (stack, a table,
    /// [`VM::gc_protect`]) before anything else can allocate.
    pub fn make(&mut self, object: HeapObject) -> GcHandle {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.alloc(object)
    }

    /// Protects an object from collection across a multi-step construction.
    pub fn gc_protect(&mut self, handle: GcHandle) {
        self.heap.protect(handle);
    }

    pub fn gc_unprotect(&mut self, handle: GcHandle) {
        self.heap.unprotect(handle);
    }

    /// Forces a full collection cycle; embedders can call this at quiet
    /// points to shed garbage without waiting for the byte budget.
    pub fn run_gc(&mut self) {
        self.collect_garbage();
    }

    fn collect_garbage(&mut self) {
        self.heap.collect(
            &self.stack[..self.sp],
            &self.frames,
            &self.open_upvalues,
            &self.globals,
            &self.interned,
            &self.return_value,
        );
    }

    #[inline]
    fn push(&mut self, value: Value) -> Result<(), String> {
        if self.sp >= STACK_MAX {
            return Err("Stack overflow.".to_string());
        }
        self.stack[self.sp] = value;
        self.sp += 1;
        Ok(())
    }

    #[inline]
    fn pop(&mut self) -> Value {
        debug_assert!(self.sp > 0, "pop from empty stack");
        self.sp -= 1;
        self.stack[self.sp]
    }

    /// `peek(0)` is the top of the stack.
    #[inline]
    fn peek(&self, depth: usize) -> Value {
        self.stack[self.sp - 1 - depth]
    }

    #[inline]
    fn set_top(&mut self, value: Value) {
        self.stack[self.sp - 1] = value;
    }

    fn frame(&self) -> &Frame {
        self.frames.last().expect("no active frame")
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    #[inline]
    fn fetch_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active frame");
        let block = &self.heap.code_block(frame.code_block).block;
        let byte = block.code[frame.ip];
        frame.ip += 1;
        byte
    }

    #[inline]
    fn fetch_u16(&mut self) -> u16 {
        let hi = self.fetch_byte() as u16;
        let lo = self.fetch_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let index = self.fetch_byte() as usize;
        self.heap.code_block(self.frame().code_block).block.constants[index]
    }

    fn current_line(&self) -> u32 {
        match self.frames.last() {
            Some(frame) => self
                .heap
                .code_block(frame.code_block)
                .block
                .line_at(frame.ip.saturating_sub(1)),
            None => 0,
        }
    }

    /// Formats a runtime error: the offending source line, the message, and
    /// one stack-trace entry per active frame, innermost first.
    fn format_runtime_error(&self, message: &str) -> String {
        let mut out = format!("[line {}]: {}\n", self.current_line(), message);
        out.push_str("stack trace:\n");
        for (depth, frame) in self.frames.iter().enumerate().rev() {
            let code_block = self.heap.code_block(frame.code_block);
            let line = code_block.block.line_at(frame.ip.saturating_sub(1));
            let name = self.heap.str_contents(code_block.name);
            if depth == 0 {
                out.push_str(&format!("\t[line {}] in {}\n", line, name));
            } else {
                out.push_str(&format!("\t[line {}] in function {}.\n", line, name));
            }
        }
        out
    }
}

#[cfg(test)]
mod dispatch_test;
