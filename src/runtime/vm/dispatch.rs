use crate::{
    bytecode::{disassembler, op_code::OpCode},
    runtime::{
        gc::GcHandle,
        object::{Closure, HeapObject, Upvalue},
        table::Table,
        value::Value,
        ExitCode,
    },
};

use super::VM;

impl VM {
    pub(super) fn run(&mut self) -> ExitCode {
        match self.run_inner() {
            Ok(value) => {
                self.return_value = value;
                ExitCode::Success
            }
            Err(message) => {
                let formatted = self.format_runtime_error(&message);
                self.last_error = Some(formatted.clone());
                (self.on_error)(self, &formatted);
                ExitCode::RuntimeError
            }
        }
    }

    /// The fetch-decode-execute loop. Runs until frame zero returns; the
    /// first error aborts execution with the frame stack intact so the
    /// caller can format a trace.
    fn run_inner(&mut self) -> Result<Value, String> {
        loop {
            if self.trace {
                self.trace_instruction();
            }
            let op = OpCode::from(self.fetch_byte());
            match op {
                OpCode::OpLoadConst => {
                    let constant = self.read_constant();
                    self.push(constant)?;
                }
                OpCode::OpLoadNil => self.push(Value::Nil)?,
                OpCode::OpPop => {
                    self.pop();
                }

                OpCode::OpAdd | OpCode::OpSub | OpCode::OpMult | OpCode::OpDiv
                | OpCode::OpMod => self.binary_arith(op)?,
                OpCode::OpLshift | OpCode::OpRshift | OpCode::OpBand | OpCode::OpBor => {
                    self.binary_bitwise(op)?
                }
                OpCode::OpGt | OpCode::OpLt | OpCode::OpGte | OpCode::OpLte => {
                    self.binary_compare(op)?
                }

                OpCode::OpEq => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b))?;
                }
                OpCode::OpNeq => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a != b))?;
                }

                OpCode::OpNegate => {
                    let operand = self.peek(0);
                    match operand {
                        Value::Num(n) => self.set_top(Value::Num(-n)),
                        _ => {
                            return Err(format!(
                                "Cannot use operator '-' on type '{}'.",
                                self.heap.type_name(operand)
                            ))
                        }
                    }
                }
                OpCode::OpLnot => {
                    let operand = self.pop();
                    self.push(Value::Bool(!operand.is_truthy()))?;
                }

                OpCode::OpConcat => self.concat()?,

                OpCode::OpJmp => {
                    let offset = self.fetch_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::OpJmpBack => {
                    let offset = self.fetch_u16() as usize;
                    self.frame_mut().ip -= offset;
                }
                OpCode::OpJmpIfTrueOrPop => {
                    let offset = self.fetch_u16() as usize;
                    if self.peek(0).is_truthy() {
                        self.frame_mut().ip += offset;
                    } else {
                        self.pop();
                    }
                }
                OpCode::OpJmpIfFalseOrPop => {
                    let offset = self.fetch_u16() as usize;
                    if self.peek(0).is_truthy() {
                        self.pop();
                    } else {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::OpPopJmpIfFalse => {
                    let offset = self.fetch_u16() as usize;
                    if !self.peek(0).is_truthy() {
                        self.frame_mut().ip += offset;
                    }
                    self.pop();
                }

                OpCode::OpGetVar => {
                    let index = self.fetch_byte() as usize;
                    let value = self.stack[self.frame().base + index];
                    self.push(value)?;
                }
                OpCode::OpSetVar => {
                    let index = self.fetch_byte() as usize;
                    let slot = self.frame().base + index;
                    self.stack[slot] = self.peek(0);
                }

                OpCode::OpGetUpval => {
                    let index = self.fetch_byte() as usize;
                    let upval = self.current_upval(index);
                    let value = match self.heap.upvalue(upval) {
                        Upvalue::Open(slot) => self.stack[*slot],
                        Upvalue::Closed(value) => *value,
                    };
                    self.push(value)?;
                }
                OpCode::OpSetUpval => {
                    let index = self.fetch_byte() as usize;
                    let upval = self.current_upval(index);
                    let value = self.peek(0);
                    match self.heap.upvalue_mut(upval) {
                        Upvalue::Open(slot) => {
                            let slot = *slot;
                            self.stack[slot] = value;
                        }
                        Upvalue::Closed(cell) => *cell = value,
                    }
                }
                OpCode::OpCloseUpval => {
                    self.close_upvalues_upto(self.sp - 1);
                    self.pop();
                }

                OpCode::OpGetGlobal => {
                    let name = self.read_constant();
                    let hash = self.heap.value_hash(name);
                    let value = self.globals.get(name, hash);
                    self.push(value)?;
                }
                OpCode::OpSetGlobal => {
                    let name = self.read_constant();
                    let hash = self.heap.value_hash(name);
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                }

                OpCode::OpNewTable => {
                    let handle = self.make(HeapObject::Table(Table::new()));
                    self.push(Value::Object(handle))?;
                }
                OpCode::OpTableAddField => {
                    let value = self.pop();
                    let key = self.pop();
                    let table = self.as_table(self.peek(0))?;
                    self.check_table_key(key)?;
                    self.table_set_value(table, key, value);
                }
                OpCode::OpTableSet => {
                    let key = self.read_constant();
                    let value = self.pop();
                    let table = self.as_table(self.peek(0))?;
                    self.table_set_value(table, key, value);
                    self.set_top(value);
                }
                OpCode::OpTableGet => {
                    let key = self.read_constant();
                    let table = self.as_table(self.peek(0))?;
                    let value = self.table_get_value(table, key);
                    self.set_top(value);
                }
                OpCode::OpTableGetNoPop => {
                    let key = self.read_constant();
                    let table = self.as_table(self.peek(0))?;
                    let value = self.table_get_value(table, key);
                    self.push(value)?;
                }
                OpCode::OpIndexSet => {
                    let value = self.pop();
                    let key = self.pop();
                    let table = self.as_table(self.peek(0))?;
                    self.check_table_key(key)?;
                    self.table_set_value(table, key, value);
                    self.set_top(value);
                }
                OpCode::OpIndex => {
                    let key = self.pop();
                    let table = self.as_table(self.peek(0))?;
                    self.check_table_key(key)?;
                    let value = self.table_get_value(table, key);
                    self.set_top(value);
                }
                OpCode::OpIndexNoPop => {
                    let key = self.peek(0);
                    let table = self.as_table(self.peek(1))?;
                    self.check_table_key(key)?;
                    let value = self.table_get_value(table, key);
                    self.push(value)?;
                }

                OpCode::OpCallFunc => {
                    let argc = self.fetch_byte() as usize;
                    let callee = self.peek(argc);
                    self.call_value(callee, argc)?;
                }
                OpCode::OpReturnVal => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("return with no active frame");
                    self.close_upvalues_upto(frame.base);
                    self.sp = frame.base;
                    if self.frames.is_empty() {
                        return Ok(result);
                    }
                    self.push(result)?;
                }

                OpCode::OpMakeFunc => self.make_func()?,
            }
        }
    }

    fn binary_arith(&mut self, op: OpCode) -> Result<(), String> {
        let b = self.peek(0);
        let a = self.peek(1);
        if let (Value::Num(x), Value::Num(y)) = (a, b) {
            if let OpCode::OpDiv = op {
                if y == 0.0 {
                    return Err("Attempt to divide by 0.".to_string());
                }
            }
            let result = match op {
                OpCode::OpAdd => x + y,
                OpCode::OpSub => x - y,
                OpCode::OpMult => x * y,
                OpCode::OpDiv => x / y,
                OpCode::OpMod => x % y,
                _ => unreachable!("not an arithmetic opcode"),
            };
            self.sp -= 1;
            self.set_top(Value::Num(result));
            Ok(())
        } else {
            Err(self.binop_error(op_symbol(op), a, b))
        }
    }

    /// Bitwise operators truncate both operands to 64-bit signed integers;
    /// shift counts wrap modulo 64.
    fn binary_bitwise(&mut self, op: OpCode) -> Result<(), String> {
        let b = self.peek(0);
        let a = self.peek(1);
        if let (Value::Num(x), Value::Num(y)) = (a, b) {
            let xi = x as i64;
            let yi = y as i64;
            let result = match op {
                OpCode::OpLshift => xi.wrapping_shl(yi as u32),
                OpCode::OpRshift => xi.wrapping_shr(yi as u32),
                OpCode::OpBand => xi & yi,
                OpCode::OpBor => xi | yi,
                _ => unreachable!("not a bitwise opcode"),
            };
            self.sp -= 1;
            self.set_top(Value::Num(result as f64));
            Ok(())
        } else {
            Err(self.binop_error(op_symbol(op), a, b))
        }
    }

    fn binary_compare(&mut self, op: OpCode) -> Result<(), String> {
        let b = self.pop();
        let a = self.pop();
        if let (Value::Num(x), Value::Num(y)) = (a, b) {
            let result = match op {
                OpCode::OpGt => x > y,
                OpCode::OpLt => x < y,
                OpCode::OpGte => x >= y,
                OpCode::OpLte => x <= y,
                _ => unreachable!("not a comparison opcode"),
            };
            self.push(Value::Bool(result))
        } else {
            Err(self.binop_error(op_symbol(op), a, b))
        }
    }

    /// String concatenation. Both operands stay on the stack until the
    /// interned result exists, so a collection triggered by the allocation
    /// cannot free them.
    fn concat(&mut self) -> Result<(), String> {
        let b = self.peek(0);
        let a = self.peek(1);
        let combined = match (a, b) {
            (Value::Object(ha), Value::Object(hb)) => {
                match (self.heap.get(ha), self.heap.get(hb)) {
                    (HeapObject::Str(left), HeapObject::Str(right)) => {
                        let mut buf =
                            String::with_capacity(left.chars.len() + right.chars.len());
                        buf.push_str(&left.chars);
                        buf.push_str(&right.chars);
                        buf
                    }
                    _ => return Err(self.binop_error("..", a, b)),
                }
            }
            _ => return Err(self.binop_error("..", a, b)),
        };
        let interned = self.intern(&combined);
        self.sp -= 1;
        self.set_top(Value::Object(interned));
        Ok(())
    }

    fn make_func(&mut self) -> Result<(), String> {
        let constant = self.read_constant();
        let code_block = match constant {
            Value::Object(handle) => handle,
            _ => return Err("make_func operand is not a codeblock".to_string()),
        };
        let num_upvals = self.fetch_byte() as usize;

        // Push the closure before capturing so every upvalue allocation
        // sees it as a root.
        let closure = self.make(HeapObject::Closure(Closure {
            code_block,
            upvals: vec![None; num_upvals],
        }));
        self.push(Value::Object(closure))?;

        for i in 0..num_upvals {
            let is_local = self.fetch_byte() != 0;
            let index = self.fetch_byte() as usize;
            let upval = if is_local {
                let slot = self.frame().base + index;
                self.capture_upvalue(slot)
            } else {
                self.current_upval(index)
            };
            self.heap.closure_mut(closure).upvals[i] = Some(upval);
        }
        Ok(())
    }

    pub(super) fn current_upval(&self, index: usize) -> GcHandle {
        let closure = self.frame().closure;
        self.heap.closure(closure).upvals[index].expect("upvalue read before capture")
    }

    fn as_table(&self, value: Value) -> Result<GcHandle, String> {
        if let Value::Object(handle) = value {
            if let HeapObject::Table(_) = self.heap.get(handle) {
                return Ok(handle);
            }
        }
        Err(format!(
            "Attempt to index a {} value.",
            self.heap.type_name(value)
        ))
    }

    fn check_table_key(&self, key: Value) -> Result<(), String> {
        match key {
            Value::Nil | Value::Undefined => Err("Table key cannot be nil.".to_string()),
            _ => Ok(()),
        }
    }

    fn table_set_value(&mut self, table: GcHandle, key: Value, value: Value) {
        let hash = self.heap.value_hash(key);
        self.heap.table_mut(table).set(key, hash, value);
    }

    fn table_get_value(&self, table: GcHandle, key: Value) -> Value {
        let hash = self.heap.value_hash(key);
        self.heap.table(table).get(key, hash)
    }

    fn binop_error(&self, symbol: &str, a: Value, b: Value) -> String {
        format!(
            "Cannot use operator '{}' on operands of type '{}' and '{}'.",
            symbol,
            self.heap.type_name(a),
            self.heap.type_name(b)
        )
    }

    fn trace_instruction(&self) {
        let frame = self.frame();
        let block = &self.heap.code_block(frame.code_block).block;
        if frame.ip >= block.code.len() {
            return;
        }
        let mut line = String::new();
        disassembler::write_instruction(&self.heap, block, frame.ip, &mut line);
        println!("{}", line);
        let items: Vec<String> = self.stack[..self.sp]
            .iter()
            .map(|v| self.heap.display(*v))
            .collect();
        println!("          stack: [{}]", items.join(", "));
    }
}

fn op_symbol(op: OpCode) -> &'static str {
    match op {
        OpCode::OpAdd => "+",
        OpCode::OpSub => "-",
        OpCode::OpMult => "*",
        OpCode::OpDiv => "/",
        OpCode::OpMod => "%",
        OpCode::OpLshift => "<<",
        OpCode::OpRshift => ">>",
        OpCode::OpBand => "&",
        OpCode::OpBor => "|",
        OpCode::OpGt => ">",
        OpCode::OpLt => "<",
        OpCode::OpGte => ">=",
        OpCode::OpLte => "<=",
        _ => "?",
    }
}
