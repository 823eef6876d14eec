use crate::{
    bytecode::{block::Block, op_code::OpCode},
    frontend::{
        ast::{BinOp, Expr, FnDef, LogicalOp, Stmt, TableKey, UnaryOp},
        parser::Parser,
        CompileError,
    },
    runtime::{
        gc::GcHandle,
        object::{CodeBlock, HeapObject},
        value::Value,
        vm::VM,
    },
};

const MAX_LOCALS: usize = 256;
const MAX_UPVALS: usize = 256;

/// Compiles a source string into a top-level code block.
///
/// The returned block is protected from the collector; the caller releases
/// the protection once the block is reachable from a root (the VM does this
/// when it wraps the block in the script closure).
pub fn compile(vm: &mut VM, source: &str) -> Result<GcHandle, CompileError> {
    let mut parser = Parser::new(source)?;
    let program = parser.parse_program()?;
    Compiler::new(vm).compile_program(&program)
}

#[derive(Debug)]
struct Local {
    name: String,
    /// Scope depth, or -1 while the initializer is still being compiled.
    depth: i32,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalDesc {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state. Nested function expressions push a new
/// state; the enclosing states are what upvalue resolution walks.
struct FnState {
    block: Block,
    name: String,
    num_params: u8,
    locals: Vec<Local>,
    upvals: Vec<UpvalDesc>,
    scope_depth: i32,
}

struct Compiler<'vm> {
    vm: &'vm mut VM,
    states: Vec<FnState>,
    /// Code blocks created during this compile; they are unreachable from
    /// VM roots until compilation finishes, so each is registered as an
    /// extra GC root until then.
    protected: Vec<GcHandle>,
    line: u32,
}

fn err_at(line: u32, message: impl Into<String>) -> CompileError {
    CompileError {
        message: message.into(),
        line,
    }
}

impl<'vm> Compiler<'vm> {
    fn new(vm: &'vm mut VM) -> Self {
        Self {
            vm,
            states: Vec::new(),
            protected: Vec::new(),
            line: 1,
        }
    }

    fn compile_program(mut self, program: &[Stmt]) -> Result<GcHandle, CompileError> {
        let result = self.run_compile(program);

        // On success every nested block is reachable through the script
        // block's constant pools, so only the script block itself stays
        // protected. On failure nothing survives.
        let keep = result.as_ref().ok().copied();
        for handle in self.protected.iter().copied() {
            if Some(handle) != keep {
                self.vm.gc_unprotect(handle);
            }
        }
        result
    }

    fn run_compile(&mut self, program: &[Stmt]) -> Result<GcHandle, CompileError> {
        self.begin_function("<script>", &[])?;
        for stmt in program {
            self.statement(stmt)?;
        }
        let (code_block, _) = self.end_function();
        Ok(code_block)
    }

    // --- Function states and scopes ---

    fn begin_function(&mut self, name: &str, params: &[String]) -> Result<(), CompileError> {
        self.states.push(FnState {
            block: Block::new(),
            name: name.to_string(),
            num_params: params.len() as u8,
            // Slot 0 belongs to the callee closure.
            locals: vec![Local {
                name: String::new(),
                depth: 0,
                is_captured: false,
            }],
            upvals: Vec::new(),
            scope_depth: 0,
        });
        self.begin_scope();
        for param in params {
            self.declare_local(param)?;
            self.mark_initialized();
        }
        Ok(())
    }

    /// Seals the current function: emits the implicit `return nil`, creates
    /// the code block object, and protects it for the rest of the compile.
    fn end_function(&mut self) -> (GcHandle, Vec<UpvalDesc>) {
        self.emit_op(OpCode::OpLoadNil);
        self.emit_op(OpCode::OpReturnVal);

        let state = self.states.pop().expect("no function state to end");
        let name = self.vm.intern(&state.name);
        let code_block = self.vm.make(HeapObject::CodeBlock(CodeBlock {
            name,
            num_params: state.num_params,
            num_upvals: state.upvals.len() as u8,
            block: state.block,
        }));
        self.vm.gc_protect(code_block);
        self.protected.push(code_block);
        (code_block, state.upvals)
    }

    fn state(&mut self) -> &mut FnState {
        self.states.last_mut().expect("no active function state")
    }

    fn begin_scope(&mut self) {
        self.state().scope_depth += 1;
    }

    /// Drops the scope's locals: plain locals are popped, captured ones are
    /// closed so their upvalues outlive the slots.
    fn end_scope(&mut self) {
        let state = self.state();
        state.scope_depth -= 1;
        let mut dropped = Vec::new();
        while let Some(local) = state.locals.last() {
            if local.depth <= state.scope_depth {
                break;
            }
            dropped.push(local.is_captured);
            state.locals.pop();
        }
        for is_captured in dropped {
            if is_captured {
                self.emit_op(OpCode::OpCloseUpval);
            } else {
                self.emit_op(OpCode::OpPop);
            }
        }
    }

    fn declare_local(&mut self, name: &str) -> Result<(), CompileError> {
        let line = self.line;
        let state = self.states.last_mut().expect("no active function state");
        if state.locals.len() >= MAX_LOCALS {
            return Err(err_at(line, "Too many local variables in function."));
        }
        for local in state.locals.iter().rev() {
            if local.depth != -1 && local.depth < state.scope_depth {
                break;
            }
            if local.name == name {
                return Err(err_at(
                    line,
                    format!("A variable named '{}' already exists in this scope.", name),
                ));
            }
        }
        state.locals.push(Local {
            name: name.to_string(),
            depth: -1,
            is_captured: false,
        });
        Ok(())
    }

    fn mark_initialized(&mut self) {
        let state = self.state();
        let depth = state.scope_depth;
        if let Some(local) = state.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn resolve_local(&self, state_index: usize, name: &str) -> Result<Option<u8>, CompileError> {
        let state = &self.states[state_index];
        for (slot, local) in state.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err(err_at(
                        self.line,
                        "Cannot read a variable in its own initializer.",
                    ));
                }
                return Ok(Some(slot as u8));
            }
        }
        Ok(None)
    }

    /// Finds `name` in an enclosing function and threads it through the
    /// intermediate functions' upvalue lists.
    fn resolve_upvalue(
        &mut self,
        state_index: usize,
        name: &str,
    ) -> Result<Option<u8>, CompileError> {
        if state_index == 0 {
            return Ok(None);
        }
        if let Some(slot) = self.resolve_local(state_index - 1, name)? {
            self.states[state_index - 1].locals[slot as usize].is_captured = true;
            return Ok(Some(self.add_upvalue(state_index, slot, true)?));
        }
        if let Some(index) = self.resolve_upvalue(state_index - 1, name)? {
            return Ok(Some(self.add_upvalue(state_index, index, false)?));
        }
        Ok(None)
    }

    fn add_upvalue(
        &mut self,
        state_index: usize,
        index: u8,
        is_local: bool,
    ) -> Result<u8, CompileError> {
        let line = self.line;
        let state = &mut self.states[state_index];
        let desc = UpvalDesc { index, is_local };
        if let Some(existing) = state.upvals.iter().position(|&u| u == desc) {
            return Ok(existing as u8);
        }
        if state.upvals.len() >= MAX_UPVALS {
            return Err(err_at(line, "Too many captured variables in function."));
        }
        state.upvals.push(desc);
        Ok((state.upvals.len() - 1) as u8)
    }

    // --- Emission helpers ---

    fn block(&mut self) -> &mut Block {
        &mut self.state().block
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.line;
        self.block().push_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line;
        self.block().push_byte(byte, line);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.line;
        self.block().push_u16(value, line);
    }

    /// Emits a jump with a placeholder offset; returns the operand position
    /// for [`Compiler::patch_jump`].
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        let operand_pos = self.block().len();
        self.emit_u16(0xffff);
        operand_pos
    }

    fn patch_jump(&mut self, operand_pos: usize) -> Result<(), CompileError> {
        let jump = self.block().len() - (operand_pos + 2);
        if jump > u16::MAX as usize {
            return Err(err_at(self.line, "Too much code to jump over."));
        }
        self.block().patch_u16(operand_pos, jump as u16);
        Ok(())
    }

    fn emit_loop(&mut self, loop_start: usize) -> Result<(), CompileError> {
        let offset = self.block().len() + 3 - loop_start;
        if offset > u16::MAX as usize {
            return Err(err_at(self.line, "Loop body too large."));
        }
        self.emit_op(OpCode::OpJmpBack);
        self.emit_u16(offset as u16);
        Ok(())
    }

    fn add_constant(&mut self, value: Value) -> Result<u8, CompileError> {
        let line = self.line;
        self.block()
            .add_constant(value)
            .ok_or_else(|| err_at(line, "Too many constants in one block."))
    }

    fn string_constant(&mut self, chars: &str) -> Result<u8, CompileError> {
        let handle = self.vm.intern(chars);
        self.add_constant(Value::Object(handle))
    }

    fn emit_constant(&mut self, value: Value) -> Result<(), CompileError> {
        let index = self.add_constant(value)?;
        self.emit_op(OpCode::OpLoadConst);
        self.emit_byte(index);
        Ok(())
    }

    // --- Statements ---

    fn statement(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Let { name, init, line } => {
                self.line = *line;
                self.declare_local(name)?;
                match init {
                    Some(expr) => self.expression(expr)?,
                    None => self.emit_op(OpCode::OpLoadNil),
                }
                self.mark_initialized();
            }
            Stmt::Fn { def, line } => {
                self.line = *line;
                self.declare_local(&def.name)?;
                // Initialized before the body compiles so the function can
                // recurse through its own binding.
                self.mark_initialized();
                self.compile_function(def, *line)?;
            }
            Stmt::Return { value, line } => {
                self.line = *line;
                match value {
                    Some(expr) => self.expression(expr)?,
                    None => self.emit_op(OpCode::OpLoadNil),
                }
                self.emit_op(OpCode::OpReturnVal);
            }
            Stmt::If {
                cond,
                then,
                alt,
                line,
            } => {
                self.line = *line;
                self.expression(cond)?;
                let else_jump = self.emit_jump(OpCode::OpPopJmpIfFalse);
                self.begin_scope();
                for stmt in then {
                    self.statement(stmt)?;
                }
                self.end_scope();
                match alt {
                    Some(alt) => {
                        let end_jump = self.emit_jump(OpCode::OpJmp);
                        self.patch_jump(else_jump)?;
                        self.begin_scope();
                        for stmt in alt {
                            self.statement(stmt)?;
                        }
                        self.end_scope();
                        self.patch_jump(end_jump)?;
                    }
                    None => self.patch_jump(else_jump)?,
                }
            }
            Stmt::While { cond, body, line } => {
                self.line = *line;
                let loop_start = self.block().len();
                self.expression(cond)?;
                let exit_jump = self.emit_jump(OpCode::OpPopJmpIfFalse);
                self.begin_scope();
                for stmt in body {
                    self.statement(stmt)?;
                }
                self.end_scope();
                self.emit_loop(loop_start)?;
                self.patch_jump(exit_jump)?;
            }
            Stmt::Block { body, line } => {
                self.line = *line;
                self.begin_scope();
                for stmt in body {
                    self.statement(stmt)?;
                }
                self.end_scope();
            }
            Stmt::Expr { expr, line } => {
                self.line = *line;
                self.expression(expr)?;
                self.emit_op(OpCode::OpPop);
            }
        }
        Ok(())
    }

    // --- Expressions ---

    fn expression(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Num { value, line } => {
                self.line = *line;
                self.emit_constant(Value::Num(*value))?;
            }
            Expr::Str { value, line } => {
                self.line = *line;
                let index = self.string_constant(value)?;
                self.emit_op(OpCode::OpLoadConst);
                self.emit_byte(index);
            }
            Expr::Bool { value, line } => {
                self.line = *line;
                self.emit_constant(Value::Bool(*value))?;
            }
            Expr::Nil { line } => {
                self.line = *line;
                self.emit_op(OpCode::OpLoadNil);
            }
            Expr::Var { name, line } => {
                self.line = *line;
                self.emit_var_get(name)?;
            }
            Expr::Unary { op, operand, line } => {
                self.expression(operand)?;
                self.line = *line;
                match op {
                    UnaryOp::Neg => self.emit_op(OpCode::OpNegate),
                    UnaryOp::Not => self.emit_op(OpCode::OpLnot),
                }
            }
            Expr::Binary { op, lhs, rhs, line } => {
                self.expression(lhs)?;
                self.expression(rhs)?;
                self.line = *line;
                self.emit_binop(*op);
            }
            Expr::Logical { op, lhs, rhs, line } => {
                self.expression(lhs)?;
                self.line = *line;
                let jump = self.emit_jump(match op {
                    LogicalOp::Or => OpCode::OpJmpIfTrueOrPop,
                    LogicalOp::And => OpCode::OpJmpIfFalseOrPop,
                });
                self.expression(rhs)?;
                self.patch_jump(jump)?;
            }
            Expr::Assign {
                target,
                op,
                value,
                line,
            } => self.assignment(target, *op, value, *line)?,
            Expr::Field { object, name, line } => {
                self.expression(object)?;
                self.line = *line;
                let index = self.string_constant(name)?;
                self.emit_op(OpCode::OpTableGet);
                self.emit_byte(index);
            }
            Expr::Index {
                object,
                index,
                line,
            } => {
                self.expression(object)?;
                self.expression(index)?;
                self.line = *line;
                self.emit_op(OpCode::OpIndex);
            }
            Expr::Call { callee, args, line } => {
                self.expression(callee)?;
                for arg in args {
                    self.expression(arg)?;
                }
                self.line = *line;
                self.emit_op(OpCode::OpCallFunc);
                self.emit_byte(args.len() as u8);
            }
            Expr::Function { def, line } => self.compile_function(def, *line)?,
            Expr::TableLit { fields, line } => {
                self.line = *line;
                self.emit_op(OpCode::OpNewTable);
                for (key, value) in fields {
                    match key {
                        TableKey::Ident(name) => {
                            let index = self.string_constant(name)?;
                            self.emit_op(OpCode::OpLoadConst);
                            self.emit_byte(index);
                        }
                        TableKey::Expr(expr) => self.expression(expr)?,
                    }
                    self.expression(value)?;
                    self.emit_op(OpCode::OpTableAddField);
                }
            }
        }
        Ok(())
    }

    fn assignment(
        &mut self,
        target: &Expr,
        op: Option<BinOp>,
        value: &Expr,
        line: u32,
    ) -> Result<(), CompileError> {
        match target {
            Expr::Var { name, .. } => match op {
                None => {
                    self.expression(value)?;
                    self.line = line;
                    self.emit_var_set(name)?;
                }
                Some(binop) => {
                    self.line = line;
                    self.emit_var_get(name)?;
                    self.expression(value)?;
                    self.line = line;
                    self.emit_binop(binop);
                    self.emit_var_set(name)?;
                }
            },
            Expr::Field { object, name, .. } => {
                self.expression(object)?;
                match op {
                    None => {
                        self.expression(value)?;
                        self.line = line;
                        let index = self.string_constant(name)?;
                        self.emit_op(OpCode::OpTableSet);
                        self.emit_byte(index);
                    }
                    Some(binop) => {
                        self.line = line;
                        let index = self.string_constant(name)?;
                        self.emit_op(OpCode::OpTableGetNoPop);
                        self.emit_byte(index);
                        self.expression(value)?;
                        self.line = line;
                        self.emit_binop(binop);
                        self.emit_op(OpCode::OpTableSet);
                        self.emit_byte(index);
                    }
                }
            }
            Expr::Index { object, index, .. } => {
                self.expression(object)?;
                self.expression(index)?;
                match op {
                    None => {
                        self.expression(value)?;
                        self.line = line;
                        self.emit_op(OpCode::OpIndexSet);
                    }
                    Some(binop) => {
                        self.line = line;
                        self.emit_op(OpCode::OpIndexNoPop);
                        self.expression(value)?;
                        self.line = line;
                        self.emit_binop(binop);
                        self.emit_op(OpCode::OpIndexSet);
                    }
                }
            }
            _ => return Err(err_at(line, "Invalid assignment target.")),
        }
        Ok(())
    }

    fn compile_function(&mut self, def: &FnDef, line: u32) -> Result<(), CompileError> {
        self.line = line;
        self.begin_function(&def.name, &def.params)?;
        for stmt in &def.body {
            self.statement(stmt)?;
        }
        let (code_block, upvals) = self.end_function();

        self.line = line;
        let index = self.add_constant(Value::Object(code_block))?;
        self.emit_op(OpCode::OpMakeFunc);
        self.emit_byte(index);
        self.emit_byte(upvals.len() as u8);
        for upval in upvals {
            self.emit_byte(upval.is_local as u8);
            self.emit_byte(upval.index);
        }
        Ok(())
    }

    fn emit_binop(&mut self, op: BinOp) {
        let opcode = match op {
            BinOp::Add => OpCode::OpAdd,
            BinOp::Sub => OpCode::OpSub,
            BinOp::Mul => OpCode::OpMult,
            BinOp::Div => OpCode::OpDiv,
            BinOp::Mod => OpCode::OpMod,
            BinOp::Shl => OpCode::OpLshift,
            BinOp::Shr => OpCode::OpRshift,
            BinOp::BitAnd => OpCode::OpBand,
            BinOp::BitOr => OpCode::OpBor,
            BinOp::Gt => OpCode::OpGt,
            BinOp::Lt => OpCode::OpLt,
            BinOp::Gte => OpCode::OpGte,
            BinOp::Lte => OpCode::OpLte,
            BinOp::Eq => OpCode::OpEq,
            BinOp::Neq => OpCode::OpNeq,
            BinOp::Concat => OpCode::OpConcat,
        };
        self.emit_op(opcode);
    }

    /// Locals first, then upvalues from enclosing functions, then globals.
    fn emit_var_get(&mut self, name: &str) -> Result<(), CompileError> {
        let top = self.states.len() - 1;
        if let Some(slot) = self.resolve_local(top, name)? {
            self.emit_op(OpCode::OpGetVar);
            self.emit_byte(slot);
        } else if let Some(index) = self.resolve_upvalue(top, name)? {
            self.emit_op(OpCode::OpGetUpval);
            self.emit_byte(index);
        } else {
            let index = self.string_constant(name)?;
            self.emit_op(OpCode::OpGetGlobal);
            self.emit_byte(index);
        }
        Ok(())
    }

    fn emit_var_set(&mut self, name: &str) -> Result<(), CompileError> {
        let top = self.states.len() - 1;
        if let Some(slot) = self.resolve_local(top, name)? {
            self.emit_op(OpCode::OpSetVar);
            self.emit_byte(slot);
        } else if let Some(index) = self.resolve_upvalue(top, name)? {
            self.emit_op(OpCode::OpSetUpval);
            self.emit_byte(index);
        } else {
            let index = self.string_constant(name)?;
            self.emit_op(OpCode::OpSetGlobal);
            self.emit_byte(index);
        }
        Ok(())
    }
}
