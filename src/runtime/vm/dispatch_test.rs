use crate::{
    bytecode::{block::Block, op_code::OpCode},
    runtime::{
        gc::GcHandle,
        object::{CodeBlock, HeapObject},
        value::Value,
        vm::VM,
        ExitCode,
    },
};

fn install_block(vm: &mut VM, block: Block) -> GcHandle {
    let name = vm.intern("test");
    let cb = vm.make(HeapObject::CodeBlock(CodeBlock {
        name,
        num_params: 0,
        num_upvals: 0,
        block,
    }));
    vm.gc_protect(cb);
    cb
}

fn run_in(vm: &mut VM, block: Block) -> ExitCode {
    let cb = install_block(vm, block);
    vm.execute_block(cb)
}

fn run_block(block: Block) -> (VM, ExitCode) {
    let mut vm = VM::new();
    let code = run_in(&mut vm, block);
    (vm, code)
}

fn emit(block: &mut Block, op: OpCode) {
    block.push_op(op, 1);
}

fn emit_const(block: &mut Block, value: Value) {
    let index = block.add_constant(value).unwrap();
    block.push_op(OpCode::OpLoadConst, 1);
    block.push_byte(index, 1);
}

#[test]
fn test_arithmetic_ops() {
    let cases = [
        (OpCode::OpAdd, 6.0),
        (OpCode::OpSub, 2.0),
        (OpCode::OpMult, 8.0),
        (OpCode::OpDiv, 2.0),
        (OpCode::OpMod, 0.0),
    ];
    for (op, expected) in cases {
        let mut block = Block::new();
        emit_const(&mut block, Value::Num(4.0));
        emit_const(&mut block, Value::Num(2.0));
        emit(&mut block, op);
        emit(&mut block, OpCode::OpReturnVal);
        let (vm, code) = run_block(block);
        assert_eq!(code, ExitCode::Success);
        assert_eq!(vm.return_value, Value::Num(expected), "{:?}", op);
    }
}

#[test]
fn test_divide_by_zero_checks_divisor() {
    let mut block = Block::new();
    emit_const(&mut block, Value::Num(1.0));
    emit_const(&mut block, Value::Num(0.0));
    emit(&mut block, OpCode::OpDiv);
    emit(&mut block, OpCode::OpReturnVal);
    let (vm, code) = run_block(block);
    assert_eq!(code, ExitCode::RuntimeError);
    let err = vm.last_error().unwrap();
    assert!(err.contains("Attempt to divide by 0."), "{}", err);
    assert!(err.contains("[line 1]"), "{}", err);

    // Zero dividend is fine.
    let mut block = Block::new();
    emit_const(&mut block, Value::Num(0.0));
    emit_const(&mut block, Value::Num(4.0));
    emit(&mut block, OpCode::OpDiv);
    emit(&mut block, OpCode::OpReturnVal);
    let (vm, code) = run_block(block);
    assert_eq!(code, ExitCode::Success);
    assert_eq!(vm.return_value, Value::Num(0.0));
}

#[test]
fn test_bitwise_ops_truncate() {
    let cases = [
        (OpCode::OpLshift, 6.5, 1.0, 12.0),
        (OpCode::OpRshift, 6.5, 1.0, 3.0),
        (OpCode::OpBand, 6.0, 3.0, 2.0),
        (OpCode::OpBor, 6.0, 3.0, 7.0),
    ];
    for (op, a, b, expected) in cases {
        let mut block = Block::new();
        emit_const(&mut block, Value::Num(a));
        emit_const(&mut block, Value::Num(b));
        emit(&mut block, op);
        emit(&mut block, OpCode::OpReturnVal);
        let (vm, code) = run_block(block);
        assert_eq!(code, ExitCode::Success);
        assert_eq!(vm.return_value, Value::Num(expected), "{:?}", op);
    }
}

#[test]
fn test_comparison_requires_numbers() {
    let mut vm = VM::new();
    let s = Value::Object(vm.intern("a"));
    let mut block = Block::new();
    emit_const(&mut block, Value::Num(1.0));
    emit_const(&mut block, s);
    emit(&mut block, OpCode::OpLt);
    emit(&mut block, OpCode::OpReturnVal);
    let code = run_in(&mut vm, block);
    assert_eq!(code, ExitCode::RuntimeError);
    let err = vm.last_error().unwrap();
    assert!(
        err.contains("Cannot use operator '<' on operands of type 'number' and 'string'."),
        "{}",
        err
    );
}

#[test]
fn test_equality_across_tags() {
    let mut block = Block::new();
    emit_const(&mut block, Value::Num(1.0));
    emit_const(&mut block, Value::Bool(true));
    emit(&mut block, OpCode::OpEq);
    emit(&mut block, OpCode::OpReturnVal);
    let (vm, _) = run_block(block);
    assert_eq!(vm.return_value, Value::Bool(false));

    let mut block = Block::new();
    emit_const(&mut block, Value::Num(2.0));
    emit_const(&mut block, Value::Num(2.0));
    emit(&mut block, OpCode::OpNeq);
    emit(&mut block, OpCode::OpReturnVal);
    let (vm, _) = run_block(block);
    assert_eq!(vm.return_value, Value::Bool(false));
}

#[test]
fn test_negate_and_lnot() {
    let mut block = Block::new();
    emit_const(&mut block, Value::Num(3.0));
    emit(&mut block, OpCode::OpNegate);
    emit(&mut block, OpCode::OpReturnVal);
    let (vm, _) = run_block(block);
    assert_eq!(vm.return_value, Value::Num(-3.0));

    let mut block = Block::new();
    emit(&mut block, OpCode::OpLoadNil);
    emit(&mut block, OpCode::OpLnot);
    emit(&mut block, OpCode::OpReturnVal);
    let (vm, _) = run_block(block);
    assert_eq!(vm.return_value, Value::Bool(true));

    // Zero is truthy.
    let mut block = Block::new();
    emit_const(&mut block, Value::Num(0.0));
    emit(&mut block, OpCode::OpLnot);
    emit(&mut block, OpCode::OpReturnVal);
    let (vm, _) = run_block(block);
    assert_eq!(vm.return_value, Value::Bool(false));
}

#[test]
fn test_negate_type_error() {
    let mut block = Block::new();
    emit_const(&mut block, Value::Bool(true));
    emit(&mut block, OpCode::OpNegate);
    emit(&mut block, OpCode::OpReturnVal);
    let (vm, code) = run_block(block);
    assert_eq!(code, ExitCode::RuntimeError);
    assert!(vm
        .last_error()
        .unwrap()
        .contains("Cannot use operator '-' on type 'boolean'."));
}

#[test]
fn test_jmp_if_true_or_pop_retains_tos_on_jump() {
    // true: jump over load_nil keeping the condition on the stack.
    let mut block = Block::new();
    emit_const(&mut block, Value::Bool(true));
    block.push_op(OpCode::OpJmpIfTrueOrPop, 1);
    block.push_u16(1, 1);
    emit(&mut block, OpCode::OpLoadNil);
    emit(&mut block, OpCode::OpReturnVal);
    let (vm, _) = run_block(block);
    assert_eq!(vm.return_value, Value::Bool(true));

    // false: no jump, condition popped, nil pushed instead.
    let mut block = Block::new();
    emit_const(&mut block, Value::Bool(false));
    block.push_op(OpCode::OpJmpIfTrueOrPop, 1);
    block.push_u16(1, 1);
    emit(&mut block, OpCode::OpLoadNil);
    emit(&mut block, OpCode::OpReturnVal);
    let (vm, _) = run_block(block);
    assert_eq!(vm.return_value, Value::Nil);
}

#[test]
fn test_pop_jmp_if_false_always_pops() {
    for (condition, expected) in [(Value::Bool(false), 2.0), (Value::Bool(true), 1.0)] {
        let mut block = Block::new();
        emit_const(&mut block, condition);
        block.push_op(OpCode::OpPopJmpIfFalse, 1);
        block.push_u16(3, 1);
        emit_const(&mut block, Value::Num(1.0)); // 2 bytes
        emit(&mut block, OpCode::OpReturnVal); // 1 byte
        emit_const(&mut block, Value::Num(2.0));
        emit(&mut block, OpCode::OpReturnVal);
        let (vm, code) = run_block(block);
        assert_eq!(code, ExitCode::Success);
        assert_eq!(vm.return_value, Value::Num(expected));
    }
}

#[test]
fn test_locals_through_get_and_set_var() {
    // Slot 0 holds the callee; pushed values land in slots 1 and up.
    let mut block = Block::new();
    emit_const(&mut block, Value::Num(4.0)); // local 1
    emit_const(&mut block, Value::Num(2.0)); // local 2
    block.push_op(OpCode::OpGetVar, 1);
    block.push_byte(1, 1);
    block.push_op(OpCode::OpGetVar, 1);
    block.push_byte(2, 1);
    emit(&mut block, OpCode::OpAdd);
    emit(&mut block, OpCode::OpReturnVal);
    let (vm, _) = run_block(block);
    assert_eq!(vm.return_value, Value::Num(6.0));
}

#[test]
fn test_set_var_retains_tos() {
    let mut block = Block::new();
    emit_const(&mut block, Value::Num(1.0)); // local 1
    emit_const(&mut block, Value::Num(9.0));
    block.push_op(OpCode::OpSetVar, 1);
    block.push_byte(1, 1);
    // The assigned value is still on top; add it to the local.
    block.push_op(OpCode::OpGetVar, 1);
    block.push_byte(1, 1);
    emit(&mut block, OpCode::OpAdd);
    emit(&mut block, OpCode::OpReturnVal);
    let (vm, _) = run_block(block);
    assert_eq!(vm.return_value, Value::Num(18.0));
}

#[test]
fn test_concat_interns_result() {
    let mut vm = VM::new();
    let ab = vm.intern("ab");
    let a = Value::Object(vm.intern("a"));
    let b = Value::Object(vm.intern("b"));
    let mut block = Block::new();
    emit_const(&mut block, a);
    emit_const(&mut block, b);
    emit(&mut block, OpCode::OpConcat);
    emit(&mut block, OpCode::OpReturnVal);
    let code = run_in(&mut vm, block);
    assert_eq!(code, ExitCode::Success);
    // Identity equality with the previously interned "ab".
    assert_eq!(vm.return_value, Value::Object(ab));
}

#[test]
fn test_concat_type_error() {
    let mut block = Block::new();
    emit_const(&mut block, Value::Num(1.0));
    emit_const(&mut block, Value::Num(2.0));
    emit(&mut block, OpCode::OpConcat);
    emit(&mut block, OpCode::OpReturnVal);
    let (vm, code) = run_block(block);
    assert_eq!(code, ExitCode::RuntimeError);
    assert!(vm.last_error().unwrap().contains("'..'"));
}

#[test]
fn test_table_add_field_and_get() {
    let mut vm = VM::new();
    let key = Value::Object(vm.intern("k"));
    let mut block = Block::new();
    emit(&mut block, OpCode::OpNewTable);
    emit_const(&mut block, key);
    emit_const(&mut block, Value::Num(7.0));
    emit(&mut block, OpCode::OpTableAddField);
    // table_get_no_pop leaves the table under the result.
    let key_index = block.add_constant(key).unwrap();
    block.push_op(OpCode::OpTableGetNoPop, 1);
    block.push_byte(key_index, 1);
    emit(&mut block, OpCode::OpReturnVal);
    let code = run_in(&mut vm, block);
    assert_eq!(code, ExitCode::Success);
    assert_eq!(vm.return_value, Value::Num(7.0));
}

#[test]
fn test_index_set_returns_assigned_value() {
    let mut vm = VM::new();
    let key = Value::Object(vm.intern("k"));
    let mut block = Block::new();
    emit(&mut block, OpCode::OpNewTable);
    emit_const(&mut block, key);
    emit_const(&mut block, Value::Num(9.0));
    emit(&mut block, OpCode::OpIndexSet);
    emit(&mut block, OpCode::OpReturnVal);
    let code = run_in(&mut vm, block);
    assert_eq!(code, ExitCode::Success);
    assert_eq!(vm.return_value, Value::Num(9.0));
}

#[test]
fn test_index_nil_key_is_an_error() {
    let mut block = Block::new();
    emit(&mut block, OpCode::OpNewTable);
    emit(&mut block, OpCode::OpLoadNil);
    emit(&mut block, OpCode::OpIndex);
    emit(&mut block, OpCode::OpReturnVal);
    let (vm, code) = run_block(block);
    assert_eq!(code, ExitCode::RuntimeError);
    assert!(vm.last_error().unwrap().contains("Table key cannot be nil."));
}

#[test]
fn test_indexing_a_non_table_fails() {
    let mut block = Block::new();
    emit_const(&mut block, Value::Num(1.0));
    emit_const(&mut block, Value::Num(2.0));
    emit(&mut block, OpCode::OpIndex);
    emit(&mut block, OpCode::OpReturnVal);
    let (vm, code) = run_block(block);
    assert_eq!(code, ExitCode::RuntimeError);
    assert!(vm
        .last_error()
        .unwrap()
        .contains("Attempt to index a number value."));
}

#[test]
fn test_absent_global_reads_nil() {
    let mut vm = VM::new();
    let name = Value::Object(vm.intern("missing"));
    let mut block = Block::new();
    let index = block.add_constant(name).unwrap();
    block.push_op(OpCode::OpGetGlobal, 1);
    block.push_byte(index, 1);
    emit(&mut block, OpCode::OpReturnVal);
    let code = run_in(&mut vm, block);
    assert_eq!(code, ExitCode::Success);
    assert_eq!(vm.return_value, Value::Nil);
}

#[test]
fn test_calling_a_non_callable_fails() {
    let mut block = Block::new();
    emit_const(&mut block, Value::Num(5.0));
    block.push_op(OpCode::OpCallFunc, 1);
    block.push_byte(0, 1);
    emit(&mut block, OpCode::OpReturnVal);
    let (vm, code) = run_block(block);
    assert_eq!(code, ExitCode::RuntimeError);
    assert!(vm
        .last_error()
        .unwrap()
        .contains("Attempt to call a number value."));
}
