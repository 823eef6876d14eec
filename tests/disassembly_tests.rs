use ember::{
    bytecode::{block::Block, disassembler::disassemble_block, op_code::OpCode},
    runtime::{
        object::{CodeBlock, HeapObject},
        value::Value,
        vm::VM,
    },
};

#[test]
fn test_disassembles_every_operand_shape() {
    let mut vm = VM::new();
    let x = Value::Object(vm.intern("x"));
    let f_name = vm.intern("f");
    let inner = vm.make(HeapObject::CodeBlock(CodeBlock {
        name: f_name,
        num_params: 0,
        num_upvals: 2,
        block: Block::new(),
    }));
    vm.gc_protect(inner);

    let mut block = Block::new();
    let one = block.add_constant(Value::Num(1.0)).unwrap();
    let key = block.add_constant(x).unwrap();
    let func = block.add_constant(Value::Object(inner)).unwrap();

    block.push_op(OpCode::OpLoadConst, 1);
    block.push_byte(one, 1);
    block.push_op(OpCode::OpLoadNil, 1);
    block.push_op(OpCode::OpPop, 1);
    block.push_op(OpCode::OpNewTable, 2);
    block.push_op(OpCode::OpTableSet, 2);
    block.push_byte(key, 2);
    block.push_op(OpCode::OpJmp, 2);
    block.push_u16(3, 2);
    block.push_op(OpCode::OpJmpBack, 3);
    block.push_u16(10, 3);
    block.push_op(OpCode::OpGetVar, 3);
    block.push_byte(2, 3);
    block.push_op(OpCode::OpCallFunc, 3);
    block.push_byte(1, 3);
    block.push_op(OpCode::OpMakeFunc, 4);
    block.push_byte(func, 4);
    block.push_byte(2, 4);
    block.push_byte(1, 4); // local
    block.push_byte(1, 4);
    block.push_byte(0, 4); // upval
    block.push_byte(0, 4);
    block.push_op(OpCode::OpReturnVal, 4);

    let output = disassemble_block(vm.heap(), "demo", &block);
    insta::assert_snapshot!(output, @r###"
== demo ==
0000    1 load_const 0 (1)
0002    | load_nil
0003    | pop
0004    2 new_table
0005    | table_set 1 (x)
0007    | jmp 3 (-> 0013)
0010    3 jmp_back 10 (-> 0003)
0013    | get_var 2
0015    | call_func 1
0017    4 make_func 2 (<codeblock f>) local 1 upval 0
0024    | return_val
"###);
}

#[test]
fn test_jump_targets_account_for_operand_width() {
    let mut block = Block::new();
    block.push_op(OpCode::OpJmp, 1);
    block.push_u16(0, 1);
    let vm = VM::new();
    let output = disassemble_block(vm.heap(), "jumps", &block);
    // A zero offset lands on the byte right after the operand.
    insta::assert_snapshot!(output, @r###"
== jumps ==
0000    1 jmp 0 (-> 0003)
"###);
}
