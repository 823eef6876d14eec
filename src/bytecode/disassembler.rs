use std::fmt::Write;

use crate::{
    bytecode::{block::Block, op_code::OpCode},
    runtime::gc::Heap,
};

/// Renders a whole block, one instruction per line.
pub fn disassemble_block(heap: &Heap, name: &str, block: &Block) -> String {
    let mut out = format!("== {} ==\n", name);
    let mut offset = 0;
    while offset < block.code.len() {
        offset = write_instruction(heap, block, offset, &mut out);
        out.push('\n');
    }
    out
}

/// Writes one decoded instruction at `offset` into `out` and returns the
/// offset of the next instruction.
pub fn write_instruction(heap: &Heap, block: &Block, offset: usize, out: &mut String) -> usize {
    let _ = write!(out, "{:04} ", offset);
    if offset > 0 && block.line_at(offset) == block.line_at(offset - 1) {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", block.line_at(offset));
    }

    let op = OpCode::from(block.code[offset]);
    match op {
        OpCode::OpLoadConst
        | OpCode::OpGetGlobal
        | OpCode::OpSetGlobal
        | OpCode::OpTableSet
        | OpCode::OpTableGet
        | OpCode::OpTableGetNoPop => {
            let index = block.code[offset + 1] as usize;
            let _ = write!(
                out,
                "{} {} ({})",
                op,
                index,
                heap.display(block.constants[index])
            );
            offset + 2
        }
        OpCode::OpGetVar | OpCode::OpSetVar | OpCode::OpGetUpval | OpCode::OpSetUpval
        | OpCode::OpCallFunc => {
            let _ = write!(out, "{} {}", op, block.code[offset + 1]);
            offset + 2
        }
        OpCode::OpJmp
        | OpCode::OpJmpIfTrueOrPop
        | OpCode::OpJmpIfFalseOrPop
        | OpCode::OpPopJmpIfFalse => {
            let jump = block.read_u16(offset + 1) as usize;
            let _ = write!(out, "{} {} (-> {:04})", op, jump, offset + 3 + jump);
            offset + 3
        }
        OpCode::OpJmpBack => {
            let jump = block.read_u16(offset + 1) as usize;
            let _ = write!(out, "{} {} (-> {:04})", op, jump, offset + 3 - jump);
            offset + 3
        }
        OpCode::OpMakeFunc => {
            let index = block.code[offset + 1] as usize;
            let num_upvals = block.code[offset + 2] as usize;
            let _ = write!(
                out,
                "{} {} ({})",
                op,
                index,
                heap.display(block.constants[index])
            );
            let mut next = offset + 3;
            for _ in 0..num_upvals {
                let is_local = block.code[next] != 0;
                let capture_index = block.code[next + 1];
                let kind = if is_local { "local" } else { "upval" };
                let _ = write!(out, " {} {}", kind, capture_index);
                next += 2;
            }
            next
        }
        _ => {
            let _ = write!(out, "{}", op);
            offset + 1
        }
    }
}
