use std::mem;

use crate::{
    bytecode::block::Block,
    runtime::{gc::GcHandle, table::Table, value::Value, NativeFn},
};

/// Objects that live on the GC-managed heap.
///
/// A single tagged variant instead of trait objects: the collector traces
/// and sizes objects with one match, and the tag doubles as the runtime
/// type of the value.
#[derive(Debug)]
pub enum HeapObject {
    /// Immutable interned string with its precomputed content hash.
    Str(Str),
    /// Compiled function body; produced by the compiler, never mutated.
    CodeBlock(CodeBlock),
    /// Runtime pairing of a code block with captured upvalues.
    Closure(Closure),
    /// Host function callable from scripts.
    NativeClosure(NativeClosure),
    /// A captured outer-scope variable, open (stack slot) or closed (owned cell).
    Upvalue(Upvalue),
    /// Hash table from values to values.
    Table(Table),
}

#[derive(Debug)]
pub struct Str {
    pub chars: Box<str>,
    pub hash: u64,
}

#[derive(Debug)]
pub struct CodeBlock {
    /// Interned function name, used in stack traces.
    pub name: GcHandle,
    pub num_params: u8,
    pub num_upvals: u8,
    pub block: Block,
}

#[derive(Debug)]
pub struct Closure {
    pub code_block: GcHandle,
    /// Fixed length `num_upvals`; slots are filled in order during
    /// `make_func` and stay `None` only while the closure is under
    /// construction.
    pub upvals: Vec<Option<GcHandle>>,
}

#[derive(Debug)]
pub struct NativeClosure {
    pub name: GcHandle,
    pub func: NativeFn,
}

/// An upvalue transitions open -> closed exactly once: while the captured
/// variable is live its stack slot index is stored; on close the current
/// value is copied into the owned cell.
#[derive(Debug)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

impl HeapObject {
    /// Runtime type label, stable and user-visible in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            HeapObject::Str(_) => "string",
            HeapObject::CodeBlock(_) => "codeblock",
            HeapObject::Closure(_) => "function",
            HeapObject::NativeClosure(_) => "function",
            HeapObject::Upvalue(_) => "upvalue",
            HeapObject::Table(_) => "table",
        }
    }

    /// Shallow byte size charged against the GC budget: the variant itself
    /// plus buffers the object owns at this moment.
    pub fn shallow_size(&self) -> usize {
        let base = mem::size_of::<Self>();
        match self {
            HeapObject::Str(s) => base + s.chars.len(),
            HeapObject::CodeBlock(cb) => {
                base + cb.block.code.capacity()
                    + cb.block.constants.capacity() * mem::size_of::<Value>()
                    + cb.block.lines.capacity() * mem::size_of::<u32>()
            }
            HeapObject::Closure(c) => {
                base + c.upvals.capacity() * mem::size_of::<Option<GcHandle>>()
            }
            HeapObject::NativeClosure(_) => base,
            HeapObject::Upvalue(_) => base,
            HeapObject::Table(t) => base + t.storage_bytes(),
        }
    }
}

/// FNV-1a over the string bytes; every string's hash is precomputed with
/// this so the intern pool can probe by content.
pub fn hash_str(chars: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in chars.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_str_is_content_based() {
        assert_eq!(hash_str("abc"), hash_str("abc"));
        assert_ne!(hash_str("abc"), hash_str("abd"));
        assert_ne!(hash_str(""), hash_str("\0"));
    }

    #[test]
    fn test_shallow_size_counts_string_bytes() {
        let short = HeapObject::Str(Str {
            chars: "ab".into(),
            hash: hash_str("ab"),
        });
        let long = HeapObject::Str(Str {
            chars: "abcdefgh".into(),
            hash: hash_str("abcdefgh"),
        });
        assert!(long.shallow_size() > short.shallow_size());
    }
}
