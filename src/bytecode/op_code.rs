use std::fmt;

/// One-byte opcodes of the Ember virtual machine.
///
/// Immediate operands follow the opcode byte: constant-pool and local-slot
/// indices are one byte, jump offsets are two bytes big-endian. Jump offsets
/// are relative to the byte after the operand; `OpJmpBack` is the only
/// opcode whose offset is subtracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    OpLoadConst = 0,
    OpLoadNil = 1,
    OpPop = 2,
    OpAdd = 3,
    OpSub = 4,
    OpMult = 5,
    OpDiv = 6,
    OpMod = 7,
    OpLshift = 8,
    OpRshift = 9,
    OpBand = 10,
    OpBor = 11,
    OpGt = 12,
    OpLt = 13,
    OpGte = 14,
    OpLte = 15,
    OpEq = 16,
    OpNeq = 17,
    OpNegate = 18,
    OpLnot = 19,
    OpConcat = 20,
    OpJmp = 21,
    OpJmpBack = 22,
    OpJmpIfTrueOrPop = 23,
    OpJmpIfFalseOrPop = 24,
    OpPopJmpIfFalse = 25,
    OpGetVar = 26,
    OpSetVar = 27,
    OpGetUpval = 28,
    OpSetUpval = 29,
    OpCloseUpval = 30,
    OpGetGlobal = 31,
    OpSetGlobal = 32,
    OpNewTable = 33,
    OpTableAddField = 34,
    OpTableSet = 35,
    OpTableGet = 36,
    OpTableGetNoPop = 37,
    OpIndexSet = 38,
    OpIndex = 39,
    OpIndexNoPop = 40,
    OpCallFunc = 41,
    OpReturnVal = 42,
    OpMakeFunc = 43,
}

impl From<u8> for OpCode {
    fn from(byte: u8) -> Self {
        match byte {
            0 => OpCode::OpLoadConst,
            1 => OpCode::OpLoadNil,
            2 => OpCode::OpPop,
            3 => OpCode::OpAdd,
            4 => OpCode::OpSub,
            5 => OpCode::OpMult,
            6 => OpCode::OpDiv,
            7 => OpCode::OpMod,
            8 => OpCode::OpLshift,
            9 => OpCode::OpRshift,
            10 => OpCode::OpBand,
            11 => OpCode::OpBor,
            12 => OpCode::OpGt,
            13 => OpCode::OpLt,
            14 => OpCode::OpGte,
            15 => OpCode::OpLte,
            16 => OpCode::OpEq,
            17 => OpCode::OpNeq,
            18 => OpCode::OpNegate,
            19 => OpCode::OpLnot,
            20 => OpCode::OpConcat,
            21 => OpCode::OpJmp,
            22 => OpCode::OpJmpBack,
            23 => OpCode::OpJmpIfTrueOrPop,
            24 => OpCode::OpJmpIfFalseOrPop,
            25 => OpCode::OpPopJmpIfFalse,
            26 => OpCode::OpGetVar,
            27 => OpCode::OpSetVar,
            28 => OpCode::OpGetUpval,
            29 => OpCode::OpSetUpval,
            30 => OpCode::OpCloseUpval,
            31 => OpCode::OpGetGlobal,
            32 => OpCode::OpSetGlobal,
            33 => OpCode::OpNewTable,
            34 => OpCode::OpTableAddField,
            35 => OpCode::OpTableSet,
            36 => OpCode::OpTableGet,
            37 => OpCode::OpTableGetNoPop,
            38 => OpCode::OpIndexSet,
            39 => OpCode::OpIndex,
            40 => OpCode::OpIndexNoPop,
            41 => OpCode::OpCallFunc,
            42 => OpCode::OpReturnVal,
            43 => OpCode::OpMakeFunc,
            _ => panic!("Unknown opcode {}", byte),
        }
    }
}

impl OpCode {
    /// The mnemonic used by the disassembler and the execution trace.
    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::OpLoadConst => "load_const",
            OpCode::OpLoadNil => "load_nil",
            OpCode::OpPop => "pop",
            OpCode::OpAdd => "add",
            OpCode::OpSub => "sub",
            OpCode::OpMult => "mult",
            OpCode::OpDiv => "div",
            OpCode::OpMod => "mod",
            OpCode::OpLshift => "lshift",
            OpCode::OpRshift => "rshift",
            OpCode::OpBand => "band",
            OpCode::OpBor => "bor",
            OpCode::OpGt => "gt",
            OpCode::OpLt => "lt",
            OpCode::OpGte => "gte",
            OpCode::OpLte => "lte",
            OpCode::OpEq => "eq",
            OpCode::OpNeq => "neq",
            OpCode::OpNegate => "negate",
            OpCode::OpLnot => "lnot",
            OpCode::OpConcat => "concat",
            OpCode::OpJmp => "jmp",
            OpCode::OpJmpBack => "jmp_back",
            OpCode::OpJmpIfTrueOrPop => "jmp_if_true_or_pop",
            OpCode::OpJmpIfFalseOrPop => "jmp_if_false_or_pop",
            OpCode::OpPopJmpIfFalse => "pop_jmp_if_false",
            OpCode::OpGetVar => "get_var",
            OpCode::OpSetVar => "set_var",
            OpCode::OpGetUpval => "get_upval",
            OpCode::OpSetUpval => "set_upval",
            OpCode::OpCloseUpval => "close_upval",
            OpCode::OpGetGlobal => "get_global",
            OpCode::OpSetGlobal => "set_global",
            OpCode::OpNewTable => "new_table",
            OpCode::OpTableAddField => "table_add_field",
            OpCode::OpTableSet => "table_set",
            OpCode::OpTableGet => "table_get",
            OpCode::OpTableGetNoPop => "table_get_no_pop",
            OpCode::OpIndexSet => "index_set",
            OpCode::OpIndex => "index",
            OpCode::OpIndexNoPop => "index_no_pop",
            OpCode::OpCallFunc => "call_func",
            OpCode::OpReturnVal => "return_val",
            OpCode::OpMakeFunc => "make_func",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trips_through_byte() {
        for byte in 0u8..=43 {
            let op = OpCode::from(byte);
            assert_eq!(op as u8, byte);
        }
    }

    #[test]
    #[should_panic(expected = "Unknown opcode")]
    fn test_unknown_byte_panics() {
        let _ = OpCode::from(200);
    }

    #[test]
    fn test_mnemonics() {
        assert_eq!(OpCode::OpLoadConst.to_string(), "load_const");
        assert_eq!(OpCode::OpJmpIfTrueOrPop.to_string(), "jmp_if_true_or_pop");
        assert_eq!(OpCode::OpMakeFunc.to_string(), "make_func");
    }
}
