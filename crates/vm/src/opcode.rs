//! The instruction set
//!
//! Operand convention: registers first, then constant-pool indices, then
//! everything else. `*K` variants take their right operand from the constant
//! pool. Jump displacements are signed 16-bit, relative to the instruction
//! following the jump.
//!
//! The numbering is stable per format version: the u16 discriminant is the
//! on-wire opcode.

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum OpCode {
    /// No operation.
    Nop = 0,

    /// `ADD dst lhs rhs` - and friends. Numeric with int/float promotion;
    /// a table left operand dispatches to its operator metamethod.
    Add = 1,
    /// `ADDK dst lhs k`
    AddK = 2,
    Sub = 3,
    SubK = 4,
    Mul = 5,
    MulK = 6,
    Div = 7,
    DivK = 8,
    Mod = 9,
    ModK = 10,
    Pow = 11,
    PowK = 12,
    /// `NEG dst src`
    Neg = 13,

    /// `MOVE dst src` - register copy.
    Move = 14,
    /// `SWAP r0 r1`
    Swap = 15,
    /// `LOADK dst k` - load constant-pool entry.
    LoadK = 16,
    /// `LOADNIL dst`
    LoadNil = 17,
    /// `LOADTABLE dst` - fresh empty table.
    LoadTable = 18,
    /// `LOADFUNCTION dst nupv arity` - construct a closure. The `nupv`
    /// following instructions must be `CAPTURE` descriptors; the body runs
    /// from after them to the matching `RETURN`.
    LoadFunction = 19,

    /// `PUSH src`
    Push = 20,
    /// `PUSHK k`
    PushK = 21,
    /// `POP dst`
    Pop = 22,
    /// `GETSTACK dst off` - read the stack slot at absolute offset `off`.
    GetStack = 23,
    /// `SETSTACK src off`
    SetStack = 24,
    /// `GETARGUMENT dst i` - i-th argument of the current frame, nil when
    /// out of range.
    GetArgument = 25,

    /// `GETGLOBAL dst k` - `k` names the identifier (string constant);
    /// unbound globals read as nil.
    GetGlobal = 26,
    /// `SETGLOBAL src k` - declare-once; redeclaration is an error.
    SetGlobal = 27,

    /// `INCREMENT dst` / `DECREMENT dst` - numeric step in place.
    Increment = 28,
    Decrement = 29,

    /// `EQUAL dst lhs rhs` - and friends; result is a bool in `dst`.
    Equal = 30,
    NotEqual = 31,
    Less = 32,
    Greater = 33,
    LessOrEqual = 34,
    GreaterOrEqual = 35,

    /// `JUMP off`
    Jump = 36,
    /// `JUMPIF cnd off` / `JUMPIFNOT cnd off` - branch on truthiness.
    JumpIf = 37,
    JumpIfNot = 38,
    /// `JUMPIFEQUAL lhs rhs off` - and friends; comparison folded into the
    /// branch.
    JumpIfEqual = 39,
    JumpIfNotEqual = 40,
    JumpIfLess = 41,
    JumpIfGreater = 42,
    JumpIfLessOrEqual = 43,
    JumpIfGreaterOrEqual = 44,

    /// `CALL callee argc` - polymorphic over closures, foreigns, and tables
    /// with `__call`.
    Call = 45,
    /// `NATIVECALL callee argc` - callee is statically a closure.
    NativeCall = 46,
    /// `EXTERNCALL callee argc` - callee is statically a foreign.
    ExternCall = 47,
    /// `METHODCALL obj argc` - call `obj`'s `__call` metamethod with the
    /// table pushed as the receiver.
    MethodCall = 48,
    /// `RETURN retc`
    Return = 49,

    /// `CAPTURE kind idx` - closure construction descriptor; only valid
    /// immediately after `LOADFUNCTION`. kind 0 captures the stack slot
    /// `idx` as an open upvalue, kind 1 shares the running closure's
    /// upvalue `idx`.
    Capture = 50,
    /// `GETUPVALUE dst idx` / `SETUPVALUE src idx` - read/write through the
    /// open/closed indirection.
    GetUpvalue = 51,
    SetUpvalue = 52,

    /// `GETTABLE dst tbl key` - lookup with metatable fallback.
    GetTable = 53,
    /// `SETTABLE src tbl key` - rejects frozen tables.
    SetTable = 54,
    /// `NEXTTABLE dst tbl` - in-order traversal; nil when exhausted.
    NextTable = 55,
    /// `LENTABLE dst tbl`
    LenTable = 56,

    /// `CONCAT dst lhs rhs` / `CONCATK dst lhs k`
    Concat = 57,
    ConcatK = 58,

    /// `GETSTRING dst str idx` - character code at `idx`, nil out of range.
    GetString = 59,
    /// `LENSTRING dst str` - length in bytes.
    LenString = 60,

    /// `LEN dst val` - generic length per value kind.
    Len = 61,
    /// `TYPE dst val` - primitive tag name.
    Type = 62,
    /// `TYPEOF dst val` - a table's `__type` string if present, else the
    /// tag name.
    TypeOf = 63,

    /// `FREEZE tbl` - one-way freeze.
    Freeze = 64,

    /// Stop the dispatcher with the current exit code.
    Halt = 65,
    /// `EXIT code` - stop with an immediate exit code.
    Exit = 66,
}

impl OpCode {
    /// Wire mnemonic, as printed by the disassembler.
    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Nop => "NOP",
            OpCode::Add => "ADD",
            OpCode::AddK => "ADDK",
            OpCode::Sub => "SUB",
            OpCode::SubK => "SUBK",
            OpCode::Mul => "MUL",
            OpCode::MulK => "MULK",
            OpCode::Div => "DIV",
            OpCode::DivK => "DIVK",
            OpCode::Mod => "MOD",
            OpCode::ModK => "MODK",
            OpCode::Pow => "POW",
            OpCode::PowK => "POWK",
            OpCode::Neg => "NEG",
            OpCode::Move => "MOVE",
            OpCode::Swap => "SWAP",
            OpCode::LoadK => "LOADK",
            OpCode::LoadNil => "LOADNIL",
            OpCode::LoadTable => "LOADTABLE",
            OpCode::LoadFunction => "LOADFUNCTION",
            OpCode::Push => "PUSH",
            OpCode::PushK => "PUSHK",
            OpCode::Pop => "POP",
            OpCode::GetStack => "GETSTACK",
            OpCode::SetStack => "SETSTACK",
            OpCode::GetArgument => "GETARGUMENT",
            OpCode::GetGlobal => "GETGLOBAL",
            OpCode::SetGlobal => "SETGLOBAL",
            OpCode::Increment => "INCREMENT",
            OpCode::Decrement => "DECREMENT",
            OpCode::Equal => "EQUAL",
            OpCode::NotEqual => "NOTEQUAL",
            OpCode::Less => "LESS",
            OpCode::Greater => "GREATER",
            OpCode::LessOrEqual => "LESSOREQUAL",
            OpCode::GreaterOrEqual => "GREATEROREQUAL",
            OpCode::Jump => "JUMP",
            OpCode::JumpIf => "JUMPIF",
            OpCode::JumpIfNot => "JUMPIFNOT",
            OpCode::JumpIfEqual => "JUMPIFEQUAL",
            OpCode::JumpIfNotEqual => "JUMPIFNOTEQUAL",
            OpCode::JumpIfLess => "JUMPIFLESS",
            OpCode::JumpIfGreater => "JUMPIFGREATER",
            OpCode::JumpIfLessOrEqual => "JUMPIFLESSOREQUAL",
            OpCode::JumpIfGreaterOrEqual => "JUMPIFGREATEROREQUAL",
            OpCode::Call => "CALL",
            OpCode::NativeCall => "NATIVECALL",
            OpCode::ExternCall => "EXTERNCALL",
            OpCode::MethodCall => "METHODCALL",
            OpCode::Return => "RETURN",
            OpCode::Capture => "CAPTURE",
            OpCode::GetUpvalue => "GETUPVALUE",
            OpCode::SetUpvalue => "SETUPVALUE",
            OpCode::GetTable => "GETTABLE",
            OpCode::SetTable => "SETTABLE",
            OpCode::NextTable => "NEXTTABLE",
            OpCode::LenTable => "LENTABLE",
            OpCode::Concat => "CONCAT",
            OpCode::ConcatK => "CONCATK",
            OpCode::GetString => "GETSTRING",
            OpCode::LenString => "LENSTRING",
            OpCode::Len => "LEN",
            OpCode::Type => "TYPE",
            OpCode::TypeOf => "TYPEOF",
            OpCode::Freeze => "FREEZE",
            OpCode::Halt => "HALT",
            OpCode::Exit => "EXIT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discriminants_are_stable() {
        assert_eq!(u16::from(OpCode::Nop), 0);
        assert_eq!(u16::from(OpCode::LoadK), 16);
        assert_eq!(u16::from(OpCode::Call), 45);
        assert_eq!(u16::from(OpCode::Exit), 66);
    }

    #[test]
    fn test_round_trip_through_u16() {
        for raw in 0u16..=66 {
            let op = OpCode::try_from(raw).expect("every discriminant in range decodes");
            assert_eq!(u16::from(op), raw);
        }
        assert!(OpCode::try_from(67u16).is_err());
        assert!(OpCode::try_from(u16::MAX).is_err());
    }
}
