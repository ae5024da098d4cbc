//! OpCode module for the Lox Virtual Machine.
//!
//! This module defines all the instructions supported by the VM. Each
//! instruction is one opcode byte followed by zero or more immediate
//! bytes; constant-pool indices and jump offsets are one byte each.

mod operand_size;

pub use operand_size::OperandSize;

/// The instruction set of the Lox VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // === Literals / constants ===
    /// Pushes a constant-pool value.
    Constant = 0x00,
    /// Pushes true.
    True = 0x01,
    /// Pushes false.
    False = 0x02,
    /// Pushes nil.
    Nil = 0x03,
    /// Pushes a string constant; the second immediate marks a static
    /// (shared, frozen-buffer) literal.
    String = 0x04,
    /// Pops `n` values and pushes a fresh array of them.
    Array = 0x05,
    /// Pushes a copy-on-write duplicate of a static array constant.
    DupArray = 0x06,
    /// Pops `2n` values and pushes a fresh map of them.
    Map = 0x07,
    /// Pushes a copy-on-write duplicate of a static map constant.
    DupMap = 0x08,
    /// Pushes a compiled regex built from a string constant.
    Regex = 0x09,

    // === Arithmetic / logic ===
    Add = 0x0a,
    Subtract = 0x0b,
    Multiply = 0x0c,
    Divide = 0x0d,
    Modulo = 0x0e,
    BitOr = 0x0f,
    BitAnd = 0x10,
    BitXor = 0x11,
    /// Shift left (`<<` on numbers; `opShovelLeft` on receivers).
    ShovelL = 0x12,
    /// Shift right.
    ShovelR = 0x13,
    Negate = 0x14,
    Not = 0x15,

    // === Comparison ===
    Equal = 0x16,
    NotEqual = 0x17,
    Less = 0x18,
    Greater = 0x19,
    LessEqual = 0x1a,
    GreaterEqual = 0x1b,

    // === Locals / upvalues / globals / constants ===
    GetLocal = 0x1c,
    SetLocal = 0x1d,
    /// Destructuring store: writes element `i` of the unpacked rhs.
    UnpackSetLocal = 0x1e,
    GetUpvalue = 0x1f,
    SetUpvalue = 0x20,
    CloseUpvalue = 0x21,
    GetGlobal = 0x22,
    SetGlobal = 0x23,
    DefineGlobal = 0x24,
    UnpackDefineGlobal = 0x25,
    GetConst = 0x26,
    SetConst = 0x27,
    /// Constant lookup under an explicit class/module on the stack.
    GetConstUnder = 0x28,

    // === Calls and methods ===
    /// Calls the value below the arguments; immediates are argc and a
    /// CallInfo constant index.
    Call = 0x29,
    /// Method invocation: name constant, argc, CallInfo constant.
    Invoke = 0x2a,
    /// Builds a closure over a function constant; two immediate bytes
    /// per declared upvalue follow.
    Closure = 0x2b,
    /// Marks the array on top of the stack for argument splatting.
    SplatArray = 0x2c,
    GetThis = 0x2d,
    /// Pushes a bound super-method for the named method.
    GetSuper = 0x2e,
    /// Defines an instance method on the class below the closure.
    Method = 0x2f,
    /// Defines a static (singleton-class) method.
    ClassMethod = 0x30,
    Getter = 0x31,
    Setter = 0x32,
    PropGet = 0x33,
    PropSet = 0x34,
    /// Pushes whether the keyword argument at `kwslot` was supplied in
    /// the kwargs map held at local `mapslot`.
    CheckKeyword = 0x35,
    /// Wraps the closure on top of the stack into a Block instance.
    ToBlock = 0x36,

    // === Class / module definition ===
    Class = 0x37,
    Module = 0x38,
    Subclass = 0x39,
    /// Enters a class body: pushes the class on the cref stack.
    In = 0x3a,
    PopCref = 0x3b,

    // === Control flow ===
    Jump = 0x3c,
    JumpIfFalse = 0x3d,
    JumpIfTrue = 0x3e,
    /// Branch without popping the tested value.
    JumpIfFalsePeek = 0x3f,
    JumpIfTruePeek = 0x40,
    /// Backward jump; the offset includes its own operand bytes.
    Loop = 0x41,
    Return = 0x42,
    /// Halts the VM.
    Leave = 0x43,
    Print = 0x44,
    Pop = 0x45,
    PopN = 0x46,

    // === Iteration ===
    /// Converts the value on top of the stack into an iterator.
    Iter = 0x47,
    /// Pushes the iterator's next element, or undef when exhausted.
    IterNext = 0x48,

    // === Exceptions / blocks ===
    Throw = 0x49,
    /// Pushes the throwable stashed on the matching catch-table row.
    GetThrown = 0x4a,
    /// Re-raises the in-flight exception at the end of an ensure body.
    RethrowIfErr = 0x4b,
    IndexGet = 0x4c,
    IndexSet = 0x4d,
    BlockBreak = 0x4e,
    BlockContinue = 0x4f,
    BlockReturn = 0x50,
}

const OP_CODE_MAX: u8 = OpCode::BlockReturn as u8;

impl OpCode {
    /// Returns the mnemonic for this opcode.
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Constant => "CONSTANT",
            OpCode::True => "TRUE",
            OpCode::False => "FALSE",
            OpCode::Nil => "NIL",
            OpCode::String => "STRING",
            OpCode::Array => "ARRAY",
            OpCode::DupArray => "DUPARRAY",
            OpCode::Map => "MAP",
            OpCode::DupMap => "DUPMAP",
            OpCode::Regex => "REGEX",
            OpCode::Add => "ADD",
            OpCode::Subtract => "SUBTRACT",
            OpCode::Multiply => "MULTIPLY",
            OpCode::Divide => "DIVIDE",
            OpCode::Modulo => "MODULO",
            OpCode::BitOr => "BITOR",
            OpCode::BitAnd => "BITAND",
            OpCode::BitXor => "BITXOR",
            OpCode::ShovelL => "SHOVEL_L",
            OpCode::ShovelR => "SHOVEL_R",
            OpCode::Negate => "NEGATE",
            OpCode::Not => "NOT",
            OpCode::Equal => "EQUAL",
            OpCode::NotEqual => "NOT_EQUAL",
            OpCode::Less => "LESS",
            OpCode::Greater => "GREATER",
            OpCode::LessEqual => "LESS_EQUAL",
            OpCode::GreaterEqual => "GREATER_EQUAL",
            OpCode::GetLocal => "GET_LOCAL",
            OpCode::SetLocal => "SET_LOCAL",
            OpCode::UnpackSetLocal => "UNPACK_SET_LOCAL",
            OpCode::GetUpvalue => "GET_UPVALUE",
            OpCode::SetUpvalue => "SET_UPVALUE",
            OpCode::CloseUpvalue => "CLOSE_UPVALUE",
            OpCode::GetGlobal => "GET_GLOBAL",
            OpCode::SetGlobal => "SET_GLOBAL",
            OpCode::DefineGlobal => "DEFINE_GLOBAL",
            OpCode::UnpackDefineGlobal => "UNPACK_DEFINE_GLOBAL",
            OpCode::GetConst => "GET_CONST",
            OpCode::SetConst => "SET_CONST",
            OpCode::GetConstUnder => "GET_CONST_UNDER",
            OpCode::Call => "CALL",
            OpCode::Invoke => "INVOKE",
            OpCode::Closure => "CLOSURE",
            OpCode::SplatArray => "SPLAT_ARRAY",
            OpCode::GetThis => "GET_THIS",
            OpCode::GetSuper => "GET_SUPER",
            OpCode::Method => "METHOD",
            OpCode::ClassMethod => "CLASS_METHOD",
            OpCode::Getter => "GETTER",
            OpCode::Setter => "SETTER",
            OpCode::PropGet => "PROP_GET",
            OpCode::PropSet => "PROP_SET",
            OpCode::CheckKeyword => "CHECK_KEYWORD",
            OpCode::ToBlock => "TO_BLOCK",
            OpCode::Class => "CLASS",
            OpCode::Module => "MODULE",
            OpCode::Subclass => "SUBCLASS",
            OpCode::In => "IN",
            OpCode::PopCref => "POP_CREF",
            OpCode::Jump => "JUMP",
            OpCode::JumpIfFalse => "JUMP_IF_FALSE",
            OpCode::JumpIfTrue => "JUMP_IF_TRUE",
            OpCode::JumpIfFalsePeek => "JUMP_IF_FALSE_PEEK",
            OpCode::JumpIfTruePeek => "JUMP_IF_TRUE_PEEK",
            OpCode::Loop => "LOOP",
            OpCode::Return => "RETURN",
            OpCode::Leave => "LEAVE",
            OpCode::Print => "PRINT",
            OpCode::Pop => "POP",
            OpCode::PopN => "POP_N",
            OpCode::Iter => "ITER",
            OpCode::IterNext => "ITER_NEXT",
            OpCode::Throw => "THROW",
            OpCode::GetThrown => "GET_THROWN",
            OpCode::RethrowIfErr => "RETHROW_IF_ERR",
            OpCode::IndexGet => "INDEX_GET",
            OpCode::IndexSet => "INDEX_SET",
            OpCode::BlockBreak => "BLOCK_BREAK",
            OpCode::BlockContinue => "BLOCK_CONTINUE",
            OpCode::BlockReturn => "BLOCK_RETURN",
        }
    }

    /// Iterates over every defined opcode.
    pub fn iter() -> impl Iterator<Item = OpCode> {
        (0..=OP_CODE_MAX).filter_map(|b| OpCode::try_from(b).ok())
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        if byte <= OP_CODE_MAX {
            // Discriminants are dense from 0; the bound check makes the
            // transmute total.
            Ok(unsafe { std::mem::transmute::<u8, OpCode>(byte) })
        } else {
            Err(byte)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_opcodes() {
        for op in OpCode::iter() {
            let byte = op as u8;
            assert_eq!(OpCode::try_from(byte), Ok(op));
        }
    }

    #[test]
    fn test_invalid_byte_rejected() {
        assert!(OpCode::try_from(OP_CODE_MAX + 1).is_err());
        assert!(OpCode::try_from(0xff).is_err());
    }

    #[test]
    fn test_names_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for op in OpCode::iter() {
            assert!(seen.insert(op.name()), "duplicate name {}", op.name());
        }
    }
}
