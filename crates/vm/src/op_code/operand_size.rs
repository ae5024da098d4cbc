//! Immediate operand sizes for each opcode.

use super::OpCode;

/// How many immediate bytes follow an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandSize {
    /// A fixed number of immediate bytes.
    Fixed(usize),
    /// CLOSURE: one function-constant byte plus two bytes per declared
    /// upvalue; the count comes from the function constant.
    Closure,
}

impl OpCode {
    /// Returns the operand size of this opcode.
    pub fn operand_size(self) -> OperandSize {
        use OpCode::*;
        match self {
            // one constant-pool index
            Constant | DupArray | DupMap | Regex | GetGlobal | SetGlobal | DefineGlobal
            | GetConst | SetConst | GetConstUnder | GetSuper | Method | ClassMethod | Getter
            | Setter | PropGet | PropSet | Class | Module | Subclass | GetThrown
            | RethrowIfErr => OperandSize::Fixed(1),

            // one count byte
            Array | Map | PopN => OperandSize::Fixed(1),

            // one jump-offset byte
            Jump | JumpIfFalse | JumpIfTrue | JumpIfFalsePeek | JumpIfTruePeek | Loop => {
                OperandSize::Fixed(1)
            }

            // slot + name constant
            GetLocal | SetLocal | GetUpvalue | SetUpvalue => OperandSize::Fixed(2),

            // constant + flag / two indices
            String | CheckKeyword | UnpackDefineGlobal | Call => OperandSize::Fixed(2),

            // slot + unpack index + name constant
            UnpackSetLocal => OperandSize::Fixed(3),

            // name constant + argc + callinfo constant
            Invoke => OperandSize::Fixed(3),

            Closure => OperandSize::Closure,

            // no operands
            True | False | Nil | Add | Subtract | Multiply | Divide | Modulo | BitOr | BitAnd
            | BitXor | ShovelL | ShovelR | Negate | Not | Equal | NotEqual | Less | Greater
            | LessEqual | GreaterEqual | CloseUpvalue | SplatArray | GetThis | ToBlock | In
            | PopCref | Return | Leave | Print | Pop | Iter | IterNext | Throw | IndexGet
            | IndexSet | BlockBreak | BlockContinue | BlockReturn => OperandSize::Fixed(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selected_sizes() {
        assert_eq!(OpCode::Constant.operand_size(), OperandSize::Fixed(1));
        assert_eq!(OpCode::GetLocal.operand_size(), OperandSize::Fixed(2));
        assert_eq!(OpCode::Invoke.operand_size(), OperandSize::Fixed(3));
        assert_eq!(OpCode::UnpackSetLocal.operand_size(), OperandSize::Fixed(3));
        assert_eq!(OpCode::Add.operand_size(), OperandSize::Fixed(0));
        assert_eq!(OpCode::Closure.operand_size(), OperandSize::Closure);
    }
}
