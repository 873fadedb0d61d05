//! The KHIR opcode table.
//!
//! Every instruction is a single 64-bit word whose low byte is one of these
//! opcodes. The remaining bits are interpreted according to the opcode's
//! [`InstrFormat`]; see [`crate::instruction`] for the field layouts.

use strum::{EnumCount, FromRepr};

/// Interpretation of the middle 48 bits of an instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrFormat {
    /// One 48-bit immediate (literal or constant-pool index).
    Type1,
    /// Two 24-bit value handles.
    Type2,
    /// 24-bit value handle, 8-bit sub-argument, 16-bit type id.
    Type3,
    /// 24-bit value handle and two 12-bit basic-block ids.
    Type5,
}

/// Comparison predicate shared by every `*_cmp_*` opcode family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompType {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// KHIR opcodes.
///
/// The first group forms the constant-global arena: these are the only
/// opcodes that may appear in the program-level constant pool (and as
/// global initializers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, FromRepr)]
#[repr(u8)]
pub enum Opcode {
    // Constant-global arena.
    I1Const,
    I8Const,
    I16Const,
    I32Const,
    I64Const,
    F64Const,
    GlobalCharArrayConst,
    StructConst,
    ArrayConst,
    Nullptr,
    GlobalRef,
    FuncPtr,

    // i1
    I1Cmpeq,
    I1Cmpne,
    I1Lnot,
    I1ZextI8,
    I1ZextI64,

    // i8
    I8Add,
    I8Sub,
    I8Mul,
    I8Div,
    I8Cmpeq,
    I8Cmpne,
    I8Cmplt,
    I8Cmple,
    I8Cmpgt,
    I8Cmpge,
    I8ZextI64,
    I8ConvF64,

    // i16
    I16Add,
    I16Sub,
    I16Mul,
    I16Div,
    I16Cmpeq,
    I16Cmpne,
    I16Cmplt,
    I16Cmple,
    I16Cmpgt,
    I16Cmpge,
    I16ZextI64,
    I16ConvF64,

    // i32
    I32Add,
    I32Sub,
    I32Mul,
    I32Div,
    I32Cmpeq,
    I32Cmpne,
    I32Cmplt,
    I32Cmple,
    I32Cmpgt,
    I32Cmpge,
    I32ZextI64,
    I32ConvF64,

    // i64
    I64Add,
    I64Sub,
    I64Mul,
    I64Div,
    I64Cmpeq,
    I64Cmpne,
    I64Cmplt,
    I64Cmple,
    I64Cmpgt,
    I64Cmpge,
    I64ConvF64,

    // f64
    F64Add,
    F64Sub,
    F64Mul,
    F64Div,
    F64Cmpeq,
    F64Cmpne,
    F64Cmplt,
    F64Cmple,
    F64Cmpgt,
    F64Cmpge,
    F64ConvI64,

    // Memory.
    I8Load,
    I16Load,
    I32Load,
    I64Load,
    F64Load,
    PtrLoad,
    I8Store,
    I16Store,
    I32Store,
    I64Store,
    F64Store,
    PtrStore,
    PtrAdd,
    PtrCast,
    Alloca,

    // Control flow.
    Br,
    Condbr,
    Return,
    ReturnValue,
    Phi,
    PhiMember,

    // Calls.
    FuncArg,
    CallArg,
    Call,
    CallIndirect,
}

impl Opcode {
    /// The field layout of this opcode's instruction word.
    pub fn format(self) -> InstrFormat {
        use Opcode::*;
        match self {
            I1Const | I8Const | I16Const | I32Const | I64Const | F64Const
            | GlobalCharArrayConst | StructConst | ArrayConst | GlobalRef | Return => {
                InstrFormat::Type1
            }

            I1Cmpeq | I1Cmpne | I1Lnot | I1ZextI8 | I1ZextI64 | I8Add | I8Sub | I8Mul
            | I8Div | I8Cmpeq | I8Cmpne | I8Cmplt | I8Cmple | I8Cmpgt | I8Cmpge
            | I8ZextI64 | I8ConvF64 | I16Add | I16Sub | I16Mul | I16Div | I16Cmpeq
            | I16Cmpne | I16Cmplt | I16Cmple | I16Cmpgt | I16Cmpge | I16ZextI64
            | I16ConvF64 | I32Add | I32Sub | I32Mul | I32Div | I32Cmpeq | I32Cmpne
            | I32Cmplt | I32Cmple | I32Cmpgt | I32Cmpge | I32ZextI64 | I32ConvF64
            | I64Add | I64Sub | I64Mul | I64Div | I64Cmpeq | I64Cmpne | I64Cmplt
            | I64Cmple | I64Cmpgt | I64Cmpge | I64ConvF64 | F64Add | F64Sub | F64Mul
            | F64Div | F64Cmpeq | F64Cmpne | F64Cmplt | F64Cmple | F64Cmpgt | F64Cmpge
            | F64ConvI64 | I8Store | I16Store | I32Store | I64Store | F64Store
            | PtrStore | PtrAdd | ReturnValue | PhiMember => InstrFormat::Type2,

            Nullptr | FuncPtr | I8Load | I16Load | I32Load | I64Load | F64Load
            | PtrLoad | PtrCast | Alloca | Phi | FuncArg | CallArg | Call
            | CallIndirect => InstrFormat::Type3,

            Br | Condbr => InstrFormat::Type5,
        }
    }

    /// Whether this opcode may live in the constant-global arena.
    pub fn is_constant(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            I1Const
                | I8Const
                | I16Const
                | I32Const
                | I64Const
                | F64Const
                | GlobalCharArrayConst
                | StructConst
                | ArrayConst
                | Nullptr
                | GlobalRef
                | FuncPtr
        )
    }

    /// Whether this opcode terminates a basic block.
    pub fn is_terminator(self) -> bool {
        use Opcode::*;
        matches!(self, Br | Condbr | Return | ReturnValue)
    }

    /// Operand bit width for the width-specialised integer families.
    ///
    /// `i1` operands are handled at width 8; the allocator and both
    /// backends treat an `i1` as a byte whose value is 0 or 1.
    pub fn operand_width(self) -> Option<u8> {
        use Opcode::*;
        match self {
            I1Cmpeq | I1Cmpne | I1Lnot | I1ZextI8 | I1ZextI64 | I8Add | I8Sub | I8Mul
            | I8Div | I8Cmpeq | I8Cmpne | I8Cmplt | I8Cmple | I8Cmpgt | I8Cmpge
            | I8ZextI64 | I8ConvF64 | I8Load | I8Store => Some(8),
            I16Add | I16Sub | I16Mul | I16Div | I16Cmpeq | I16Cmpne | I16Cmplt
            | I16Cmple | I16Cmpgt | I16Cmpge | I16ZextI64 | I16ConvF64 | I16Load
            | I16Store => Some(16),
            I32Add | I32Sub | I32Mul | I32Div | I32Cmpeq | I32Cmpne | I32Cmplt
            | I32Cmple | I32Cmpgt | I32Cmpge | I32ZextI64 | I32ConvF64 | I32Load
            | I32Store => Some(32),
            I64Add | I64Sub | I64Mul | I64Div | I64Cmpeq | I64Cmpne | I64Cmplt
            | I64Cmple | I64Cmpgt | I64Cmpge | I64ConvF64 | I64Load | I64Store
            | PtrLoad | PtrStore => Some(64),
            _ => None,
        }
    }

    /// The comparison predicate of a `*_cmp_*` opcode.
    pub fn comparison(self) -> Option<CompType> {
        use Opcode::*;
        match self {
            I1Cmpeq | I8Cmpeq | I16Cmpeq | I32Cmpeq | I64Cmpeq | F64Cmpeq => {
                Some(CompType::Eq)
            }
            I1Cmpne | I8Cmpne | I16Cmpne | I32Cmpne | I64Cmpne | F64Cmpne => {
                Some(CompType::Ne)
            }
            I8Cmplt | I16Cmplt | I32Cmplt | I64Cmplt | F64Cmplt => Some(CompType::Lt),
            I8Cmple | I16Cmple | I32Cmple | I64Cmple | F64Cmple => Some(CompType::Le),
            I8Cmpgt | I16Cmpgt | I32Cmpgt | I64Cmpgt | F64Cmpgt => Some(CompType::Gt),
            I8Cmpge | I16Cmpge | I32Cmpge | I64Cmpge | F64Cmpge => Some(CompType::Ge),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::EnumCount;

    #[test]
    fn opcode_fits_in_a_byte() {
        assert!(Opcode::COUNT <= 256);
        assert_eq!(Opcode::from_repr(Opcode::CallIndirect as u8), Some(Opcode::CallIndirect));
    }

    #[test]
    fn constant_arena_is_the_leading_block() {
        for repr in 0..Opcode::COUNT as u8 {
            let op = Opcode::from_repr(repr).unwrap();
            assert_eq!(op.is_constant(), repr <= Opcode::FuncPtr as u8);
        }
    }

    #[test]
    fn terminators_are_type2_type1_or_type5() {
        for op in [Opcode::Br, Opcode::Condbr, Opcode::Return, Opcode::ReturnValue] {
            assert!(op.is_terminator());
        }
        assert!(!Opcode::Phi.is_terminator());
        assert!(!Opcode::Call.is_terminator());
    }
}
