//! Register assignment strategies.
//!
//! Both strategies produce the same artifact: a per-instruction [`Home`]
//! table the lowering consults for every operand read and result write.
//! Stack-spill pins every value to a frame slot; linear-scan keeps short,
//! call-free intervals in caller-saved registers.

use quarry_khir::instruction::{GenericReader, Type2Reader, Type3Reader, Type5Reader};
use quarry_khir::{Function, Opcode, Program, Value};

use crate::encoder::{Gp, Xmm, R8, R9, RDI, RSI};

pub mod linear_scan;
pub mod stack_spill;

/// Where a value lives for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Home {
    Gp(Gp),
    Xmm(Xmm),
    /// `[rbp - offset]`.
    Slot(i32),
}

/// The allocator's output for one function.
#[derive(Debug)]
pub struct Assignment {
    /// Indexed by instruction; `None` for instructions producing no value.
    pub homes: Vec<Option<Home>>,
    pub num_slots: u32,
}

impl Assignment {
    /// Frame bytes needed for the spill area.
    pub fn spill_bytes(&self) -> i64 {
        self.num_slots as i64 * 8
    }
}

/// Pluggable strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegAllocStrategy {
    /// A dedicated 8-byte frame slot per SSA value.
    StackSpill,
    /// Sorted live intervals over a caller-saved register pool.
    LinearScan,
}

impl RegAllocStrategy {
    pub fn assign(self, program: &Program, func: &Function) -> Assignment {
        match self {
            RegAllocStrategy::StackSpill => stack_spill::assign(program, func),
            RegAllocStrategy::LinearScan => linear_scan::assign(program, func),
        }
    }
}

/// GP registers the linear-scan allocator may hand out. All caller-saved;
/// `rax`/`rcx`/`rdx` stay working registers and `r10`/`r11` stay scratch
/// for edge moves and call staging.
pub(crate) const GP_POOL: [Gp; 4] = [RDI, RSI, R8, R9];

/// XMM registers the linear-scan allocator may hand out; `xmm0..xmm3`
/// stay working/staging registers.
pub(crate) const XMM_POOL: [Xmm; 4] = [Xmm(4), Xmm(5), Xmm(6), Xmm(7)];

/// Register class of a value, decided by its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueClass {
    /// Produces no storable value.
    None,
    Int,
    Float,
}

pub(crate) fn value_class(program: &Program, func: &Function, idx: usize) -> ValueClass {
    use Opcode::*;
    let instr = func.instructions()[idx];
    match GenericReader::new(instr).opcode() {
        I8Store | I16Store | I32Store | I64Store | F64Store | PtrStore | Br | Condbr
        | Return | ReturnValue | CallArg | PhiMember => ValueClass::None,
        PtrAdd => ValueClass::Int,
        opcode => match program.type_of(func, Value::instr(idx as u32)) {
            Ok(t) if program.type_manager().is_void(t) => ValueClass::None,
            Ok(t) if program.type_manager().is_f64(t) => ValueClass::Float,
            Ok(_) => ValueClass::Int,
            Err(_) => {
                debug_assert!(false, "untyped opcode {opcode:?} outside the known set");
                ValueClass::Int
            }
        },
    }
}

/// The value operands an instruction reads, in either arena.
pub(crate) fn operands(instr: u64) -> impl Iterator<Item = Value> {
    use Opcode::*;
    let opcode = GenericReader::new(instr).opcode();
    let mut out: [Option<Value>; 2] = [None, None];
    match opcode {
        // binary
        I1Cmpeq | I1Cmpne | I8Add | I8Sub | I8Mul | I8Div | I8Cmpeq | I8Cmpne
        | I8Cmplt | I8Cmple | I8Cmpgt | I8Cmpge | I16Add | I16Sub | I16Mul | I16Div
        | I16Cmpeq | I16Cmpne | I16Cmplt | I16Cmple | I16Cmpgt | I16Cmpge | I32Add
        | I32Sub | I32Mul | I32Div | I32Cmpeq | I32Cmpne | I32Cmplt | I32Cmple
        | I32Cmpgt | I32Cmpge | I64Add | I64Sub | I64Mul | I64Div | I64Cmpeq
        | I64Cmpne | I64Cmplt | I64Cmple | I64Cmpgt | I64Cmpge | F64Add | F64Sub
        | F64Mul | F64Div | F64Cmpeq | F64Cmpne | F64Cmplt | F64Cmple | F64Cmpgt
        | F64Cmpge | PtrAdd | I8Store | I16Store | I32Store | I64Store | F64Store
        | PtrStore => {
            let r = Type2Reader::new(instr);
            out[0] = Some(Value::unpack(r.arg0()));
            out[1] = Some(Value::unpack(r.arg1()));
        }
        // unary T2
        I1Lnot | I1ZextI8 | I1ZextI64 | I8ZextI64 | I16ZextI64 | I32ZextI64
        | I8ConvF64 | I16ConvF64 | I32ConvF64 | I64ConvF64 | F64ConvI64
        | ReturnValue => {
            out[0] = Some(Value::unpack(Type2Reader::new(instr).arg0()));
        }
        // the member's incoming value; the phi operand is a write target
        PhiMember => {
            out[0] = Some(Value::unpack(Type2Reader::new(instr).arg1()));
        }
        // T3 with a value argument
        I8Load | I16Load | I32Load | I64Load | F64Load | PtrLoad | PtrCast
        | CallArg | CallIndirect => {
            out[0] = Some(Value::unpack(Type3Reader::new(instr).arg()));
        }
        Condbr => {
            out[0] = Some(Value::unpack(Type5Reader::new(instr).arg()));
        }
        _ => {}
    }
    out.into_iter().flatten()
}
