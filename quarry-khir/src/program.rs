//! The built program: functions, constant pools, globals.
//!
//! A [`Program`] is the immutable result of
//! [`crate::builder::ProgramBuilder::finish`]; backends borrow it for the
//! duration of translation and own nothing but their emitted artifacts
//! afterwards.

use bitflags::bitflags;
use hashbrown::HashMap;

use crate::error::KhirError;
use crate::instruction::{Type1Reader, Type3Reader};
use crate::opcode::Opcode;
use crate::types::{TypeId, TypeManager};
use crate::value::{FuncId, Value};

bitflags! {
    /// Function attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FunctionFlags: u8 {
        /// Declared by the runtime; has a native address, no body.
        const EXTERNAL = 1 << 0;
        /// Symbol resolvable by the execution driver.
        const PUBLIC = 1 << 1;
    }
}

/// Sentinel for a basic block that has not been made current yet.
const UNPLACED: u32 = u32::MAX;

/// A typed struct constant whose fields reference other constant-pool
/// entries.
#[derive(Debug, Clone)]
pub struct StructConstant {
    pub type_id: TypeId,
    pub fields: Vec<Value>,
}

/// A typed array constant whose elements reference other constant-pool
/// entries.
#[derive(Debug, Clone)]
pub struct ArrayConstant {
    pub type_id: TypeId,
    pub elems: Vec<Value>,
}

/// A global variable.
#[derive(Debug, Clone)]
pub struct Global {
    pub constant: bool,
    pub public: bool,
    pub type_id: TypeId,
    /// Constant-pool handle of the initializer.
    pub init: Value,
}

/// A function under construction or inside a finished [`Program`].
#[derive(Debug, Clone)]
pub struct Function {
    name: String,
    function_type: TypeId,
    result_type: TypeId,
    arg_types: Vec<TypeId>,
    arg_values: Vec<Value>,
    flags: FunctionFlags,
    addr: Option<*const u8>,
    instructions: Vec<u64>,
    basic_blocks: Vec<(u32, u32)>,
    basic_block_order: Vec<u32>,
    current_block: u32,
}

// The only raw pointer is the immutable native address of an external
// runtime function.
unsafe impl Send for Function {}
unsafe impl Sync for Function {}

impl Function {
    pub(crate) fn new(
        name: String,
        function_type: TypeId,
        result_type: TypeId,
        arg_types: Vec<TypeId>,
        flags: FunctionFlags,
        addr: Option<*const u8>,
    ) -> Self {
        Self {
            name,
            function_type,
            result_type,
            arg_types,
            arg_values: Vec::new(),
            flags,
            addr,
            instructions: Vec::new(),
            basic_blocks: Vec::new(),
            basic_block_order: Vec::new(),
            current_block: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function_type(&self) -> TypeId {
        self.function_type
    }

    pub fn result_type(&self) -> TypeId {
        self.result_type
    }

    pub fn arg_types(&self) -> &[TypeId] {
        &self.arg_types
    }

    pub fn arg_values(&self) -> &[Value] {
        &self.arg_values
    }

    pub fn is_external(&self) -> bool {
        self.flags.contains(FunctionFlags::EXTERNAL)
    }

    pub fn is_public(&self) -> bool {
        self.flags.contains(FunctionFlags::PUBLIC)
    }

    /// Native address of an external function.
    pub fn addr(&self) -> Option<*const u8> {
        self.addr
    }

    pub fn instructions(&self) -> &[u64] {
        &self.instructions
    }

    /// Half-open instruction range of each basic block.
    pub fn basic_blocks(&self) -> impl Iterator<Item = std::ops::Range<usize>> + '_ {
        self.basic_blocks
            .iter()
            .map(|&(s, e)| if s == UNPLACED { 0..0 } else { s as usize..e as usize })
    }

    pub fn basic_block(&self, id: usize) -> std::ops::Range<usize> {
        let (s, e) = self.basic_blocks[id];
        if s == UNPLACED {
            0..0
        } else {
            s as usize..e as usize
        }
    }

    pub fn num_basic_blocks(&self) -> usize {
        self.basic_blocks.len()
    }

    /// Blocks in layout order (the order they were made current).
    pub fn basic_block_order(&self) -> &[u32] {
        &self.basic_block_order
    }

    pub(crate) fn init_body(&mut self, arg_types: &[TypeId]) {
        let entry = self.generate_basic_block();
        self.basic_blocks[entry as usize].0 = 0;
        self.basic_blocks[entry as usize].1 = 0;
        self.basic_block_order.push(entry);
        self.current_block = entry;
        for (i, &t) in arg_types.iter().enumerate() {
            let instr = crate::instruction::Type3Builder::new(Opcode::FuncArg)
                .sarg(i as u8)
                .type_id(t.raw())
                .build();
            let v = self
                .append(instr)
                .expect("entry block cannot be terminated yet");
            self.arg_values.push(v);
        }
    }

    pub(crate) fn append(&mut self, instr: u64) -> Result<Value, KhirError> {
        if self.is_terminated(self.current_block) {
            return Err(KhirError::Terminated);
        }
        let idx = self.instructions.len() as u32;
        self.instructions.push(instr);
        let (start, end) = &mut self.basic_blocks[self.current_block as usize];
        debug_assert_ne!(*start, UNPLACED);
        debug_assert_eq!(*end, idx);
        *end = idx + 1;
        Ok(Value::instr(idx))
    }

    pub(crate) fn update(&mut self, pos: Value, instr: u64) {
        debug_assert!(!pos.is_constant_global());
        self.instructions[pos.idx() as usize] = instr;
    }

    pub fn instruction(&self, v: Value) -> u64 {
        debug_assert!(!v.is_constant_global());
        self.instructions[v.idx() as usize]
    }

    pub(crate) fn generate_basic_block(&mut self) -> u32 {
        let id = self.basic_blocks.len() as u32;
        self.basic_blocks.push((UNPLACED, UNPLACED));
        id
    }

    pub(crate) fn set_current_basic_block(&mut self, id: u32) -> Result<(), KhirError> {
        if !self.is_terminated(self.current_block) {
            return Err(KhirError::UnterminatedSwitch);
        }
        if self.basic_blocks[id as usize].0 == UNPLACED {
            let at = self.instructions.len() as u32;
            self.basic_blocks[id as usize] = (at, at);
            self.basic_block_order.push(id);
        }
        self.current_block = id;
        Ok(())
    }

    pub(crate) fn current_basic_block(&self) -> u32 {
        self.current_block
    }

    pub fn is_terminated(&self, id: u32) -> bool {
        let (start, end) = self.basic_blocks[id as usize];
        if start == UNPLACED || start == end {
            return false;
        }
        let last = self.instructions[end as usize - 1];
        crate::instruction::GenericReader::new(last).opcode().is_terminator()
    }
}

/// A fully-built program.
#[derive(Debug)]
pub struct Program {
    pub(crate) type_manager: TypeManager,
    pub(crate) functions: Vec<Function>,
    pub(crate) name_to_function: HashMap<String, FuncId>,
    pub(crate) i64_constants: Vec<u64>,
    pub(crate) f64_constants: Vec<f64>,
    pub(crate) char_array_constants: Vec<String>,
    pub(crate) struct_constants: Vec<StructConstant>,
    pub(crate) array_constants: Vec<ArrayConstant>,
    pub(crate) globals: Vec<Global>,
    pub(crate) constant_instrs: Vec<u64>,
}

impl Program {
    pub fn type_manager(&self) -> &TypeManager {
        &self.type_manager
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn function(&self, f: FuncId) -> &Function {
        &self.functions[f.idx()]
    }

    pub fn get_function(&self, name: &str) -> Result<FuncId, KhirError> {
        self.name_to_function
            .get(name)
            .copied()
            .ok_or_else(|| KhirError::UnknownName(name.to_owned()))
    }

    pub fn i64_constants(&self) -> &[u64] {
        &self.i64_constants
    }

    pub fn f64_constants(&self) -> &[f64] {
        &self.f64_constants
    }

    pub fn char_array_constants(&self) -> &[String] {
        &self.char_array_constants
    }

    pub fn struct_constants(&self) -> &[StructConstant] {
        &self.struct_constants
    }

    pub fn array_constants(&self) -> &[ArrayConstant] {
        &self.array_constants
    }

    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    /// The constant-global arena, in creation order.
    pub fn constant_instrs(&self) -> &[u64] {
        &self.constant_instrs
    }

    /// Hands the fully-built program to a backend instance.
    pub fn translate(
        &self,
        backend: &mut dyn crate::backend::Backend,
    ) -> Result<(), crate::error::BackendError> {
        backend.translate(self)
    }

    /// The instruction word a value refers to, in either arena.
    pub fn instr_of(&self, func: &Function, v: Value) -> u64 {
        if v.is_constant_global() {
            self.constant_instrs[v.idx() as usize]
        } else {
            func.instruction(v)
        }
    }

    /// The type of a value, per-instruction (no dataflow).
    pub fn type_of(&self, func: &Function, v: Value) -> Result<TypeId, KhirError> {
        instr_type(
            &self.type_manager,
            &self.functions,
            &self.struct_constants,
            &self.array_constants,
            &self.globals,
            self.instr_of(func, v),
        )
    }
}

/// Type of a single instruction word, resolved against the program tables.
///
/// Pointer types referenced here were interned when the corresponding
/// entity was created, so the immutable lookups cannot miss.
pub(crate) fn instr_type(
    tm: &TypeManager,
    functions: &[Function],
    struct_constants: &[StructConstant],
    array_constants: &[ArrayConstant],
    globals: &[Global],
    instr: u64,
) -> Result<TypeId, KhirError> {
    use Opcode::*;
    let opcode = crate::instruction::GenericReader::new(instr).opcode();
    let existing_pointer = |elem: TypeId| -> TypeId {
        tm.existing_pointer_type(elem)
            .expect("pointer type interned at creation")
    };
    match opcode {
        I1Const | I1Cmpeq | I1Cmpne | I1Lnot | I8Cmpeq | I8Cmpne | I8Cmplt | I8Cmple
        | I8Cmpgt | I8Cmpge | I16Cmpeq | I16Cmpne | I16Cmplt | I16Cmple | I16Cmpgt
        | I16Cmpge | I32Cmpeq | I32Cmpne | I32Cmplt | I32Cmple | I32Cmpgt | I32Cmpge
        | I64Cmpeq | I64Cmpne | I64Cmplt | I64Cmple | I64Cmpgt | I64Cmpge | F64Cmpeq
        | F64Cmpne | F64Cmplt | F64Cmple | F64Cmpgt | F64Cmpge => Ok(tm.i1_type()),

        I8Const | I8Add | I8Sub | I8Mul | I8Div | I1ZextI8 => Ok(tm.i8_type()),
        I16Const | I16Add | I16Sub | I16Mul | I16Div => Ok(tm.i16_type()),
        I32Const | I32Add | I32Sub | I32Mul | I32Div => Ok(tm.i32_type()),
        I64Const | I64Add | I64Sub | I64Mul | I64Div | I1ZextI64 | I8ZextI64
        | I16ZextI64 | I32ZextI64 | F64ConvI64 => Ok(tm.i64_type()),
        F64Const | F64Add | F64Sub | F64Mul | F64Div | I8ConvF64 | I16ConvF64
        | I32ConvF64 | I64ConvF64 => Ok(tm.f64_type()),

        GlobalCharArrayConst => Ok(tm.i8_ptr_type()),

        StructConst => {
            let id = Type1Reader::new(instr).constant() as usize;
            Ok(existing_pointer(struct_constants[id].type_id))
        }
        ArrayConst => {
            let id = Type1Reader::new(instr).constant() as usize;
            Ok(existing_pointer(array_constants[id].type_id))
        }
        GlobalRef => {
            let id = Type1Reader::new(instr).constant() as usize;
            Ok(existing_pointer(globals[id].type_id))
        }
        FuncPtr => {
            let id = Type3Reader::new(instr).arg() as usize;
            Ok(existing_pointer(functions[id].function_type()))
        }

        Nullptr | PtrCast | Alloca | Phi | FuncArg | Call | I8Load | I16Load
        | I32Load | I64Load | F64Load | PtrLoad => {
            Ok(TypeId::from_raw(Type3Reader::new(instr).type_id()))
        }
        CallIndirect => {
            let fn_type = TypeId::from_raw(Type3Reader::new(instr).type_id());
            tm.function_result(fn_type)
        }

        I8Store | I16Store | I32Store | I64Store | F64Store | PtrStore | Br
        | Condbr | Return | ReturnValue => Ok(tm.void_type()),

        PtrAdd | CallArg | PhiMember => Err(KhirError::UntypedFragment(opcode)),
    }
}
