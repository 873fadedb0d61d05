//! The program builder.
//!
//! The builder tracks a current function and a current basic block; every
//! emitted instruction appends to the current block's range. Scalar and
//! aggregate constants go to the program-level constant arena instead and
//! are shareable across functions.

use hashbrown::HashMap;

use crate::error::KhirError;
use crate::instruction::{
    Type1Builder, Type2Builder, Type2Reader, Type3Builder, Type5Builder,
};
use crate::opcode::{CompType, Opcode};
use crate::program::{
    instr_type, ArrayConstant, Function, FunctionFlags, Global, Program, StructConstant,
};
use crate::types::{TypeId, TypeKind, TypeManager};
use crate::value::{BlockId, FuncId, Value};

/// Placeholder for a phi-member's not-yet-known phi operand.
const PHI_PLACEHOLDER: u32 = 0xFF_FFFF;

/// Builds one [`Program`].
#[derive(Debug)]
pub struct ProgramBuilder {
    type_manager: TypeManager,
    functions: Vec<Function>,
    name_to_function: HashMap<String, FuncId>,
    current_function: Option<FuncId>,
    i64_constants: Vec<u64>,
    f64_constants: Vec<f64>,
    char_array_constants: Vec<String>,
    struct_constants: Vec<StructConstant>,
    array_constants: Vec<ArrayConstant>,
    globals: Vec<Global>,
    constant_instrs: Vec<u64>,
}

macro_rules! binary_op {
    ($(#[$doc:meta])* $name:ident, $opcode:expr) => {
        $(#[$doc])*
        pub fn $name(&mut self, v1: Value, v2: Value) -> Result<Value, KhirError> {
            self.append(
                Type2Builder::new($opcode)
                    .arg0(v1.pack())
                    .arg1(v2.pack())
                    .build(),
            )
        }
    };
}

macro_rules! unary_op {
    ($(#[$doc:meta])* $name:ident, $opcode:expr) => {
        $(#[$doc])*
        pub fn $name(&mut self, v: Value) -> Result<Value, KhirError> {
            self.append(Type2Builder::new($opcode).arg0(v.pack()).build())
        }
    };
}

macro_rules! cmp_op {
    ($name:ident, $eq:expr, $ne:expr, $lt:expr, $le:expr, $gt:expr, $ge:expr) => {
        /// Signed comparison; yields `i1`.
        pub fn $name(
            &mut self,
            cmp: CompType,
            v1: Value,
            v2: Value,
        ) -> Result<Value, KhirError> {
            let opcode = match cmp {
                CompType::Eq => $eq,
                CompType::Ne => $ne,
                CompType::Lt => $lt,
                CompType::Le => $le,
                CompType::Gt => $gt,
                CompType::Ge => $ge,
            };
            self.append(
                Type2Builder::new(opcode)
                    .arg0(v1.pack())
                    .arg1(v2.pack())
                    .build(),
            )
        }
    };
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self {
            type_manager: TypeManager::new(),
            functions: Vec::new(),
            name_to_function: HashMap::new(),
            current_function: None,
            i64_constants: Vec::new(),
            f64_constants: Vec::new(),
            char_array_constants: Vec::new(),
            struct_constants: Vec::new(),
            array_constants: Vec::new(),
            globals: Vec::new(),
            constant_instrs: Vec::new(),
        }
    }

    // ---- Types -----------------------------------------------------------

    pub fn type_manager(&self) -> &TypeManager {
        &self.type_manager
    }

    pub fn void_type(&self) -> TypeId {
        self.type_manager.void_type()
    }

    pub fn i1_type(&self) -> TypeId {
        self.type_manager.i1_type()
    }

    pub fn i8_type(&self) -> TypeId {
        self.type_manager.i8_type()
    }

    pub fn i16_type(&self) -> TypeId {
        self.type_manager.i16_type()
    }

    pub fn i32_type(&self) -> TypeId {
        self.type_manager.i32_type()
    }

    pub fn i64_type(&self) -> TypeId {
        self.type_manager.i64_type()
    }

    pub fn f64_type(&self) -> TypeId {
        self.type_manager.f64_type()
    }

    pub fn i8_ptr_type(&self) -> TypeId {
        self.type_manager.i8_ptr_type()
    }

    pub fn pointer_type(&mut self, elem: TypeId) -> TypeId {
        self.type_manager.pointer_type(elem)
    }

    pub fn array_type(&mut self, elem: TypeId, len: u32) -> TypeId {
        self.type_manager.array_type(elem, len)
    }

    pub fn struct_type(&mut self, fields: &[TypeId]) -> Result<TypeId, KhirError> {
        self.type_manager.struct_type(fields)
    }

    pub fn named_struct_type(
        &mut self,
        fields: &[TypeId],
        name: &str,
    ) -> Result<TypeId, KhirError> {
        self.type_manager.named_struct_type(fields, name)
    }

    pub fn opaque_type(&mut self, name: &str) -> Result<TypeId, KhirError> {
        self.type_manager.opaque_type(name)
    }

    pub fn get_struct_type(&self, name: &str) -> Result<TypeId, KhirError> {
        self.type_manager.get_struct_type(name)
    }

    pub fn get_opaque_type(&self, name: &str) -> Result<TypeId, KhirError> {
        self.type_manager.get_opaque_type(name)
    }

    pub fn function_type(&mut self, result: TypeId, args: &[TypeId]) -> TypeId {
        self.type_manager.function_type(result, args)
    }

    /// The type of a value, recoverable from its packed word alone.
    pub fn type_of(&self, v: Value) -> Result<TypeId, KhirError> {
        let instr = if v.is_constant_global() {
            self.constant_instrs[v.idx() as usize]
        } else {
            self.current().instruction(v)
        };
        instr_type(
            &self.type_manager,
            &self.functions,
            &self.struct_constants,
            &self.array_constants,
            &self.globals,
            instr,
        )
    }

    // ---- Functions -------------------------------------------------------

    /// A private function with a generated symbol name.
    pub fn create_function(
        &mut self,
        result: TypeId,
        args: &[TypeId],
    ) -> Result<FuncId, KhirError> {
        let name = format!(".fn{}", self.functions.len());
        self.add_function(name, result, args, FunctionFlags::empty(), None)
    }

    /// A public function whose symbol the execution driver can resolve.
    pub fn create_public_function(
        &mut self,
        result: TypeId,
        args: &[TypeId],
        name: &str,
    ) -> Result<FuncId, KhirError> {
        self.add_function(name.to_owned(), result, args, FunctionFlags::PUBLIC, None)
    }

    /// Binds `name` to a function type and a native address supplied by the
    /// runtime.
    pub fn declare_external_function(
        &mut self,
        name: &str,
        result: TypeId,
        args: &[TypeId],
        addr: *const u8,
    ) -> Result<FuncId, KhirError> {
        self.add_function(
            name.to_owned(),
            result,
            args,
            FunctionFlags::EXTERNAL,
            Some(addr),
        )
    }

    fn add_function(
        &mut self,
        name: String,
        result: TypeId,
        args: &[TypeId],
        flags: FunctionFlags,
        addr: Option<*const u8>,
    ) -> Result<FuncId, KhirError> {
        if self.name_to_function.contains_key(&name) {
            return Err(KhirError::DuplicateName(name));
        }
        let function_type = self.type_manager.function_type(result, args);
        // func_ptr values are typed as pointers to this function type
        self.type_manager.pointer_type(function_type);

        let id = FuncId(self.functions.len() as u32);
        let mut function =
            Function::new(name.clone(), function_type, result, args.to_vec(), flags, addr);
        if !flags.contains(FunctionFlags::EXTERNAL) {
            function.init_body(args);
            self.current_function = Some(id);
        }
        self.functions.push(function);
        self.name_to_function.insert(name, id);
        Ok(id)
    }

    pub fn get_function(&self, name: &str) -> Result<FuncId, KhirError> {
        self.name_to_function
            .get(name)
            .copied()
            .ok_or_else(|| KhirError::UnknownName(name.to_owned()))
    }

    pub fn function_arguments(&self, f: FuncId) -> &[Value] {
        self.functions[f.idx()].arg_values()
    }

    /// Constant-arena value holding the address of `f`.
    pub fn function_pointer(&mut self, f: FuncId) -> Value {
        self.push_constant(Type3Builder::new(Opcode::FuncPtr).arg(f.0).build())
    }

    /// Re-focus construction on a previously created function.
    pub fn set_current_function(&mut self, f: FuncId) {
        debug_assert!(!self.functions[f.idx()].is_external());
        self.current_function = Some(f);
    }

    fn current(&self) -> &Function {
        let id = self.current_function.expect("no function under construction");
        &self.functions[id.idx()]
    }

    fn current_mut(&mut self) -> &mut Function {
        let id = self.current_function.expect("no function under construction");
        &mut self.functions[id.idx()]
    }

    fn append(&mut self, instr: u64) -> Result<Value, KhirError> {
        self.current_mut().append(instr)
    }

    fn push_constant(&mut self, instr: u64) -> Value {
        let idx = self.constant_instrs.len() as u32;
        self.constant_instrs.push(instr);
        Value::constant_global(idx)
    }

    // ---- Calls -----------------------------------------------------------

    /// Direct call. Arguments materialise as a positional `call_arg` run
    /// consumed by the trailing `call`.
    pub fn call(&mut self, f: FuncId, args: &[Value]) -> Result<Value, KhirError> {
        for (i, &arg) in args.iter().enumerate() {
            self.append(
                Type3Builder::new(Opcode::CallArg)
                    .sarg(i as u8)
                    .arg(arg.pack())
                    .build(),
            )?;
        }
        let result = self.functions[f.idx()].result_type();
        self.append(
            Type3Builder::new(Opcode::Call)
                .arg(f.0)
                .type_id(result.raw())
                .build(),
        )
    }

    /// Indirect call through a function-pointer value of type `func_type`.
    pub fn call_indirect(
        &mut self,
        func: Value,
        func_type: TypeId,
        args: &[Value],
    ) -> Result<Value, KhirError> {
        for (i, &arg) in args.iter().enumerate() {
            self.append(
                Type3Builder::new(Opcode::CallArg)
                    .sarg(i as u8)
                    .arg(arg.pack())
                    .build(),
            )?;
        }
        self.append(
            Type3Builder::new(Opcode::CallIndirect)
                .arg(func.pack())
                .type_id(func_type.raw())
                .build(),
        )
    }

    pub fn ret(&mut self) -> Result<(), KhirError> {
        self.append(Type1Builder::new(Opcode::Return).build())?;
        Ok(())
    }

    pub fn ret_value(&mut self, v: Value) -> Result<(), KhirError> {
        self.append(Type2Builder::new(Opcode::ReturnValue).arg0(v.pack()).build())?;
        Ok(())
    }

    // ---- Control flow ----------------------------------------------------

    pub fn generate_block(&mut self) -> BlockId {
        let func = self.current_function.expect("no function under construction");
        let block = self.current_mut().generate_basic_block();
        BlockId { func, block }
    }

    pub fn current_block(&self) -> BlockId {
        let func = self.current_function.expect("no function under construction");
        BlockId { func, block: self.current().current_basic_block() }
    }

    pub fn is_terminated(&self, b: BlockId) -> bool {
        self.functions[b.func.idx()].is_terminated(b.block)
    }

    /// Legal only once the current block is terminated.
    pub fn set_current_block(&mut self, b: BlockId) -> Result<(), KhirError> {
        debug_assert_eq!(Some(b.func), self.current_function);
        self.current_mut().set_current_basic_block(b.block)
    }

    pub fn branch(&mut self, b: BlockId) -> Result<(), KhirError> {
        self.append(Type5Builder::new(Opcode::Br).marg0(b.block as u16).build())?;
        Ok(())
    }

    pub fn branch_cond(
        &mut self,
        cond: Value,
        if_true: BlockId,
        if_false: BlockId,
    ) -> Result<(), KhirError> {
        self.append(
            Type5Builder::new(Opcode::Condbr)
                .arg(cond.pack())
                .marg0(if_true.block as u16)
                .marg1(if_false.block as u16)
                .build(),
        )?;
        Ok(())
    }

    /// A join-point value. Incoming operands arrive via
    /// [`Self::phi_member`] + [`Self::update_phi_member`].
    pub fn phi(&mut self, t: TypeId) -> Result<Value, KhirError> {
        self.append(Type3Builder::new(Opcode::Phi).type_id(t.raw()).build())
    }

    /// Records an incoming value in the predecessor block. The owning phi
    /// is unknown at this point; back-patch it with
    /// [`Self::update_phi_member`].
    pub fn phi_member(&mut self, v: Value) -> Result<Value, KhirError> {
        self.append(
            Type2Builder::new(Opcode::PhiMember)
                .arg0(PHI_PLACEHOLDER)
                .arg1(v.pack())
                .build(),
        )
    }

    /// Points a previously emitted phi-member at its phi.
    pub fn update_phi_member(&mut self, phi: Value, member: Value) {
        let old = self.current().instruction(member);
        let patched = Type2Builder::new(Opcode::PhiMember)
            .arg0(phi.pack())
            .arg1(Type2Reader::new(old).arg1())
            .build();
        self.current_mut().update(member, patched);
    }

    // ---- Memory ----------------------------------------------------------

    /// Stack allocation of one `t`; yields a `t*`.
    pub fn alloca(&mut self, t: TypeId) -> Result<Value, KhirError> {
        let ptr = self.type_manager.pointer_type(t);
        self.append(Type3Builder::new(Opcode::Alloca).type_id(ptr.raw()).build())
    }

    /// Null constant of the pointer type `t`.
    pub fn nullptr(&mut self, t: TypeId) -> Value {
        self.push_constant(Type3Builder::new(Opcode::Nullptr).type_id(t.raw()).build())
    }

    pub fn ptr_cast(&mut self, v: Value, t: TypeId) -> Result<Value, KhirError> {
        self.append(
            Type3Builder::new(Opcode::PtrCast)
                .arg(v.pack())
                .type_id(t.raw())
                .build(),
        )
    }

    pub fn store(&mut self, ptr: Value, v: Value) -> Result<(), KhirError> {
        let pointee = self.pointee_of(ptr)?;
        let opcode = match self.type_manager.kind(pointee) {
            TypeKind::I1 | TypeKind::I8 => Opcode::I8Store,
            TypeKind::I16 => Opcode::I16Store,
            TypeKind::I32 => Opcode::I32Store,
            TypeKind::I64 => Opcode::I64Store,
            TypeKind::F64 => Opcode::F64Store,
            TypeKind::Pointer { .. } => Opcode::PtrStore,
            _ => return Err(KhirError::InvalidIndex(pointee)),
        };
        self.append(
            Type2Builder::new(opcode)
                .arg0(ptr.pack())
                .arg1(v.pack())
                .build(),
        )?;
        Ok(())
    }

    pub fn load(&mut self, ptr: Value) -> Result<Value, KhirError> {
        let pointee = self.pointee_of(ptr)?;
        let opcode = match self.type_manager.kind(pointee) {
            TypeKind::I1 | TypeKind::I8 => Opcode::I8Load,
            TypeKind::I16 => Opcode::I16Load,
            TypeKind::I32 => Opcode::I32Load,
            TypeKind::I64 => Opcode::I64Load,
            TypeKind::F64 => Opcode::F64Load,
            TypeKind::Pointer { .. } => Opcode::PtrLoad,
            _ => return Err(KhirError::InvalidIndex(pointee)),
        };
        self.append(
            Type3Builder::new(opcode)
                .arg(ptr.pack())
                .type_id(pointee.raw())
                .build(),
        )
    }

    fn pointee_of(&self, ptr: Value) -> Result<TypeId, KhirError> {
        let t = self.type_of(ptr)?;
        self.type_manager.pointer_elem(t)
    }

    /// `size_of(t)` as an `i64` constant.
    pub fn size_of(&mut self, t: TypeId) -> Result<Value, KhirError> {
        let size = self.type_manager.size_of(t)?;
        Ok(self.const_i64(size as i64))
    }

    /// GEP over a `t*`: scaled index path folded to a byte offset, applied
    /// with `ptr_add` and cast to the element pointer type.
    pub fn get_element_ptr(
        &mut self,
        t: TypeId,
        ptr: Value,
        idx: &[i32],
    ) -> Result<Value, KhirError> {
        let (offset, result_ptr) = self.type_manager.pointer_offset(t, idx, false)?;
        let offset = self.const_i64(offset);
        let sum = self.append(
            Type2Builder::new(Opcode::PtrAdd)
                .arg0(ptr.pack())
                .arg1(offset.pack())
                .build(),
        )?;
        self.ptr_cast(sum, result_ptr)
    }

    // ---- Scalar constants ------------------------------------------------

    pub fn const_i1(&mut self, v: bool) -> Value {
        self.push_constant(Type1Builder::new(Opcode::I1Const).constant(v as u64).build())
    }

    pub fn const_i8(&mut self, v: i8) -> Value {
        self.push_constant(
            Type1Builder::new(Opcode::I8Const).constant(v as u8 as u64).build(),
        )
    }

    pub fn const_i16(&mut self, v: i16) -> Value {
        self.push_constant(
            Type1Builder::new(Opcode::I16Const).constant(v as u16 as u64).build(),
        )
    }

    pub fn const_i32(&mut self, v: i32) -> Value {
        self.push_constant(
            Type1Builder::new(Opcode::I32Const).constant(v as u32 as u64).build(),
        )
    }

    /// 64-bit literals overflow the 48-bit immediate, so they live in a
    /// side pool and the instruction carries the pool index.
    pub fn const_i64(&mut self, v: i64) -> Value {
        let idx = self.i64_constants.len() as u64;
        self.i64_constants.push(v as u64);
        self.push_constant(Type1Builder::new(Opcode::I64Const).constant(idx).build())
    }

    pub fn const_f64(&mut self, v: f64) -> Value {
        let idx = self.f64_constants.len() as u64;
        self.f64_constants.push(v);
        self.push_constant(Type1Builder::new(Opcode::F64Const).constant(idx).build())
    }

    // ---- i1 --------------------------------------------------------------

    unary_op!(
        /// Logical not, defined only over `i1`.
        lnot_i1,
        Opcode::I1Lnot
    );
    unary_op!(zext_i1_i8, Opcode::I1ZextI8);
    unary_op!(zext_i1_i64, Opcode::I1ZextI64);

    /// `i1` comparison; only `Eq`/`Ne` are meaningful.
    pub fn cmp_i1(&mut self, cmp: CompType, v1: Value, v2: Value) -> Result<Value, KhirError> {
        let opcode = match cmp {
            CompType::Eq => Opcode::I1Cmpeq,
            _ => Opcode::I1Cmpne,
        };
        self.append(
            Type2Builder::new(opcode)
                .arg0(v1.pack())
                .arg1(v2.pack())
                .build(),
        )
    }

    // ---- i8 --------------------------------------------------------------

    binary_op!(add_i8, Opcode::I8Add);
    binary_op!(sub_i8, Opcode::I8Sub);
    binary_op!(mul_i8, Opcode::I8Mul);
    binary_op!(div_i8, Opcode::I8Div);
    cmp_op!(
        cmp_i8,
        Opcode::I8Cmpeq,
        Opcode::I8Cmpne,
        Opcode::I8Cmplt,
        Opcode::I8Cmple,
        Opcode::I8Cmpgt,
        Opcode::I8Cmpge
    );
    unary_op!(zext_i8_i64, Opcode::I8ZextI64);
    unary_op!(i8_to_f64, Opcode::I8ConvF64);

    // ---- i16 -------------------------------------------------------------

    binary_op!(add_i16, Opcode::I16Add);
    binary_op!(sub_i16, Opcode::I16Sub);
    binary_op!(mul_i16, Opcode::I16Mul);
    binary_op!(div_i16, Opcode::I16Div);
    cmp_op!(
        cmp_i16,
        Opcode::I16Cmpeq,
        Opcode::I16Cmpne,
        Opcode::I16Cmplt,
        Opcode::I16Cmple,
        Opcode::I16Cmpgt,
        Opcode::I16Cmpge
    );
    unary_op!(zext_i16_i64, Opcode::I16ZextI64);
    unary_op!(i16_to_f64, Opcode::I16ConvF64);

    // ---- i32 -------------------------------------------------------------

    binary_op!(add_i32, Opcode::I32Add);
    binary_op!(sub_i32, Opcode::I32Sub);
    binary_op!(mul_i32, Opcode::I32Mul);
    binary_op!(div_i32, Opcode::I32Div);
    cmp_op!(
        cmp_i32,
        Opcode::I32Cmpeq,
        Opcode::I32Cmpne,
        Opcode::I32Cmplt,
        Opcode::I32Cmple,
        Opcode::I32Cmpgt,
        Opcode::I32Cmpge
    );
    unary_op!(zext_i32_i64, Opcode::I32ZextI64);
    unary_op!(i32_to_f64, Opcode::I32ConvF64);

    // ---- i64 -------------------------------------------------------------

    binary_op!(add_i64, Opcode::I64Add);
    binary_op!(sub_i64, Opcode::I64Sub);
    binary_op!(mul_i64, Opcode::I64Mul);
    binary_op!(div_i64, Opcode::I64Div);
    cmp_op!(
        cmp_i64,
        Opcode::I64Cmpeq,
        Opcode::I64Cmpne,
        Opcode::I64Cmplt,
        Opcode::I64Cmple,
        Opcode::I64Cmpgt,
        Opcode::I64Cmpge
    );
    unary_op!(i64_to_f64, Opcode::I64ConvF64);

    // ---- f64 -------------------------------------------------------------

    binary_op!(add_f64, Opcode::F64Add);
    binary_op!(sub_f64, Opcode::F64Sub);
    binary_op!(mul_f64, Opcode::F64Mul);
    binary_op!(div_f64, Opcode::F64Div);
    cmp_op!(
        cmp_f64,
        Opcode::F64Cmpeq,
        Opcode::F64Cmpne,
        Opcode::F64Cmplt,
        Opcode::F64Cmple,
        Opcode::F64Cmpgt,
        Opcode::F64Cmpge
    );
    unary_op!(f64_to_i64, Opcode::F64ConvI64);

    // ---- Aggregate constants and globals ---------------------------------

    /// Pooled string literal; yields its `i8*`.
    pub fn global_char_array(&mut self, s: &str) -> Value {
        let idx = self.char_array_constants.len() as u64;
        self.char_array_constants.push(s.to_owned());
        self.push_constant(
            Type1Builder::new(Opcode::GlobalCharArrayConst).constant(idx).build(),
        )
    }

    /// A struct constant whose fields are earlier constant-pool entries.
    pub fn constant_struct(
        &mut self,
        t: TypeId,
        fields: &[Value],
    ) -> Result<Value, KhirError> {
        if fields.iter().any(|f| !f.is_constant_global()) {
            return Err(KhirError::InvalidConstantDependency);
        }
        self.type_manager.pointer_type(t);
        let idx = self.struct_constants.len() as u64;
        self.struct_constants.push(StructConstant { type_id: t, fields: fields.to_vec() });
        Ok(self.push_constant(Type1Builder::new(Opcode::StructConst).constant(idx).build()))
    }

    /// An array constant whose elements are earlier constant-pool entries.
    pub fn constant_array(
        &mut self,
        t: TypeId,
        elems: &[Value],
    ) -> Result<Value, KhirError> {
        if elems.iter().any(|e| !e.is_constant_global()) {
            return Err(KhirError::InvalidConstantDependency);
        }
        self.type_manager.pointer_type(t);
        let idx = self.array_constants.len() as u64;
        self.array_constants.push(ArrayConstant { type_id: t, elems: elems.to_vec() });
        Ok(self.push_constant(Type1Builder::new(Opcode::ArrayConst).constant(idx).build()))
    }

    /// A global variable; yields the constant-arena reference to it.
    pub fn global(
        &mut self,
        constant: bool,
        public: bool,
        t: TypeId,
        init: Value,
    ) -> Result<Value, KhirError> {
        if !init.is_constant_global() {
            return Err(KhirError::InvalidConstantDependency);
        }
        self.type_manager.pointer_type(t);
        let idx = self.globals.len() as u64;
        self.globals.push(Global { constant, public, type_id: t, init });
        Ok(self.push_constant(Type1Builder::new(Opcode::GlobalRef).constant(idx).build()))
    }

    // ---- Finalisation ----------------------------------------------------

    /// Freezes the builder into an immutable [`Program`].
    pub fn finish(self) -> Program {
        Program {
            type_manager: self.type_manager,
            functions: self.functions,
            name_to_function: self.name_to_function,
            i64_constants: self.i64_constants,
            f64_constants: self.f64_constants,
            char_array_constants: self.char_array_constants,
            struct_constants: self.struct_constants,
            array_constants: self.array_constants,
            globals: self.globals,
            constant_instrs: self.constant_instrs,
        }
    }
}
