//! Lowering of a KHIR program to x86-64 machine code.
//!
//! Translation runs in three phases: the data section (string literals and
//! recursively serialised globals), a label per function, then function
//! bodies. Every function shares the same frame discipline: callee-saved
//! pushes, `rbp` frame, a placeholder `sub rsp, imm32` back-patched once
//! the body has been lowered, and a single epilogue all returns jump to.

use hashbrown::HashMap;
use tracing::debug;

use quarry_khir::instruction::{
    GenericReader, Type1Reader, Type2Reader, Type3Reader, Type5Reader,
};
use quarry_khir::{Backend, BackendError, Function, Opcode, Program, TypeId, Value};

use crate::buffer::{CodeBuffer, ExecBuffer, Label};
use crate::encoder::{
    Asm, Cond, Gp, Width, Xmm, R10, R11, R8, R9, RAX, RBP, RBX, RCX, RDI, RDX, RSI,
    RSP, R12, R13, R14, R15, XMM0, XMM1, XMM14, XMM15,
};
use crate::regalloc::{Assignment, Home, RegAllocStrategy, ValueClass};

const CALLEE_SAVED: [Gp; 5] = [RBX, R12, R13, R14, R15];
const INT_ARG_REGS: [Gp; 6] = [RDI, RSI, RDX, RCX, R8, R9];
const MAX_FLOAT_ARG_REGS: usize = 8;

/// Offset of the first stack-passed incoming argument from `rbp`:
/// saved `rbp`, five callee-saved registers, then the return address.
const INCOMING_STACK_ARG_BASE: i32 = 8 + 5 * 8 + 8;

/// A pending register/slot write, resolved as a parallel-move sequence.
#[derive(Debug, Clone, Copy)]
struct Move {
    src: MoveSrc,
    dst: Home,
    class: ValueClass,
}

#[derive(Debug, Clone, Copy)]
enum MoveSrc {
    Home(Home),
    Const(Value),
}

/// The in-process x86-64 JIT backend.
pub struct AsmBackend {
    strategy: RegAllocStrategy,
    buffer: Option<CodeBuffer>,
    exec: Option<ExecBuffer>,
    char_labels: Vec<Label>,
    global_labels: Vec<Label>,
    func_labels: Vec<Label>,
    external_addrs: Vec<Option<*const u8>>,
    public_labels: HashMap<String, Label>,
    entries: HashMap<String, usize>,
}

impl AsmBackend {
    pub fn new(strategy: RegAllocStrategy) -> Self {
        Self {
            strategy,
            buffer: None,
            exec: None,
            char_labels: Vec::new(),
            global_labels: Vec::new(),
            func_labels: Vec::new(),
            external_addrs: Vec::new(),
            public_labels: HashMap::new(),
            entries: HashMap::new(),
        }
    }

    // ---- Data section ----------------------------------------------------

    /// Serialises one constant-pool entry; returns the bytes written.
    fn output_constant(
        &self,
        buf: &mut CodeBuffer,
        program: &Program,
        instr: u64,
    ) -> Result<u64, BackendError> {
        let reader = Type1Reader::new(instr);
        match GenericReader::new(instr).opcode() {
            // i1 is stored as a byte
            Opcode::I1Const | Opcode::I8Const => {
                buf.emit_u8(reader.constant() as u8);
                Ok(1)
            }
            Opcode::I16Const => {
                buf.emit_u16(reader.constant() as u16);
                Ok(2)
            }
            Opcode::I32Const => {
                buf.emit_u32(reader.constant() as u32);
                Ok(4)
            }
            Opcode::I64Const => {
                buf.emit_u64(program.i64_constants()[reader.constant() as usize]);
                Ok(8)
            }
            Opcode::F64Const => {
                buf.emit_u64(program.f64_constants()[reader.constant() as usize].to_bits());
                Ok(8)
            }
            Opcode::GlobalCharArrayConst => {
                buf.emit_abs64(self.char_labels[reader.constant() as usize]);
                Ok(8)
            }
            Opcode::Nullptr => {
                buf.emit_u64(0);
                Ok(8)
            }
            Opcode::GlobalRef => {
                buf.emit_abs64(self.global_labels[reader.constant() as usize]);
                Ok(8)
            }
            Opcode::FuncPtr => {
                let func_idx = Type3Reader::new(instr).arg() as usize;
                match self.external_addrs[func_idx] {
                    Some(addr) => buf.emit_u64(addr as u64),
                    None => buf.emit_abs64(self.func_labels[func_idx]),
                }
                Ok(8)
            }
            Opcode::StructConst => {
                let sc = &program.struct_constants()[reader.constant() as usize];
                let tm = program.type_manager();
                let offsets = tm.field_offsets(sc.type_id)?.to_vec();
                let size = tm.size_of(sc.type_id)?;
                let mut written = 0u64;
                for (field, &offset) in sc.fields.iter().zip(&offsets) {
                    while written < offset {
                        buf.emit_u8(0);
                        written += 1;
                    }
                    let field_instr = program.constant_instrs()[field.idx() as usize];
                    written += self.output_constant(buf, program, field_instr)?;
                }
                while written < size {
                    buf.emit_u8(0);
                    written += 1;
                }
                Ok(written)
            }
            Opcode::ArrayConst => {
                let ac = &program.array_constants()[reader.constant() as usize];
                let mut written = 0u64;
                for elem in &ac.elems {
                    let elem_instr = program.constant_instrs()[elem.idx() as usize];
                    written += self.output_constant(buf, program, elem_instr)?;
                }
                Ok(written)
            }
            opcode => Err(BackendError::BackendBuildFailed(format!(
                "{opcode:?} is not a constant"
            ))),
        }
    }

    // ---- Operand materialisation -----------------------------------------

    fn const_to_gp(
        &self,
        asm: &mut Asm<'_>,
        program: &Program,
        v: Value,
        dst: Gp,
    ) -> Result<(), BackendError> {
        let instr = program.constant_instrs()[v.idx() as usize];
        let reader = Type1Reader::new(instr);
        match GenericReader::new(instr).opcode() {
            Opcode::I1Const | Opcode::I8Const | Opcode::I16Const | Opcode::I32Const => {
                asm.mov_ri64(dst, reader.constant());
            }
            Opcode::I64Const => {
                asm.mov_ri64(dst, program.i64_constants()[reader.constant() as usize]);
            }
            Opcode::F64Const => {
                asm.mov_ri64(
                    dst,
                    program.f64_constants()[reader.constant() as usize].to_bits(),
                );
            }
            Opcode::Nullptr => asm.mov_ri64(dst, 0),
            Opcode::GlobalCharArrayConst => {
                asm.lea_rip(dst, self.char_labels[reader.constant() as usize]);
            }
            Opcode::GlobalRef => {
                asm.lea_rip(dst, self.global_labels[reader.constant() as usize]);
            }
            Opcode::FuncPtr => {
                let func_idx = Type3Reader::new(instr).arg() as usize;
                match self.external_addrs[func_idx] {
                    Some(addr) => asm.mov_ri64(dst, addr as u64),
                    None => asm.lea_rip(dst, self.func_labels[func_idx]),
                }
            }
            opcode => {
                return Err(BackendError::BackendBuildFailed(format!(
                    "{opcode:?} cannot be materialised outside a global initializer"
                )))
            }
        }
        Ok(())
    }

    fn value_to_gp(
        &self,
        asm: &mut Asm<'_>,
        program: &Program,
        assignment: &Assignment,
        v: Value,
        dst: Gp,
    ) -> Result<(), BackendError> {
        if v.is_constant_global() {
            return self.const_to_gp(asm, program, v, dst);
        }
        match assignment.homes[v.idx() as usize] {
            Some(Home::Gp(reg)) => asm.mov_rr(dst, reg),
            Some(Home::Slot(offset)) => asm.mov_rm(dst, RBP, -offset),
            Some(Home::Xmm(reg)) => asm.movq_rx(dst, reg),
            None => {
                return Err(BackendError::BackendBuildFailed(format!(
                    "value %{} has no storage",
                    v.idx()
                )))
            }
        }
        Ok(())
    }

    fn value_to_xmm(
        &self,
        asm: &mut Asm<'_>,
        program: &Program,
        assignment: &Assignment,
        v: Value,
        dst: Xmm,
    ) -> Result<(), BackendError> {
        if v.is_constant_global() {
            self.const_to_gp(asm, program, v, RAX)?;
            asm.movq_xr(dst, RAX);
            return Ok(());
        }
        match assignment.homes[v.idx() as usize] {
            Some(Home::Xmm(reg)) => asm.movsd_xx(dst, reg),
            Some(Home::Slot(offset)) => asm.movsd_xm(dst, RBP, -offset),
            Some(Home::Gp(reg)) => asm.movq_xr(dst, reg),
            None => {
                return Err(BackendError::BackendBuildFailed(format!(
                    "value %{} has no storage",
                    v.idx()
                )))
            }
        }
        Ok(())
    }

    fn store_gp(asm: &mut Asm<'_>, home: Option<Home>, src: Gp) {
        match home {
            Some(Home::Gp(reg)) => asm.mov_rr(reg, src),
            Some(Home::Slot(offset)) => asm.mov_mr(RBP, -offset, src),
            Some(Home::Xmm(reg)) => asm.movq_xr(reg, src),
            None => {}
        }
    }

    fn store_xmm(asm: &mut Asm<'_>, home: Option<Home>, src: Xmm) {
        match home {
            Some(Home::Xmm(reg)) => asm.movsd_xx(reg, src),
            Some(Home::Slot(offset)) => asm.movsd_mx(RBP, -offset, src),
            Some(Home::Gp(reg)) => {
                asm.movq_rx(RAX, src);
                asm.mov_rr(reg, RAX);
            }
            None => {}
        }
    }

    // ---- Parallel moves --------------------------------------------------

    /// Emits a move set whose sources must all be read before any
    /// conflicting destination is written. Cycles are broken through the
    /// scratch registers (`r10` / `xmm15`).
    fn resolve_moves(
        &self,
        asm: &mut Asm<'_>,
        program: &Program,
        assignment: &Assignment,
        mut pending: Vec<Move>,
    ) -> Result<(), BackendError> {
        pending.retain(|m| !matches!(m.src, MoveSrc::Home(h) if h == m.dst));

        while !pending.is_empty() {
            let blocked: Vec<Home> = pending
                .iter()
                .filter_map(|m| match m.src {
                    MoveSrc::Home(h) => Some(h),
                    MoveSrc::Const(_) => None,
                })
                .collect();

            if let Some(pos) = pending.iter().position(|m| !blocked.contains(&m.dst)) {
                let m = pending.swap_remove(pos);
                self.emit_move(asm, program, assignment, m)?;
            } else {
                // Cycle: divert one register/slot source through a scratch.
                let pos = pending
                    .iter()
                    .position(|m| matches!(m.src, MoveSrc::Home(_)))
                    .expect("a blocked move set always contains a home source");
                let m = &mut pending[pos];
                let MoveSrc::Home(src) = m.src else { unreachable!() };
                match m.class {
                    ValueClass::Float => {
                        match src {
                            Home::Xmm(reg) => asm.movsd_xx(XMM15, reg),
                            Home::Slot(offset) => asm.movsd_xm(XMM15, RBP, -offset),
                            Home::Gp(reg) => {
                                asm.mov_rr(R10, reg);
                                asm.movq_xr(XMM15, R10);
                            }
                        }
                        m.src = MoveSrc::Home(Home::Xmm(XMM15));
                    }
                    _ => {
                        match src {
                            Home::Gp(reg) => asm.mov_rr(R10, reg),
                            Home::Slot(offset) => asm.mov_rm(R10, RBP, -offset),
                            Home::Xmm(reg) => asm.movq_rx(R10, reg),
                        }
                        m.src = MoveSrc::Home(Home::Gp(R10));
                    }
                }
            }
        }
        Ok(())
    }

    fn emit_move(
        &self,
        asm: &mut Asm<'_>,
        program: &Program,
        assignment: &Assignment,
        m: Move,
    ) -> Result<(), BackendError> {
        match (m.src, m.dst, m.class) {
            (MoveSrc::Const(v), Home::Gp(dst), _) => {
                self.const_to_gp(asm, program, v, dst)?;
            }
            (MoveSrc::Const(v), Home::Xmm(dst), _) => {
                self.const_to_gp(asm, program, v, RAX)?;
                asm.movq_xr(dst, RAX);
            }
            (MoveSrc::Const(v), Home::Slot(offset), _) => {
                self.const_to_gp(asm, program, v, RAX)?;
                asm.mov_mr(RBP, -offset, RAX);
            }
            (MoveSrc::Home(src), dst, ValueClass::Float) => {
                match (src, dst) {
                    (Home::Xmm(s), Home::Xmm(d)) => asm.movsd_xx(d, s),
                    (Home::Xmm(s), Home::Slot(d)) => asm.movsd_mx(RBP, -d, s),
                    (Home::Slot(s), Home::Xmm(d)) => asm.movsd_xm(d, RBP, -s),
                    (Home::Slot(s), Home::Slot(d)) => {
                        // xmm0..7 can be pending prologue/call sources, so
                        // slot transfers go through a high scratch
                        asm.movsd_xm(XMM14, RBP, -s);
                        asm.movsd_mx(RBP, -d, XMM14);
                    }
                    (Home::Gp(s), Home::Xmm(d)) => asm.movq_xr(d, s),
                    (Home::Xmm(s), Home::Gp(d)) => asm.movq_rx(d, s),
                    (Home::Gp(s), Home::Gp(d)) => asm.mov_rr(d, s),
                    (Home::Gp(s), Home::Slot(d)) => asm.mov_mr(RBP, -d, s),
                    (Home::Slot(s), Home::Gp(d)) => asm.mov_rm(d, RBP, -s),
                }
            }
            (MoveSrc::Home(src), dst, _) => match (src, dst) {
                (Home::Gp(s), Home::Gp(d)) => asm.mov_rr(d, s),
                (Home::Gp(s), Home::Slot(d)) => asm.mov_mr(RBP, -d, s),
                (Home::Slot(s), Home::Gp(d)) => asm.mov_rm(d, RBP, -s),
                (Home::Slot(s), Home::Slot(d)) => {
                    asm.mov_rm(RAX, RBP, -s);
                    asm.mov_mr(RBP, -d, RAX);
                }
                (Home::Xmm(s), Home::Gp(d)) => asm.movq_rx(d, s),
                (Home::Gp(s), Home::Xmm(d)) => asm.movq_xr(d, s),
                (Home::Xmm(s), Home::Slot(d)) => asm.movsd_mx(RBP, -d, s),
                (Home::Slot(s), Home::Xmm(d)) => asm.movsd_xm(d, RBP, -s),
                (Home::Xmm(s), Home::Xmm(d)) => asm.movsd_xx(d, s),
            },
        }
        Ok(())
    }

    // ---- Function bodies -------------------------------------------------

    #[allow(clippy::too_many_lines)]
    fn translate_function(
        &mut self,
        buf: &mut CodeBuffer,
        program: &Program,
        func_idx: usize,
        func: &Function,
    ) -> Result<(), BackendError> {
        let assignment = self.strategy.assign(program, func);

        buf.bind(self.func_labels[func_idx]);
        if func.is_public() {
            self.public_labels
                .insert(func.name().to_owned(), self.func_labels[func_idx]);
        }

        let mut asm = Asm::new(buf);

        // Prologue.
        for reg in CALLEE_SAVED {
            asm.push(reg);
        }
        asm.push(RBP);
        asm.mov_rr(RBP, RSP);
        let frame_patch = asm.sub_ri32(RSP, 0);

        // Incoming arguments into their homes.
        let mut moves = Vec::new();
        let mut next_int = 0usize;
        let mut next_float = 0usize;
        let mut next_stack = 0i32;
        for (&arg, &t) in func.arg_values().iter().zip(func.arg_types()) {
            let is_float = program.type_manager().is_f64(t);
            let (src, class) = if is_float && next_float < MAX_FLOAT_ARG_REGS {
                next_float += 1;
                (Home::Xmm(Xmm(next_float as u8 - 1)), ValueClass::Float)
            } else if !is_float && next_int < INT_ARG_REGS.len() {
                next_int += 1;
                (Home::Gp(INT_ARG_REGS[next_int - 1]), ValueClass::Int)
            } else {
                let offset = -(INCOMING_STACK_ARG_BASE + next_stack * 8);
                next_stack += 1;
                let class = if is_float { ValueClass::Float } else { ValueClass::Int };
                (Home::Slot(offset), class)
            };
            let Some(dst) = assignment.homes[arg.idx() as usize] else { continue };
            moves.push(Move { src: MoveSrc::Home(src), dst, class });
        }
        self.resolve_moves(&mut asm, program, &assignment, moves)?;

        let block_labels: Vec<Label> =
            (0..func.num_basic_blocks()).map(|_| asm.buf().new_label()).collect();
        let epilogue = asm.buf().new_label();

        let order = func.basic_block_order();
        let mut call_args: Vec<Value> = Vec::new();
        let mut edge_moves: Vec<Move> = Vec::new();
        for (pos, &block) in order.iter().enumerate() {
            let next_block = order.get(pos + 1).copied();
            asm.buf().bind(block_labels[block as usize]);
            for idx in func.basic_block(block as usize) {
                self.lower_instr(
                    &mut asm,
                    program,
                    func,
                    &assignment,
                    &block_labels,
                    epilogue,
                    next_block,
                    idx,
                    &mut call_args,
                    &mut edge_moves,
                )?;
            }
        }

        // Frame size: spill area rounded so call sites stay 16-byte
        // aligned (rsp is 8 mod 16 after the rbp push).
        let spill = assignment.spill_bytes();
        let frame = (spill + 15) / 16 * 16 + 8;
        asm.buf().patch_u32(
            frame_patch,
            u32::try_from(frame).map_err(|_| {
                BackendError::BackendBuildFailed("frame too large".into())
            })?,
        );

        // Epilogue.
        asm.buf().bind(epilogue);
        asm.leave();
        for reg in CALLEE_SAVED.iter().rev() {
            asm.pop(*reg);
        }
        asm.ret();
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    #[allow(clippy::too_many_lines)]
    fn lower_instr(
        &mut self,
        asm: &mut Asm<'_>,
        program: &Program,
        func: &Function,
        assignment: &Assignment,
        block_labels: &[Label],
        epilogue: Label,
        next_block: Option<u32>,
        idx: usize,
        call_args: &mut Vec<Value>,
        edge_moves: &mut Vec<Move>,
    ) -> Result<(), BackendError> {
        use Opcode::*;
        let instr = func.instructions()[idx];
        let opcode = GenericReader::new(instr).opcode();
        let home = assignment.homes[idx];

        match opcode {
            // ---- integer arithmetic --------------------------------------
            I8Add | I16Add | I32Add | I64Add | I8Sub | I16Sub | I32Sub | I64Sub => {
                let r = Type2Reader::new(instr);
                let width = Width::from_bits(opcode.operand_width().unwrap_or(64));
                self.value_to_gp(asm, program, assignment, Value::unpack(r.arg0()), RAX)?;
                self.value_to_gp(asm, program, assignment, Value::unpack(r.arg1()), RCX)?;
                if matches!(opcode, I8Add | I16Add | I32Add | I64Add) {
                    asm.add_rr(width, RAX, RCX);
                } else {
                    asm.sub_rr(width, RAX, RCX);
                }
                asm.movzx_rr(width, RAX, RAX);
                Self::store_gp(asm, home, RAX);
            }

            I8Mul | I16Mul | I32Mul | I64Mul => {
                let r = Type2Reader::new(instr);
                let width = Width::from_bits(opcode.operand_width().unwrap_or(64));
                self.value_to_gp(asm, program, assignment, Value::unpack(r.arg0()), RAX)?;
                self.value_to_gp(asm, program, assignment, Value::unpack(r.arg1()), RCX)?;
                asm.imul(width, RCX);
                asm.movzx_rr(width, RAX, RAX);
                Self::store_gp(asm, home, RAX);
            }

            I8Div | I16Div | I32Div | I64Div => {
                let r = Type2Reader::new(instr);
                let width = Width::from_bits(opcode.operand_width().unwrap_or(64));
                self.value_to_gp(asm, program, assignment, Value::unpack(r.arg0()), RAX)?;
                self.value_to_gp(asm, program, assignment, Value::unpack(r.arg1()), RCX)?;
                match width {
                    Width::W8 => asm.cbw(),
                    Width::W16 => asm.cwd(),
                    Width::W32 => asm.cdq(),
                    Width::W64 => asm.cqo(),
                }
                asm.idiv(width, RCX);
                asm.movzx_rr(width, RAX, RAX);
                Self::store_gp(asm, home, RAX);
            }

            // ---- comparisons ---------------------------------------------
            I1Cmpeq | I1Cmpne | I8Cmpeq | I8Cmpne | I8Cmplt | I8Cmple | I8Cmpgt
            | I8Cmpge | I16Cmpeq | I16Cmpne | I16Cmplt | I16Cmple | I16Cmpgt
            | I16Cmpge | I32Cmpeq | I32Cmpne | I32Cmplt | I32Cmple | I32Cmpgt
            | I32Cmpge | I64Cmpeq | I64Cmpne | I64Cmplt | I64Cmple | I64Cmpgt
            | I64Cmpge => {
                let r = Type2Reader::new(instr);
                let width = Width::from_bits(opcode.operand_width().unwrap_or(64));
                self.value_to_gp(asm, program, assignment, Value::unpack(r.arg0()), RAX)?;
                self.value_to_gp(asm, program, assignment, Value::unpack(r.arg1()), RCX)?;
                asm.cmp_rr(width, RAX, RCX);
                asm.setcc(int_cond(opcode), RAX);
                asm.movzx_rr(Width::W8, RAX, RAX);
                Self::store_gp(asm, home, RAX);
            }

            F64Cmpeq | F64Cmpne | F64Cmplt | F64Cmple | F64Cmpgt | F64Cmpge => {
                let r = Type2Reader::new(instr);
                self.value_to_xmm(asm, program, assignment, Value::unpack(r.arg0()), XMM0)?;
                self.value_to_xmm(asm, program, assignment, Value::unpack(r.arg1()), XMM1)?;
                asm.ucomisd(XMM0, XMM1);
                asm.setcc(float_cond(opcode), RAX);
                asm.movzx_rr(Width::W8, RAX, RAX);
                Self::store_gp(asm, home, RAX);
            }

            // ---- float arithmetic ----------------------------------------
            F64Add | F64Sub | F64Mul | F64Div => {
                let r = Type2Reader::new(instr);
                self.value_to_xmm(asm, program, assignment, Value::unpack(r.arg0()), XMM0)?;
                self.value_to_xmm(asm, program, assignment, Value::unpack(r.arg1()), XMM1)?;
                match opcode {
                    F64Add => asm.addsd(XMM0, XMM1),
                    F64Sub => asm.subsd(XMM0, XMM1),
                    F64Mul => asm.mulsd(XMM0, XMM1),
                    _ => asm.divsd(XMM0, XMM1),
                }
                Self::store_xmm(asm, home, XMM0);
            }

            // ---- conversions ---------------------------------------------
            I1Lnot => {
                let r = Type2Reader::new(instr);
                self.value_to_gp(asm, program, assignment, Value::unpack(r.arg0()), RAX)?;
                asm.xor_ri8(RAX, 1);
                Self::store_gp(asm, home, RAX);
            }

            I1ZextI8 | I1ZextI64 | I8ZextI64 | I16ZextI64 | I32ZextI64 => {
                let r = Type2Reader::new(instr);
                let width = Width::from_bits(opcode.operand_width().unwrap_or(64));
                self.value_to_gp(asm, program, assignment, Value::unpack(r.arg0()), RAX)?;
                asm.movzx_rr(width, RAX, RAX);
                Self::store_gp(asm, home, RAX);
            }

            I8ConvF64 | I16ConvF64 | I32ConvF64 | I64ConvF64 => {
                let r = Type2Reader::new(instr);
                let width = Width::from_bits(opcode.operand_width().unwrap_or(64));
                self.value_to_gp(asm, program, assignment, Value::unpack(r.arg0()), RAX)?;
                asm.movsx_rr(width, RAX, RAX);
                asm.cvtsi2sd(XMM0, RAX);
                Self::store_xmm(asm, home, XMM0);
            }

            F64ConvI64 => {
                let r = Type2Reader::new(instr);
                self.value_to_xmm(asm, program, assignment, Value::unpack(r.arg0()), XMM0)?;
                asm.cvttsd2si(RAX, XMM0);
                Self::store_gp(asm, home, RAX);
            }

            // ---- memory --------------------------------------------------
            I8Load | I16Load | I32Load | I64Load | PtrLoad => {
                let r = Type3Reader::new(instr);
                let width = Width::from_bits(opcode.operand_width().unwrap_or(64));
                self.value_to_gp(asm, program, assignment, Value::unpack(r.arg()), RAX)?;
                asm.load_zx(width, RAX, RAX, 0);
                Self::store_gp(asm, home, RAX);
            }

            F64Load => {
                let r = Type3Reader::new(instr);
                self.value_to_gp(asm, program, assignment, Value::unpack(r.arg()), RAX)?;
                asm.movsd_xm(XMM0, RAX, 0);
                Self::store_xmm(asm, home, XMM0);
            }

            I8Store | I16Store | I32Store | I64Store | PtrStore => {
                let r = Type2Reader::new(instr);
                let width = Width::from_bits(opcode.operand_width().unwrap_or(64));
                self.value_to_gp(asm, program, assignment, Value::unpack(r.arg0()), RAX)?;
                self.value_to_gp(asm, program, assignment, Value::unpack(r.arg1()), RCX)?;
                asm.mov_mr_width(width, RAX, 0, RCX);
            }

            F64Store => {
                let r = Type2Reader::new(instr);
                self.value_to_gp(asm, program, assignment, Value::unpack(r.arg0()), RAX)?;
                self.value_to_xmm(asm, program, assignment, Value::unpack(r.arg1()), XMM0)?;
                asm.movsd_mx(RAX, 0, XMM0);
            }

            PtrAdd => {
                let r = Type2Reader::new(instr);
                self.value_to_gp(asm, program, assignment, Value::unpack(r.arg0()), RAX)?;
                self.value_to_gp(asm, program, assignment, Value::unpack(r.arg1()), RCX)?;
                asm.add_rr(Width::W64, RAX, RCX);
                Self::store_gp(asm, home, RAX);
            }

            PtrCast => {
                let r = Type3Reader::new(instr);
                self.value_to_gp(asm, program, assignment, Value::unpack(r.arg()), RAX)?;
                Self::store_gp(asm, home, RAX);
            }

            Alloca => {
                let ptr_type = TypeId::from_raw(Type3Reader::new(instr).type_id());
                let tm = program.type_manager();
                let pointee = tm.pointer_elem(ptr_type)?;
                let size = tm.size_of(pointee)?;
                let size = size.div_ceil(16).max(1) * 16;
                // the returned pointer is the pre-subtraction rsp
                asm.mov_rr(RAX, RSP);
                asm.sub_ri32(
                    RSP,
                    i32::try_from(size).map_err(|_| {
                        BackendError::BackendBuildFailed("alloca too large".into())
                    })?,
                );
                Self::store_gp(asm, home, RAX);
            }

            // ---- control flow --------------------------------------------
            Br => {
                let target = Type5Reader::new(instr).marg0() as u32;
                self.resolve_moves(asm, program, assignment, std::mem::take(edge_moves))?;
                if next_block != Some(target) {
                    asm.jmp(block_labels[target as usize]);
                }
            }

            Condbr => {
                let r = Type5Reader::new(instr);
                let (on_true, on_false) = (r.marg0() as u32, r.marg1() as u32);
                self.resolve_moves(asm, program, assignment, std::mem::take(edge_moves))?;
                self.value_to_gp(asm, program, assignment, Value::unpack(r.arg()), RAX)?;
                // callers are not obliged to zero the upper bits of an i1
                asm.movzx_rr(Width::W8, RAX, RAX);
                asm.cmp_ri8(RAX, 1);
                if next_block == Some(on_true) {
                    asm.jcc(Cond::Ne, block_labels[on_false as usize]);
                } else if next_block == Some(on_false) {
                    asm.jcc(Cond::E, block_labels[on_true as usize]);
                } else {
                    asm.jcc(Cond::E, block_labels[on_true as usize]);
                    asm.jmp(block_labels[on_false as usize]);
                }
            }

            Return => {
                self.resolve_moves(asm, program, assignment, std::mem::take(edge_moves))?;
                asm.jmp(epilogue);
            }

            ReturnValue => {
                let r = Type2Reader::new(instr);
                self.resolve_moves(asm, program, assignment, std::mem::take(edge_moves))?;
                let v = Value::unpack(r.arg0());
                if program.type_manager().is_f64(func.result_type()) {
                    self.value_to_xmm(asm, program, assignment, v, XMM0)?;
                } else {
                    self.value_to_gp(asm, program, assignment, v, RAX)?;
                }
                asm.jmp(epilogue);
            }

            // ---- phi web -------------------------------------------------
            Phi | FuncArg => {}

            PhiMember => {
                let r = Type2Reader::new(instr);
                if r.arg0() == 0xFF_FFFF {
                    return Err(BackendError::BackendBuildFailed(
                        "phi member was never attached to a phi".into(),
                    ));
                }
                let phi = Value::unpack(r.arg0());
                let incoming = Value::unpack(r.arg1());
                let Some(dst) = assignment.homes[phi.idx() as usize] else {
                    return Err(BackendError::BackendBuildFailed(
                        "phi has no storage".into(),
                    ));
                };
                let phi_type = program.type_of(func, phi)?;
                let class = if program.type_manager().is_f64(phi_type) {
                    ValueClass::Float
                } else {
                    ValueClass::Int
                };
                let src = if incoming.is_constant_global() {
                    MoveSrc::Const(incoming)
                } else {
                    match assignment.homes[incoming.idx() as usize] {
                        Some(h) => MoveSrc::Home(h),
                        None => {
                            return Err(BackendError::BackendBuildFailed(
                                "phi member value has no storage".into(),
                            ))
                        }
                    }
                };
                edge_moves.push(Move { src, dst, class });
            }

            // ---- calls ---------------------------------------------------
            CallArg => {
                call_args.push(Value::unpack(Type3Reader::new(instr).arg()));
            }

            Call => {
                let r = Type3Reader::new(instr);
                let callee_idx = r.arg() as usize;
                let callee = &program.functions()[callee_idx];
                let arg_types = callee.arg_types().to_vec();
                let args = std::mem::take(call_args);
                let target = match self.external_addrs[callee_idx] {
                    Some(addr) => Callee::External(addr),
                    None => Callee::Internal(self.func_labels[callee_idx]),
                };
                self.lower_call(asm, program, assignment, target, &args, &arg_types)?;
                let result = TypeId::from_raw(r.type_id());
                Self::store_call_result(asm, program, home, result);
            }

            CallIndirect => {
                let r = Type3Reader::new(instr);
                let fn_type = TypeId::from_raw(r.type_id());
                let arg_types = program.type_manager().function_args(fn_type)?.to_vec();
                let args = std::mem::take(call_args);
                let fn_ptr = Value::unpack(r.arg());
                self.value_to_gp(asm, program, assignment, fn_ptr, R11)?;
                self.lower_call(asm, program, assignment, Callee::Register, &args, &arg_types)?;
                let result = program.type_manager().function_result(fn_type)?;
                Self::store_call_result(asm, program, home, result);
            }

            opcode => {
                return Err(BackendError::BackendBuildFailed(format!(
                    "{opcode:?} cannot appear in a function body"
                )))
            }
        }
        Ok(())
    }

    fn store_call_result(
        asm: &mut Asm<'_>,
        program: &Program,
        home: Option<Home>,
        result: TypeId,
    ) {
        if program.type_manager().is_void(result) {
            return;
        }
        if program.type_manager().is_f64(result) {
            Self::store_xmm(asm, home, XMM0);
        } else {
            Self::store_gp(asm, home, RAX);
        }
    }

    /// SysV call sequence: stack overflow args pushed right-to-left with
    /// 16-byte alignment restored, register args staged as one parallel
    /// move, then the call itself.
    fn lower_call(
        &self,
        asm: &mut Asm<'_>,
        program: &Program,
        assignment: &Assignment,
        callee: Callee,
        args: &[Value],
        arg_types: &[TypeId],
    ) -> Result<(), BackendError> {
        let tm = program.type_manager();
        let mut moves = Vec::new();
        let mut stack_args = Vec::new();
        let mut next_int = 0usize;
        let mut next_float = 0usize;
        for (&arg, &t) in args.iter().zip(arg_types) {
            let is_float = tm.is_f64(t);
            if is_float && next_float < MAX_FLOAT_ARG_REGS {
                moves.push(Move {
                    src: arg_src(assignment, arg)?,
                    dst: Home::Xmm(Xmm(next_float as u8)),
                    class: ValueClass::Float,
                });
                next_float += 1;
            } else if !is_float && next_int < INT_ARG_REGS.len() {
                moves.push(Move {
                    src: arg_src(assignment, arg)?,
                    dst: Home::Gp(INT_ARG_REGS[next_int]),
                    class: ValueClass::Int,
                });
                next_int += 1;
            } else {
                stack_args.push(arg);
            }
        }

        let padded = stack_args.len() % 2 == 1;
        if padded {
            asm.sub_ri32(RSP, 8);
        }
        for &arg in stack_args.iter().rev() {
            // pushed through rax; float bit patterns travel fine in a GP
            self.value_to_gp(asm, program, assignment, arg, RAX)?;
            asm.push(RAX);
        }

        self.resolve_moves(asm, program, assignment, moves)?;

        match callee {
            Callee::Internal(label) => asm.call(label),
            Callee::External(addr) => {
                asm.mov_ri64(R11, addr as u64);
                asm.call_r(R11);
            }
            Callee::Register => asm.call_r(R11),
        }

        let cleanup = stack_args.len() as i32 * 8 + if padded { 8 } else { 0 };
        if cleanup > 0 {
            asm.add_ri32(RSP, cleanup);
        }
        Ok(())
    }
}

enum Callee {
    Internal(Label),
    External(*const u8),
    /// Target already loaded into `r11`.
    Register,
}

fn arg_src(assignment: &Assignment, arg: Value) -> Result<MoveSrc, BackendError> {
    if arg.is_constant_global() {
        Ok(MoveSrc::Const(arg))
    } else {
        match assignment.homes[arg.idx() as usize] {
            Some(h) => Ok(MoveSrc::Home(h)),
            None => Err(BackendError::BackendBuildFailed(format!(
                "call argument %{} has no storage",
                arg.idx()
            ))),
        }
    }
}

fn int_cond(opcode: Opcode) -> Cond {
    use quarry_khir::CompType::*;
    match opcode.comparison().expect("comparison opcode") {
        Eq => Cond::E,
        Ne => Cond::Ne,
        Lt => Cond::L,
        Le => Cond::Le,
        Gt => Cond::G,
        Ge => Cond::Ge,
    }
}

fn float_cond(opcode: Opcode) -> Cond {
    use quarry_khir::CompType::*;
    match opcode.comparison().expect("comparison opcode") {
        Eq => Cond::E,
        Ne => Cond::Ne,
        Lt => Cond::B,
        Le => Cond::Be,
        Gt => Cond::A,
        Ge => Cond::Ae,
    }
}

impl Backend for AsmBackend {
    fn translate(&mut self, program: &Program) -> Result<(), BackendError> {
        debug!(strategy = ?self.strategy, "asm backend translate");
        let mut buf = CodeBuffer::new();

        self.char_labels = (0..program.char_array_constants().len())
            .map(|_| buf.new_label())
            .collect();
        self.global_labels =
            (0..program.globals().len()).map(|_| buf.new_label()).collect();
        self.func_labels =
            (0..program.functions().len()).map(|_| buf.new_label()).collect();
        self.external_addrs = program.functions().iter().map(|f| f.addr()).collect();

        // Data section: string literals, then globals.
        for (i, s) in program.char_array_constants().iter().enumerate() {
            buf.bind(self.char_labels[i]);
            buf.emit_bytes(s.as_bytes());
            buf.emit_u8(0);
        }
        for (i, global) in program.globals().iter().enumerate() {
            buf.align(8);
            buf.bind(self.global_labels[i]);
            let init = program.constant_instrs()[global.init.idx() as usize];
            self.output_constant(&mut buf, program, init)?;
        }
        buf.begin_code();

        // Bodies.
        for (i, func) in program.functions().iter().enumerate() {
            if func.is_external() {
                continue;
            }
            self.translate_function(&mut buf, program, i, func)?;
        }

        self.buffer = Some(buf);
        Ok(())
    }

    fn compile(&mut self) -> Result<(), BackendError> {
        let buf = self
            .buffer
            .take()
            .ok_or_else(|| BackendError::BackendBuildFailed("nothing translated".into()))?;
        self.entries = self
            .public_labels
            .iter()
            .map(|(name, &label)| {
                let offset = buf.label_offset(label).expect("bound function label");
                (name.clone(), offset)
            })
            .collect();
        self.exec = Some(buf.finalize()?);
        debug!(entries = self.entries.len(), "asm backend compiled");
        Ok(())
    }

    fn entry(&self, name: &str) -> Option<*const u8> {
        let offset = *self.entries.get(name)?;
        Some(self.exec.as_ref()?.entry(offset))
    }
}
