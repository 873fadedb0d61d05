//! Emission of the textual LLVM module (opaque-pointer syntax).

use std::fmt::Write as _;

use hashbrown::HashMap;
use itertools::Itertools;

use quarry_khir::instruction::{
    GenericReader, Type1Reader, Type2Reader, Type3Reader, Type5Reader,
};
use quarry_khir::{
    BackendError, Function, Opcode, Program, TypeId, TypeKind, Value,
};

pub(crate) fn emit_module(program: &Program) -> Result<String, BackendError> {
    let mut out = String::new();
    let tm = program.type_manager();

    // Named type definitions, in insertion order.
    for (id, kind) in tm.iter() {
        match kind {
            TypeKind::Struct { fields, .. } => {
                let fields = fields.iter().map(|&f| type_text(program, f)).join(", ");
                let _ = writeln!(out, "%t{} = type {{ {fields} }}", id.raw());
            }
            TypeKind::Opaque { .. } => {
                let _ = writeln!(out, "%t{} = type opaque", id.raw());
            }
            _ => {}
        }
    }

    // String literals.
    for (i, s) in program.char_array_constants().iter().enumerate() {
        let _ = writeln!(
            out,
            "@str{} = private unnamed_addr constant [{} x i8] c\"{}\\00\"",
            i,
            s.len() + 1,
            escape(s)
        );
    }

    let constants = resolve_constants(program)?;

    // Globals.
    for (i, global) in program.globals().iter().enumerate() {
        let init = constants[global.init.idx() as usize]
            .as_ref()
            .ok_or(BackendError::Khir(
                quarry_khir::KhirError::InvalidConstantDependency,
            ))?;
        let linkage = if global.public { "dso_local" } else { "internal" };
        let kind = if global.constant { "constant" } else { "global" };
        let _ = writeln!(
            out,
            "@g{} = {} {} {} {}",
            i,
            linkage,
            kind,
            type_text(program, global.type_id),
            init
        );
    }

    // Function bodies.
    for func in program.functions() {
        if func.is_external() {
            continue;
        }
        emit_function(&mut out, program, func, &constants)?;
    }

    Ok(out)
}

/// Fixed-point sweep over the constant pool: an entry is emitted once all
/// the entries it references are. A sweep that makes no progress while
/// entries remain means the pool has a cycle or a dangling reference.
fn resolve_constants(program: &Program) -> Result<Vec<Option<String>>, BackendError> {
    let instrs = program.constant_instrs();
    let mut resolved: Vec<Option<String>> = vec![None; instrs.len()];
    let mut remaining = instrs.len();

    while remaining > 0 {
        let mut progressed = false;
        for (idx, &instr) in instrs.iter().enumerate() {
            if resolved[idx].is_some() {
                continue;
            }
            if let Some(text) = try_resolve(program, instr, &resolved)? {
                resolved[idx] = Some(text);
                remaining -= 1;
                progressed = true;
            }
        }
        if !progressed {
            return Err(BackendError::Khir(
                quarry_khir::KhirError::InvalidConstantDependency,
            ));
        }
    }
    Ok(resolved)
}

fn try_resolve(
    program: &Program,
    instr: u64,
    resolved: &[Option<String>],
) -> Result<Option<String>, BackendError> {
    let reader = Type1Reader::new(instr);
    let text = match GenericReader::new(instr).opcode() {
        Opcode::I1Const => {
            if reader.constant() == 1 { "true".into() } else { "false".into() }
        }
        Opcode::I8Const => (reader.constant() as u8 as i8).to_string(),
        Opcode::I16Const => (reader.constant() as u16 as i16).to_string(),
        Opcode::I32Const => (reader.constant() as u32 as i32).to_string(),
        Opcode::I64Const => {
            (program.i64_constants()[reader.constant() as usize] as i64).to_string()
        }
        Opcode::F64Const => format!(
            "0x{:016X}",
            program.f64_constants()[reader.constant() as usize].to_bits()
        ),
        Opcode::GlobalCharArrayConst => format!("@str{}", reader.constant()),
        Opcode::Nullptr => "null".into(),
        Opcode::GlobalRef => format!("@g{}", reader.constant()),
        Opcode::FuncPtr => {
            let func = &program.functions()[Type3Reader::new(instr).arg() as usize];
            match func.addr() {
                Some(addr) => format!("inttoptr (i64 {} to ptr)", addr as u64),
                None => format!("@\"{}\"", func.name()),
            }
        }
        Opcode::StructConst => {
            let sc = &program.struct_constants()[reader.constant() as usize];
            let field_types = match program.type_manager().kind(sc.type_id) {
                TypeKind::Struct { fields, .. } => fields.clone(),
                _ => {
                    return Err(BackendError::BackendBuildFailed(
                        "struct constant with non-struct type".into(),
                    ))
                }
            };
            let mut parts = Vec::with_capacity(sc.fields.len());
            for (field, t) in sc.fields.iter().zip(field_types) {
                match &resolved[field.idx() as usize] {
                    Some(text) => parts.push(format!("{} {}", type_text(program, t), text)),
                    None => return Ok(None),
                }
            }
            format!("{{ {} }}", parts.join(", "))
        }
        Opcode::ArrayConst => {
            let ac = &program.array_constants()[reader.constant() as usize];
            let elem_type = match program.type_manager().kind(ac.type_id) {
                TypeKind::Array { elem, .. } => *elem,
                _ => {
                    return Err(BackendError::BackendBuildFailed(
                        "array constant with non-array type".into(),
                    ))
                }
            };
            let elem_text = type_text(program, elem_type);
            let mut parts = Vec::with_capacity(ac.elems.len());
            for elem in &ac.elems {
                match &resolved[elem.idx() as usize] {
                    Some(text) => parts.push(format!("{elem_text} {text}")),
                    None => return Ok(None),
                }
            }
            format!("[{}]", parts.join(", "))
        }
        opcode => {
            return Err(BackendError::BackendBuildFailed(format!(
                "{opcode:?} is not a constant"
            )))
        }
    };
    Ok(Some(text))
}

fn emit_function(
    out: &mut String,
    program: &Program,
    func: &Function,
    constants: &[Option<String>],
) -> Result<(), BackendError> {
    let linkage = if func.is_public() { "dso_local" } else { "internal" };
    let params = func
        .arg_values()
        .iter()
        .zip(func.arg_types())
        .map(|(v, &t)| format!("{} %v{}", type_text(program, t), v.idx()))
        .join(", ");
    let _ = writeln!(
        out,
        "define {} {} @\"{}\"({}) {{",
        linkage,
        type_text(program, func.result_type()),
        func.name(),
        params
    );

    // Phi incoming lists, recovered from the members' blocks.
    let mut phi_members: HashMap<u32, Vec<(Value, u32)>> = HashMap::new();
    for &block in func.basic_block_order() {
        for idx in func.basic_block(block as usize) {
            let instr = func.instructions()[idx];
            if GenericReader::new(instr).opcode() == Opcode::PhiMember {
                let r = Type2Reader::new(instr);
                if r.arg0() == 0xFF_FFFF {
                    return Err(BackendError::BackendBuildFailed(
                        "phi member was never attached to a phi".into(),
                    ));
                }
                let phi = Value::unpack(r.arg0());
                let incoming = Value::unpack(r.arg1());
                phi_members.entry(phi.idx()).or_default().push((incoming, block));
            }
        }
    }

    let value_text = |v: Value| -> String {
        if v.is_constant_global() {
            constants[v.idx() as usize].clone().unwrap_or_else(|| "undef".into())
        } else {
            format!("%v{}", v.idx())
        }
    };

    let mut call_args: Vec<Value> = Vec::new();
    // Every block is labelled, the entry included; the entry label is only
    // illegal to branch to, not to write.
    for &block in func.basic_block_order() {
        let _ = writeln!(out, "b{block}:");
        for idx in func.basic_block(block as usize) {
            emit_instr(
                out,
                program,
                func,
                idx,
                &phi_members,
                &value_text,
                &mut call_args,
            )?;
        }
    }

    out.push_str("}\n");
    Ok(())
}

#[allow(clippy::too_many_lines)]
fn emit_instr(
    out: &mut String,
    program: &Program,
    func: &Function,
    idx: usize,
    phi_members: &HashMap<u32, Vec<(Value, u32)>>,
    value_text: &dyn Fn(Value) -> String,
    call_args: &mut Vec<Value>,
) -> Result<(), BackendError> {
    use Opcode::*;
    let instr = func.instructions()[idx];
    let opcode = GenericReader::new(instr).opcode();
    let tm = program.type_manager();

    let int_ty = |op: Opcode| match op.operand_width() {
        Some(8) => {
            // i1 families run at width 8 in the JIT but keep their IR type
            match op {
                I1Cmpeq | I1Cmpne | I1Lnot | I1ZextI8 | I1ZextI64 => "i1",
                _ => "i8",
            }
        }
        Some(16) => "i16",
        Some(32) => "i32",
        _ => "i64",
    };

    match opcode {
        I8Add | I16Add | I32Add | I64Add | I8Sub | I16Sub | I32Sub | I64Sub | I8Mul
        | I16Mul | I32Mul | I64Mul | I8Div | I16Div | I32Div | I64Div => {
            let r = Type2Reader::new(instr);
            let op = match opcode {
                I8Add | I16Add | I32Add | I64Add => "add",
                I8Sub | I16Sub | I32Sub | I64Sub => "sub",
                I8Mul | I16Mul | I32Mul | I64Mul => "mul",
                _ => "sdiv",
            };
            let _ = writeln!(
                out,
                "  %v{idx} = {op} {} {}, {}",
                int_ty(opcode),
                value_text(Value::unpack(r.arg0())),
                value_text(Value::unpack(r.arg1()))
            );
        }

        F64Add | F64Sub | F64Mul | F64Div => {
            let r = Type2Reader::new(instr);
            let op = match opcode {
                F64Add => "fadd",
                F64Sub => "fsub",
                F64Mul => "fmul",
                _ => "fdiv",
            };
            let _ = writeln!(
                out,
                "  %v{idx} = {op} double {}, {}",
                value_text(Value::unpack(r.arg0())),
                value_text(Value::unpack(r.arg1()))
            );
        }

        I1Cmpeq | I1Cmpne | I8Cmpeq | I8Cmpne | I8Cmplt | I8Cmple | I8Cmpgt | I8Cmpge
        | I16Cmpeq | I16Cmpne | I16Cmplt | I16Cmple | I16Cmpgt | I16Cmpge | I32Cmpeq
        | I32Cmpne | I32Cmplt | I32Cmple | I32Cmpgt | I32Cmpge | I64Cmpeq | I64Cmpne
        | I64Cmplt | I64Cmple | I64Cmpgt | I64Cmpge => {
            let r = Type2Reader::new(instr);
            let pred = match opcode.comparison().expect("comparison opcode") {
                quarry_khir::CompType::Eq => "eq",
                quarry_khir::CompType::Ne => "ne",
                quarry_khir::CompType::Lt => "slt",
                quarry_khir::CompType::Le => "sle",
                quarry_khir::CompType::Gt => "sgt",
                quarry_khir::CompType::Ge => "sge",
            };
            let _ = writeln!(
                out,
                "  %v{idx} = icmp {pred} {} {}, {}",
                int_ty(opcode),
                value_text(Value::unpack(r.arg0())),
                value_text(Value::unpack(r.arg1()))
            );
        }

        F64Cmpeq | F64Cmpne | F64Cmplt | F64Cmple | F64Cmpgt | F64Cmpge => {
            let r = Type2Reader::new(instr);
            let pred = match opcode.comparison().expect("comparison opcode") {
                quarry_khir::CompType::Eq => "oeq",
                quarry_khir::CompType::Ne => "one",
                quarry_khir::CompType::Lt => "olt",
                quarry_khir::CompType::Le => "ole",
                quarry_khir::CompType::Gt => "ogt",
                quarry_khir::CompType::Ge => "oge",
            };
            let _ = writeln!(
                out,
                "  %v{idx} = fcmp {pred} double {}, {}",
                value_text(Value::unpack(r.arg0())),
                value_text(Value::unpack(r.arg1()))
            );
        }

        I1Lnot => {
            let r = Type2Reader::new(instr);
            let _ = writeln!(
                out,
                "  %v{idx} = xor i1 {}, true",
                value_text(Value::unpack(r.arg0()))
            );
        }

        I1ZextI8 => {
            let r = Type2Reader::new(instr);
            let _ = writeln!(
                out,
                "  %v{idx} = zext i1 {} to i8",
                value_text(Value::unpack(r.arg0()))
            );
        }

        I1ZextI64 | I8ZextI64 | I16ZextI64 | I32ZextI64 => {
            let r = Type2Reader::new(instr);
            let _ = writeln!(
                out,
                "  %v{idx} = zext {} {} to i64",
                int_ty(opcode),
                value_text(Value::unpack(r.arg0()))
            );
        }

        I8ConvF64 | I16ConvF64 | I32ConvF64 | I64ConvF64 => {
            let r = Type2Reader::new(instr);
            let _ = writeln!(
                out,
                "  %v{idx} = sitofp {} {} to double",
                int_ty(opcode),
                value_text(Value::unpack(r.arg0()))
            );
        }

        F64ConvI64 => {
            let r = Type2Reader::new(instr);
            let _ = writeln!(
                out,
                "  %v{idx} = fptosi double {} to i64",
                value_text(Value::unpack(r.arg0()))
            );
        }

        I8Load | I16Load | I32Load | I64Load | F64Load | PtrLoad => {
            let r = Type3Reader::new(instr);
            let ty = type_text(program, TypeId::from_raw(r.type_id()));
            let _ = writeln!(
                out,
                "  %v{idx} = load {ty}, ptr {}",
                value_text(Value::unpack(r.arg()))
            );
        }

        I8Store | I16Store | I32Store | I64Store | F64Store | PtrStore => {
            let r = Type2Reader::new(instr);
            let value = Value::unpack(r.arg1());
            let ty = type_text(program, program.type_of(func, value)?);
            let _ = writeln!(
                out,
                "  store {ty} {}, ptr {}",
                value_text(value),
                value_text(Value::unpack(r.arg0()))
            );
        }

        PtrAdd => {
            let r = Type2Reader::new(instr);
            let _ = writeln!(
                out,
                "  %v{idx} = getelementptr i8, ptr {}, i64 {}",
                value_text(Value::unpack(r.arg0())),
                value_text(Value::unpack(r.arg1()))
            );
        }

        PtrCast => {
            let r = Type3Reader::new(instr);
            let _ = writeln!(
                out,
                "  %v{idx} = getelementptr i8, ptr {}, i64 0",
                value_text(Value::unpack(r.arg()))
            );
        }

        Alloca => {
            let ptr_type = TypeId::from_raw(Type3Reader::new(instr).type_id());
            let pointee = tm.pointer_elem(ptr_type)?;
            let _ = writeln!(
                out,
                "  %v{idx} = alloca {}, align 16",
                type_text(program, pointee)
            );
        }

        Br => {
            let target = Type5Reader::new(instr).marg0();
            let _ = writeln!(out, "  br label %b{target}");
        }

        Condbr => {
            let r = Type5Reader::new(instr);
            let _ = writeln!(
                out,
                "  br i1 {}, label %b{}, label %b{}",
                value_text(Value::unpack(r.arg())),
                r.marg0(),
                r.marg1()
            );
        }

        Return => {
            let _ = writeln!(out, "  ret void");
        }

        ReturnValue => {
            let r = Type2Reader::new(instr);
            let _ = writeln!(
                out,
                "  ret {} {}",
                type_text(program, func.result_type()),
                value_text(Value::unpack(r.arg0()))
            );
        }

        Phi => {
            let t = TypeId::from_raw(Type3Reader::new(instr).type_id());
            let members = phi_members.get(&(idx as u32)).ok_or_else(|| {
                BackendError::BackendBuildFailed(format!("phi %v{idx} has no members"))
            })?;
            let incoming = members
                .iter()
                .map(|&(v, block)| format!("[ {}, %b{} ]", value_text(v), block))
                .join(", ");
            let _ = writeln!(out, "  %v{idx} = phi {} {}", type_text(program, t), incoming);
        }

        FuncArg | PhiMember => {}

        CallArg => {
            call_args.push(Value::unpack(Type3Reader::new(instr).arg()));
        }

        Call => {
            let r = Type3Reader::new(instr);
            let callee = &program.functions()[r.arg() as usize];
            let args = std::mem::take(call_args);
            let rendered = render_args(program, &args, callee.arg_types(), value_text);
            let target = match callee.addr() {
                Some(addr) => format!("inttoptr (i64 {} to ptr)", addr as u64),
                None => format!("@\"{}\"", callee.name()),
            };
            let ret = type_text(program, callee.result_type());
            if tm.is_void(callee.result_type()) {
                let _ = writeln!(out, "  call {ret} {target}({rendered})");
            } else {
                let _ = writeln!(out, "  %v{idx} = call {ret} {target}({rendered})");
            }
        }

        CallIndirect => {
            let r = Type3Reader::new(instr);
            let fn_type = TypeId::from_raw(r.type_id());
            let arg_types = tm.function_args(fn_type)?.to_vec();
            let result = tm.function_result(fn_type)?;
            let args = std::mem::take(call_args);
            let rendered = render_args(program, &args, &arg_types, value_text);
            let target = value_text(Value::unpack(r.arg()));
            let ret = type_text(program, result);
            if tm.is_void(result) {
                let _ = writeln!(out, "  call {ret} {target}({rendered})");
            } else {
                let _ = writeln!(out, "  %v{idx} = call {ret} {target}({rendered})");
            }
        }

        opcode => {
            return Err(BackendError::BackendBuildFailed(format!(
                "{opcode:?} cannot appear in a function body"
            )))
        }
    }
    Ok(())
}

fn render_args(
    program: &Program,
    args: &[Value],
    arg_types: &[TypeId],
    value_text: &dyn Fn(Value) -> String,
) -> String {
    args.iter()
        .zip(arg_types)
        .map(|(&v, &t)| format!("{} {}", type_text(program, t), value_text(v)))
        .join(", ")
}

pub(crate) fn type_text(program: &Program, t: TypeId) -> String {
    match program.type_manager().kind(t) {
        TypeKind::Void => "void".into(),
        TypeKind::I1 => "i1".into(),
        TypeKind::I8 => "i8".into(),
        TypeKind::I16 => "i16".into(),
        TypeKind::I32 => "i32".into(),
        TypeKind::I64 => "i64".into(),
        TypeKind::F64 => "double".into(),
        TypeKind::Pointer { .. } | TypeKind::Function { .. } => "ptr".into(),
        TypeKind::Array { elem, len } => {
            format!("[{} x {}]", len, type_text(program, *elem))
        }
        TypeKind::Struct { .. } | TypeKind::Opaque { .. } => format!("%t{}", t.raw()),
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if (0x20..0x7F).contains(&b) && b != b'"' && b != b'\\' {
            out.push(b as char);
        } else {
            let _ = write!(out, "\\{b:02X}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_khir::{CompType, ProgramBuilder};

    #[test]
    fn module_text_covers_types_constants_and_bodies() {
        let mut b = ProgramBuilder::new();
        let i64t = b.i64_type();
        let s = b.named_struct_type(&[i64t, i64t], "pair").unwrap();
        let one = b.const_i64(1);
        let two = b.const_i64(2);
        let pair = b.constant_struct(s, &[one, two]).unwrap();
        b.global(false, true, s, pair).unwrap();
        let text_ptr = b.global_char_array("hello");

        b.create_public_function(i64t, &[i64t, i64t], "compute").unwrap();
        let f = b.get_function("compute").unwrap();
        let args = b.function_arguments(f).to_vec();
        let cond = b.cmp_i64(CompType::Lt, args[0], args[1]).unwrap();
        let not = b.lnot_i1(cond).unwrap();
        let wide = b.zext_i1_i64(not).unwrap();
        let byte = b.load(text_ptr).unwrap();
        let wide_byte = b.zext_i8_i64(byte).unwrap();
        let sum = b.add_i64(wide, wide_byte).unwrap();
        b.ret_value(sum).unwrap();
        let program = b.finish();

        let module = emit_module(&program).unwrap();
        assert!(module.contains("= type { i64, i64 }"), "{module}");
        assert!(module.contains("@str0"), "{module}");
        assert!(module.contains("@g0 = dso_local global"), "{module}");
        assert!(module.contains("icmp slt i64"), "{module}");
        assert!(module.contains("xor i1"), "{module}");
        assert!(module.contains("define dso_local i64 @\"compute\""), "{module}");
        assert!(module.contains("ret i64"), "{module}");
    }

    #[test]
    fn unattached_phi_members_are_rejected() {
        let mut b = ProgramBuilder::new();
        let i64t = b.i64_type();
        b.create_public_function(i64t, &[i64t], "compute").unwrap();
        let f = b.get_function("compute").unwrap();
        let args = b.function_arguments(f).to_vec();
        let join = b.generate_block();
        let _orphan = b.phi_member(args[0]).unwrap();
        b.branch(join).unwrap();
        b.set_current_block(join).unwrap();
        b.ret_value(args[0]).unwrap();
        let program = b.finish();

        assert!(emit_module(&program).is_err());
    }
}
