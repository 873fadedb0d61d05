//! Textual dump of a built program, for debugging and test diagnostics.

use std::fmt;

use crate::instruction::{GenericReader, Type1Reader, Type2Reader, Type3Reader, Type5Reader};
use crate::opcode::InstrFormat;
use crate::program::Program;
use crate::types::TypeKind;
use crate::value::Value;

struct DisplayValue(Value);

impl fmt::Display for DisplayValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_constant_global() {
            write!(f, "@{}", self.0.idx())
        } else {
            write!(f, "%{}", self.0.idx())
        }
    }
}

fn write_instr(f: &mut fmt::Formatter<'_>, instr: u64) -> fmt::Result {
    let opcode = GenericReader::new(instr).opcode();
    match opcode.format() {
        InstrFormat::Type1 => {
            write!(f, "{:?} {}", opcode, Type1Reader::new(instr).constant())
        }
        InstrFormat::Type2 => {
            let r = Type2Reader::new(instr);
            write!(
                f,
                "{:?} {} {}",
                opcode,
                DisplayValue(Value::unpack(r.arg0())),
                DisplayValue(Value::unpack(r.arg1()))
            )
        }
        InstrFormat::Type3 => {
            let r = Type3Reader::new(instr);
            write!(
                f,
                "{:?} {} #{} t{}",
                opcode,
                DisplayValue(Value::unpack(r.arg())),
                r.sarg(),
                r.type_id()
            )
        }
        InstrFormat::Type5 => {
            let r = Type5Reader::new(instr);
            write!(
                f,
                "{:?} {} b{} b{}",
                opcode,
                DisplayValue(Value::unpack(r.arg())),
                r.marg0(),
                r.marg1()
            )
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; types")?;
        for (id, kind) in self.type_manager().iter() {
            match kind {
                TypeKind::Pointer { elem } => {
                    writeln!(f, "t{} = ptr t{}", id.raw(), elem.raw())?
                }
                TypeKind::Array { elem, len } => {
                    writeln!(f, "t{} = [{} x t{}]", id.raw(), len, elem.raw())?
                }
                TypeKind::Struct { fields, name, .. } => {
                    let fields: Vec<_> =
                        fields.iter().map(|t| format!("t{}", t.raw())).collect();
                    match name {
                        Some(name) => writeln!(
                            f,
                            "t{} = struct {} {{ {} }}",
                            id.raw(),
                            name,
                            fields.join(", ")
                        )?,
                        None => {
                            writeln!(f, "t{} = struct {{ {} }}", id.raw(), fields.join(", "))?
                        }
                    }
                }
                TypeKind::Function { result, args } => {
                    let args: Vec<_> = args.iter().map(|t| format!("t{}", t.raw())).collect();
                    writeln!(f, "t{} = fn({}) -> t{}", id.raw(), args.join(", "), result.raw())?
                }
                TypeKind::Opaque { name } => {
                    writeln!(f, "t{} = opaque {}", id.raw(), name)?
                }
                base => writeln!(f, "t{} = {:?}", id.raw(), base)?,
            }
        }

        writeln!(f, "; constant pool")?;
        for (i, &instr) in self.constant_instrs().iter().enumerate() {
            write!(f, "@{} = ", i)?;
            write_instr(f, instr)?;
            writeln!(f)?;
        }

        for (i, global) in self.globals().iter().enumerate() {
            writeln!(
                f,
                "global {} t{} init={} constant={} public={}",
                i,
                global.type_id.raw(),
                DisplayValue(global.init),
                global.constant,
                global.public,
            )?;
        }

        for function in self.functions() {
            if function.is_external() {
                writeln!(f, "extern fn {}", function.name())?;
                continue;
            }
            writeln!(
                f,
                "{}fn {}:",
                if function.is_public() { "pub " } else { "" },
                function.name()
            )?;
            for &block in function.basic_block_order() {
                writeln!(f, "  b{}:", block)?;
                for idx in function.basic_block(block as usize) {
                    write!(f, "    %{} = ", idx)?;
                    write_instr(f, function.instructions()[idx])?;
                    writeln!(f)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::ProgramBuilder;
    use crate::opcode::CompType;

    #[test]
    fn printer_renders_a_small_program() {
        let mut b = ProgramBuilder::new();
        let i64t = b.i64_type();
        let i1t = b.i1_type();
        b.create_public_function(i64t, &[i64t, i64t], "compute").unwrap();
        let f = b.get_function("compute").unwrap();
        let args = b.function_arguments(f).to_vec();

        let cond = b.cmp_i64(CompType::Lt, args[0], args[1]).unwrap();
        let then_b = b.generate_block();
        let else_b = b.generate_block();
        b.branch_cond(cond, then_b, else_b).unwrap();
        b.set_current_block(then_b).unwrap();
        b.ret_value(args[0]).unwrap();
        b.set_current_block(else_b).unwrap();
        b.ret_value(args[1]).unwrap();

        let text = b.finish().to_string();
        assert!(text.contains("pub fn compute:"), "{text}");
        assert!(text.contains("I64Cmplt"), "{text}");
        assert!(text.contains("b1:"), "{text}");
    }

    #[test]
    fn printer_renders_every_opcode() {
        use hashbrown::HashMap;
        use strum::EnumCount;

        use crate::instruction::{Type1Builder, Type2Builder, Type3Builder, Type5Builder};
        use crate::opcode::{InstrFormat, Opcode};
        use crate::program::{Function, FunctionFlags, Global, Program};
        use crate::types::TypeManager;
        use crate::value::Value;

        fn sample_word(op: Opcode) -> u64 {
            match op.format() {
                InstrFormat::Type1 => Type1Builder::new(op).constant(7).build(),
                InstrFormat::Type2 => Type2Builder::new(op)
                    .arg0(Value::instr(1).pack())
                    .arg1(Value::constant_global(2).pack())
                    .build(),
                InstrFormat::Type3 => Type3Builder::new(op)
                    .arg(Value::instr(3).pack())
                    .sarg(1)
                    .type_id(5)
                    .build(),
                InstrFormat::Type5 => Type5Builder::new(op)
                    .arg(Value::instr(0).pack())
                    .marg0(1)
                    .marg1(2)
                    .build(),
            }
        }

        let mut tm = TypeManager::new();
        let i64t = tm.i64_type();
        tm.named_struct_type(&[i64t], "sample").unwrap();
        tm.opaque_type("runtime_sample").unwrap();
        tm.array_type(i64t, 4);
        let fn_type = tm.function_type(i64t, &[i64t]);

        let opcodes: Vec<Opcode> = (0..Opcode::COUNT as u8)
            .map(|repr| Opcode::from_repr(repr).unwrap())
            .collect();

        // every opcode appears in the body: non-terminators share the
        // entry block, each remaining terminator gets a block of its own
        let mut func = Function::new(
            "every_opcode".into(),
            fn_type,
            i64t,
            Vec::new(),
            FunctionFlags::PUBLIC,
            None,
        );
        func.init_body(&[]);
        for &op in opcodes.iter().filter(|op| !op.is_terminator()) {
            func.append(sample_word(op)).unwrap();
        }
        func.append(sample_word(Opcode::Br)).unwrap();
        for op in [Opcode::Condbr, Opcode::Return, Opcode::ReturnValue] {
            let block = func.generate_basic_block();
            func.set_current_basic_block(block).unwrap();
            func.append(sample_word(op)).unwrap();
        }

        let constant_instrs: Vec<u64> = opcodes
            .iter()
            .filter(|op| op.is_constant())
            .map(|&op| sample_word(op))
            .collect();

        let program = Program {
            type_manager: tm,
            functions: vec![func],
            name_to_function: HashMap::new(),
            i64_constants: vec![1],
            f64_constants: vec![1.0],
            char_array_constants: vec!["sample".into()],
            struct_constants: Vec::new(),
            array_constants: Vec::new(),
            globals: vec![Global {
                constant: false,
                public: true,
                type_id: i64t,
                init: Value::constant_global(0),
            }],
            constant_instrs,
        };

        let text = program.to_string();
        for op in opcodes {
            assert!(text.contains(&format!("{op:?}")), "missing {op:?} in:\n{text}");
        }
    }
}
