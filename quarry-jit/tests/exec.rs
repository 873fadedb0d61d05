//! End-to-end tests: build a small program, lower it, call the entry
//! point, assert on the returned value. Every scenario runs under both
//! register-allocation strategies.

#![cfg(all(target_arch = "x86_64", unix))]

use test_case::test_case;

use quarry_jit::{AsmBackend, RegAllocStrategy};
use quarry_khir::{Backend, CompType, Program, ProgramBuilder};

fn compile(program: &Program, strategy: RegAllocStrategy) -> AsmBackend {
    let mut backend = AsmBackend::new(strategy);
    backend.translate(program).expect("translate");
    backend.compile().expect("compile");
    backend
}

fn entry<F: Copy>(backend: &AsmBackend, name: &str) -> F {
    let ptr = backend.entry(name).expect("public entry");
    unsafe { *std::ptr::addr_of!(ptr).cast::<F>() }
}

#[test_case(RegAllocStrategy::StackSpill; "stack_spill")]
#[test_case(RegAllocStrategy::LinearScan; "linear_scan")]
fn integer_add(strategy: RegAllocStrategy) {
    let mut b = ProgramBuilder::new();
    let i32t = b.i32_type();
    b.create_public_function(i32t, &[i32t, i32t], "compute").unwrap();
    let f = b.get_function("compute").unwrap();
    let args = b.function_arguments(f).to_vec();
    let sum = b.add_i32(args[0], args[1]).unwrap();
    b.ret_value(sum).unwrap();
    let program = b.finish();

    let backend = compile(&program, strategy);
    let compute: extern "C" fn(i32, i32) -> i32 = entry(&backend, "compute");
    assert_eq!(compute(3, 4), 7);
    assert_eq!(compute(i32::MIN, -1), i32::MAX);
}

#[test_case(RegAllocStrategy::StackSpill; "stack_spill")]
#[test_case(RegAllocStrategy::LinearScan; "linear_scan")]
fn branch_and_phi(strategy: RegAllocStrategy) {
    let mut b = ProgramBuilder::new();
    let (i1t, i64t) = (b.i1_type(), b.i64_type());
    b.create_public_function(i64t, &[i1t, i64t, i64t], "compute").unwrap();
    let f = b.get_function("compute").unwrap();
    let args = b.function_arguments(f).to_vec();

    let then_b = b.generate_block();
    let else_b = b.generate_block();
    let join = b.generate_block();
    b.branch_cond(args[0], then_b, else_b).unwrap();

    b.set_current_block(then_b).unwrap();
    let m1 = b.phi_member(args[1]).unwrap();
    b.branch(join).unwrap();

    b.set_current_block(else_b).unwrap();
    let m2 = b.phi_member(args[2]).unwrap();
    b.branch(join).unwrap();

    b.set_current_block(join).unwrap();
    let phi = b.phi(i64t).unwrap();
    b.update_phi_member(phi, m1);
    b.update_phi_member(phi, m2);
    b.ret_value(phi).unwrap();
    let program = b.finish();

    let backend = compile(&program, strategy);
    let compute: extern "C" fn(u8, i64, i64) -> i64 = entry(&backend, "compute");
    assert_eq!(compute(1, 5, 9), 5);
    assert_eq!(compute(0, 5, 9), 9);
}

#[test_case(RegAllocStrategy::StackSpill; "stack_spill")]
#[test_case(RegAllocStrategy::LinearScan; "linear_scan")]
fn struct_field_load(strategy: RegAllocStrategy) {
    #[repr(C)]
    struct S {
        x1: i8,
        x2: i16,
        x3: i64,
    }

    let mut b = ProgramBuilder::new();
    let (i8t, i16t, i64t) = (b.i8_type(), b.i16_type(), b.i64_type());
    let s = b.named_struct_type(&[i8t, i16t, i64t], "S").unwrap();
    assert_eq!(b.type_manager().field_offsets(s).unwrap(), &[0, 2, 8]);
    let s_ptr = b.pointer_type(s);

    b.create_public_function(i64t, &[s_ptr], "compute").unwrap();
    let f = b.get_function("compute").unwrap();
    let args = b.function_arguments(f).to_vec();
    let field = b.get_element_ptr(s, args[0], &[0, 2]).unwrap();
    let value = b.load(field).unwrap();
    b.ret_value(value).unwrap();
    let program = b.finish();

    let backend = compile(&program, strategy);
    let compute: extern "C" fn(*const S) -> i64 = entry(&backend, "compute");
    let s = S { x1: 0, x2: 1000, x3: 2 };
    assert_eq!(compute(&s), 2);
}

#[test_case(RegAllocStrategy::StackSpill; "stack_spill")]
#[test_case(RegAllocStrategy::LinearScan; "linear_scan")]
fn loop_sum(strategy: RegAllocStrategy) {
    let mut b = ProgramBuilder::new();
    let i64t = b.i64_type();
    b.create_public_function(i64t, &[], "compute").unwrap();

    let zero = b.const_i64(0);
    let one = b.const_i64(1);
    let ten = b.const_i64(10);
    let three = b.const_i64(3);

    let header = b.generate_block();
    let body = b.generate_block();
    let exit = b.generate_block();

    let m_i0 = b.phi_member(zero).unwrap();
    let m_acc0 = b.phi_member(zero).unwrap();
    b.branch(header).unwrap();

    b.set_current_block(header).unwrap();
    let phi_i = b.phi(i64t).unwrap();
    b.update_phi_member(phi_i, m_i0);
    let phi_acc = b.phi(i64t).unwrap();
    b.update_phi_member(phi_acc, m_acc0);
    let cond = b.cmp_i64(CompType::Lt, phi_i, ten).unwrap();
    b.branch_cond(cond, body, exit).unwrap();

    b.set_current_block(body).unwrap();
    let next_acc = b.add_i64(phi_acc, phi_i).unwrap();
    let next_i = b.add_i64(phi_i, one).unwrap();
    let m_i1 = b.phi_member(next_i).unwrap();
    b.update_phi_member(phi_i, m_i1);
    let m_acc1 = b.phi_member(next_acc).unwrap();
    b.update_phi_member(phi_acc, m_acc1);
    b.branch(header).unwrap();

    b.set_current_block(exit).unwrap();
    let result = b.mul_i64(phi_acc, three).unwrap();
    b.ret_value(result).unwrap();
    let program = b.finish();

    let backend = compile(&program, strategy);
    let compute: extern "C" fn() -> i64 = entry(&backend, "compute");
    assert_eq!(compute(), 135);
}

#[test_case(RegAllocStrategy::StackSpill; "stack_spill")]
#[test_case(RegAllocStrategy::LinearScan; "linear_scan")]
fn global_mutation(strategy: RegAllocStrategy) {
    let mut b = ProgramBuilder::new();
    let i64t = b.i64_type();
    let minus_one = b.const_i64(-1);
    let g = b.global(false, true, i64t, minus_one).unwrap();

    let i64_ptr = b.pointer_type(i64t);
    let i64_ptr_ptr = b.pointer_type(i64_ptr);
    b.create_public_function(i64t, &[i64_ptr_ptr], "compute").unwrap();
    let f = b.get_function("compute").unwrap();
    let args = b.function_arguments(f).to_vec();
    b.store(args[0], g).unwrap();
    let inner = b.load(args[0]).unwrap();
    let value = b.load(inner).unwrap();
    b.ret_value(value).unwrap();
    let program = b.finish();

    let backend = compile(&program, strategy);
    let compute: extern "C" fn(*mut *const i64) -> i64 = entry(&backend, "compute");
    let mut dest: *const i64 = std::ptr::null();
    assert_eq!(compute(&mut dest), -1);
    assert!(!dest.is_null());
    assert_eq!(unsafe { *dest }, -1);
}

#[test_case(RegAllocStrategy::StackSpill; "stack_spill")]
#[test_case(RegAllocStrategy::LinearScan; "linear_scan")]
fn float_arithmetic(strategy: RegAllocStrategy) {
    let mut b = ProgramBuilder::new();
    let f64t = b.f64_type();
    b.create_public_function(f64t, &[f64t, f64t], "compute").unwrap();
    let f = b.get_function("compute").unwrap();
    let args = b.function_arguments(f).to_vec();
    let half = b.const_f64(0.5);
    let sum = b.add_f64(args[0], args[1]).unwrap();
    let scaled = b.mul_f64(sum, half).unwrap();
    b.ret_value(scaled).unwrap();
    let program = b.finish();

    let backend = compile(&program, strategy);
    let compute: extern "C" fn(f64, f64) -> f64 = entry(&backend, "compute");
    assert_eq!(compute(3.0, 5.0), 4.0);
}

#[test_case(RegAllocStrategy::StackSpill; "stack_spill")]
#[test_case(RegAllocStrategy::LinearScan; "linear_scan")]
fn division_and_comparison_widths(strategy: RegAllocStrategy) {
    let mut b = ProgramBuilder::new();
    let (i16t, i64t) = (b.i16_type(), b.i64_type());
    b.create_public_function(i64t, &[i16t, i16t], "compute").unwrap();
    let f = b.get_function("compute").unwrap();
    let args = b.function_arguments(f).to_vec();
    let quot = b.div_i16(args[0], args[1]).unwrap();
    let lt = b.cmp_i16(CompType::Lt, quot, args[1]).unwrap();
    let wide_quot = b.zext_i16_i64(quot).unwrap();
    let wide_lt = b.zext_i1_i64(lt).unwrap();
    // quot * 2 + (quot < b)
    let two = b.const_i64(2);
    let doubled = b.mul_i64(wide_quot, two).unwrap();
    let result = b.add_i64(doubled, wide_lt).unwrap();
    b.ret_value(result).unwrap();
    let program = b.finish();

    let backend = compile(&program, strategy);
    let compute: extern "C" fn(i16, i16) -> i64 = entry(&backend, "compute");
    // 100 / 7 = 14, 14 < 7 is false -> 28
    assert_eq!(compute(100, 7), 28);
    // 3 / 7 = 0, 0 < 7 is true -> 1
    assert_eq!(compute(3, 7), 1);
}

extern "C" fn record_call(x: i64) -> i64 {
    x * 10
}

#[test_case(RegAllocStrategy::StackSpill; "stack_spill")]
#[test_case(RegAllocStrategy::LinearScan; "linear_scan")]
fn external_call(strategy: RegAllocStrategy) {
    let mut b = ProgramBuilder::new();
    let i64t = b.i64_type();
    let addr = record_call as extern "C" fn(i64) -> i64 as *const u8;
    let ext = b.declare_external_function("scale", i64t, &[i64t], addr).unwrap();
    b.create_public_function(i64t, &[i64t], "compute").unwrap();
    let f = b.get_function("compute").unwrap();
    let args = b.function_arguments(f).to_vec();
    let scaled = b.call(ext, &[args[0]]).unwrap();
    let one = b.const_i64(1);
    let result = b.add_i64(scaled, one).unwrap();
    b.ret_value(result).unwrap();
    let program = b.finish();

    let backend = compile(&program, strategy);
    let compute: extern "C" fn(i64) -> i64 = entry(&backend, "compute");
    assert_eq!(compute(4), 41);
}

extern "C" fn sum8(
    a: i64,
    b: i64,
    c: i64,
    d: i64,
    e: i64,
    f: i64,
    g: i64,
    h: i64,
) -> i64 {
    a + b + c + d + e + f + g + h
}

#[test_case(RegAllocStrategy::StackSpill; "stack_spill")]
#[test_case(RegAllocStrategy::LinearScan; "linear_scan")]
fn call_with_stack_arguments(strategy: RegAllocStrategy) {
    let mut b = ProgramBuilder::new();
    let i64t = b.i64_type();
    type Sum8 = extern "C" fn(i64, i64, i64, i64, i64, i64, i64, i64) -> i64;
    let addr = sum8 as Sum8 as *const u8;
    let ext = b.declare_external_function("sum8", i64t, &[i64t; 8], addr).unwrap();
    b.create_public_function(i64t, &[], "compute").unwrap();
    let consts: Vec<_> = (1..=8).map(|i| b.const_i64(i)).collect();
    let result = b.call(ext, &consts).unwrap();
    b.ret_value(result).unwrap();
    let program = b.finish();

    let backend = compile(&program, strategy);
    let compute: extern "C" fn() -> i64 = entry(&backend, "compute");
    assert_eq!(compute(), 36);
}

#[test_case(RegAllocStrategy::StackSpill; "stack_spill")]
#[test_case(RegAllocStrategy::LinearScan; "linear_scan")]
fn indirect_call_through_function_pointer(strategy: RegAllocStrategy) {
    let mut b = ProgramBuilder::new();
    let i64t = b.i64_type();
    let callee = b.create_function(i64t, &[i64t, i64t]).unwrap();
    let cargs = b.function_arguments(callee).to_vec();
    let diff = b.sub_i64(cargs[0], cargs[1]).unwrap();
    b.ret_value(diff).unwrap();

    let fn_type = b.function_type(i64t, &[i64t, i64t]);
    b.create_public_function(i64t, &[i64t, i64t], "compute").unwrap();
    let f = b.get_function("compute").unwrap();
    let args = b.function_arguments(f).to_vec();
    let fn_ptr = b.function_pointer(callee);
    let result = b.call_indirect(fn_ptr, fn_type, &args).unwrap();
    b.ret_value(result).unwrap();
    let program = b.finish();

    let backend = compile(&program, strategy);
    let compute: extern "C" fn(i64, i64) -> i64 = entry(&backend, "compute");
    assert_eq!(compute(50, 8), 42);
}

#[test_case(RegAllocStrategy::StackSpill; "stack_spill")]
#[test_case(RegAllocStrategy::LinearScan; "linear_scan")]
fn alloca_and_char_array(strategy: RegAllocStrategy) {
    let mut b = ProgramBuilder::new();
    let i64t = b.i64_type();
    b.create_public_function(i64t, &[], "compute").unwrap();

    // spill an i64 through an alloca slot
    let slot = b.alloca(i64t).unwrap();
    let seven = b.const_i64(7);
    b.store(slot, seven).unwrap();
    let reloaded = b.load(slot).unwrap();

    // read the first byte of a string literal
    let text = b.global_char_array("quarry");
    let byte = b.load(text).unwrap();
    let wide = b.zext_i8_i64(byte).unwrap();
    let result = b.add_i64(reloaded, wide).unwrap();
    b.ret_value(result).unwrap();
    let program = b.finish();

    let backend = compile(&program, strategy);
    let compute: extern "C" fn() -> i64 = entry(&backend, "compute");
    assert_eq!(compute(), 7 + i64::from(b'q'));
}
