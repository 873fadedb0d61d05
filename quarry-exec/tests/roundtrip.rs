//! Backend round-trip: the same program, lowered through the assembler
//! (both allocators) and the optimizing path, must produce the same
//! observable results. The optimizing half is skipped when the host has
//! no LLVM toolchain.

#![cfg(all(target_arch = "x86_64", unix))]

use quarry_jit::{AsmBackend, RegAllocStrategy};
use quarry_khir::{Backend, CompType, Program, ProgramBuilder};
use quarry_llvm::LlvmBackend;

/// `compute(n, d) = sum(i for i in 0..n) + n / d + (n < d)`
fn build_mixed_program() -> Program {
    let mut b = ProgramBuilder::new();
    let i64t = b.i64_type();
    b.create_public_function(i64t, &[i64t, i64t], "compute").unwrap();
    let f = b.get_function("compute").unwrap();
    let args = b.function_arguments(f).to_vec();
    let zero = b.const_i64(0);
    let one = b.const_i64(1);

    let header = b.generate_block();
    let body = b.generate_block();
    let exit = b.generate_block();

    let m_i0 = b.phi_member(zero).unwrap();
    let m_acc0 = b.phi_member(zero).unwrap();
    b.branch(header).unwrap();

    b.set_current_block(header).unwrap();
    let i = b.phi(i64t).unwrap();
    b.update_phi_member(i, m_i0);
    let acc = b.phi(i64t).unwrap();
    b.update_phi_member(acc, m_acc0);
    let in_range = b.cmp_i64(CompType::Lt, i, args[0]).unwrap();
    b.branch_cond(in_range, body, exit).unwrap();

    b.set_current_block(body).unwrap();
    let acc_next = b.add_i64(acc, i).unwrap();
    let i_next = b.add_i64(i, one).unwrap();
    let m_i1 = b.phi_member(i_next).unwrap();
    b.update_phi_member(i, m_i1);
    let m_acc1 = b.phi_member(acc_next).unwrap();
    b.update_phi_member(acc, m_acc1);
    b.branch(header).unwrap();

    b.set_current_block(exit).unwrap();
    let quot = b.div_i64(args[0], args[1]).unwrap();
    let less = b.cmp_i64(CompType::Lt, args[0], args[1]).unwrap();
    let less_wide = b.zext_i1_i64(less).unwrap();
    let partial = b.add_i64(acc, quot).unwrap();
    let total = b.add_i64(partial, less_wide).unwrap();
    b.ret_value(total).unwrap();

    b.finish()
}

fn run_with(backend: &dyn Backend, n: i64, d: i64) -> i64 {
    let ptr = backend.entry("compute").expect("compute entry");
    let f: extern "C" fn(i64, i64) -> i64 = unsafe { std::mem::transmute(ptr) };
    f(n, d)
}

#[test]
fn backends_agree_on_observable_results() {
    let program = build_mixed_program();
    let inputs = [(0i64, 3i64), (1, 3), (10, 3), (100, 7), (8192, 2)];
    let expected = |n: i64, d: i64| (0..n).sum::<i64>() + n / d + i64::from(n < d);

    for strategy in [RegAllocStrategy::StackSpill, RegAllocStrategy::LinearScan] {
        let mut jit = AsmBackend::new(strategy);
        jit.translate(&program).unwrap();
        jit.compile().unwrap();
        for (n, d) in inputs {
            assert_eq!(run_with(&jit, n, d), expected(n, d), "jit {strategy:?} ({n}, {d})");
        }
    }

    if !quarry_llvm::available() {
        eprintln!("llvm toolchain unavailable; skipping the optimizing half");
        return;
    }
    let mut opt = LlvmBackend::new();
    opt.translate(&program).unwrap();
    opt.compile().unwrap();
    for (n, d) in inputs {
        assert_eq!(run_with(&opt, n, d), expected(n, d), "llvm ({n}, {d})");
    }
}
