//! Linear-scan assignment.
//!
//! One walk over the instruction stream builds `[def, last_use]` intervals;
//! a second scan in start order hands out caller-saved registers, evicting
//! the longest-living active interval to a frame slot under pressure.
//! Intervals that cross a call site go straight to a slot (every pool
//! register is caller-saved), and join-point values (phis) are pinned to
//! slots so that edge moves can never form register cycles with them.

use quarry_khir::instruction::GenericReader;
use quarry_khir::{Function, Opcode, Program, Value};

use super::{operands, value_class, Assignment, Home, ValueClass, GP_POOL, XMM_POOL};

#[derive(Debug, Clone, Copy)]
struct Active {
    idx: usize,
    end: usize,
}

pub fn assign(program: &Program, func: &Function) -> Assignment {
    let instructions = func.instructions();
    let n = instructions.len();

    let classes: Vec<ValueClass> =
        (0..n).map(|i| value_class(program, func, i)).collect();

    // Interval ends. A phi-member's source stays live to its block's
    // terminator: its edge move is emitted there.
    let mut last_use = vec![0usize; n];
    for (i, last) in last_use.iter_mut().enumerate() {
        *last = i;
    }
    let mut is_phi = vec![false; n];
    let mut calls = Vec::new();
    for &block in func.basic_block_order() {
        let range = func.basic_block(block as usize);
        let block_last = range.end.saturating_sub(1);
        for i in range {
            let instr = instructions[i];
            let opcode = GenericReader::new(instr).opcode();
            match opcode {
                Opcode::Phi => is_phi[i] = true,
                Opcode::Call | Opcode::CallIndirect => calls.push(i),
                _ => {}
            }
            let use_at = if opcode == Opcode::PhiMember { block_last } else { i };
            for v in operands(instr) {
                if !v.is_constant_global() {
                    let def = v.idx() as usize;
                    last_use[def] = last_use[def].max(use_at);
                }
            }
        }
    }

    let mut homes: Vec<Option<Home>> = vec![None; n];
    let mut num_slots = 0u32;
    let mut new_slot = |homes: &mut Vec<Option<Home>>, idx: usize| {
        num_slots += 1;
        homes[idx] = Some(Home::Slot(num_slots as i32 * 8));
    };

    let mut gp_free: Vec<_> = GP_POOL.iter().rev().copied().collect();
    let mut xmm_free: Vec<_> = XMM_POOL.iter().rev().copied().collect();
    let mut gp_active: Vec<Active> = Vec::new();
    let mut xmm_active: Vec<Active> = Vec::new();

    for idx in 0..n {
        let class = classes[idx];
        if class == ValueClass::None {
            continue;
        }

        // Expire intervals whose last read is behind us.
        gp_active.retain(|a| {
            if last_use[a.idx] <= idx && a.idx != idx {
                if let Some(Home::Gp(reg)) = homes[a.idx] {
                    gp_free.push(reg);
                }
                false
            } else {
                true
            }
        });
        xmm_active.retain(|a| {
            if last_use[a.idx] <= idx && a.idx != idx {
                if let Some(Home::Xmm(reg)) = homes[a.idx] {
                    xmm_free.push(reg);
                }
                false
            } else {
                true
            }
        });

        let end = last_use[idx];

        if is_phi[idx] || crosses_call(&calls, idx, end) {
            new_slot(&mut homes, idx);
            continue;
        }

        match class {
            ValueClass::Float => {
                if let Some(reg) = xmm_free.pop() {
                    homes[idx] = Some(Home::Xmm(reg));
                    xmm_active.push(Active { idx, end });
                } else if let Some(pos) = longest(&xmm_active, &last_use, end) {
                    let evicted = xmm_active.swap_remove(pos);
                    let reg = match homes[evicted.idx] {
                        Some(Home::Xmm(r)) => r,
                        _ => unreachable!("active interval without a register"),
                    };
                    new_slot(&mut homes, evicted.idx);
                    homes[idx] = Some(Home::Xmm(reg));
                    xmm_active.push(Active { idx, end });
                } else {
                    new_slot(&mut homes, idx);
                }
            }
            _ => {
                if let Some(reg) = gp_free.pop() {
                    homes[idx] = Some(Home::Gp(reg));
                    gp_active.push(Active { idx, end });
                } else if let Some(pos) = longest(&gp_active, &last_use, end) {
                    let evicted = gp_active.swap_remove(pos);
                    let reg = match homes[evicted.idx] {
                        Some(Home::Gp(r)) => r,
                        _ => unreachable!("active interval without a register"),
                    };
                    new_slot(&mut homes, evicted.idx);
                    homes[idx] = Some(Home::Gp(reg));
                    gp_active.push(Active { idx, end });
                } else {
                    new_slot(&mut homes, idx);
                }
            }
        }
    }

    Assignment { homes, num_slots }
}

fn crosses_call(calls: &[usize], start: usize, end: usize) -> bool {
    calls.iter().any(|&c| c > start && c < end)
}

/// Index of the active interval living past `end` the longest, if any
/// outlives the candidate.
fn longest(active: &[Active], last_use: &[usize], end: usize) -> Option<usize> {
    let (pos, longest) = active
        .iter()
        .enumerate()
        .max_by_key(|(_, a)| last_use[a.idx])?;
    (last_use[longest.idx] > end).then_some(pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_khir::ProgramBuilder;

    fn build_straightline() -> (Program, quarry_khir::FuncId) {
        let mut b = ProgramBuilder::new();
        let i64t = b.i64_type();
        b.create_public_function(i64t, &[i64t, i64t], "compute").unwrap();
        let f = b.get_function("compute").unwrap();
        let args = b.function_arguments(f).to_vec();
        let sum = b.add_i64(args[0], args[1]).unwrap();
        let prod = b.mul_i64(sum, args[1]).unwrap();
        b.ret_value(prod).unwrap();
        (b.finish(), f)
    }

    use quarry_khir::Program;

    #[test]
    fn short_intervals_get_registers() {
        let (program, f) = build_straightline();
        let func = program.function(f);
        let a = assign(&program, func);
        assert!(a
            .homes
            .iter()
            .flatten()
            .all(|h| matches!(h, Home::Gp(_))));
    }

    #[test]
    fn no_two_overlapping_intervals_share_a_register() {
        let mut b = ProgramBuilder::new();
        let i64t = b.i64_type();
        b.create_public_function(i64t, &[i64t; 6], "compute").unwrap();
        let f = b.get_function("compute").unwrap();
        let args = b.function_arguments(f).to_vec();
        // all six args stay live to the end, overflowing the pool of four
        let mut acc = b.add_i64(args[0], args[1]).unwrap();
        for arg in &args[2..] {
            acc = b.add_i64(acc, *arg).unwrap();
        }
        let mut acc2 = b.add_i64(args[0], args[5]).unwrap();
        acc2 = b.add_i64(acc2, acc).unwrap();
        b.ret_value(acc2).unwrap();

        let program = b.finish();
        let func = program.function(f);
        let a = assign(&program, func);

        // rebuild intervals and cross-check register exclusivity
        let n = func.instructions().len();
        let mut last_use = (0..n).collect::<Vec<_>>();
        for (i, &instr) in func.instructions().iter().enumerate() {
            for v in operands(instr) {
                if !v.is_constant_global() {
                    let d = v.idx() as usize;
                    last_use[d] = last_use[d].max(i);
                }
            }
        }
        for i in 0..n {
            for j in (i + 1)..n {
                let (Some(hi), Some(hj)) = (a.homes[i], a.homes[j]) else { continue };
                if hi == hj && matches!(hi, Home::Gp(_) | Home::Xmm(_)) {
                    // intervals must be disjoint: j defs after i's last read
                    assert!(last_use[i] <= j, "overlap between %{i} and %{j}");
                }
            }
        }
        // some value must have spilled
        assert!(a.num_slots > 0);
    }

    #[test]
    fn values_living_across_calls_are_spilled() {
        let mut b = ProgramBuilder::new();
        let i64t = b.i64_type();
        let callee = b.create_function(i64t, &[]).unwrap();
        let zero = b.const_i64(0);
        b.ret_value(zero).unwrap();

        b.create_public_function(i64t, &[i64t, i64t], "compute").unwrap();
        let f = b.get_function("compute").unwrap();
        let args = b.function_arguments(f).to_vec();
        let sum = b.add_i64(args[0], args[1]).unwrap();
        let call = b.call(callee, &[]).unwrap();
        let total = b.add_i64(sum, call).unwrap();
        b.ret_value(total).unwrap();

        let program = b.finish();
        let func = program.function(f);
        let a = assign(&program, func);
        assert!(matches!(a.homes[sum.idx() as usize], Some(Home::Slot(_))));
    }

    #[test]
    fn floats_use_the_xmm_pool() {
        let mut b = ProgramBuilder::new();
        let f64t = b.f64_type();
        b.create_public_function(f64t, &[f64t, f64t], "compute").unwrap();
        let f = b.get_function("compute").unwrap();
        let args = b.function_arguments(f).to_vec();
        let prod = b.mul_f64(args[0], args[1]).unwrap();
        b.ret_value(prod).unwrap();

        let program = b.finish();
        let a = assign(&program, program.function(f));
        assert!(a.homes.iter().flatten().all(|h| matches!(h, Home::Xmm(_))));
    }

    #[test]
    fn phis_are_pinned_to_slots() {
        let mut b = ProgramBuilder::new();
        let i64t = b.i64_type();
        let i1t = b.i1_type();
        b.create_public_function(i64t, &[i1t, i64t, i64t], "compute").unwrap();
        let f = b.get_function("compute").unwrap();
        let args = b.function_arguments(f).to_vec();
        let t = b.generate_block();
        let e = b.generate_block();
        let j = b.generate_block();
        b.branch_cond(args[0], t, e).unwrap();
        b.set_current_block(t).unwrap();
        let m1 = b.phi_member(args[1]).unwrap();
        b.branch(j).unwrap();
        b.set_current_block(e).unwrap();
        let m2 = b.phi_member(args[2]).unwrap();
        b.branch(j).unwrap();
        b.set_current_block(j).unwrap();
        let phi = b.phi(i64t).unwrap();
        b.update_phi_member(phi, m1);
        b.update_phi_member(phi, m2);
        b.ret_value(phi).unwrap();

        let program = b.finish();
        let a = assign(&program, program.function(f));
        assert!(matches!(a.homes[phi.idx() as usize], Some(Home::Slot(_))));
    }
}
