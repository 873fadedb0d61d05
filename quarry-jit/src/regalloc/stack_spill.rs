//! Stack-spill assignment: a dedicated, 8-byte-aligned frame slot per SSA
//! value. Trivially correct and fast to emit; the default while the
//! adaptive policy is still probing.

use quarry_khir::{Function, Program};

use super::{value_class, Assignment, Home, ValueClass};

pub fn assign(program: &Program, func: &Function) -> Assignment {
    let mut homes = Vec::with_capacity(func.instructions().len());
    let mut num_slots = 0u32;
    for idx in 0..func.instructions().len() {
        match value_class(program, func, idx) {
            ValueClass::None => homes.push(None),
            ValueClass::Int | ValueClass::Float => {
                num_slots += 1;
                homes.push(Some(Home::Slot(num_slots as i32 * 8)));
            }
        }
    }
    Assignment { homes, num_slots }
}
