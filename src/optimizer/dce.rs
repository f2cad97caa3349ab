//! Dead-code elimination
//!
//! Mark-sweep over instructions: anything with side effects, anything
//! raster-critical, and every terminator is a root; liveness then flows
//! backwards through operands (transitively through phis). Everything
//! unmarked is removed.

use crate::ir::{IlFunction, Opcode, VReg};
use std::collections::HashSet;

/// Runs one mark-sweep; returns true when instructions were removed
pub fn run(func: &mut IlFunction) -> bool {
    let mut live_regs: HashSet<VReg> = HashSet::new();

    // Roots: operands of instructions that must stay
    for block in &func.blocks {
        for instr in &block.instructions {
            if instr.must_keep() {
                for reg in instr.used_regs() {
                    live_regs.insert(reg);
                }
            }
        }
    }

    // Propagate until stable: a live result makes its operands live
    let mut changed = true;
    while changed {
        changed = false;
        for block in &func.blocks {
            for instr in &block.instructions {
                let Some(result) = instr.result else { continue };
                if !live_regs.contains(&result) {
                    continue;
                }
                for reg in instr.used_regs() {
                    if live_regs.insert(reg) {
                        changed = true;
                    }
                }
            }
        }
    }

    // Sweep
    let mut removed = false;
    for block in &mut func.blocks {
        let before = block.instructions.len();
        block.instructions.retain(|instr| {
            if instr.must_keep() {
                return true;
            }
            match instr.result {
                Some(result) => live_regs.contains(&result),
                // Pure instruction without result: nothing to keep
                None => false,
            }
        });
        removed |= block.instructions.len() != before;
    }

    if removed {
        tracing::debug!(function = %func.name, "dead code eliminated");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Constant, FunctionBuilder, IlType, Opcode, Value};

    #[test]
    fn test_unused_const_removed() {
        let mut b = FunctionBuilder::new("m", "f", IlType::Void, false);
        b.emit_const(Constant::byte(42)); // never used
        let used = b.emit_const(Constant::word(0xD020));
        let v = b.emit_const(Constant::byte(1));
        b.emit(Opcode::Poke, None, vec![used, v], vec![]);
        b.ret_void();
        let mut func = b.finish();

        assert!(run(&mut func));
        let consts = func
            .blocks
            .iter()
            .flat_map(|bl| bl.instructions.iter())
            .filter(|i| i.op == Opcode::Const)
            .count();
        assert_eq!(consts, 2); // only the two poke operands survive
    }

    #[test]
    fn test_raster_critical_kept() {
        let mut b = FunctionBuilder::new("m", "f", IlType::Void, false);
        let mut meta = crate::ir::InstrMeta::default();
        meta.raster_critical = true;
        b.emit_with_meta(
            Opcode::Const,
            Some(IlType::Byte),
            vec![Value::Const(Constant::byte(7))],
            vec![],
            meta,
        );
        b.ret_void();
        let mut func = b.finish();

        assert!(!run(&mut func));
        let consts = func
            .blocks
            .iter()
            .flat_map(|bl| bl.instructions.iter())
            .filter(|i| i.op == Opcode::Const)
            .count();
        assert_eq!(consts, 1);
    }
}
