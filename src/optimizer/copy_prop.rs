//! Copy propagation
//!
//! SSA has no explicit copy instruction; the copies worth removing are
//! trivial phis, where every incoming operand is the same value (or the
//! phi itself, for loop-carried self-references). Uses of the phi result
//! are rewritten to the operand and the phi removed.

use crate::ir::{IlFunction, Opcode, VReg, Value};
use std::collections::HashMap;

/// Removes trivial phis; returns true when anything changed
pub fn run(func: &mut IlFunction) -> bool {
    let mut replacements: HashMap<VReg, Value> = HashMap::new();

    // Find trivial phis
    for block in &func.blocks {
        for instr in &block.instructions {
            if instr.op != Opcode::Phi {
                continue;
            }
            let Some(result) = instr.result else { continue };
            let mut unique: Option<Value> = None;
            let mut trivial = true;
            for &operand in &instr.operands {
                // A self-reference does not disqualify the phi
                if operand.as_reg() == Some(result) {
                    continue;
                }
                match unique {
                    None => unique = Some(operand),
                    Some(existing) if existing == operand => {}
                    Some(_) => {
                        trivial = false;
                        break;
                    }
                }
            }
            if trivial {
                if let Some(value) = unique {
                    replacements.insert(result, value);
                }
            }
        }
    }

    if replacements.is_empty() {
        return false;
    }

    // Chase chains so a phi of a phi resolves fully
    let resolve = |mut value: Value| {
        let mut hops = 0;
        while let Value::Reg(reg) = value {
            match replacements.get(&reg) {
                Some(&next) if next != value && hops < 64 => {
                    value = next;
                    hops += 1;
                }
                _ => break,
            }
        }
        value
    };

    for block in &mut func.blocks {
        block.instructions.retain(|instr| {
            !(instr.op == Opcode::Phi
                && instr
                    .result
                    .map(|r| replacements.contains_key(&r))
                    .unwrap_or(false))
        });
        for instr in &mut block.instructions {
            for operand in &mut instr.operands {
                *operand = resolve(*operand);
            }
        }
    }

    tracing::debug!(
        function = %func.name,
        removed = replacements.len(),
        "trivial phis propagated"
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Constant, FunctionBuilder, IlType};

    #[test]
    fn test_trivial_phi_removed() {
        let mut b = FunctionBuilder::new("m", "f", IlType::Byte, false);
        let cond = b.emit_const(Constant::bool(true));
        let left = b.new_block("left");
        let right = b.new_block("right");
        let merge = b.new_block("merge");
        b.branch(cond, left, right);

        let shared = Value::Const(Constant::byte(7));
        b.switch_to(left);
        b.jump(merge);
        b.switch_to(right);
        b.jump(merge);

        b.switch_to(merge);
        let phi = b
            .emit(
                Opcode::Phi,
                Some(IlType::Byte),
                vec![shared, shared],
                vec![left, right],
            )
            .map(Value::Reg)
            .unwrap();
        b.ret(phi);
        let mut func = b.finish();

        assert!(run(&mut func));
        let phis = func
            .blocks
            .iter()
            .flat_map(|bl| bl.instructions.iter())
            .filter(|i| i.op == Opcode::Phi)
            .count();
        assert_eq!(phis, 0);
        // The return now uses the constant directly
        let ret = func
            .blocks
            .iter()
            .flat_map(|bl| bl.instructions.iter())
            .find(|i| i.op == Opcode::Return)
            .unwrap();
        assert_eq!(ret.operands[0].as_const().unwrap().value, 7);
    }
}
