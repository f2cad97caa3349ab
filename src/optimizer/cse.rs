//! Common subexpression elimination
//!
//! Value numbering over `(opcode, operands, type)` for pure operations,
//! scoped by the dominator tree so a reused result always dominates its
//! new use. Sequence points clear the tables: nothing is deduplicated
//! across a barrier or volatile access.

use crate::ir::{BlockId, IlFunction, IlType, Opcode, VReg, Value};
use crate::ssa::DominatorTree;
use std::collections::HashMap;

type ValueKey = (Opcode, Vec<Value>, IlType);

/// Runs dominator-scoped value numbering; returns true when anything
/// was eliminated
pub fn run(func: &mut IlFunction) -> bool {
    let dom = DominatorTree::compute(func);
    let mut replacements: HashMap<VReg, Value> = HashMap::new();
    let mut scopes: Vec<HashMap<ValueKey, VReg>> = vec![HashMap::new()];
    let entry = func.entry;
    let changed = walk(func, &dom, entry, &mut scopes, &mut replacements);

    if !replacements.is_empty() {
        for block in &mut func.blocks {
            for instr in &mut block.instructions {
                for operand in &mut instr.operands {
                    if let Value::Reg(reg) = operand {
                        if let Some(&replacement) = replacements.get(reg) {
                            *operand = replacement;
                        }
                    }
                }
            }
        }
    }
    changed
}

fn walk(
    func: &mut IlFunction,
    dom: &DominatorTree,
    block: BlockId,
    scopes: &mut Vec<HashMap<ValueKey, VReg>>,
    replacements: &mut HashMap<VReg, Value>,
) -> bool {
    let mut changed = false;
    scopes.push(HashMap::new());

    let mut remove: Vec<usize> = Vec::new();
    let len = func.block(block).instructions.len();
    for index in 0..len {
        // Resolve operands against earlier replacements before hashing
        {
            let instr = &mut func.block_mut(block).instructions[index];
            for operand in &mut instr.operands {
                if let Value::Reg(reg) = operand {
                    if let Some(&replacement) = replacements.get(reg) {
                        *operand = replacement;
                    }
                }
            }
        }

        let instr = &func.block(block).instructions[index];
        if instr.op.is_sequence_point() {
            // Hard fence: forget everything on both sides
            for scope in scopes.iter_mut() {
                scope.clear();
            }
            continue;
        }
        if !instr.op.is_pure() || instr.op == Opcode::Phi || instr.meta.raster_critical {
            continue;
        }
        let Some(result) = instr.result else { continue };

        let key: ValueKey = (instr.op.clone(), instr.operands.clone(), result.ty);
        let existing = scopes.iter().rev().find_map(|scope| scope.get(&key));
        match existing {
            Some(&earlier) => {
                replacements.insert(result, Value::Reg(earlier));
                remove.push(index);
                changed = true;
            }
            None => {
                scopes.last_mut().unwrap().insert(key, result);
            }
        }
    }
    for &index in remove.iter().rev() {
        func.block_mut(block).instructions.remove(index);
    }

    let children = dom.children[block.0 as usize].clone();
    for child in children {
        changed |= walk(func, dom, child, scopes, replacements);
    }

    scopes.pop();
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Constant, FunctionBuilder};

    #[test]
    fn test_repeated_add_reused() {
        let mut b = FunctionBuilder::new("m", "f", IlType::Byte, false);
        let x = b.emit_const(Constant::byte(4));
        let y = b.emit_const(Constant::byte(5));
        let first = b
            .emit(Opcode::Add, Some(IlType::Byte), vec![x, y], vec![])
            .map(Value::Reg)
            .unwrap();
        let second = b
            .emit(Opcode::Add, Some(IlType::Byte), vec![x, y], vec![])
            .map(Value::Reg)
            .unwrap();
        let sum = b
            .emit(Opcode::Add, Some(IlType::Byte), vec![first, second], vec![])
            .map(Value::Reg)
            .unwrap();
        b.ret(sum);
        let mut func = b.finish();

        assert!(run(&mut func));
        let adds = func
            .blocks
            .iter()
            .flat_map(|bl| bl.instructions.iter())
            .filter(|i| i.op == Opcode::Add)
            .count();
        // The duplicate add is gone; the final add uses the first result
        // twice
        assert_eq!(adds, 2);
    }

    #[test]
    fn test_no_cse_across_barrier() {
        let mut b = FunctionBuilder::new("m", "f", IlType::Byte, false);
        let x = b.emit_const(Constant::byte(4));
        let y = b.emit_const(Constant::byte(5));
        let first = b
            .emit(Opcode::Add, Some(IlType::Byte), vec![x, y], vec![])
            .map(Value::Reg)
            .unwrap();
        let mut meta = crate::ir::InstrMeta::default();
        meta.raster_critical = true;
        b.emit_with_meta(Opcode::Barrier, None, vec![], vec![], meta);
        let second = b
            .emit(Opcode::Add, Some(IlType::Byte), vec![x, y], vec![])
            .map(Value::Reg)
            .unwrap();
        let sum = b
            .emit(Opcode::Add, Some(IlType::Byte), vec![first, second], vec![])
            .map(Value::Reg)
            .unwrap();
        b.ret(sum);
        let mut func = b.finish();

        // Nothing may be merged across the barrier
        run(&mut func);
        let adds = func
            .blocks
            .iter()
            .flat_map(|bl| bl.instructions.iter())
            .filter(|i| i.op == Opcode::Add)
            .count();
        assert_eq!(adds, 3);
    }
}
