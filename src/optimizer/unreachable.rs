//! Unreachable-block elimination
//!
//! Forward DFS from the entry; blocks never visited are emptied and their
//! CFG edges removed. Phi operands arriving from removed blocks are
//! dropped so the phi invariants keep holding.

use crate::ir::{BlockId, IlFunction, Opcode};
use std::collections::HashSet;

/// Removes unreachable blocks; returns true when anything changed
pub fn run(func: &mut IlFunction) -> bool {
    let reachable: HashSet<BlockId> = func.reachable_blocks().into_iter().collect();
    let ids: Vec<BlockId> = func.blocks.iter().map(|b| b.id).collect();
    let mut changed = false;

    for id in ids {
        if reachable.contains(&id) {
            continue;
        }
        if func.block(id).instructions.is_empty()
            && func.block(id).successors.is_empty()
            && func.block(id).predecessors.is_empty()
        {
            continue; // already dead and detached
        }
        changed = true;

        let successors = func.block(id).successors.clone();
        for succ in successors {
            func.remove_edge(id, succ);
            let block = func.block_mut(succ);
            for instr in &mut block.instructions {
                if instr.op == Opcode::Phi {
                    if let Some(slot) = instr.blocks.iter().position(|&p| p == id) {
                        instr.blocks.remove(slot);
                        if slot < instr.operands.len() {
                            instr.operands.remove(slot);
                        }
                    }
                }
            }
        }
        let predecessors = func.block(id).predecessors.clone();
        for pred in predecessors {
            func.remove_edge(pred, id);
        }
        func.block_mut(id).instructions.clear();
    }
    changed
}
