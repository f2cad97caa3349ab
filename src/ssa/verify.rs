//! SSA verification
//!
//! Checks the structural invariants after construction and after every
//! optimizer run: each register defined exactly once, every use dominated
//! by its definition, phis only at block heads with one operand per
//! predecessor. Violations are compiler bugs and abort the pipeline with
//! a dump of the offending function.

use super::dominators::DominatorTree;
use crate::error::{Error, Result};
use crate::ir::{BlockId, IlFunction, Opcode, VReg};
use std::collections::HashMap;

/// Where a register is defined
#[derive(Clone, Copy)]
struct DefSite {
    block: BlockId,
    /// Index within the block; parameters use `usize::MAX` as "before
    /// everything"
    index: usize,
}

/// Verifies one function, returning the reasons it is malformed
pub fn verify(func: &IlFunction) -> Vec<String> {
    let mut errors = Vec::new();
    let dom = DominatorTree::compute(func);

    // Collect definition sites; parameters define at function entry
    let mut defs: HashMap<VReg, DefSite> = HashMap::new();
    for param in &func.params {
        defs.insert(
            param.reg,
            DefSite {
                block: func.entry,
                index: usize::MAX,
            },
        );
    }
    for &block_id in dom.reachable.iter() {
        let block = func.block(block_id);
        for (index, instr) in block.instructions.iter().enumerate() {
            if let Some(result) = instr.result {
                if defs
                    .insert(
                        result,
                        DefSite {
                            block: block_id,
                            index,
                        },
                    )
                    .is_some()
                {
                    errors.push(format!(
                        "register v{} is defined more than once",
                        result.id
                    ));
                }
            }
        }
    }

    for &block_id in dom.reachable.iter() {
        let block = func.block(block_id);
        let mut seen_non_phi = false;

        for (index, instr) in block.instructions.iter().enumerate() {
            if instr.op == Opcode::Phi {
                if seen_non_phi {
                    errors.push(format!(
                        "phi {} in {} appears after non-phi instructions",
                        instr.id.0, block_id
                    ));
                }
                // One operand per predecessor, in predecessor order
                let preds = &block.predecessors;
                if instr.operands.len() != preds.len()
                    || instr.blocks.len() != preds.len()
                {
                    errors.push(format!(
                        "phi {} in {} has {} operands for {} predecessors",
                        instr.id.0,
                        block_id,
                        instr.operands.len(),
                        preds.len()
                    ));
                } else {
                    for pred in preds {
                        if !instr.blocks.contains(pred) {
                            errors.push(format!(
                                "phi {} in {} is missing an operand for predecessor {}",
                                instr.id.0, block_id, pred
                            ));
                        }
                    }
                }
                // Phi uses must be dominated at the incoming edge
                for (value, &from) in instr.operands.iter().zip(instr.blocks.iter()) {
                    if let Some(reg) = value.as_reg() {
                        match defs.get(&reg) {
                            None => errors.push(format!(
                                "phi {} uses undefined register v{}",
                                instr.id.0, reg.id
                            )),
                            Some(site) => {
                                if !dom.dominates(site.block, from) {
                                    errors.push(format!(
                                        "phi {} operand v{} does not dominate edge {} -> {}",
                                        instr.id.0, reg.id, from, block_id
                                    ));
                                }
                            }
                        }
                    }
                }
                continue;
            }
            seen_non_phi = true;

            for reg in instr.used_regs() {
                match defs.get(&reg) {
                    None => errors.push(format!(
                        "instruction {} uses undefined register v{}",
                        instr.id.0, reg.id
                    )),
                    Some(site) => {
                        let dominated = if site.block == block_id {
                            site.index == usize::MAX || site.index < index
                        } else {
                            dom.dominates(site.block, block_id)
                        };
                        if !dominated {
                            errors.push(format!(
                                "use of v{} in {} is not dominated by its definition",
                                reg.id, block_id
                            ));
                        }
                    }
                }
            }
        }

        // Every reachable non-exit block ends in a terminator
        if block_id != func.exit && !block.is_terminated() {
            errors.push(format!("{} has no terminator", block_id));
        }
    }

    errors
}

/// Verifies and converts failures into a fatal internal error with a full
/// dump of the function
pub fn verify_or_fail(func: &IlFunction) -> Result<()> {
    let errors = verify(func);
    if errors.is_empty() {
        return Ok(());
    }
    Err(Error::SsaVerification {
        function: format!("{}.{}", func.module, func.name),
        reason: errors.join("; "),
        dump: func.to_string(),
    })
}
