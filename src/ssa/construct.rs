//! SSA construction: phi placement and renaming
//!
//! Function-local variables (names carrying a `%` suffix and no module
//! dot) are promoted out of their `load_var`/`store_var` slots into pure
//! register flow. Phi placement follows the classic worklist over
//! dominance frontiers; renaming walks the dominator tree in preorder
//! with a value stack per variable. Module-level variables stay as memory
//! operations.

use super::dominators::DominatorTree;
use crate::ir::{
    BlockId, Constant, IlFunction, IlType, InstrId, InstrMeta, Instruction, Opcode, VReg, Value,
};
use std::collections::{HashMap, HashSet};

/// True for names the promotion applies to
fn is_local(name: &str) -> bool {
    name.contains('%') && !name.contains('.')
}

/// Runs phi placement and renaming over one function
pub struct SsaBuilder<'a> {
    func: &'a mut IlFunction,
    dom: DominatorTree,
    frontiers: Vec<HashSet<BlockId>>,
    /// Phi instruction -> variable it merges
    phi_vars: HashMap<InstrId, String>,
    /// Resolved replacement for deleted load results
    replacements: HashMap<VReg, Value>,
    /// Renaming stacks, one per variable
    stacks: HashMap<String, Vec<Value>>,
    /// Preferred-register hints carried from promoted accesses to phis
    var_hints: HashMap<String, (crate::ir::CpuReg, u8)>,
}

impl<'a> SsaBuilder<'a> {
    /// Prepares construction; unreachable blocks are emptied first so the
    /// dominator walk covers everything that still holds code
    pub fn new(func: &'a mut IlFunction) -> Self {
        prune_unreachable(func);
        let dom = DominatorTree::compute(func);
        let frontiers = dom.frontiers(func);
        SsaBuilder {
            func,
            dom,
            frontiers,
            phi_vars: HashMap::new(),
            replacements: HashMap::new(),
            stacks: HashMap::new(),
            var_hints: HashMap::new(),
        }
    }

    /// Runs the construction to completion
    pub fn run(mut self) {
        let (def_blocks, var_types) = self.collect_definitions();
        self.place_phis(&def_blocks, &var_types);
        self.seed_params();
        let entry = self.func.entry;
        self.rename(entry);
        self.sweep_deleted();
    }

    /// Defining blocks and value type per promotable variable
    fn collect_definitions(
        &mut self,
    ) -> (HashMap<String, HashSet<BlockId>>, HashMap<String, IlType>) {
        let mut def_blocks: HashMap<String, HashSet<BlockId>> = HashMap::new();
        let mut var_types: HashMap<String, IlType> = HashMap::new();

        for block in &self.func.blocks {
            for instr in &block.instructions {
                match &instr.op {
                    Opcode::StoreVar(name) if is_local(name) => {
                        def_blocks.entry(name.clone()).or_default().insert(block.id);
                        if let Some(v) = instr.operands.first() {
                            var_types.entry(name.clone()).or_insert_with(|| v.ty());
                        }
                        // Register hints survive promotion on the phi
                        if let Some(hint) = instr.meta.preferred_reg {
                            self.var_hints
                                .insert(name.clone(), (hint, instr.meta.zp_priority));
                        }
                    }
                    Opcode::LoadVar(name) if is_local(name) => {
                        if let Some(result) = instr.result {
                            var_types.entry(name.clone()).or_insert(result.ty);
                        }
                        if let Some(hint) = instr.meta.preferred_reg {
                            self.var_hints
                                .insert(name.clone(), (hint, instr.meta.zp_priority));
                        }
                    }
                    _ => {}
                }
            }
        }

        // Parameters define their slot at the entry block
        for param in &self.func.params {
            def_blocks
                .entry(param.name.clone())
                .or_default()
                .insert(self.func.entry);
            var_types.entry(param.name.clone()).or_insert(param.ty);
        }

        (def_blocks, var_types)
    }

    /// Worklist phi placement: a placed phi is itself a new definition
    fn place_phis(
        &mut self,
        def_blocks: &HashMap<String, HashSet<BlockId>>,
        var_types: &HashMap<String, IlType>,
    ) {
        let mut vars: Vec<&String> = def_blocks.keys().collect();
        vars.sort();

        for var in vars {
            let ty = var_types.get(var).copied().unwrap_or(IlType::Byte);
            let mut worklist: Vec<BlockId> = def_blocks[var].iter().copied().collect();
            worklist.sort();
            let mut placed: HashSet<BlockId> = HashSet::new();

            while let Some(block) = worklist.pop() {
                let frontier: Vec<BlockId> =
                    self.frontiers[block.0 as usize].iter().copied().collect();
                for target in frontier {
                    if !placed.insert(target) {
                        continue;
                    }
                    let preds = self.func.block(target).predecessors.clone();
                    if preds.is_empty() {
                        continue;
                    }
                    let result = self.func.fresh_reg(ty);
                    let id = InstrId(self.func.next_instr);
                    self.func.next_instr += 1;
                    let mut meta = InstrMeta::default();
                    if let Some(&(hint, priority)) = self.var_hints.get(var) {
                        meta.preferred_reg = Some(hint);
                        meta.zp_priority = priority;
                    }
                    let phi = Instruction {
                        id,
                        op: Opcode::Phi,
                        result: Some(result),
                        operands: vec![
                            Value::Const(Constant { value: 0, ty });
                            preds.len()
                        ],
                        blocks: preds,
                        meta,
                    };
                    self.func
                        .block_mut(target)
                        .instructions
                        .insert(0, phi);
                    self.phi_vars.insert(id, var.clone());

                    if !def_blocks[var].contains(&target) {
                        worklist.push(target);
                    }
                }
            }
        }
    }

    /// Parameters start live in their arrival registers
    fn seed_params(&mut self) {
        for param in &self.func.params {
            self.stacks
                .entry(param.name.clone())
                .or_default()
                .push(Value::Reg(param.reg));
        }
    }

    fn current_value(&self, var: &str, ty: IlType) -> Value {
        self.stacks
            .get(var)
            .and_then(|s| s.last())
            .copied()
            // A read before any write sees zero
            .unwrap_or(Value::Const(Constant { value: 0, ty }))
    }

    fn resolve(&self, value: Value) -> Value {
        match value {
            Value::Reg(reg) => self.replacements.get(&reg).copied().unwrap_or(value),
            _ => value,
        }
    }

    /// Preorder walk over the dominator tree
    fn rename(&mut self, block: BlockId) {
        let mut pushed: Vec<String> = Vec::new();

        // Rewrite and filter this block's instructions
        let instr_count = self.func.block(block).instructions.len();
        let mut deleted: Vec<usize> = Vec::new();
        for index in 0..instr_count {
            // Resolve operands through the replacement map first
            let resolved: Vec<Value> = self.func.block(block).instructions[index]
                .operands
                .iter()
                .map(|&v| self.resolve(v))
                .collect();
            self.func.block_mut(block).instructions[index].operands = resolved;

            let instr = &self.func.block(block).instructions[index];
            match instr.op.clone() {
                Opcode::Phi => {
                    // Every phi is built with a result register; the
                    // verifier rejects the function afterwards if one is
                    // somehow missing, so a malformed phi is skipped here
                    // rather than panicking mid-pass.
                    debug_assert!(instr.result.is_some(), "phi without result");
                    if let (Some(var), Some(result)) =
                        (self.phi_vars.get(&instr.id).cloned(), instr.result)
                    {
                        self.stacks.entry(var.clone()).or_default().push(Value::Reg(result));
                        pushed.push(var);
                    }
                }
                Opcode::LoadVar(name) if is_local(&name) => {
                    // A load without a result computes nothing; deleting
                    // it is still the right outcome.
                    debug_assert!(instr.result.is_some(), "load without result");
                    if let Some(result) = instr.result {
                        let value = self.current_value(&name, result.ty);
                        self.replacements.insert(result, value);
                    }
                    deleted.push(index);
                }
                Opcode::StoreVar(name) if is_local(&name) => {
                    let value = self.resolve(instr.operands[0]);
                    self.stacks.entry(name.clone()).or_default().push(value);
                    pushed.push(name);
                    deleted.push(index);
                }
                _ => {}
            }
        }
        for &index in deleted.iter().rev() {
            let removed = self.func.block_mut(block).instructions.remove(index);
            debug_assert!(matches!(
                removed.op,
                Opcode::LoadVar(_) | Opcode::StoreVar(_)
            ));
        }

        // Feed successor phis the value flowing out along this edge
        let successors = self.func.block(block).successors.clone();
        for succ in successors {
            let phi_ids: Vec<(InstrId, usize)> = self
                .func
                .block(succ)
                .phis()
                .filter_map(|phi| {
                    phi.blocks
                        .iter()
                        .position(|&p| p == block)
                        .map(|slot| (phi.id, slot))
                })
                .collect();
            for (phi_id, slot) in phi_ids {
                let Some(var) = self.phi_vars.get(&phi_id).cloned() else {
                    // Generator-emitted phi: its operand is a real value,
                    // already resolved when its block was renamed
                    continue;
                };
                let ty = self
                    .func
                    .block(succ)
                    .instructions
                    .iter()
                    .find(|i| i.id == phi_id)
                    .and_then(|i| i.result)
                    .map(|r| r.ty)
                    .unwrap_or(IlType::Byte);
                let value = self.current_value(&var, ty);
                if let Some(instr) = self
                    .func
                    .block_mut(succ)
                    .instructions
                    .iter_mut()
                    .find(|i| i.id == phi_id)
                {
                    instr.operands[slot] = value;
                }
            }
        }

        // Recurse into dominated blocks
        let children = self.dom.children[block.0 as usize].clone();
        for child in children {
            self.rename(child);
        }

        for var in pushed.into_iter().rev() {
            if let Some(stack) = self.stacks.get_mut(&var) {
                stack.pop();
            }
        }
    }

    /// Generator-emitted phis in blocks renamed before their predecessors
    /// may still hold stale register operands; resolve one final time
    fn sweep_deleted(&mut self) {
        let replacements = std::mem::take(&mut self.replacements);
        for block in &mut self.func.blocks {
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
}

/// Empties blocks unreachable from the entry and removes their CFG edges
fn prune_unreachable(func: &mut IlFunction) {
    let reachable: HashSet<BlockId> = func.reachable_blocks().into_iter().collect();
    let ids: Vec<BlockId> = func.blocks.iter().map(|b| b.id).collect();
    for id in ids {
        if reachable.contains(&id) {
            continue;
        }
        let successors = func.block(id).successors.clone();
        for succ in successors {
            func.remove_edge(id, succ);
            // Drop the dead block from successor phi operand lists
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
}
