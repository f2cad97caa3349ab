//! Dominator tree and dominance frontiers
//!
//! Dominator sets are computed by the iterative data-flow variant:
//! `Dom(entry) = {entry}`, and for every other block
//! `Dom(B) = {B} ∪ ⋂ Dom(P)` over predecessors, iterated to a fixed
//! point. The immediate dominator falls out as the deepest strict
//! dominator; frontiers use the predecessor-runner walk.

use crate::ir::{BlockId, IlFunction};
use std::collections::HashSet;

/// Dominator information for one function
#[derive(Debug)]
pub struct DominatorTree {
    /// Immediate dominator per block (index by block id)
    pub idom: Vec<Option<BlockId>>,
    /// Full dominator set per block
    pub dom_sets: Vec<HashSet<BlockId>>,
    /// Dominator-tree children per block
    pub children: Vec<Vec<BlockId>>,
    /// Depth in the dominator tree
    pub depth: Vec<u32>,
    /// Blocks reachable from entry
    pub reachable: HashSet<BlockId>,
}

impl DominatorTree {
    /// Computes dominators for all blocks reachable from the entry
    pub fn compute(func: &IlFunction) -> Self {
        let n = func.blocks.len();
        let reachable: HashSet<BlockId> = func.reachable_blocks().into_iter().collect();
        let all: HashSet<BlockId> = reachable.iter().copied().collect();

        let mut dom_sets: Vec<HashSet<BlockId>> = (0..n)
            .map(|i| {
                let id = BlockId(i as u32);
                if id == func.entry {
                    [id].into_iter().collect()
                } else {
                    all.clone()
                }
            })
            .collect();

        // Iterate to fixed point
        let mut changed = true;
        while changed {
            changed = false;
            for &id in &reachable {
                if id == func.entry {
                    continue;
                }
                let preds: Vec<BlockId> = func
                    .block(id)
                    .predecessors
                    .iter()
                    .copied()
                    .filter(|p| reachable.contains(p))
                    .collect();
                let mut new_set: Option<HashSet<BlockId>> = None;
                for pred in preds {
                    let pred_set = &dom_sets[pred.0 as usize];
                    new_set = Some(match new_set {
                        None => pred_set.clone(),
                        Some(acc) => acc.intersection(pred_set).copied().collect(),
                    });
                }
                let mut new_set = new_set.unwrap_or_default();
                new_set.insert(id);
                if new_set != dom_sets[id.0 as usize] {
                    dom_sets[id.0 as usize] = new_set;
                    changed = true;
                }
            }
        }

        // Immediate dominator: the strict dominator with the largest
        // dominator set (dominators of a block are totally ordered)
        let mut idom: Vec<Option<BlockId>> = vec![None; n];
        for &id in &reachable {
            if id == func.entry {
                continue;
            }
            let strict: Vec<BlockId> = dom_sets[id.0 as usize]
                .iter()
                .copied()
                .filter(|&d| d != id)
                .collect();
            idom[id.0 as usize] = strict
                .iter()
                .copied()
                .max_by_key(|d| dom_sets[d.0 as usize].len());
        }

        let mut children: Vec<Vec<BlockId>> = vec![Vec::new(); n];
        for &id in &reachable {
            if let Some(parent) = idom[id.0 as usize] {
                children[parent.0 as usize].push(id);
            }
        }
        for kids in &mut children {
            kids.sort();
        }

        let mut depth = vec![0u32; n];
        let mut stack = vec![func.entry];
        while let Some(id) = stack.pop() {
            for &child in &children[id.0 as usize] {
                depth[child.0 as usize] = depth[id.0 as usize] + 1;
                stack.push(child);
            }
        }

        DominatorTree {
            idom,
            dom_sets,
            children,
            depth,
            reachable,
        }
    }

    /// Does `a` dominate `b`?
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        self.dom_sets
            .get(b.0 as usize)
            .map(|set| set.contains(&a))
            .unwrap_or(false)
    }

    /// Dominance frontier per block: `DF(B)` holds every block X where B
    /// dominates a predecessor of X but not X itself (strictly)
    pub fn frontiers(&self, func: &IlFunction) -> Vec<HashSet<BlockId>> {
        let n = func.blocks.len();
        let mut df: Vec<HashSet<BlockId>> = vec![HashSet::new(); n];

        for &id in &self.reachable {
            let preds: Vec<BlockId> = func
                .block(id)
                .predecessors
                .iter()
                .copied()
                .filter(|p| self.reachable.contains(p))
                .collect();
            if preds.len() < 2 {
                continue;
            }
            let Some(idom) = self.idom[id.0 as usize] else {
                continue;
            };
            for pred in preds {
                let mut runner = pred;
                while runner != idom {
                    df[runner.0 as usize].insert(id);
                    match self.idom[runner.0 as usize] {
                        Some(next) => runner = next,
                        None => break,
                    }
                }
            }
        }
        df
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Constant, FunctionBuilder, IlType};

    /// Diamond: entry -> a, b -> merge
    fn diamond() -> IlFunction {
        let mut b = FunctionBuilder::new("m", "f", IlType::Void, false);
        let cond = b.emit_const(Constant::bool(true));
        let left = b.new_block("left");
        let right = b.new_block("right");
        let merge = b.new_block("merge");
        b.branch(cond, left, right);
        b.switch_to(left);
        b.jump(merge);
        b.switch_to(right);
        b.jump(merge);
        b.switch_to(merge);
        b.ret_void();
        b.finish()
    }

    #[test]
    fn test_diamond_dominators() {
        let func = diamond();
        let dom = DominatorTree::compute(&func);
        let entry = func.entry;
        // Entry dominates everything reachable
        for &id in &dom.reachable {
            assert!(dom.dominates(entry, id));
        }
        // Branch arms do not dominate the merge
        let merge = BlockId(4);
        let left = BlockId(2);
        assert!(!dom.dominates(left, merge));
        assert_eq!(dom.idom[merge.0 as usize], Some(entry));
    }

    #[test]
    fn test_diamond_frontiers() {
        let func = diamond();
        let dom = DominatorTree::compute(&func);
        let df = dom.frontiers(&func);
        let merge = BlockId(4);
        let left = BlockId(2);
        let right = BlockId(3);
        assert!(df[left.0 as usize].contains(&merge));
        assert!(df[right.0 as usize].contains(&merge));
        assert!(!df[func.entry.0 as usize].contains(&merge));
    }

    #[test]
    fn test_entry_dominates_itself_only_trivially() {
        let func = diamond();
        let dom = DominatorTree::compute(&func);
        assert_eq!(dom.dom_sets[func.entry.0 as usize].len(), 1);
    }
}
