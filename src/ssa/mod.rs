//! SSA construction
//!
//! Converts generated IL into SSA form per function: dominator tree,
//! dominance frontiers, worklist phi placement, preorder renaming, then
//! verification. Verification failures are internal compiler errors.

pub mod construct;
pub mod dominators;
pub mod verify;

pub use construct::SsaBuilder;
pub use dominators::DominatorTree;
pub use verify::{verify, verify_or_fail};

use crate::error::Result;
use crate::ir::IlModule;

/// Runs SSA construction over every function of every module
pub struct SsaConstructor;

impl SsaConstructor {
    /// Converts all functions to SSA form, verifying each
    pub fn run(modules: &mut [IlModule]) -> Result<()> {
        for module in modules.iter_mut() {
            for func in module.functions.iter_mut() {
                SsaBuilder::new(func).run();
                verify_or_fail(func)?;
                tracing::debug!(
                    function = %format!("{}.{}", func.module, func.name),
                    instructions = func.instruction_count(),
                    "SSA constructed"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IlGenerator, Opcode};
    use crate::sema::analyze_sources;

    fn build_ssa(source: &str) -> Vec<IlModule> {
        let analysis = analyze_sources(&[("t.bl65", source)]);
        assert!(
            !analysis.has_errors(),
            "analysis failed: {:?}",
            analysis.diags.diagnostics()
        );
        let mut modules = IlGenerator::new(&analysis).generate().unwrap();
        SsaConstructor::run(&mut modules).unwrap();
        modules
    }

    #[test]
    fn test_straight_line_promotes_locals() {
        let modules = build_ssa(
            "export function main()\n  let x: byte = 2 + 3\n  poke($d020, x)\nend function\n",
        );
        let func = modules[0].function("main").unwrap();
        // All local loads/stores are gone
        let residue = func
            .blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .filter(|i| {
                matches!(&i.op, Opcode::LoadVar(n) | Opcode::StoreVar(n) if n.contains('%'))
            })
            .count();
        assert_eq!(residue, 0);
    }

    #[test]
    fn test_branch_join_gets_phi() {
        let modules = build_ssa(
            "export function main()\n  let x: byte = 0\n  let f: boolean = peek($dc00) == 0\n  if f then\n    x = 1\n  else\n    x = 2\n  end if\n  poke($d020, x)\nend function\n",
        );
        let func = modules[0].function("main").unwrap();
        let phi_count = func
            .blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .filter(|i| i.op == Opcode::Phi)
            .count();
        assert!(phi_count >= 1, "expected a phi at the join:\n{}", func);
    }

    #[test]
    fn test_loop_induction_gets_phi() {
        let modules = build_ssa(
            "export function main()\n  for i = 0 to 9\n    poke($d020, i)\n  next\nend function\n",
        );
        let func = modules[0].function("main").unwrap();
        let has_phi = func
            .blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .any(|i| i.op == Opcode::Phi);
        assert!(has_phi, "loop header needs an induction phi:\n{}", func);
    }

    #[test]
    fn test_verification_passes_on_generated_code() {
        let modules = build_ssa(
            "function helper(a: byte, b: byte): byte\n  if a > b then\n    return a\n  end if\n  return b\nend function\nexport function main()\n  poke($d020, helper(1, 2))\nend function\n",
        );
        for module in &modules {
            for func in &module.functions {
                assert!(verify(func).is_empty(), "{}", func);
            }
        }
    }

    #[test]
    fn test_globals_stay_memory_ops() {
        let modules = build_ssa(
            "let score: byte = 0\nexport function main()\n  score = score + 1\n  poke($d020, score)\nend function\n",
        );
        let func = modules[0].function("main").unwrap();
        let global_ops = func
            .blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .filter(|i| {
                matches!(&i.op, Opcode::LoadVar(n) | Opcode::StoreVar(n) if n == "global.score")
            })
            .count();
        assert!(global_ops >= 2, "global accesses must remain:\n{}", func);
    }
}
