//! Optimizer
//!
//! A fixed pass pipeline over SSA IL, iterated to a fixed point under a
//! configurable cap. `O1` runs unreachable-block elimination, constant
//! folding, and dead-code elimination; `O2` adds constant propagation,
//! copy propagation, and common subexpression elimination. SSA is
//! re-verified after every iteration, and `barrier`/`volatile_read`/
//! `volatile_write` are sequence points nothing crosses.

pub mod const_fold;
pub mod copy_prop;
pub mod cse;
pub mod dce;
pub mod unreachable;

use crate::diagnostics::DiagnosticBag;
use crate::error::Result;
use crate::ir::IlModule;
use crate::ssa::verify_or_fail;

/// Default bound on pipeline iterations per function
pub const DEFAULT_MAX_ITERATIONS: u32 = 8;

/// Optimizer with a configurable optimization level
pub struct Optimizer {
    level: u8,
    max_iterations: u32,
}

impl Optimizer {
    /// Creates an optimizer for the given level (0-2)
    pub fn new(level: u8) -> Self {
        Optimizer {
            level,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    /// Overrides the iteration cap
    pub fn with_max_iterations(mut self, cap: u32) -> Self {
        self.max_iterations = cap.max(1);
        self
    }

    /// Runs the pipeline over every function of every module
    pub fn optimize(&self, modules: &mut [IlModule], diags: &mut DiagnosticBag) -> Result<()> {
        if self.level == 0 {
            return Ok(());
        }

        for module in modules.iter_mut() {
            for func in module.functions.iter_mut() {
                let mut iterations = 0;
                loop {
                    let mut changed = false;
                    changed |= unreachable::run(func);
                    changed |= const_fold::fold_constants(func, diags);
                    if self.level >= 2 {
                        changed |= const_fold::propagate_constants(func);
                        changed |= copy_prop::run(func);
                        changed |= cse::run(func);
                    }
                    changed |= dce::run(func);

                    verify_or_fail(func)?;

                    iterations += 1;
                    if !changed || iterations >= self.max_iterations {
                        tracing::debug!(
                            function = %format!("{}.{}", func.module, func.name),
                            iterations,
                            "optimizer fixed point"
                        );
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IlGenerator, IlModule, Opcode};
    use crate::sema::analyze_sources;
    use crate::ssa::SsaConstructor;

    fn optimized(source: &str, level: u8) -> (Vec<IlModule>, DiagnosticBag) {
        let analysis = analyze_sources(&[("t.bl65", source)]);
        assert!(
            !analysis.has_errors(),
            "analysis failed: {:?}",
            analysis.diags.diagnostics()
        );
        let mut modules = IlGenerator::new(&analysis).generate().unwrap();
        SsaConstructor::run(&mut modules).unwrap();
        let mut diags = DiagnosticBag::new();
        Optimizer::new(level).optimize(&mut modules, &mut diags).unwrap();
        (modules, diags)
    }

    fn ops_of(modules: &[IlModule], func: &str) -> Vec<&'static str> {
        modules[0]
            .function(func)
            .unwrap()
            .blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .map(|i| i.op.name())
            .collect()
    }

    #[test]
    fn test_constant_expression_collapses() {
        let (modules, _) = optimized(
            "export function main()\n  let x: byte = 2 + 3\n  poke($d020, x)\nend function\n",
            2,
        );
        let ops = ops_of(&modules, "main");
        // The add folded away; only constants and the poke remain
        assert!(!ops.contains(&"add"), "{:?}", ops);
        assert!(ops.contains(&"poke"));
    }

    #[test]
    fn test_optimizer_is_idempotent() {
        let source = "export function main()\n  let x: byte = 1\n  let y: byte = x + 2\n  if y > 2 then\n    poke($d020, y)\n  end if\nend function\n";
        let (modules_once, _) = optimized(source, 2);
        let mut modules_twice = modules_once.clone();
        let mut diags = DiagnosticBag::new();
        Optimizer::new(2)
            .optimize(&mut modules_twice, &mut diags)
            .unwrap();

        let dump_once = modules_once[0].function("main").unwrap().to_string();
        let dump_twice = modules_twice[0].function("main").unwrap().to_string();
        assert_eq!(dump_once, dump_twice);
    }

    #[test]
    fn test_barrier_pins_hardware_writes() {
        let (modules, _) = optimized(
            "@map vic at $d000\n  border: byte at $20\nend map\nexport function main()\n  vic.border = 0\n  barrier()\n  vic.border = 1\nend function\n",
            2,
        );
        let func = modules[0].function("main").unwrap();
        let sequence: Vec<&'static str> = func
            .blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .map(|i| i.op.name())
            .filter(|n| *n == "map_store_field" || *n == "barrier")
            .collect();
        assert_eq!(
            sequence,
            vec!["map_store_field", "barrier", "map_store_field"]
        );
    }

    #[test]
    fn test_unreachable_branch_removed() {
        let (modules, _) = optimized(
            "export function main()\n  if false then\n    poke($d020, 1)\n  end if\n  poke($d020, 2)\nend function\n",
            1,
        );
        let func = modules[0].function("main").unwrap();
        let pokes = func
            .blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .filter(|i| i.op == Opcode::Poke)
            .count();
        assert_eq!(pokes, 1, "{}", func);
    }

    #[test]
    fn test_o0_leaves_il_alone() {
        let source =
            "export function main()\n  let x: byte = 2 + 3\n  poke($d020, x)\nend function\n";
        let (modules, _) = optimized(source, 0);
        let ops = ops_of(&modules, "main");
        assert!(ops.contains(&"add"));
    }
}
