//! Semantic analysis
//!
//! Multi-pass analysis over the whole module batch:
//!
//! 1. Module registry (duplicate names)
//! 2. Dependency graph (cycles, topological compile order)
//! 3. Import resolution
//! 4. Per-module passes in dependency order: symbol tables, type
//!    resolution, type checking, statement validation, control flow
//! 5. Global symbol table aggregation
//! 6. Memory layout
//! 7. Usage analysis (advisory)
//!
//! Analysis never throws on bad source; diagnostics accumulate and callers
//! test `has_errors()`.

pub mod builder;
pub mod checker;
pub mod control_flow;
pub mod intrinsics;
pub mod memory;
pub mod modules;
pub mod resolver;
pub mod symbols;
pub mod types;
pub mod usage;
pub mod validator;

pub use builder::{ScopeMap, SymbolTableBuilder};
pub use checker::TypeChecker;
pub use control_flow::{CfgBlockId, ControlFlowAnalyzer, ControlFlowGraph};
pub use intrinsics::{IntrinsicDef, IntrinsicRegistry, SYSTEM_SOURCE};
pub use memory::{MemoryLayout, Placement, Region};
pub use modules::{DependencyGraph, GlobalSymbolTable, ModuleRegistry};
pub use resolver::TypeResolver;
pub use symbols::{
    MappedField, MappedStruct, ScopeId, StorageClass, Symbol, SymbolId, SymbolKind, SymbolTable,
};
pub use types::{TypeId, TypeKind, TypeTable};
pub use usage::{UsageAnalyzer, UsageReport, VariableUsage};
pub use validator::StatementValidator;

use crate::diagnostics::{DiagnosticBag, DiagnosticCode};
use crate::parser::ast::{NodeMetadata, Program};
use std::collections::{HashMap, HashSet};

/// Everything the analyzer learned about one module
#[derive(Debug)]
pub struct ModuleAnalysis {
    /// The parsed program
    pub program: Program,
    /// Symbol table
    pub symbols: SymbolTable,
    /// Declaration/scope mapping shared by all passes
    pub scope_map: ScopeMap,
    /// Expression types, coercions, symbol refs, hints
    pub metadata: NodeMetadata,
    /// Per-function control-flow graphs
    pub cfgs: HashMap<String, ControlFlowGraph>,
    /// Usage counters
    pub usage: UsageReport,
    /// Module is part of an import cycle; per-module passes were skipped
    pub in_cycle: bool,
}

/// Result of analyzing a batch
#[derive(Debug)]
pub struct AnalysisResult {
    /// Per-module results, in input order
    pub modules: Vec<ModuleAnalysis>,
    /// Indices into `modules` in compile order (dependencies first)
    pub compile_order: Vec<usize>,
    /// Aggregated exports
    pub globals: GlobalSymbolTable,
    /// Batch-wide memory layout
    pub layout: MemoryLayout,
    /// Session type table
    pub types: TypeTable,
    /// Everything reported during analysis
    pub diags: DiagnosticBag,
}

impl AnalysisResult {
    /// True when an error-severity diagnostic was reported
    pub fn has_errors(&self) -> bool {
        self.diags.has_errors()
    }
}

/// Batch semantic analyzer
pub struct SemanticAnalyzer {
    intrinsics: IntrinsicRegistry,
}

impl SemanticAnalyzer {
    /// Creates an analyzer for one compilation session
    pub fn new() -> Self {
        SemanticAnalyzer {
            intrinsics: IntrinsicRegistry::new(),
        }
    }

    /// Runs every pass over the batch
    pub fn analyze(self, programs: Vec<Program>) -> AnalysisResult {
        let mut diags = DiagnosticBag::new();
        let mut types = TypeTable::new();

        // Passes 1-3: registry, dependency graph, import resolution
        let registry = ModuleRegistry::build(&programs, &mut diags);
        let graph = DependencyGraph::build(&programs, &registry, &mut diags);
        tracing::debug!(
            modules = programs.len(),
            order = ?graph.order,
            "module graph resolved"
        );

        let n = programs.len();
        let mut tables: Vec<SymbolTable> = (0..n).map(|_| SymbolTable::new()).collect();
        let mut maps: Vec<ScopeMap> = (0..n).map(|_| ScopeMap::default()).collect();
        let mut metas: Vec<NodeMetadata> = (0..n).map(|_| NodeMetadata::new()).collect();
        let mut globals = GlobalSymbolTable::new();

        // Pass 4a/4b per module, dependencies first, feeding pass 5 so
        // dependents see their dependencies' exports
        for &index in &graph.order {
            let program = &programs[index];
            let (table, map) =
                SymbolTableBuilder::new(&mut types, &mut diags).build(program);
            tables[index] = table;
            maps[index] = map;

            TypeResolver::new(
                &mut tables[index],
                &maps[index],
                &mut types,
                &mut metas[index],
                &mut diags,
            )
            .resolve(program);

            self.apply_implicit_main_export(&mut tables[index], &mut diags);
            globals.register_module(&program.module_name, &tables[index]);
        }

        // Pass 4c/4d/4e per module, dependency order
        for &index in &graph.order {
            let program = &programs[index];
            TypeChecker::new(
                &program.module_name,
                &mut tables[index],
                &maps[index],
                &mut types,
                &mut metas[index],
                &globals,
                &self.intrinsics,
                &mut diags,
            )
            .check(program);

            StatementValidator::new(
                &tables[index],
                &maps[index],
                &metas[index],
                &mut diags,
            )
            .validate(program);
        }

        // Batch-level main rules
        self.check_main_rules(&programs, &graph, &globals, &mut diags);

        // Pass 4e: control-flow graphs and flow warnings
        let mut cfgs: Vec<HashMap<String, ControlFlowGraph>> =
            (0..n).map(|_| HashMap::new()).collect();
        for &index in &graph.order {
            let non_void = self.non_void_functions(&tables[index], &types);
            cfgs[index] =
                ControlFlowAnalyzer::new(&mut diags).analyze(&programs[index], &non_void);
        }

        // Pass 6: memory layout over every analyzed module
        let layout = {
            let placed: Vec<(String, &SymbolTable)> = graph
                .order
                .iter()
                .map(|&i| (programs[i].module_name.clone(), &tables[i]))
                .collect();
            MemoryLayout::build(&placed, &types, &mut diags)
        };

        // Pass 7: usage analysis (advisory)
        let mut usages: Vec<UsageReport> = (0..n).map(|_| UsageReport::default()).collect();
        for &index in &graph.order {
            usages[index] = UsageAnalyzer::new(&tables[index], &maps[index], &metas[index])
                .analyze(&programs[index], &mut diags);
        }

        // Assemble per-module results back into input order
        let in_cycle = graph.in_cycle.clone();
        let compile_order = graph.order.clone();
        let mut modules = Vec::with_capacity(n);
        let mut tables = tables.into_iter();
        let mut maps = maps.into_iter();
        let mut metas = metas.into_iter();
        let mut cfgs = cfgs.into_iter();
        let mut usages = usages.into_iter();
        for (index, program) in programs.into_iter().enumerate() {
            modules.push(ModuleAnalysis {
                program,
                symbols: tables.next().unwrap(),
                scope_map: maps.next().unwrap(),
                metadata: metas.next().unwrap(),
                cfgs: cfgs.next().unwrap(),
                usage: usages.next().unwrap(),
                in_cycle: in_cycle.contains(&index),
            });
        }

        AnalysisResult {
            modules,
            compile_order,
            globals,
            layout,
            types,
            diags,
        }
    }

    /// `main` is exported implicitly when the author forgot to
    fn apply_implicit_main_export(&self, table: &mut SymbolTable, diags: &mut DiagnosticBag) {
        let Some(id) = table.lookup_local(table.module_scope, "main") else {
            return;
        };
        let symbol = table.symbol(id);
        if symbol.kind == SymbolKind::Function && !symbol.is_exported {
            let loc = symbol.loc.clone();
            table.symbol_mut(id).is_exported = true;
            diags.warn(
                DiagnosticCode::ImplicitMainExport,
                "'main' is exported implicitly",
                loc,
            );
        }
    }

    /// `main` must exist once across the batch
    fn check_main_rules(
        &self,
        programs: &[Program],
        graph: &DependencyGraph,
        globals: &GlobalSymbolTable,
        diags: &mut DiagnosticBag,
    ) {
        // With cycle errors the batch is already failing; a missing-main
        // error on top would be noise.
        if !graph.in_cycle.is_empty() {
            return;
        }
        let mains = globals.find_mains();
        match mains.len() {
            0 => {
                let loc = programs
                    .first()
                    .map(|p| p.loc.clone())
                    .unwrap_or_else(|| crate::source::SourceLocation::start_of("<batch>"));
                diags.error(
                    DiagnosticCode::MissingMain,
                    "No 'main' function found in the batch",
                    loc,
                );
            }
            1 => {}
            _ => {
                let names: Vec<String> =
                    mains.iter().map(|m| m.module.clone()).collect();
                let loc = programs
                    .first()
                    .map(|p| p.loc.clone())
                    .unwrap_or_else(|| crate::source::SourceLocation::start_of("<batch>"));
                diags.error(
                    DiagnosticCode::DuplicateExportedMain,
                    format!("'main' is exported by multiple modules: {}", names.join(", ")),
                    loc,
                );
            }
        }
    }

    /// Names of functions with a non-void return type
    fn non_void_functions(&self, table: &SymbolTable, types: &TypeTable) -> HashSet<String> {
        let mut set = HashSet::new();
        for (_, symbol) in table.symbols() {
            if symbol.kind != SymbolKind::Function {
                continue;
            }
            if let Some(ty) = symbol.ty {
                if let TypeKind::Function { ret, .. } = &types.info(ty).kind {
                    if *ret != types.void_id {
                        set.insert(symbol.name.clone());
                    }
                }
            }
        }
        set
    }
}

impl Default for SemanticAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience: parse and analyze a batch of (file name, source) pairs.
/// Used heavily by tests; the `Compiler` facade drives the same phases.
pub fn analyze_sources(sources: &[(&str, &str)]) -> AnalysisResult {
    let mut diags = DiagnosticBag::new();
    let mut programs = Vec::new();
    for (file, text) in sources {
        let tokens = crate::lexer::Scanner::new(text, file).scan_tokens(&mut diags);
        let (program, pd) = crate::parser::Parser::new(tokens, file).parse();
        diags.absorb(pd);
        programs.push(program);
    }
    let mut result = SemanticAnalyzer::new().analyze(programs);
    let mut merged = diags;
    merged.absorb(std::mem::take(&mut result.diags));
    result.diags = merged;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze_one(source: &str) -> AnalysisResult {
        analyze_sources(&[("t.bl65", source)])
    }

    #[test]
    fn test_happy_path() {
        let result = analyze_one(
            "export function main()\n  let x: byte = 2 + 3\n  poke($d020, x)\nend function\n",
        );
        assert!(!result.has_errors(), "{:?}", result.diags.diagnostics());
    }

    #[test]
    fn test_missing_main() {
        let result = analyze_one("function helper(): byte\n  return 1\nend function\n");
        assert!(result.diags.find(DiagnosticCode::MissingMain).is_some());
    }

    #[test]
    fn test_implicit_main_export_warns() {
        let result = analyze_one("function main()\n  let x: byte = 0\n  poke($d020, x)\nend function\n");
        assert!(result
            .diags
            .find(DiagnosticCode::ImplicitMainExport)
            .is_some());
        assert!(!result.has_errors());
    }

    #[test]
    fn test_duplicate_main_across_modules() {
        let result = analyze_sources(&[
            ("a.bl65", "module a\nexport function main()\nlet x: byte = 1\nend function\n"),
            ("b.bl65", "module b\nexport function main()\nlet x: byte = 1\nend function\n"),
        ]);
        assert!(result
            .diags
            .find(DiagnosticCode::DuplicateExportedMain)
            .is_some());
    }

    #[test]
    fn test_circular_import_stops_per_module_work() {
        let result = analyze_sources(&[
            ("a.bl65", "module a\nimport g from b\nexport function main()\n  g()\nend function\n"),
            ("b.bl65", "module b\nimport main from a\nexport function g()\n  nop()\nend function\n"),
        ]);
        assert!(result.diags.find(DiagnosticCode::CircularImport).is_some());
        assert!(result.modules.iter().all(|m| m.in_cycle));
        assert!(result.compile_order.is_empty());
    }

    #[test]
    fn test_cross_module_call() {
        let result = analyze_sources(&[
            (
                "util.bl65",
                "module util\nexport function double(x: byte): byte\n  return x * 2\nend function\n",
            ),
            (
                "main.bl65",
                "module game\nimport double from util\nexport function main()\n  let x: byte = double(4)\n  poke($d020, x)\nend function\n",
            ),
        ]);
        assert!(!result.has_errors(), "{:?}", result.diags.diagnostics());
        // util compiles before game
        let util_idx = result
            .modules
            .iter()
            .position(|m| m.program.module_name == "util")
            .unwrap();
        assert_eq!(result.compile_order[0], util_idx);
    }

    #[test]
    fn test_undefined_variable() {
        let result = analyze_one("export function main()\n  poke($d020, missing)\nend function\n");
        assert!(result.diags.find(DiagnosticCode::UndefinedVariable).is_some());
    }

    #[test]
    fn test_assign_to_const() {
        let result = analyze_one(
            "const SPEED: byte = 3\nexport function main()\n  SPEED = 4\nend function\n",
        );
        assert!(result.diags.find(DiagnosticCode::AssignToConst).is_some());
    }

    #[test]
    fn test_array_reassignment() {
        let result = analyze_one(
            "let colors: byte[] = [2, 5, 6]\nexport function main()\n  colors = [1, 2, 3]\nend function\n",
        );
        assert!(result
            .diags
            .find(DiagnosticCode::ArrayReassignment)
            .is_some());
    }

    #[test]
    fn test_intrinsic_arity() {
        let result =
            analyze_one("export function main()\n  poke($d020)\nend function\n");
        assert!(result
            .diags
            .find(DiagnosticCode::IntrinsicArityMismatch)
            .is_some());
    }

    #[test]
    fn test_length_of_literal() {
        let result = analyze_one(
            "export function main(): word\n  return length(\"hello\")\nend function\n",
        );
        assert!(!result.has_errors(), "{:?}", result.diags.diagnostics());
    }

    #[test]
    fn test_mapped_struct_access() {
        let result = analyze_one(
            "@map vic at $d000\n  border: byte at $20\nend map\nexport function main()\n  vic.border = 0\nend function\n",
        );
        assert!(!result.has_errors(), "{:?}", result.diags.diagnostics());
    }

    #[test]
    fn test_break_outside_loop() {
        let result = analyze_one("export function main()\n  break\nend function\n");
        assert!(result.has_errors());
    }

    #[test]
    fn test_word_to_byte_needs_explicit() {
        let result = analyze_one(
            "export function main()\n  let w: word = 300\n  let b: byte = w\nend function\n",
        );
        assert!(result.diags.find(DiagnosticCode::TypeMismatch).is_some());
    }
}
