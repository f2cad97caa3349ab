//! Multi-module linkage
//!
//! The batch is analyzed as a whole: a registry maps module names to parsed
//! programs, a dependency graph orders compilation (dependencies first) and
//! rejects import cycles, and a global symbol table aggregates per-module
//! exports for cross-module lookup.

use super::symbols::{SymbolId, SymbolKind, SymbolTable};
use super::types::TypeId;
use crate::diagnostics::{DiagnosticBag, DiagnosticCode};
use crate::parser::ast::Program;
use std::collections::{HashMap, HashSet};

/// Maps module names to their index in the program batch
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    by_name: HashMap<String, usize>,
}

impl ModuleRegistry {
    /// Builds the registry; duplicate module names are fatal for the
    /// second occurrence
    pub fn build(programs: &[Program], diags: &mut DiagnosticBag) -> Self {
        let mut by_name: HashMap<String, usize> = HashMap::new();
        for (index, program) in programs.iter().enumerate() {
            if by_name.contains_key(&program.module_name) {
                diags.error(
                    DiagnosticCode::DuplicateModule,
                    format!(
                        "Module '{}' is declared by more than one file",
                        program.module_name
                    ),
                    program.loc.clone(),
                );
            } else {
                by_name.insert(program.module_name.clone(), index);
            }
        }
        ModuleRegistry { by_name }
    }

    /// Index of a module by name
    pub fn get(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// True when the module exists in the batch
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }
}

/// Import graph over the batch, with cycle rejection and topological order
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Adjacency: module index -> indices it imports from
    deps: Vec<Vec<usize>>,
    /// Topological compile order, dependencies first
    pub order: Vec<usize>,
    /// Modules involved in at least one import cycle
    pub in_cycle: HashSet<usize>,
}

/// DFS colors for cycle detection
#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

impl DependencyGraph {
    /// Builds the graph and computes the compile order. Unresolvable
    /// imports are reported here as `ModuleNotFound`; cycles as
    /// `CircularImport` naming the full chain.
    pub fn build(
        programs: &[Program],
        registry: &ModuleRegistry,
        diags: &mut DiagnosticBag,
    ) -> Self {
        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); programs.len()];

        for (index, program) in programs.iter().enumerate() {
            for import in &program.imports {
                match registry.get(&import.module) {
                    Some(dep) => {
                        if dep != index && !deps[index].contains(&dep) {
                            deps[index].push(dep);
                        }
                    }
                    None => {
                        diags.error(
                            DiagnosticCode::ModuleNotFound,
                            format!("Imported module '{}' does not exist", import.module),
                            import.loc.clone(),
                        );
                    }
                }
            }
        }

        let mut graph = DependencyGraph {
            deps,
            order: Vec::new(),
            in_cycle: HashSet::new(),
        };
        graph.detect_cycles(programs, diags);
        graph.topological_order();
        graph
    }

    /// DFS with coloring; every back edge yields one reported cycle chain
    fn detect_cycles(&mut self, programs: &[Program], diags: &mut DiagnosticBag) {
        let n = self.deps.len();
        let mut colors = vec![Color::White; n];
        let mut stack: Vec<usize> = Vec::new();

        for start in 0..n {
            if colors[start] == Color::White {
                self.cycle_dfs(start, programs, &mut colors, &mut stack, diags);
            }
        }
    }

    fn cycle_dfs(
        &mut self,
        node: usize,
        programs: &[Program],
        colors: &mut Vec<Color>,
        stack: &mut Vec<usize>,
        diags: &mut DiagnosticBag,
    ) {
        colors[node] = Color::Gray;
        stack.push(node);

        let deps = self.deps[node].clone();
        for dep in deps {
            match colors[dep] {
                Color::White => self.cycle_dfs(dep, programs, colors, stack, diags),
                Color::Gray => {
                    // Back edge: the chain runs from `dep` around to `node`
                    let from = stack.iter().position(|&m| m == dep).unwrap_or(0);
                    let mut chain: Vec<String> = stack[from..]
                        .iter()
                        .map(|&m| programs[m].module_name.clone())
                        .collect();
                    chain.push(programs[dep].module_name.clone());

                    for &m in &stack[from..] {
                        self.in_cycle.insert(m);
                    }
                    self.in_cycle.insert(dep);

                    diags.error(
                        DiagnosticCode::CircularImport,
                        format!("Circular import: {}", chain.join(" -> ")),
                        programs[node].loc.clone(),
                    );
                }
                Color::Black => {}
            }
        }

        stack.pop();
        colors[node] = Color::Black;
    }

    /// Postorder DFS over the dependency edges puts dependencies first.
    /// Modules caught in a cycle are excluded: no further cross-module
    /// work happens for them.
    fn topological_order(&mut self) {
        let n = self.deps.len();
        let mut visited = vec![false; n];
        let mut order = Vec::with_capacity(n);

        fn visit(
            node: usize,
            deps: &[Vec<usize>],
            in_cycle: &HashSet<usize>,
            visited: &mut Vec<bool>,
            order: &mut Vec<usize>,
        ) {
            if visited[node] || in_cycle.contains(&node) {
                return;
            }
            visited[node] = true;
            for &dep in &deps[node] {
                visit(dep, deps, in_cycle, visited, order);
            }
            order.push(node);
        }

        for node in 0..n {
            visit(node, &self.deps, &self.in_cycle, &mut visited, &mut order);
        }
        self.order = order;
    }

    /// Modules `index` imports from
    pub fn dependencies(&self, index: usize) -> &[usize] {
        &self.deps[index]
    }
}

/// One exported symbol, viewed from outside its module
#[derive(Debug, Clone)]
pub struct GlobalSymbol {
    /// Exporting module
    pub module: String,
    /// Exported name
    pub name: String,
    /// Id inside the exporting module's symbol table
    pub symbol: SymbolId,
    /// Symbol kind
    pub kind: SymbolKind,
    /// Resolved type
    pub ty: Option<TypeId>,
    /// Constant flag
    pub is_const: bool,
    /// Compile-time value for constants
    pub const_value: Option<u32>,
}

/// Aggregated exports of the whole batch
#[derive(Debug, Default)]
pub struct GlobalSymbolTable {
    exports: HashMap<String, HashMap<String, GlobalSymbol>>,
}

impl GlobalSymbolTable {
    /// Creates an empty table
    pub fn new() -> Self {
        GlobalSymbolTable::default()
    }

    /// Registers every exported module-scope symbol of one module
    pub fn register_module(&mut self, module: &str, table: &SymbolTable) {
        let entry = self.exports.entry(module.to_string()).or_default();
        for id in table.module_symbols() {
            let symbol = table.symbol(id);
            if symbol.is_exported {
                entry.insert(
                    symbol.name.clone(),
                    GlobalSymbol {
                        module: module.to_string(),
                        name: symbol.name.clone(),
                        symbol: id,
                        kind: symbol.kind,
                        ty: symbol.ty,
                        is_const: symbol.is_const,
                        const_value: symbol.const_value,
                    },
                );
            }
        }
    }

    /// Qualified lookup: `module` + exported name
    pub fn lookup_qualified(&self, module: &str, name: &str) -> Option<&GlobalSymbol> {
        self.exports.get(module)?.get(name)
    }

    /// Unqualified lookup across every module; returns all matches so the
    /// caller can reject ambiguity
    pub fn lookup_unqualified(&self, name: &str) -> Vec<&GlobalSymbol> {
        let mut matches: Vec<&GlobalSymbol> = self
            .exports
            .values()
            .filter_map(|names| names.get(name))
            .collect();
        matches.sort_by(|a, b| a.module.cmp(&b.module));
        matches
    }

    /// Exported names of one module
    pub fn module_exports(&self, module: &str) -> Option<&HashMap<String, GlobalSymbol>> {
        self.exports.get(module)
    }

    /// Every exported `main` in the batch (for uniqueness checking)
    pub fn find_mains(&self) -> Vec<&GlobalSymbol> {
        let mut mains = self.lookup_unqualified("main");
        mains.retain(|s| s.kind == SymbolKind::Function);
        mains
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticBag;
    use crate::lexer::Scanner;
    use crate::parser::Parser;

    fn parse_modules(sources: &[&str]) -> (Vec<Program>, DiagnosticBag) {
        let mut diags = DiagnosticBag::new();
        let mut programs = Vec::new();
        for (i, src) in sources.iter().enumerate() {
            let file = format!("m{}.bl65", i);
            let tokens = Scanner::new(src, &file).scan_tokens(&mut diags);
            let (program, pd) = Parser::new(tokens, &file).parse();
            diags.absorb(pd);
            programs.push(program);
        }
        (programs, diags)
    }

    #[test]
    fn test_duplicate_module_names() {
        let (programs, mut diags) =
            parse_modules(&["module a\nlet x: byte = 1\n", "module a\nlet y: byte = 2\n"]);
        ModuleRegistry::build(&programs, &mut diags);
        assert!(diags.find(DiagnosticCode::DuplicateModule).is_some());
    }

    #[test]
    fn test_topological_order() {
        let (programs, mut diags) = parse_modules(&[
            "module a\nimport f from b\n",
            "module b\nexport function f(): byte\n  return 1\nend function\n",
        ]);
        let registry = ModuleRegistry::build(&programs, &mut diags);
        let graph = DependencyGraph::build(&programs, &registry, &mut diags);
        assert!(!diags.has_errors(), "{:?}", diags.diagnostics());
        // b (index 1) must come before a (index 0)
        assert_eq!(graph.order, vec![1, 0]);
    }

    #[test]
    fn test_cycle_detection() {
        let (programs, mut diags) = parse_modules(&[
            "module a\nimport g from b\nexport function f(): byte\n  return 1\nend function\n",
            "module b\nimport f from a\nexport function g(): byte\n  return 2\nend function\n",
        ]);
        let registry = ModuleRegistry::build(&programs, &mut diags);
        let graph = DependencyGraph::build(&programs, &registry, &mut diags);

        let cycle = diags.find(DiagnosticCode::CircularImport).unwrap();
        assert!(cycle.message.contains("a"), "{}", cycle.message);
        assert!(cycle.message.contains("b"), "{}", cycle.message);
        assert!(cycle.message.contains("->"));
        // Both modules are excluded from the compile order
        assert!(graph.order.is_empty());
        assert_eq!(graph.in_cycle.len(), 2);
    }

    #[test]
    fn test_missing_module() {
        let (programs, mut diags) = parse_modules(&["module a\nimport f from nowhere\n"]);
        let registry = ModuleRegistry::build(&programs, &mut diags);
        let _ = DependencyGraph::build(&programs, &registry, &mut diags);
        assert!(diags.find(DiagnosticCode::ModuleNotFound).is_some());
    }
}
