//! Control-flow analysis (pass 4e)
//!
//! Builds a per-function CFG over statement ids, computes reachability by
//! forward DFS from the entry block, warns about unreachable statements,
//! and flags non-void functions that can fall off the end.

use crate::diagnostics::{DiagnosticBag, DiagnosticCode};
use crate::parser::ast::*;
use std::collections::HashSet;

/// CFG block id (index into the block arena)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CfgBlockId(pub usize);

/// One basic block of statements
#[derive(Debug, Clone)]
pub struct CfgBlock {
    /// Arena id
    pub id: CfgBlockId,
    /// Human-readable label
    pub label: String,
    /// Statements in the block, in order
    pub stmts: Vec<NodeId>,
    /// Predecessor blocks
    pub predecessors: Vec<CfgBlockId>,
    /// Successor blocks
    pub successors: Vec<CfgBlockId>,
    /// Location of the first statement, for diagnostics
    pub first_loc: Option<crate::source::SourceLocation>,
}

/// Per-function control-flow graph
#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    /// Block arena
    pub blocks: Vec<CfgBlock>,
    /// Entry block (no predecessors)
    pub entry: CfgBlockId,
    /// Exit block (no successors)
    pub exit: CfgBlockId,
}

impl ControlFlowGraph {
    fn new() -> Self {
        let mut cfg = ControlFlowGraph {
            blocks: Vec::new(),
            entry: CfgBlockId(0),
            exit: CfgBlockId(0),
        };
        cfg.entry = cfg.new_block("entry");
        cfg.exit = cfg.new_block("exit");
        cfg
    }

    fn new_block(&mut self, label: &str) -> CfgBlockId {
        let id = CfgBlockId(self.blocks.len());
        self.blocks.push(CfgBlock {
            id,
            label: format!("{}_{}", label, id.0),
            stmts: Vec::new(),
            predecessors: Vec::new(),
            successors: Vec::new(),
            first_loc: None,
        });
        id
    }

    /// Adds a bidirectional edge
    fn add_edge(&mut self, from: CfgBlockId, to: CfgBlockId) {
        if !self.blocks[from.0].successors.contains(&to) {
            self.blocks[from.0].successors.push(to);
        }
        if !self.blocks[to.0].predecessors.contains(&from) {
            self.blocks[to.0].predecessors.push(from);
        }
    }

    /// Blocks reachable from the entry by forward DFS
    pub fn reachable(&self) -> HashSet<CfgBlockId> {
        let mut seen = HashSet::new();
        let mut stack = vec![self.entry];
        while let Some(block) = stack.pop() {
            if !seen.insert(block) {
                continue;
            }
            for &succ in &self.blocks[block.0].successors {
                stack.push(succ);
            }
        }
        seen
    }

    /// Block by id
    pub fn block(&self, id: CfgBlockId) -> &CfgBlock {
        &self.blocks[id.0]
    }
}

/// Builds CFGs and reports flow diagnostics for one module
pub struct ControlFlowAnalyzer<'a> {
    diags: &'a mut DiagnosticBag,
}

struct LoopTargets {
    break_to: CfgBlockId,
    continue_to: CfgBlockId,
}

impl<'a> ControlFlowAnalyzer<'a> {
    /// Creates the analyzer
    pub fn new(diags: &'a mut DiagnosticBag) -> Self {
        ControlFlowAnalyzer { diags }
    }

    /// Analyzes every function of the program, returning each CFG keyed by
    /// function name
    pub fn analyze(
        mut self,
        program: &Program,
        non_void: &HashSet<String>,
    ) -> std::collections::HashMap<String, ControlFlowGraph> {
        let mut cfgs = std::collections::HashMap::new();
        for decl in &program.decls {
            if let Decl::Function(f) = decl {
                if f.is_stub {
                    continue;
                }
                let cfg = self.analyze_function(f, non_void.contains(&f.name));
                cfgs.insert(f.name.clone(), cfg);
            }
        }
        cfgs
    }

    fn analyze_function(&mut self, f: &FunctionDecl, needs_return: bool) -> ControlFlowGraph {
        let mut cfg = ControlFlowGraph::new();
        let mut loops: Vec<LoopTargets> = Vec::new();

        let entry = cfg.entry;
        let after = self.build_block(&mut cfg, &f.body, entry, &mut loops);

        if let Some(open) = after {
            // Control can fall off the end of the function
            cfg.add_edge(open, cfg.exit);
            if needs_return {
                self.diags.error(
                    DiagnosticCode::ReturnTypeMismatch,
                    format!(
                        "Function '{}': not all code paths return a value",
                        f.name
                    ),
                    f.loc.clone(),
                );
            }
        }

        self.warn_unreachable(&cfg);
        cfg
    }

    /// Builds `stmts` starting in `current`; returns the open block control
    /// flows out of, or `None` when every path terminated
    fn build_block(
        &mut self,
        cfg: &mut ControlFlowGraph,
        stmts: &[Stmt],
        mut current: CfgBlockId,
        loops: &mut Vec<LoopTargets>,
    ) -> Option<CfgBlockId> {
        let mut terminated = false;

        for stmt in stmts {
            if terminated {
                // Statements after a terminator go into a fresh block with
                // no predecessors; the reachability pass reports them.
                current = cfg.new_block("dead");
                terminated = false;
            }
            if cfg.blocks[current.0].first_loc.is_none() {
                cfg.blocks[current.0].first_loc = Some(stmt.loc.clone());
            }
            cfg.blocks[current.0].stmts.push(stmt.id);

            match &stmt.kind {
                StmtKind::If {
                    then_body,
                    else_body,
                    ..
                } => {
                    let then_block = cfg.new_block("then");
                    cfg.add_edge(current, then_block);
                    let then_end = self.build_block(cfg, then_body, then_block, loops);

                    let merge = cfg.new_block("endif");
                    match else_body {
                        Some(else_body) => {
                            let else_block = cfg.new_block("else");
                            cfg.add_edge(current, else_block);
                            let else_end = self.build_block(cfg, else_body, else_block, loops);
                            if let Some(e) = else_end {
                                cfg.add_edge(e, merge);
                            }
                        }
                        None => cfg.add_edge(current, merge),
                    }
                    if let Some(t) = then_end {
                        cfg.add_edge(t, merge);
                    }
                    current = merge;
                }
                StmtKind::While { body, .. } => {
                    let header = cfg.new_block("while_head");
                    let body_block = cfg.new_block("while_body");
                    let exit = cfg.new_block("while_end");
                    cfg.add_edge(current, header);
                    cfg.add_edge(header, body_block);
                    cfg.add_edge(header, exit);

                    loops.push(LoopTargets {
                        break_to: exit,
                        continue_to: header,
                    });
                    let body_end = self.build_block(cfg, body, body_block, loops);
                    loops.pop();

                    if let Some(b) = body_end {
                        cfg.add_edge(b, header);
                    }
                    current = exit;
                }
                StmtKind::For { body, .. } => {
                    let header = cfg.new_block("for_head");
                    let body_block = cfg.new_block("for_body");
                    let increment = cfg.new_block("for_inc");
                    let exit = cfg.new_block("for_end");
                    cfg.add_edge(current, header);
                    cfg.add_edge(header, body_block);
                    cfg.add_edge(header, exit);
                    cfg.add_edge(increment, header);

                    loops.push(LoopTargets {
                        break_to: exit,
                        continue_to: increment,
                    });
                    let body_end = self.build_block(cfg, body, body_block, loops);
                    loops.pop();

                    if let Some(b) = body_end {
                        cfg.add_edge(b, increment);
                    }
                    current = exit;
                }
                StmtKind::Match { cases, default, .. } => {
                    let merge = cfg.new_block("endmatch");
                    for case in cases {
                        let case_block = cfg.new_block("case");
                        cfg.add_edge(current, case_block);
                        if let Some(end) = self.build_block(cfg, &case.body, case_block, loops) {
                            cfg.add_edge(end, merge);
                        }
                    }
                    match default {
                        Some(default) => {
                            let default_block = cfg.new_block("default");
                            cfg.add_edge(current, default_block);
                            if let Some(end) =
                                self.build_block(cfg, default, default_block, loops)
                            {
                                cfg.add_edge(end, merge);
                            }
                        }
                        None => cfg.add_edge(current, merge),
                    }
                    current = merge;
                }
                StmtKind::Return(_) => {
                    cfg.add_edge(current, cfg.exit);
                    terminated = true;
                }
                StmtKind::Break => {
                    if let Some(targets) = loops.last() {
                        cfg.add_edge(current, targets.break_to);
                    }
                    terminated = true;
                }
                StmtKind::Continue => {
                    if let Some(targets) = loops.last() {
                        cfg.add_edge(current, targets.continue_to);
                    }
                    terminated = true;
                }
                StmtKind::Let(_) | StmtKind::Expression(_) | StmtKind::Asm(_) => {}
            }
        }

        if terminated {
            None
        } else {
            Some(current)
        }
    }

    fn warn_unreachable(&mut self, cfg: &ControlFlowGraph) {
        let reachable = cfg.reachable();
        for block in &cfg.blocks {
            if reachable.contains(&block.id) || block.stmts.is_empty() {
                continue;
            }
            if let Some(loc) = &block.first_loc {
                self.diags.warn(
                    DiagnosticCode::UnreachableCode,
                    "Unreachable code",
                    loc.clone(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Scanner;
    use crate::parser::Parser;

    fn analyze(source: &str, non_void: &[&str]) -> (DiagnosticBag, Vec<ControlFlowGraph>) {
        let mut diags = DiagnosticBag::new();
        let tokens = Scanner::new(source, "t.bl65").scan_tokens(&mut diags);
        let (program, pd) = Parser::new(tokens, "t.bl65").parse();
        diags.absorb(pd);
        let set: HashSet<String> = non_void.iter().map(|s| s.to_string()).collect();
        let cfgs = ControlFlowAnalyzer::new(&mut diags).analyze(&program, &set);
        (diags, cfgs.into_values().collect())
    }

    #[test]
    fn test_edges_are_bidirectional() {
        let source =
            "function f(x: byte): byte\n  if x > 1 then\n    return 1\n  end if\n  return 0\nend function\n";
        let (diags, cfgs) = analyze(source, &["f"]);
        assert!(!diags.has_errors(), "{:?}", diags.diagnostics());
        let cfg = &cfgs[0];
        for block in &cfg.blocks {
            for &succ in &block.successors {
                assert!(cfg.block(succ).predecessors.contains(&block.id));
            }
            for &pred in &block.predecessors {
                assert!(cfg.block(pred).successors.contains(&block.id));
            }
        }
        // Entry has no predecessors, exit no successors
        assert!(cfg.block(cfg.entry).predecessors.is_empty());
        assert!(cfg.block(cfg.exit).successors.is_empty());
    }

    #[test]
    fn test_missing_return_flagged() {
        let source =
            "function f(x: byte): byte\n  if x > 1 then\n    return 1\n  end if\nend function\n";
        let (diags, _) = analyze(source, &["f"]);
        assert!(diags.find(DiagnosticCode::ReturnTypeMismatch).is_some());
    }

    #[test]
    fn test_all_paths_return_ok() {
        let source = "function f(x: byte): byte\n  if x > 1 then\n    return 1\n  else\n    return 0\n  end if\nend function\n";
        let (diags, _) = analyze(source, &["f"]);
        assert!(!diags.has_errors(), "{:?}", diags.diagnostics());
    }

    #[test]
    fn test_unreachable_after_return() {
        let source =
            "function f(): byte\n  return 1\n  poke($d020, 0)\nend function\n";
        let (diags, _) = analyze(source, &["f"]);
        assert!(diags.find(DiagnosticCode::UnreachableCode).is_some());
    }

    #[test]
    fn test_loop_back_edge() {
        let source = "function f()\n  while true\n    poke($d020, 0)\n  end while\nend function\n";
        let (diags, cfgs) = analyze(source, &[]);
        assert!(!diags.has_errors());
        let cfg = &cfgs[0];
        // Some block must loop back to a header (a cycle exists)
        let has_back_edge = cfg
            .blocks
            .iter()
            .any(|b| b.successors.iter().any(|s| s.0 < b.id.0));
        assert!(has_back_edge);
    }
}
