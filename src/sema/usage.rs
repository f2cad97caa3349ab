//! Variable-usage analysis (pass 7, advisory)
//!
//! Counts reads and writes per symbol, tracks the deepest loop each symbol
//! is touched in, and reports unused variables, functions, and imports.
//! Results attach as a report; nothing here blocks compilation.

use super::builder::ScopeMap;
use super::symbols::{SymbolId, SymbolKind, SymbolTable};
use crate::diagnostics::{DiagnosticBag, DiagnosticCode};
use crate::parser::ast::*;
use std::collections::HashMap;

/// Usage counters for one symbol
#[derive(Debug, Clone, Copy, Default)]
pub struct VariableUsage {
    /// Number of reads
    pub reads: u32,
    /// Number of writes
    pub writes: u32,
    /// Deepest loop nesting the symbol is touched in
    pub max_loop_depth: u32,
}

impl VariableUsage {
    /// Touched at all
    pub fn is_used(&self) -> bool {
        self.reads > 0 || self.writes > 0
    }

    /// Read but never written (beyond its initializer)
    pub fn is_read_only(&self) -> bool {
        self.reads > 0 && self.writes == 0
    }

    /// Written but never read
    pub fn is_write_only(&self) -> bool {
        self.writes > 0 && self.reads == 0
    }

    /// Touched inside a loop (a cheap hot-path signal)
    pub fn is_hot(&self) -> bool {
        self.max_loop_depth > 0 && self.is_used()
    }
}

/// Usage report for one module
#[derive(Debug, Default)]
pub struct UsageReport {
    /// Per-symbol counters
    pub usage: HashMap<SymbolId, VariableUsage>,
}

/// Runs the usage pass over one module
pub struct UsageAnalyzer<'a> {
    table: &'a SymbolTable,
    map: &'a ScopeMap,
    metadata: &'a NodeMetadata,
    report: UsageReport,
    loop_depth: u32,
}

impl<'a> UsageAnalyzer<'a> {
    /// Creates the analyzer
    pub fn new(table: &'a SymbolTable, map: &'a ScopeMap, metadata: &'a NodeMetadata) -> Self {
        UsageAnalyzer {
            table,
            map,
            metadata,
            report: UsageReport::default(),
            loop_depth: 0,
        }
    }

    /// Analyzes the module and reports unused entities. `main`, exported
    /// symbols, and intrinsic stubs are never flagged.
    pub fn analyze(mut self, program: &Program, diags: &mut DiagnosticBag) -> UsageReport {
        let mut stubs: std::collections::HashSet<SymbolId> = std::collections::HashSet::new();
        for decl in &program.decls {
            if let Decl::Function(f) = decl {
                if f.is_stub {
                    if let Some(&id) = self.map.decl_symbols.get(&f.id) {
                        stubs.insert(id);
                    }
                    for param in &f.params {
                        if let Some(&id) = self.map.decl_symbols.get(&param.id) {
                            stubs.insert(id);
                        }
                    }
                    continue;
                }
                self.walk_block(&f.body);
            }
            if let Decl::Variable(v) = decl {
                if let Some(init) = &v.init {
                    self.walk_expr(init, false);
                }
            }
        }

        for (id, symbol) in self.table.symbols() {
            if stubs.contains(&id) {
                continue;
            }
            let usage = self.report.usage.get(&id).copied().unwrap_or_default();
            if symbol.is_exported || symbol.name == "main" {
                continue;
            }
            match symbol.kind {
                SymbolKind::Variable | SymbolKind::Parameter => {
                    if !usage.is_used() {
                        diags.warn(
                            DiagnosticCode::UnusedVariable,
                            format!("'{}' is never used", symbol.name),
                            symbol.loc.clone(),
                        );
                    } else if usage.is_write_only() && symbol.kind == SymbolKind::Variable {
                        diags.warn(
                            DiagnosticCode::DeadStore,
                            format!("'{}' is written but never read", symbol.name),
                            symbol.loc.clone(),
                        );
                    }
                }
                SymbolKind::Function => {
                    if !usage.is_used() {
                        diags.warn(
                            DiagnosticCode::UnusedFunction,
                            format!("Function '{}' is never called", symbol.name),
                            symbol.loc.clone(),
                        );
                    }
                }
                SymbolKind::ImportedSymbol => {
                    if !usage.is_used() {
                        let mut diagnostic = crate::diagnostics::Diagnostic::new(
                            DiagnosticCode::UnusedImport,
                            format!("Import '{}' is never used", symbol.name),
                            symbol.loc.clone(),
                        );
                        diagnostic = diagnostic.with_fix(crate::diagnostics::SuggestedFix {
                            description: format!("remove the unused import '{}'", symbol.name),
                            location: symbol.loc.clone(),
                            replacement: String::new(),
                        });
                        diags.report(diagnostic);
                    }
                }
                _ => {}
            }
        }

        self.report
    }

    fn record(&mut self, id: SymbolId, write: bool) {
        let entry = self.report.usage.entry(id).or_default();
        if write {
            entry.writes += 1;
        } else {
            entry.reads += 1;
        }
        entry.max_loop_depth = entry.max_loop_depth.max(self.loop_depth);
    }

    fn walk_block(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.walk_stmt(stmt);
        }
    }

    fn walk_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Let(v) => {
                if let Some(init) = &v.init {
                    self.walk_expr(init, false);
                }
                // The declaration itself counts as the first write
                if let Some(&id) = self.map.decl_symbols.get(&v.id) {
                    if v.init.is_some() {
                        self.record(id, true);
                    }
                }
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                self.walk_expr(cond, false);
                self.walk_block(then_body);
                if let Some(else_body) = else_body {
                    self.walk_block(else_body);
                }
            }
            StmtKind::While { cond, body } => {
                self.loop_depth += 1;
                self.walk_expr(cond, false);
                self.walk_block(body);
                self.loop_depth -= 1;
            }
            StmtKind::For {
                var_id,
                from,
                to,
                step,
                body,
                ..
            } => {
                self.walk_expr(from, false);
                self.walk_expr(to, false);
                if let Some(step) = step {
                    self.walk_expr(step, false);
                }
                self.loop_depth += 1;
                if let Some(&id) = self.map.decl_symbols.get(var_id) {
                    self.record(id, true);
                }
                self.walk_block(body);
                self.loop_depth -= 1;
            }
            StmtKind::Match {
                scrutinee,
                cases,
                default,
            } => {
                self.walk_expr(scrutinee, false);
                for case in cases {
                    self.walk_expr(&case.value, false);
                    self.walk_block(&case.body);
                }
                if let Some(default) = default {
                    self.walk_block(default);
                }
            }
            StmtKind::Return(Some(value)) => self.walk_expr(value, false),
            StmtKind::Expression(expr) => self.walk_expr(expr, false),
            _ => {}
        }
    }

    fn walk_expr(&mut self, expr: &Expr, is_write: bool) {
        match &expr.kind {
            ExprKind::Identifier(_) => {
                if let Some(raw) = self.metadata.symbol_of(expr.id) {
                    self.record(SymbolId(raw), is_write);
                }
            }
            ExprKind::Assign { op, target, value } => {
                // Compound assignment reads the target too
                if op.is_some() {
                    self.walk_expr(target, false);
                }
                self.walk_expr(target, true);
                self.walk_expr(value, false);
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                self.walk_expr(lhs, false);
                self.walk_expr(rhs, false);
            }
            ExprKind::Unary { operand, .. } => self.walk_expr(operand, false),
            ExprKind::Call { callee, args } => {
                self.walk_expr(callee, false);
                for arg in args {
                    self.walk_expr(arg, false);
                }
            }
            ExprKind::Index { base, index } => {
                self.walk_expr(base, is_write);
                self.walk_expr(index, false);
            }
            ExprKind::Member { base, .. } => self.walk_expr(base, is_write),
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                self.walk_expr(cond, false);
                self.walk_expr(then_expr, false);
                self.walk_expr(else_expr, false);
            }
            ExprKind::ArrayLiteral(elements) => {
                for element in elements {
                    self.walk_expr(element, false);
                }
            }
            _ => {}
        }
    }
}
