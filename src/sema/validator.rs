//! Statement validation (pass 4d)
//!
//! Context rules the type checker does not own: break/continue placement,
//! `const` immutability, and storage-class restrictions (`@data` needs a
//! compile-time constant initializer, `@map` stays at module scope).

use super::builder::ScopeMap;
use super::symbols::{StorageClass, SymbolId, SymbolTable};
use crate::diagnostics::{DiagnosticBag, DiagnosticCode};
use crate::parser::ast::*;

/// Validates one module
pub struct StatementValidator<'a> {
    table: &'a SymbolTable,
    map: &'a ScopeMap,
    metadata: &'a NodeMetadata,
    diags: &'a mut DiagnosticBag,
    loop_depth: u32,
}

impl<'a> StatementValidator<'a> {
    /// Creates the validator
    pub fn new(
        table: &'a SymbolTable,
        map: &'a ScopeMap,
        metadata: &'a NodeMetadata,
        diags: &'a mut DiagnosticBag,
    ) -> Self {
        StatementValidator {
            table,
            map,
            metadata,
            diags,
            loop_depth: 0,
        }
    }

    /// Runs the pass
    pub fn validate(mut self, program: &Program) {
        for decl in &program.decls {
            match decl {
                Decl::Variable(v) => self.validate_module_var(v),
                Decl::Function(f) => self.validate_block(&f.body),
                _ => {}
            }
        }
    }

    fn validate_module_var(&mut self, v: &VarDecl) {
        let storage = self
            .map
            .decl_symbols
            .get(&v.id)
            .map(|&id| self.table.symbol(id).storage);

        if storage == Some(StorageClass::Data) {
            match &v.init {
                None => {
                    self.diags.error(
                        DiagnosticCode::TypeMismatch,
                        format!("'@data' variable '{}' needs an initializer", v.name),
                        v.loc.clone(),
                    );
                }
                Some(init) => {
                    if !self.is_compile_time_constant(init) {
                        self.diags.error(
                            DiagnosticCode::TypeMismatch,
                            format!(
                                "'@data' initializer for '{}' must be a compile-time constant",
                                v.name
                            ),
                            init.loc.clone(),
                        );
                    }
                }
            }
        }
    }

    fn is_compile_time_constant(&self, expr: &Expr) -> bool {
        match &expr.kind {
            ExprKind::Str(_) => true,
            ExprKind::ArrayLiteral(elements) => elements
                .iter()
                .all(|e| self.metadata.constant_of(e.id).is_some()),
            _ => self.metadata.constant_of(expr.id).is_some(),
        }
    }

    fn validate_block(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.validate_stmt(stmt);
        }
    }

    fn validate_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Let(v) => {
                if let Some(init) = &v.init {
                    self.validate_expr(init);
                }
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                self.validate_expr(cond);
                self.validate_block(then_body);
                if let Some(else_body) = else_body {
                    self.validate_block(else_body);
                }
            }
            StmtKind::While { cond, body } => {
                self.validate_expr(cond);
                self.loop_depth += 1;
                self.validate_block(body);
                self.loop_depth -= 1;
            }
            StmtKind::For {
                from,
                to,
                step,
                body,
                ..
            } => {
                self.validate_expr(from);
                self.validate_expr(to);
                if let Some(step) = step {
                    self.validate_expr(step);
                }
                self.loop_depth += 1;
                self.validate_block(body);
                self.loop_depth -= 1;
            }
            StmtKind::Match {
                scrutinee,
                cases,
                default,
            } => {
                self.validate_expr(scrutinee);
                for case in cases {
                    self.validate_block(&case.body);
                }
                if let Some(default) = default {
                    self.validate_block(default);
                }
            }
            StmtKind::Break => {
                if self.loop_depth == 0 {
                    self.diags.error(
                        DiagnosticCode::UnexpectedToken,
                        "'break' is only allowed inside a loop",
                        stmt.loc.clone(),
                    );
                }
            }
            StmtKind::Continue => {
                if self.loop_depth == 0 {
                    self.diags.error(
                        DiagnosticCode::UnexpectedToken,
                        "'continue' is only allowed inside a loop",
                        stmt.loc.clone(),
                    );
                }
            }
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.validate_expr(value);
                }
            }
            StmtKind::Expression(expr) => self.validate_expr(expr),
            StmtKind::Asm(_) => {}
        }
    }

    fn validate_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Assign { target, value, .. } => {
                self.validate_assignment_target(target);
                self.validate_expr(value);
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                self.validate_expr(lhs);
                self.validate_expr(rhs);
            }
            ExprKind::Unary { operand, .. } => self.validate_expr(operand),
            ExprKind::Call { callee, args } => {
                self.validate_expr(callee);
                for arg in args {
                    self.validate_expr(arg);
                }
            }
            ExprKind::Index { base, index } => {
                self.validate_expr(base);
                self.validate_expr(index);
            }
            ExprKind::Member { base, .. } => self.validate_expr(base),
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                self.validate_expr(cond);
                self.validate_expr(then_expr);
                self.validate_expr(else_expr);
            }
            ExprKind::ArrayLiteral(elements) => {
                for element in elements {
                    self.validate_expr(element);
                }
            }
            _ => {}
        }
    }

    fn validate_assignment_target(&mut self, target: &Expr) {
        // The root identifier decides constness; element and member writes
        // go through the same symbol.
        let root = Self::root_identifier(target);
        if let Some(root) = root {
            if let Some(raw) = self.metadata.symbol_of(root.id) {
                let symbol = self.table.symbol(SymbolId(raw));
                if symbol.is_const {
                    self.diags.error(
                        DiagnosticCode::AssignToConst,
                        format!("Cannot assign to constant '{}'", symbol.name),
                        target.loc.clone(),
                    );
                }
            }
        }
        if let ExprKind::Index { index, .. } = &target.kind {
            self.validate_expr(index);
        }
    }

    fn root_identifier(expr: &Expr) -> Option<&Expr> {
        match &expr.kind {
            ExprKind::Identifier(_) => Some(expr),
            ExprKind::Index { base, .. } => Self::root_identifier(base),
            ExprKind::Member { base, .. } => Self::root_identifier(base),
            _ => None,
        }
    }
}
