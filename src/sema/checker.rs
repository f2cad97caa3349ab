//! Type checking (pass 4c)
//!
//! A single checker walks each function, annotating every expression with
//! its resolved type, recording the symbol each name resolves to, and
//! inserting coercion markers wherever an implicit conversion is needed.
//! Calls are checked against function signatures, callback types, or the
//! intrinsic registry; compile-time intrinsics fold to constants here.

use super::builder::ScopeMap;
use super::intrinsics::{IntrinsicDef, IntrinsicRegistry, IntrinsicType};
use super::modules::GlobalSymbolTable;
use super::symbols::{ScopeId, SymbolId, SymbolKind, SymbolTable};
use super::types::{TypeId, TypeKind, TypeTable};
use crate::diagnostics::{DiagnosticBag, DiagnosticCode};
use crate::parser::ast::*;

/// Type checker for one module. Shared analysis state is carried as
/// explicit fields rather than globals; per-node behavior dispatches on
/// the AST kind tags.
pub struct TypeChecker<'a> {
    module: &'a str,
    table: &'a mut SymbolTable,
    map: &'a ScopeMap,
    types: &'a mut TypeTable,
    metadata: &'a mut NodeMetadata,
    globals: &'a GlobalSymbolTable,
    intrinsics: &'a IntrinsicRegistry,
    diags: &'a mut DiagnosticBag,
    /// Return type of the function being checked
    current_ret: TypeId,
}

impl<'a> TypeChecker<'a> {
    /// Creates a checker over one module's analysis state
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        module: &'a str,
        table: &'a mut SymbolTable,
        map: &'a ScopeMap,
        types: &'a mut TypeTable,
        metadata: &'a mut NodeMetadata,
        globals: &'a GlobalSymbolTable,
        intrinsics: &'a IntrinsicRegistry,
        diags: &'a mut DiagnosticBag,
    ) -> Self {
        let void = types.void_id;
        TypeChecker {
            module,
            table,
            map,
            types,
            metadata,
            globals,
            intrinsics,
            diags,
            current_ret: void,
        }
    }

    /// Checks the whole module
    pub fn check(mut self, program: &Program) {
        self.bind_imports(program);

        for decl in &program.decls {
            match decl {
                Decl::Variable(v) => {
                    self.check_var_init(v, self.table.module_scope);
                }
                Decl::Function(f) if !f.is_stub => self.check_function(f),
                _ => {}
            }
        }
    }

    /// Resolves each imported symbol against the exporting module's
    /// registered exports and copies its type over
    fn bind_imports(&mut self, program: &Program) {
        for import in &program.imports {
            for name in &import.names {
                let Some(id) = self.table.lookup_local(self.table.module_scope, name) else {
                    continue;
                };
                if self.table.symbol(id).kind != SymbolKind::ImportedSymbol {
                    continue;
                }
                match self.globals.lookup_qualified(&import.module, name) {
                    Some(exported) => {
                        let symbol = self.table.symbol_mut(id);
                        symbol.ty = exported.ty;
                        symbol.is_const = exported.is_const;
                        symbol.const_value = exported.const_value;
                    }
                    None => {
                        self.diags.error(
                            DiagnosticCode::UndefinedVariable,
                            format!(
                                "Module '{}' does not export '{}'",
                                import.module, name
                            ),
                            import.loc.clone(),
                        );
                    }
                }
            }
        }
    }

    fn check_function(&mut self, f: &FunctionDecl) {
        let Some(&scope) = self.map.scopes.get(&(f.id, 0)) else {
            return;
        };
        self.current_ret = self
            .map
            .decl_symbols
            .get(&f.id)
            .and_then(|&id| self.table.symbol(id).ty)
            .map(|ty| match &self.types.info(ty).kind {
                TypeKind::Function { ret, .. } => *ret,
                _ => self.types.void_id,
            })
            .unwrap_or(self.types.void_id);

        self.check_block(&f.body, scope);
    }

    fn check_block(&mut self, stmts: &[Stmt], scope: ScopeId) {
        for stmt in stmts {
            self.check_stmt(stmt, scope);
        }
    }

    fn check_stmt(&mut self, stmt: &Stmt, scope: ScopeId) {
        match &stmt.kind {
            StmtKind::Let(v) => self.check_var_init(v, scope),
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                self.check_condition(cond, scope);
                if let Some(&s) = self.map.scopes.get(&(stmt.id, 0)) {
                    self.check_block(then_body, s);
                }
                if let (Some(else_body), Some(&s)) =
                    (else_body.as_ref(), self.map.scopes.get(&(stmt.id, 1)))
                {
                    self.check_block(else_body, s);
                }
            }
            StmtKind::While { cond, body } => {
                self.check_condition(cond, scope);
                if let Some(&s) = self.map.scopes.get(&(stmt.id, 0)) {
                    self.check_block(body, s);
                }
            }
            StmtKind::For {
                var_id,
                from,
                to,
                step,
                body,
                ..
            } => {
                let Some(&loop_scope) = self.map.scopes.get(&(stmt.id, 0)) else {
                    return;
                };
                let induction = self
                    .map
                    .decl_symbols
                    .get(var_id)
                    .and_then(|&id| self.table.symbol(id).ty)
                    .unwrap_or(self.types.unknown_id);

                for bound in [Some(from), Some(to), step.as_ref()].into_iter().flatten() {
                    let ty = self.check_expr(bound, loop_scope);
                    self.require_assignable(induction, ty, bound);
                }
                self.check_block(body, loop_scope);
            }
            StmtKind::Match {
                scrutinee,
                cases,
                default,
            } => {
                let scrutinee_ty = self.check_expr(scrutinee, scope);
                if !self.types.is_numeric(scrutinee_ty)
                    && scrutinee_ty != self.types.unknown_id
                {
                    self.diags.error(
                        DiagnosticCode::TypeMismatch,
                        format!(
                            "Cannot match on a value of type {}",
                            self.types.name_of(scrutinee_ty)
                        ),
                        scrutinee.loc.clone(),
                    );
                }
                for (index, case) in cases.iter().enumerate() {
                    let case_ty = self.check_expr(&case.value, scope);
                    self.require_assignable(scrutinee_ty, case_ty, &case.value);
                    if self.metadata.constant_of(case.value.id).is_none() {
                        self.diags.error(
                            DiagnosticCode::TypeMismatch,
                            "Case values must be compile-time constants",
                            case.value.loc.clone(),
                        );
                    }
                    if let Some(&s) = self.map.scopes.get(&(stmt.id, index as u8)) {
                        self.check_block(&case.body, s);
                    }
                }
                if let (Some(default), Some(&s)) =
                    (default.as_ref(), self.map.scopes.get(&(stmt.id, u8::MAX)))
                {
                    self.check_block(default, s);
                }
            }
            StmtKind::Return(value) => {
                let void = self.types.void_id;
                match value {
                    Some(expr) => {
                        let ty = self.check_expr(expr, scope);
                        if self.current_ret == void {
                            self.diags.error(
                                DiagnosticCode::ReturnTypeMismatch,
                                "Void function cannot return a value",
                                expr.loc.clone(),
                            );
                        } else if !self.types.assignable(self.current_ret, ty) {
                            self.diags.error(
                                DiagnosticCode::ReturnTypeMismatch,
                                format!(
                                    "Cannot return {} from a function returning {}",
                                    self.types.name_of(ty),
                                    self.types.name_of(self.current_ret)
                                ),
                                expr.loc.clone(),
                            );
                        } else {
                            self.mark_coercion(expr, self.current_ret, ty);
                        }
                    }
                    None => {
                        if self.current_ret != void {
                            self.diags.error(
                                DiagnosticCode::ReturnTypeMismatch,
                                format!(
                                    "Function must return a value of type {}",
                                    self.types.name_of(self.current_ret)
                                ),
                                stmt.loc.clone(),
                            );
                        }
                    }
                }
            }
            StmtKind::Expression(expr) => {
                let _ = self.check_expr(expr, scope);
            }
            StmtKind::Break | StmtKind::Continue | StmtKind::Asm(_) => {}
        }
    }

    fn check_var_init(&mut self, v: &VarDecl, scope: ScopeId) {
        let declared = self
            .map
            .decl_symbols
            .get(&v.id)
            .and_then(|&id| self.table.symbol(id).ty)
            .unwrap_or(self.types.unknown_id);

        if let Some(init) = &v.init {
            let init_ty = self.check_expr(init, scope);
            if !self.types.assignable(declared, init_ty) {
                self.diags.error(
                    DiagnosticCode::TypeMismatch,
                    format!(
                        "Cannot initialize {} '{}' with a value of type {}",
                        self.types.name_of(declared),
                        v.name,
                        self.types.name_of(init_ty)
                    ),
                    init.loc.clone(),
                );
            } else {
                self.mark_coercion(init, declared, init_ty);
            }

            // String variables remember their literal length so length()
            // stays a compile-time query.
            if let (ExprKind::Str(text), Some(&id)) =
                (&init.kind, self.map.decl_symbols.get(&v.id))
            {
                self.table.symbol_mut(id).const_value = Some(text.len() as u32);
            }
            // Richer constant initializers fold into the symbol too.
            if v.is_const {
                if let (Some(value), Some(&id)) = (
                    self.metadata.constant_of(init.id),
                    self.map.decl_symbols.get(&v.id),
                ) {
                    self.table.symbol_mut(id).const_value = Some(value);
                }
            }
        }
    }

    /// Conditions accept boolean directly and byte through coercion
    fn check_condition(&mut self, cond: &Expr, scope: ScopeId) {
        let ty = self.check_expr(cond, scope);
        let boolean = self.types.bool_id;
        if ty == boolean || ty == self.types.unknown_id {
            return;
        }
        if self.types.assignable(boolean, ty) {
            self.mark_coercion(cond, boolean, ty);
            self.diags.warn(
                DiagnosticCode::ImplicitConversion,
                format!(
                    "{} used as a boolean condition",
                    self.types.name_of(ty)
                ),
                cond.loc.clone(),
            );
        } else {
            self.diags.error(
                DiagnosticCode::TypeMismatch,
                format!(
                    "Condition must be boolean, got {}",
                    self.types.name_of(ty)
                ),
                cond.loc.clone(),
            );
        }
    }

    // =========================================================================
    // EXPRESSIONS
    // =========================================================================

    /// Checks an expression, records its type, and returns it
    pub fn check_expr(&mut self, expr: &Expr, scope: ScopeId) -> TypeId {
        let ty = match &expr.kind {
            ExprKind::Number(n) => {
                self.metadata
                    .set(expr.id, MetadataKey::ConstantValue, MetadataValue::Number(*n));
                if *n <= 255 {
                    self.types.byte_id
                } else {
                    self.types.word_id
                }
            }
            ExprKind::Bool(b) => {
                self.metadata.set(
                    expr.id,
                    MetadataKey::ConstantValue,
                    MetadataValue::Number(*b as u32),
                );
                self.types.bool_id
            }
            ExprKind::Str(_) => self.types.string_id,
            ExprKind::ArrayLiteral(elements) => self.check_array_literal(expr, elements, scope),
            ExprKind::Identifier(name) => self.check_identifier(expr, name, scope),
            ExprKind::Binary { op, lhs, rhs } => self.check_binary(expr, *op, lhs, rhs, scope),
            ExprKind::Unary { op, operand } => self.check_unary(expr, *op, operand, scope),
            ExprKind::Assign { op, target, value } => {
                self.check_assign(expr, *op, target, value, scope)
            }
            ExprKind::Call { callee, args } => self.check_call(expr, callee, args, scope),
            ExprKind::Index { base, index } => self.check_index(base, index, scope),
            ExprKind::Member { base, member } => self.check_member(expr, base, member, scope),
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                self.check_condition(cond, scope);
                let then_ty = self.check_expr(then_expr, scope);
                let else_ty = self.check_expr(else_expr, scope);
                let result = self.types.wider_of(then_ty, else_ty);
                if !self.types.assignable(result, then_ty)
                    || !self.types.assignable(result, else_ty)
                {
                    self.diags.error(
                        DiagnosticCode::TypeMismatch,
                        format!(
                            "Ternary branches have incompatible types {} and {}",
                            self.types.name_of(then_ty),
                            self.types.name_of(else_ty)
                        ),
                        expr.loc.clone(),
                    );
                }
                self.mark_coercion(then_expr, result, then_ty);
                self.mark_coercion(else_expr, result, else_ty);
                result
            }
        };
        self.metadata.set_type(expr.id, ty.0);
        ty
    }

    fn check_array_literal(&mut self, expr: &Expr, elements: &[Expr], scope: ScopeId) -> TypeId {
        let mut elem = self.types.byte_id;
        for element in elements {
            let ty = self.check_expr(element, scope);
            if !self.types.is_numeric(ty) && ty != self.types.unknown_id {
                self.diags.error(
                    DiagnosticCode::TypeMismatch,
                    format!(
                        "Array elements must be numeric, got {}",
                        self.types.name_of(ty)
                    ),
                    element.loc.clone(),
                );
            }
            elem = self.types.wider_of(elem, ty);
        }
        let _ = expr;
        self.types.array_of(elem, Some(elements.len() as u32))
    }

    fn check_identifier(&mut self, expr: &Expr, name: &str, scope: ScopeId) -> TypeId {
        let Some(id) = self.table.lookup(scope, name) else {
            self.diags.error(
                DiagnosticCode::UndefinedVariable,
                format!("Undefined variable '{}'", name),
                expr.loc.clone(),
            );
            return self.types.unknown_id;
        };

        self.metadata.set_symbol(expr.id, id.0);
        let symbol = self.table.symbol(id);
        if let Some(value) = symbol.const_value {
            if symbol.is_const || symbol.kind == SymbolKind::EnumMember {
                self.metadata.set(
                    expr.id,
                    MetadataKey::ConstantValue,
                    MetadataValue::Number(value),
                );
            }
        }
        symbol.ty.unwrap_or(self.types.unknown_id)
    }

    fn check_binary(
        &mut self,
        expr: &Expr,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        scope: ScopeId,
    ) -> TypeId {
        if op.is_logical() {
            self.check_condition(lhs, scope);
            self.check_condition(rhs, scope);
            self.fold_binary(expr, op, lhs, rhs, self.types.bool_id);
            return self.types.bool_id;
        }

        let lhs_ty = self.check_expr(lhs, scope);
        let rhs_ty = self.check_expr(rhs, scope);

        for (operand, ty) in [(lhs, lhs_ty), (rhs, rhs_ty)] {
            if !self.types.is_numeric(ty) && ty != self.types.unknown_id {
                self.diags.error(
                    DiagnosticCode::TypeMismatch,
                    format!(
                        "Operator '{}' needs numeric operands, got {}",
                        op,
                        self.types.name_of(ty)
                    ),
                    operand.loc.clone(),
                );
                return self.types.unknown_id;
            }
        }

        if op.is_comparison() {
            let common = self.types.wider_of(lhs_ty, rhs_ty);
            self.mark_coercion(lhs, common, lhs_ty);
            self.mark_coercion(rhs, common, rhs_ty);
            self.fold_binary(expr, op, lhs, rhs, self.types.bool_id);
            return self.types.bool_id;
        }

        // Shifts keep the left operand's width; everything else widens to
        // the larger operand.
        let result = match op {
            BinaryOp::Shl | BinaryOp::Shr => {
                let boolean = self.types.bool_id;
                if lhs_ty == boolean {
                    self.types.byte_id
                } else {
                    lhs_ty
                }
            }
            _ => self.types.arithmetic_result(lhs_ty, rhs_ty),
        };
        self.mark_coercion(lhs, result, lhs_ty);
        if !matches!(op, BinaryOp::Shl | BinaryOp::Shr) {
            self.mark_coercion(rhs, result, rhs_ty);
        }
        self.fold_binary(expr, op, lhs, rhs, result);
        result
    }

    /// Records a constant for the whole expression when both operands
    /// folded; division by a constant zero is left for the optimizer to
    /// diagnose
    fn fold_binary(&mut self, expr: &Expr, op: BinaryOp, lhs: &Expr, rhs: &Expr, result: TypeId) {
        let (Some(l), Some(r)) = (
            self.metadata.constant_of(lhs.id),
            self.metadata.constant_of(rhs.id),
        ) else {
            return;
        };
        let value = match op {
            BinaryOp::Add => l.wrapping_add(r),
            BinaryOp::Sub => l.wrapping_sub(r),
            BinaryOp::Mul => l.wrapping_mul(r),
            BinaryOp::Div if r != 0 => l / r,
            BinaryOp::Mod if r != 0 => l % r,
            BinaryOp::BitAnd => l & r,
            BinaryOp::BitOr => l | r,
            BinaryOp::BitXor => l ^ r,
            BinaryOp::Shl => l.wrapping_shl(r),
            BinaryOp::Shr => l.wrapping_shr(r),
            BinaryOp::Eq => (l == r) as u32,
            BinaryOp::Ne => (l != r) as u32,
            BinaryOp::Lt => (l < r) as u32,
            BinaryOp::Le => (l <= r) as u32,
            BinaryOp::Gt => (l > r) as u32,
            BinaryOp::Ge => (l >= r) as u32,
            BinaryOp::LogicalAnd => ((l != 0) && (r != 0)) as u32,
            BinaryOp::LogicalOr => ((l != 0) || (r != 0)) as u32,
            _ => return,
        };
        let masked = if result == self.types.byte_id || result == self.types.bool_id {
            value & 0xFF
        } else {
            value & 0xFFFF
        };
        self.metadata.set(
            expr.id,
            MetadataKey::ConstantValue,
            MetadataValue::Number(masked),
        );
    }

    fn check_unary(
        &mut self,
        expr: &Expr,
        op: UnaryOp,
        operand: &Expr,
        scope: ScopeId,
    ) -> TypeId {
        match op {
            UnaryOp::LogicalNot => {
                self.check_condition(operand, scope);
                if let Some(v) = self.metadata.constant_of(operand.id) {
                    self.metadata.set(
                        expr.id,
                        MetadataKey::ConstantValue,
                        MetadataValue::Number((v == 0) as u32),
                    );
                }
                self.types.bool_id
            }
            UnaryOp::Neg | UnaryOp::BitNot => {
                let ty = self.check_expr(operand, scope);
                if !self.types.is_numeric(ty) && ty != self.types.unknown_id {
                    self.diags.error(
                        DiagnosticCode::TypeMismatch,
                        format!(
                            "Unary operator needs a numeric operand, got {}",
                            self.types.name_of(ty)
                        ),
                        operand.loc.clone(),
                    );
                    return self.types.unknown_id;
                }
                let result = if ty == self.types.bool_id {
                    self.types.byte_id
                } else {
                    ty
                };
                if let Some(v) = self.metadata.constant_of(operand.id) {
                    let mask = if result == self.types.byte_id {
                        0xFFu32
                    } else {
                        0xFFFF
                    };
                    let folded = match op {
                        UnaryOp::Neg => v.wrapping_neg() & mask,
                        _ => !v & mask,
                    };
                    self.metadata.set(
                        expr.id,
                        MetadataKey::ConstantValue,
                        MetadataValue::Number(folded),
                    );
                }
                result
            }
            UnaryOp::AddressOf => {
                let ty = self.check_expr(operand, scope);
                if !self.is_addressable(operand) {
                    self.diags.error(
                        DiagnosticCode::AddressOfNonLvalue,
                        "'@' needs a value with a static address",
                        operand.loc.clone(),
                    );
                    return self.types.unknown_id;
                }
                self.types.pointer_to(ty)
            }
        }
    }

    /// Only values with a static home can have their address taken:
    /// module-level variables, elements of module-level arrays, mapped
    /// fields, and functions.
    fn is_addressable(&self, expr: &Expr) -> bool {
        match &expr.kind {
            ExprKind::Identifier(_) => match self.metadata.symbol_of(expr.id) {
                Some(raw) => {
                    let symbol = self.table.symbol(SymbolId(raw));
                    matches!(
                        symbol.kind,
                        SymbolKind::Variable
                            | SymbolKind::Function
                            | SymbolKind::MappedVariable
                            | SymbolKind::ImportedSymbol
                    ) && symbol.scope == self.table.module_scope
                }
                None => false,
            },
            ExprKind::Index { base, .. } => self.is_addressable(base),
            ExprKind::Member { base, .. } => self.is_addressable(base),
            _ => false,
        }
    }

    fn check_assign(
        &mut self,
        expr: &Expr,
        op: Option<BinaryOp>,
        target: &Expr,
        value: &Expr,
        scope: ScopeId,
    ) -> TypeId {
        let target_ty = self.check_expr(target, scope);
        let value_ty = self.check_expr(value, scope);

        // Whole arrays never move after declaration
        if matches!(self.types.info(target_ty).kind, TypeKind::Array { .. })
            && matches!(target.kind, ExprKind::Identifier(_))
        {
            self.diags.error(
                DiagnosticCode::ArrayReassignment,
                "Arrays cannot be reassigned; assign to elements instead",
                expr.loc.clone(),
            );
            return target_ty;
        }

        if let Some(op) = op {
            if !self.types.is_numeric(target_ty) && target_ty != self.types.unknown_id {
                self.diags.error(
                    DiagnosticCode::TypeMismatch,
                    format!(
                        "Compound operator '{}=' needs a numeric target, got {}",
                        op,
                        self.types.name_of(target_ty)
                    ),
                    target.loc.clone(),
                );
            }
            if !self.types.is_numeric(value_ty) && value_ty != self.types.unknown_id {
                self.diags.error(
                    DiagnosticCode::TypeMismatch,
                    format!(
                        "Compound operator '{}=' needs a numeric operand, got {}",
                        op,
                        self.types.name_of(value_ty)
                    ),
                    value.loc.clone(),
                );
            }
        } else if !self.types.assignable(target_ty, value_ty) {
            self.diags.error(
                DiagnosticCode::TypeMismatch,
                format!(
                    "Cannot assign {} to {}",
                    self.types.name_of(value_ty),
                    self.types.name_of(target_ty)
                ),
                value.loc.clone(),
            );
        } else {
            self.mark_coercion(value, target_ty, value_ty);
        }

        target_ty
    }

    fn check_call(
        &mut self,
        expr: &Expr,
        callee: &Expr,
        args: &[Expr],
        scope: ScopeId,
    ) -> TypeId {
        // Intrinsic names bypass ordinary function-symbol lookup
        if let ExprKind::Identifier(name) = &callee.kind {
            if let Some(def) = self.intrinsics.lookup(name) {
                self.metadata.set(
                    expr.id,
                    MetadataKey::IntrinsicCall,
                    MetadataValue::Flag(true),
                );
                // An import of the same name still counts as used
                if let Some(id) = self.table.lookup(scope, name) {
                    self.metadata.set_symbol(callee.id, id.0);
                }
                return self.check_intrinsic_call(expr, def, args, scope);
            }
        }

        let callee_ty = self.check_expr(callee, scope);
        let (params, ret) = match self.types.info(callee_ty).kind.clone() {
            TypeKind::Function { params, ret } => (params, ret),
            TypeKind::Unknown => return self.types.unknown_id,
            _ => {
                self.diags.error(
                    DiagnosticCode::TypeMismatch,
                    format!(
                        "Value of type {} is not callable",
                        self.types.name_of(callee_ty)
                    ),
                    callee.loc.clone(),
                );
                return self.types.unknown_id;
            }
        };

        if args.len() != params.len() {
            self.diags.error(
                DiagnosticCode::TypeMismatch,
                format!(
                    "Call expects {} argument(s), got {}",
                    params.len(),
                    args.len()
                ),
                expr.loc.clone(),
            );
        }
        for (arg, &param) in args.iter().zip(params.iter()) {
            let arg_ty = self.check_expr(arg, scope);
            if !self.types.assignable(param, arg_ty) {
                self.diags.error(
                    DiagnosticCode::TypeMismatch,
                    format!(
                        "Argument type {} does not match parameter type {}",
                        self.types.name_of(arg_ty),
                        self.types.name_of(param)
                    ),
                    arg.loc.clone(),
                );
            } else {
                self.mark_coercion(arg, param, arg_ty);
            }
        }
        for arg in args.iter().skip(params.len()) {
            let _ = self.check_expr(arg, scope);
        }
        ret
    }

    fn check_intrinsic_call(
        &mut self,
        expr: &Expr,
        def: &'static IntrinsicDef,
        args: &[Expr],
        scope: ScopeId,
    ) -> TypeId {
        if args.len() != def.params.len() {
            self.diags.error(
                DiagnosticCode::IntrinsicArityMismatch,
                format!(
                    "Intrinsic '{}' expects {} argument(s), got {}",
                    def.name,
                    def.params.len(),
                    args.len()
                ),
                expr.loc.clone(),
            );
            return self.intrinsic_type(def.ret);
        }

        match def.name {
            "sizeof" => return self.check_sizeof(expr, &args[0], scope),
            "length" => return self.check_length(expr, &args[0], scope),
            _ => {}
        }

        for (arg, &param) in args.iter().zip(def.params.iter()) {
            let expected = self.intrinsic_type(param);
            let arg_ty = self.check_expr(arg, scope);
            if !self.types.assignable(expected, arg_ty) {
                self.diags.error(
                    DiagnosticCode::TypeMismatch,
                    format!(
                        "Intrinsic '{}' argument must be {}, got {}",
                        def.name,
                        self.types.name_of(expected),
                        self.types.name_of(arg_ty)
                    ),
                    arg.loc.clone(),
                );
            } else {
                self.mark_coercion(arg, expected, arg_ty);
            }
        }
        self.intrinsic_type(def.ret)
    }

    /// `sizeof` accepts a type name or any typed expression
    fn check_sizeof(&mut self, expr: &Expr, arg: &Expr, scope: ScopeId) -> TypeId {
        let size = match &arg.kind {
            ExprKind::Identifier(name) => match name.as_str() {
                "byte" | "boolean" | "bool" => Some(1),
                "word" => Some(2),
                _ => match self.table.lookup(scope, name) {
                    Some(id) => {
                        let symbol = self.table.symbol(id);
                        match symbol.kind {
                            SymbolKind::Type | SymbolKind::Enum => {
                                symbol.ty.map(|t| self.types.size_of(t))
                            }
                            _ => symbol.ty.map(|t| self.types.size_of(t)),
                        }
                    }
                    None => {
                        self.diags.error(
                            DiagnosticCode::UndefinedVariable,
                            format!("Unknown type or variable '{}' in sizeof", name),
                            arg.loc.clone(),
                        );
                        None
                    }
                },
            },
            _ => {
                let ty = self.check_expr(arg, scope);
                Some(self.types.size_of(ty))
            }
        };
        if let Some(size) = size {
            self.metadata.set(
                expr.id,
                MetadataKey::ConstantValue,
                MetadataValue::Number(size),
            );
        }
        self.types.word_id
    }

    /// `length` needs a size known at compile time: a sized array, a
    /// string literal, or a string variable initialized from one
    fn check_length(&mut self, expr: &Expr, arg: &Expr, scope: ScopeId) -> TypeId {
        let len = match &arg.kind {
            ExprKind::Str(text) => Some(text.len() as u32),
            _ => {
                let ty = self.check_expr(arg, scope);
                match self.types.info(ty).kind.clone() {
                    TypeKind::Array { len: Some(n), .. } => Some(n),
                    TypeKind::String => {
                        // A string variable knows its literal length
                        self.metadata
                            .symbol_of(arg.id)
                            .and_then(|raw| self.table.symbol(SymbolId(raw)).const_value)
                    }
                    _ => None,
                }
            }
        };
        match len {
            Some(n) => {
                self.metadata.set(
                    expr.id,
                    MetadataKey::ConstantValue,
                    MetadataValue::Number(n),
                );
            }
            None => {
                self.diags.error(
                    DiagnosticCode::LengthUnknownSize,
                    "length() needs a value whose size is known at compile time",
                    arg.loc.clone(),
                );
            }
        }
        self.types.word_id
    }

    fn check_index(&mut self, base: &Expr, index: &Expr, scope: ScopeId) -> TypeId {
        let base_ty = self.check_expr(base, scope);
        let index_ty = self.check_expr(index, scope);
        if !self.types.is_numeric(index_ty) && index_ty != self.types.unknown_id {
            self.diags.error(
                DiagnosticCode::TypeMismatch,
                format!(
                    "Array index must be numeric, got {}",
                    self.types.name_of(index_ty)
                ),
                index.loc.clone(),
            );
        }
        match self.types.info(base_ty).kind.clone() {
            TypeKind::Array { elem, .. } => elem,
            TypeKind::Pointer(inner) => inner,
            TypeKind::Unknown => self.types.unknown_id,
            _ => {
                self.diags.error(
                    DiagnosticCode::TypeMismatch,
                    format!(
                        "Value of type {} cannot be indexed",
                        self.types.name_of(base_ty)
                    ),
                    base.loc.clone(),
                );
                self.types.unknown_id
            }
        }
    }

    fn check_member(
        &mut self,
        expr: &Expr,
        base: &Expr,
        member: &str,
        scope: ScopeId,
    ) -> TypeId {
        let ExprKind::Identifier(base_name) = &base.kind else {
            self.diags.error(
                DiagnosticCode::TypeMismatch,
                "Member access is only available on memory-mapped structs",
                base.loc.clone(),
            );
            return self.types.unknown_id;
        };

        let Some(id) = self.table.lookup(scope, base_name) else {
            self.diags.error(
                DiagnosticCode::UndefinedVariable,
                format!("Undefined variable '{}'", base_name),
                base.loc.clone(),
            );
            return self.types.unknown_id;
        };
        self.metadata.set_symbol(base.id, id.0);

        if self.table.symbol(id).kind != SymbolKind::MappedVariable {
            self.diags.error(
                DiagnosticCode::TypeMismatch,
                format!("'{}' is not a memory-mapped struct", base_name),
                base.loc.clone(),
            );
            return self.types.unknown_id;
        }

        let Some(mapped) = self.table.mapped.get(&id) else {
            return self.types.unknown_id;
        };
        match mapped.field(member) {
            Some(field) => field.ty,
            None => {
                self.diags.error(
                    DiagnosticCode::UndefinedVariable,
                    format!("'{}' has no field '{}'", base_name, member),
                    expr.loc.clone(),
                );
                self.types.unknown_id
            }
        }
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn intrinsic_type(&self, ty: IntrinsicType) -> TypeId {
        match ty {
            IntrinsicType::Byte => self.types.byte_id,
            IntrinsicType::Word => self.types.word_id,
            IntrinsicType::Void => self.types.void_id,
            IntrinsicType::Any => self.types.unknown_id,
        }
    }

    /// Records the coercion needed to use `actual` where `expected` is
    /// wanted; boolean/byte mixes warn because they change meaning
    fn mark_coercion(&mut self, expr: &Expr, expected: TypeId, actual: TypeId) {
        if let Some(kind) = self.types.coercion_for(expected, actual) {
            self.metadata.set_coercion(expr.id, kind);
            if matches!(kind, CoercionKind::BoolToByte | CoercionKind::ByteToBool) {
                self.diags.warn(
                    DiagnosticCode::ImplicitConversion,
                    format!(
                        "Implicit conversion from {} to {}",
                        self.types.name_of(actual),
                        self.types.name_of(expected)
                    ),
                    expr.loc.clone(),
                );
            }
        }
    }

    fn require_assignable(&mut self, expected: TypeId, actual: TypeId, expr: &Expr) {
        if !self.types.assignable(expected, actual) {
            self.diags.error(
                DiagnosticCode::TypeMismatch,
                format!(
                    "Expected {}, got {}",
                    self.types.name_of(expected),
                    self.types.name_of(actual)
                ),
                expr.loc.clone(),
            );
        } else {
            self.mark_coercion(expr, expected, actual);
        }
    }

    /// Module name this checker is working on (used in logs)
    pub fn module_name(&self) -> &str {
        self.module
    }
}
