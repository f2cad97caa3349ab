//! Type resolution (pass 4b)
//!
//! Converts type-annotation AST into interned [`TypeId`]s and late-binds a
//! type onto every variable, parameter, function, and enum symbol. Type
//! aliases resolve transitively with a cycle guard. Array declarations
//! without a size take their length from the initializer literal.

use super::builder::ScopeMap;
use super::symbols::{ScopeId, SymbolId, SymbolKind, SymbolTable};
use super::types::{TypeId, TypeTable};
use crate::diagnostics::{DiagnosticBag, DiagnosticCode};
use crate::parser::ast::*;
use std::collections::{HashMap, HashSet};

/// Resolves types for one module
pub struct TypeResolver<'a> {
    table: &'a mut SymbolTable,
    map: &'a ScopeMap,
    types: &'a mut TypeTable,
    metadata: &'a mut NodeMetadata,
    diags: &'a mut DiagnosticBag,
    aliases: HashMap<SymbolId, TypeExpr>,
    resolving: HashSet<SymbolId>,
}

impl<'a> TypeResolver<'a> {
    /// Creates the resolver for one module's tables
    pub fn new(
        table: &'a mut SymbolTable,
        map: &'a ScopeMap,
        types: &'a mut TypeTable,
        metadata: &'a mut NodeMetadata,
        diags: &'a mut DiagnosticBag,
    ) -> Self {
        TypeResolver {
            table,
            map,
            types,
            metadata,
            diags,
            aliases: HashMap::new(),
            resolving: HashSet::new(),
        }
    }

    /// Runs the pass
    pub fn resolve(mut self, program: &Program) {
        // Collect alias bodies first so forward references resolve
        for decl in &program.decls {
            if let Decl::TypeAlias(alias) = decl {
                if let Some(&id) = self.map.decl_symbols.get(&alias.id) {
                    self.aliases.insert(id, alias.ty.clone());
                }
            }
        }

        // Module-level symbols before function bodies, so locals can refer
        // to module variables during inference
        for decl in &program.decls {
            match decl {
                Decl::Variable(v) => self.resolve_variable(v, self.table.module_scope),
                Decl::TypeAlias(alias) => {
                    if let Some(&id) = self.map.decl_symbols.get(&alias.id) {
                        let resolved = self.resolve_alias(id);
                        self.table.symbol_mut(id).ty = Some(resolved);
                    }
                }
                Decl::Enum(e) => self.resolve_enum(e),
                Decl::MemoryMap(m) => {
                    if let Some(&id) = self.map.decl_symbols.get(&m.id) {
                        let word = self.types.word_id;
                        self.table.symbol_mut(id).ty = Some(word);
                    }
                }
                Decl::Function(_) => {}
            }
        }

        for decl in &program.decls {
            if let Decl::Function(f) = decl {
                self.resolve_function(f);
            }
        }
    }

    fn resolve_function(&mut self, f: &FunctionDecl) {
        let body_scope = match self.map.scopes.get(&(f.id, 0)) {
            Some(&s) => s,
            None => return,
        };

        let mut param_types = Vec::new();
        for param in &f.params {
            let ty = self.resolve_type_expr(&param.ty, body_scope);
            param_types.push(ty);
            if let Some(&id) = self.map.decl_symbols.get(&param.id) {
                self.table.symbol_mut(id).ty = Some(ty);
            }
        }

        let ret = match &f.ret {
            Some(ty) => self.resolve_type_expr(ty, body_scope),
            None => self.types.void_id,
        };

        let fn_type = self.types.function_of(param_types, ret);
        if let Some(&id) = self.map.decl_symbols.get(&f.id) {
            self.table.symbol_mut(id).ty = Some(fn_type);
        }

        self.resolve_block(&f.body, body_scope);
    }

    fn resolve_block(&mut self, stmts: &[Stmt], scope: ScopeId) {
        for stmt in stmts {
            self.resolve_stmt(stmt, scope);
        }
    }

    fn resolve_stmt(&mut self, stmt: &Stmt, scope: ScopeId) {
        match &stmt.kind {
            StmtKind::Let(v) => self.resolve_variable(v, scope),
            StmtKind::If {
                then_body,
                else_body,
                ..
            } => {
                if let Some(&s) = self.map.scopes.get(&(stmt.id, 0)) {
                    self.resolve_block(then_body, s);
                }
                if let (Some(else_body), Some(&s)) =
                    (else_body.as_ref(), self.map.scopes.get(&(stmt.id, 1)))
                {
                    self.resolve_block(else_body, s);
                }
            }
            StmtKind::While { body, .. } => {
                if let Some(&s) = self.map.scopes.get(&(stmt.id, 0)) {
                    self.resolve_block(body, s);
                }
            }
            StmtKind::For {
                var_id,
                from,
                to,
                body,
                ..
            } => {
                let loop_scope = match self.map.scopes.get(&(stmt.id, 0)) {
                    Some(&s) => s,
                    None => return,
                };
                // The induction variable takes the larger of its bounds:
                // word if either bound is word, else byte.
                let from_ty = self.shallow_expr_type(from, loop_scope);
                let to_ty = self.shallow_expr_type(to, loop_scope);
                let induction = self.types.wider_of(from_ty, to_ty);
                if let Some(&id) = self.map.decl_symbols.get(var_id) {
                    self.table.symbol_mut(id).ty = Some(induction);
                }
                // A statically known byte bound makes the counter an X/Y
                // index register candidate.
                if induction == self.types.byte_id && self.static_byte_bound(to, loop_scope) {
                    self.metadata.set(
                        stmt.id,
                        MetadataKey::LoopRegisterCandidate,
                        MetadataValue::Flag(true),
                    );
                }
                self.resolve_block(body, loop_scope);
            }
            StmtKind::Match { cases, default, .. } => {
                for (index, case) in cases.iter().enumerate() {
                    if let Some(&s) = self.map.scopes.get(&(stmt.id, index as u8)) {
                        self.resolve_block(&case.body, s);
                    }
                }
                if let (Some(default), Some(&s)) =
                    (default.as_ref(), self.map.scopes.get(&(stmt.id, u8::MAX)))
                {
                    self.resolve_block(default, s);
                }
            }
            _ => {}
        }
    }

    fn resolve_variable(&mut self, v: &VarDecl, scope: ScopeId) {
        let Some(&symbol_id) = self.map.decl_symbols.get(&v.id) else {
            return;
        };

        let ty = match (&v.ty, &v.init) {
            (Some(annotation), init) => {
                let mut declared = self.resolve_type_expr(annotation, scope);
                // Unsized arrays take their length from the initializer
                if let super::types::TypeKind::Array { elem, len } =
                    self.types.info(declared).kind.clone()
                {
                    match (len, init.as_ref().map(|e| &e.kind)) {
                        (None, Some(ExprKind::ArrayLiteral(elements))) => {
                            let inferred = elements.len() as u32;
                            declared = self.types.array_of(elem, Some(inferred));
                            self.metadata.set(
                                v.id,
                                MetadataKey::InferredArraySize,
                                MetadataValue::Number(inferred),
                            );
                        }
                        (None, _) => {
                            self.diags.error(
                                DiagnosticCode::CannotInferArraySize,
                                format!(
                                    "Cannot infer the size of array '{}' without an array literal initializer",
                                    v.name
                                ),
                                v.loc.clone(),
                            );
                        }
                        (Some(declared_len), Some(ExprKind::ArrayLiteral(elements)))
                            if elements.len() as u32 != declared_len =>
                        {
                            self.diags.error(
                                DiagnosticCode::TypeMismatch,
                                format!(
                                    "Array '{}' declares {} elements but the initializer has {}",
                                    v.name,
                                    declared_len,
                                    elements.len()
                                ),
                                v.loc.clone(),
                            );
                        }
                        _ => {}
                    }
                }
                declared
            }
            (None, Some(init)) => self.shallow_expr_type(init, scope),
            (None, None) => {
                self.diags.error(
                    DiagnosticCode::TypeMismatch,
                    format!(
                        "Variable '{}' needs a type annotation or an initializer",
                        v.name
                    ),
                    v.loc.clone(),
                );
                self.types.unknown_id
            }
        };

        self.table.symbol_mut(symbol_id).ty = Some(ty);
    }

    fn resolve_enum(&mut self, e: &EnumDecl) {
        let byte = self.types.byte_id;
        if let Some(&id) = self.map.decl_symbols.get(&e.id) {
            self.table.symbol_mut(id).ty = Some(byte);
        }
        for member in &e.members {
            if let Some(&id) = self.map.decl_symbols.get(&member.id) {
                self.table.symbol_mut(id).ty = Some(byte);
            }
        }
    }

    /// Resolves an annotation to an interned type id
    pub fn resolve_type_expr(&mut self, ty: &TypeExpr, scope: ScopeId) -> TypeId {
        match &ty.kind {
            TypeExprKind::Named(name) => match name.as_str() {
                "byte" => self.types.byte_id,
                "word" => self.types.word_id,
                "boolean" | "bool" => self.types.bool_id,
                "void" => self.types.void_id,
                "string" => self.types.string_id,
                _ => match self.table.lookup(scope, name) {
                    Some(id) => {
                        let symbol = self.table.symbol(id);
                        match symbol.kind {
                            SymbolKind::Type => {
                                if let Some(resolved) = symbol.ty {
                                    resolved
                                } else {
                                    self.resolve_alias(id)
                                }
                            }
                            SymbolKind::Enum => self.types.byte_id,
                            _ => {
                                self.diags.error(
                                    DiagnosticCode::TypeMismatch,
                                    format!("'{}' is not a type", name),
                                    ty.loc.clone(),
                                );
                                self.types.unknown_id
                            }
                        }
                    }
                    None => {
                        self.diags.error(
                            DiagnosticCode::UndefinedVariable,
                            format!("Unknown type '{}'", name),
                            ty.loc.clone(),
                        );
                        self.types.unknown_id
                    }
                },
            },
            TypeExprKind::Array(elem, len) => {
                let elem_id = self.resolve_type_expr(elem, scope);
                self.types.array_of(elem_id, *len)
            }
            TypeExprKind::Pointer(inner) => {
                let inner_id = self.resolve_type_expr(inner, scope);
                self.types.pointer_to(inner_id)
            }
            TypeExprKind::Callback(params, ret) => {
                let param_ids: Vec<TypeId> = params
                    .iter()
                    .map(|p| self.resolve_type_expr(p, scope))
                    .collect();
                let ret_id = match ret {
                    Some(r) => self.resolve_type_expr(r, scope),
                    None => self.types.void_id,
                };
                self.types.function_of(param_ids, ret_id)
            }
        }
    }

    /// Resolves an alias symbol's target, guarding against cycles
    fn resolve_alias(&mut self, id: SymbolId) -> TypeId {
        if !self.resolving.insert(id) {
            let loc = self.table.symbol(id).loc.clone();
            let name = self.table.symbol(id).name.clone();
            self.diags.error(
                DiagnosticCode::TypeMismatch,
                format!("Type alias '{}' refers to itself", name),
                loc,
            );
            return self.types.unknown_id;
        }
        let resolved = match self.aliases.get(&id).cloned() {
            Some(body) => {
                let scope = self.table.symbol(id).scope;
                self.resolve_type_expr(&body, scope)
            }
            None => self.types.unknown_id,
        };
        self.resolving.remove(&id);
        self.table.symbol_mut(id).ty = Some(resolved);
        resolved
    }

    /// Cheap structural typing used for initializer inference and for-loop
    /// bounds; the full checker refines these later
    fn shallow_expr_type(&mut self, expr: &Expr, scope: ScopeId) -> TypeId {
        match &expr.kind {
            ExprKind::Number(n) => {
                if *n <= 255 {
                    self.types.byte_id
                } else {
                    self.types.word_id
                }
            }
            ExprKind::Bool(_) => self.types.bool_id,
            ExprKind::Str(_) => self.types.string_id,
            ExprKind::ArrayLiteral(elements) => {
                let mut elem = self.types.byte_id;
                for e in elements {
                    let t = self.shallow_expr_type(e, scope);
                    elem = self.types.wider_of(elem, t);
                }
                self.types.array_of(elem, Some(elements.len() as u32))
            }
            ExprKind::Identifier(name) => self
                .table
                .lookup(scope, name)
                .and_then(|id| self.table.symbol(id).ty)
                .unwrap_or(self.types.unknown_id),
            ExprKind::Binary { lhs, rhs, op } => {
                let l = self.shallow_expr_type(lhs, scope);
                let r = self.shallow_expr_type(rhs, scope);
                if op.is_comparison() || op.is_logical() {
                    self.types.bool_id
                } else {
                    self.types.wider_of(l, r)
                }
            }
            ExprKind::Unary { operand, .. } => self.shallow_expr_type(operand, scope),
            _ => self.types.unknown_id,
        }
    }

    /// True when the upper bound is a byte known at compile time
    fn static_byte_bound(&mut self, expr: &Expr, scope: ScopeId) -> bool {
        match &expr.kind {
            ExprKind::Number(n) => *n <= 255,
            ExprKind::Identifier(name) => match self.table.lookup(scope, name) {
                Some(id) => {
                    let symbol = self.table.symbol(id);
                    symbol.is_const && matches!(symbol.const_value, Some(v) if v <= 255)
                }
                None => false,
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::builder::SymbolTableBuilder;
    use crate::lexer::Scanner;
    use crate::parser::Parser;

    struct Resolved {
        table: SymbolTable,
        types: TypeTable,
        metadata: NodeMetadata,
        diags: DiagnosticBag,
        program: Program,
    }

    fn resolve(source: &str) -> Resolved {
        let mut diags = DiagnosticBag::new();
        let tokens = Scanner::new(source, "t.bl65").scan_tokens(&mut diags);
        let (program, pd) = Parser::new(tokens, "t.bl65").parse();
        diags.absorb(pd);
        let mut types = TypeTable::new();
        let (mut table, map) = SymbolTableBuilder::new(&mut types, &mut diags).build(&program);
        let mut metadata = NodeMetadata::new();
        TypeResolver::new(&mut table, &map, &mut types, &mut metadata, &mut diags)
            .resolve(&program);
        Resolved {
            table,
            types,
            metadata,
            diags,
            program,
        }
    }

    fn symbol_type(r: &Resolved, name: &str) -> TypeId {
        let id = r.table.lookup(r.table.module_scope, name).unwrap();
        r.table.symbol(id).ty.unwrap()
    }

    #[test]
    fn test_annotated_types() {
        let r = resolve("let a: byte = 0\nlet b: word = 0\nlet c: boolean = true\n");
        assert!(!r.diags.has_errors());
        assert_eq!(symbol_type(&r, "a"), r.types.byte_id);
        assert_eq!(symbol_type(&r, "b"), r.types.word_id);
        assert_eq!(symbol_type(&r, "c"), r.types.bool_id);
    }

    #[test]
    fn test_alias_resolution() {
        let r = resolve("type Coord = word\nlet x: Coord = 0\n");
        assert!(!r.diags.has_errors());
        assert_eq!(symbol_type(&r, "x"), r.types.word_id);
    }

    #[test]
    fn test_alias_cycle_rejected() {
        let r = resolve("type A = B\ntype B = A\n");
        assert!(r.diags.has_errors());
    }

    #[test]
    fn test_array_size_inference() {
        let r = resolve("let colors: byte[] = [2, 5, 6]\n");
        assert!(!r.diags.has_errors());
        let ty = symbol_type(&r, "colors");
        assert_eq!(r.types.name_of(ty), "byte[3]");
        let decl_id = match &r.program.decls[0] {
            Decl::Variable(v) => v.id,
            _ => unreachable!(),
        };
        assert!(matches!(
            r.metadata.get(decl_id, MetadataKey::InferredArraySize),
            Some(MetadataValue::Number(3))
        ));
    }

    #[test]
    fn test_array_size_mismatch() {
        let r = resolve("let colors: byte[2] = [2, 5, 6]\n");
        assert!(r.diags.has_errors());
    }

    #[test]
    fn test_cannot_infer_array_size() {
        let r = resolve("let buffer: byte[]\n");
        assert!(r.diags.find(DiagnosticCode::CannotInferArraySize).is_some());
    }

    #[test]
    fn test_function_type() {
        let r = resolve("function add(a: byte, b: word): word\n  return a + b\nend function\n");
        assert!(!r.diags.has_errors());
        let ty = symbol_type(&r, "add");
        assert_eq!(r.types.name_of(ty), "callback(byte, word): word");
    }

    #[test]
    fn test_for_induction_typing() {
        let r = resolve(
            "function f()\n  for i = 0 to 999\n    let x: word = i\n  next\n  for j = 0 to 9\n    let y: byte = j\n  next\nend function\n",
        );
        assert!(!r.diags.has_errors(), "{:?}", r.diags.diagnostics());
        let f = match &r.program.decls[0] {
            Decl::Function(f) => f,
            _ => unreachable!(),
        };
        // i is word (bound 999), j is byte (bound 9)
        let word_loop = &f.body[0];
        let byte_loop = &f.body[1];
        assert!(r
            .metadata
            .get(word_loop.id, MetadataKey::LoopRegisterCandidate)
            .is_none());
        assert!(matches!(
            r.metadata.get(byte_loop.id, MetadataKey::LoopRegisterCandidate),
            Some(MetadataValue::Flag(true))
        ));
    }

    #[test]
    fn test_literal_inference_without_annotation() {
        let r = resolve("let small = 42\nlet big = 300\n");
        assert!(!r.diags.has_errors());
        assert_eq!(symbol_type(&r, "small"), r.types.byte_id);
        assert_eq!(symbol_type(&r, "big"), r.types.word_id);
    }
}
