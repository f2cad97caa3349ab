//! Symbol table construction (pass 4a)
//!
//! Records every declaration in its scope, checks duplicates, propagates
//! `export`, and sets storage classes. Scope-introducing constructs are
//! keyed by node id so later passes walk the identical scope tree.

use super::symbols::{
    MappedField, MappedStruct, ScopeId, ScopeKind, StorageClass, Symbol, SymbolId, SymbolKind,
    SymbolTable,
};
use super::types::{TypeId, TypeKind, TypeTable};
use crate::diagnostics::{DiagnosticBag, DiagnosticCode};
use crate::parser::ast::*;
use std::collections::HashMap;

/// Key addressing a scope created for a node; the branch index separates
/// the `then` (0) and `else` (1) bodies of an `if`
pub type ScopeKey = (NodeId, u8);

/// Output of the symbol-table builder for one module
#[derive(Debug, Default)]
pub struct ScopeMap {
    /// Declaration node -> declared symbol
    pub decl_symbols: HashMap<NodeId, SymbolId>,
    /// Scope-introducing node (+ branch) -> scope id
    pub scopes: HashMap<ScopeKey, ScopeId>,
}

/// Builds the symbol table for one module
pub struct SymbolTableBuilder<'a> {
    table: SymbolTable,
    map: ScopeMap,
    types: &'a mut TypeTable,
    diags: &'a mut DiagnosticBag,
}

impl<'a> SymbolTableBuilder<'a> {
    /// Creates a builder writing into fresh tables
    pub fn new(types: &'a mut TypeTable, diags: &'a mut DiagnosticBag) -> Self {
        SymbolTableBuilder {
            table: SymbolTable::new(),
            map: ScopeMap::default(),
            types,
            diags,
        }
    }

    /// Runs the pass over one program
    pub fn build(mut self, program: &Program) -> (SymbolTable, ScopeMap) {
        let module_scope = self.table.module_scope;

        for import in &program.imports {
            for name in &import.names {
                self.declare(
                    module_scope,
                    Symbol {
                        name: name.clone(),
                        kind: SymbolKind::ImportedSymbol,
                        storage: StorageClass::Ram,
                        is_const: false,
                        is_exported: false,
                        decl: import.id,
                        ty: None,
                        scope: module_scope,
                        loc: import.loc.clone(),
                        const_value: None,
                        imported_from: Some(import.module.clone()),
                    },
                );
            }
        }

        for decl in &program.decls {
            self.build_decl(module_scope, decl);
        }

        (self.table, self.map)
    }

    fn build_decl(&mut self, scope: ScopeId, decl: &Decl) {
        match decl {
            Decl::Function(f) => self.build_function(scope, f),
            Decl::Variable(v) => self.build_variable(scope, v, true),
            Decl::TypeAlias(t) => {
                self.declare(
                    scope,
                    Symbol {
                        name: t.name.clone(),
                        kind: SymbolKind::Type,
                        storage: StorageClass::Ram,
                        is_const: true,
                        is_exported: t.exported,
                        decl: t.id,
                        ty: None,
                        scope,
                        loc: t.loc.clone(),
                        const_value: None,
                        imported_from: None,
                    },
                );
            }
            Decl::Enum(e) => self.build_enum(scope, e),
            Decl::MemoryMap(m) => self.build_memory_map(scope, m),
        }
    }

    fn build_function(&mut self, scope: ScopeId, f: &FunctionDecl) {
        self.declare(
            scope,
            Symbol {
                name: f.name.clone(),
                kind: SymbolKind::Function,
                storage: StorageClass::Ram,
                is_const: true,
                is_exported: f.exported,
                decl: f.id,
                ty: None,
                scope,
                loc: f.loc.clone(),
                const_value: None,
                imported_from: None,
            },
        );

        let body_scope = self.table.push_scope(scope, ScopeKind::Function);
        self.map.scopes.insert((f.id, 0), body_scope);

        for param in &f.params {
            self.declare(
                body_scope,
                Symbol {
                    name: param.name.clone(),
                    kind: SymbolKind::Parameter,
                    storage: StorageClass::Ram,
                    is_const: false,
                    is_exported: false,
                    decl: param.id,
                    ty: None,
                    scope: body_scope,
                    loc: param.loc.clone(),
                    const_value: None,
                    imported_from: None,
                },
            );
        }

        self.build_block(body_scope, &f.body);
    }

    fn build_variable(&mut self, scope: ScopeId, v: &VarDecl, module_level: bool) {
        let storage = match v.storage {
            Some(StorageAttr::ZeroPage) => StorageClass::ZeroPage,
            Some(StorageAttr::Ram) => StorageClass::Ram,
            Some(StorageAttr::Data) => StorageClass::Data,
            None if v.is_const && module_level => StorageClass::Data,
            // Initialized arrays and strings load with the program image
            None if module_level
                && matches!(
                    v.init.as_ref().map(|e| &e.kind),
                    Some(ExprKind::ArrayLiteral(_)) | Some(ExprKind::Str(_))
                ) =>
            {
                StorageClass::Data
            }
            None => StorageClass::Ram,
        };

        // Literal constants fold right here; richer constant expressions
        // are evaluated by the type checker.
        let const_value = if v.is_const {
            match v.init.as_ref().map(|e| &e.kind) {
                Some(ExprKind::Number(n)) => Some(*n),
                Some(ExprKind::Bool(b)) => Some(*b as u32),
                _ => None,
            }
        } else {
            None
        };

        self.declare(
            scope,
            Symbol {
                name: v.name.clone(),
                kind: SymbolKind::Variable,
                storage,
                is_const: v.is_const,
                is_exported: v.exported,
                decl: v.id,
                ty: None,
                scope,
                loc: v.loc.clone(),
                const_value,
                imported_from: None,
            },
        );
    }

    fn build_enum(&mut self, scope: ScopeId, e: &EnumDecl) {
        self.declare(
            scope,
            Symbol {
                name: e.name.clone(),
                kind: SymbolKind::Enum,
                storage: StorageClass::Ram,
                is_const: true,
                is_exported: e.exported,
                decl: e.id,
                ty: None,
                scope,
                loc: e.loc.clone(),
                const_value: None,
                imported_from: None,
            },
        );

        let mut next_value: u32 = 0;
        for member in &e.members {
            let value = member.value.unwrap_or(next_value);
            next_value = value + 1;
            if value > 255 {
                self.diags.error(
                    DiagnosticCode::TypeMismatch,
                    format!("Enum member '{}' exceeds byte range", member.name),
                    member.loc.clone(),
                );
            }
            self.declare(
                scope,
                Symbol {
                    name: member.name.clone(),
                    kind: SymbolKind::EnumMember,
                    storage: StorageClass::Ram,
                    is_const: true,
                    is_exported: e.exported,
                    decl: member.id,
                    ty: None,
                    scope,
                    loc: member.loc.clone(),
                    const_value: Some(value),
                    imported_from: None,
                },
            );
        }
    }

    fn build_memory_map(&mut self, scope: ScopeId, m: &MemoryMapDecl) {
        let mut fields = Vec::new();
        let mut next_offset: u32 = 0;
        let mut size: u32 = 0;

        for field in &m.fields {
            let (ty, field_size, len) = self.resolve_map_field_type(&field.ty);
            let offset = field.offset.unwrap_or(next_offset);
            next_offset = offset + field_size;
            size = size.max(offset + field_size);
            fields.push(MappedField {
                name: field.name.clone(),
                ty,
                offset,
                len,
            });
        }

        let id = self.declare(
            scope,
            Symbol {
                name: m.name.clone(),
                kind: SymbolKind::MappedVariable,
                storage: StorageClass::Map,
                is_const: false,
                is_exported: m.exported,
                decl: m.id,
                ty: None,
                scope,
                loc: m.loc.clone(),
                const_value: Some(m.base),
                imported_from: None,
            },
        );
        if let Some(id) = id {
            self.table.mapped.insert(
                id,
                MappedStruct {
                    base: m.base,
                    fields,
                    size,
                },
            );
        }
    }

    /// Map fields admit only byte, word, and fixed-size arrays of them
    fn resolve_map_field_type(&mut self, ty: &TypeExpr) -> (TypeId, u32, Option<u32>) {
        match &ty.kind {
            TypeExprKind::Named(name) if name == "byte" => (self.types.byte_id, 1, None),
            TypeExprKind::Named(name) if name == "word" => (self.types.word_id, 2, None),
            TypeExprKind::Array(elem, Some(len)) => {
                let (elem_id, elem_size, _) = self.resolve_map_field_type(elem);
                let arr = self.types.array_of(elem_id, Some(*len));
                (arr, elem_size * len, Some(*len))
            }
            _ => {
                self.diags.error(
                    DiagnosticCode::InvalidMemoryMapScope,
                    "Memory map fields must be byte, word, or fixed-size arrays of them",
                    ty.loc.clone(),
                );
                (self.types.unknown_id, 0, None)
            }
        }
    }

    fn build_block(&mut self, scope: ScopeId, stmts: &[Stmt]) {
        for stmt in stmts {
            self.build_stmt(scope, stmt);
        }
    }

    fn build_stmt(&mut self, scope: ScopeId, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Let(v) => self.build_variable(scope, v, false),
            StmtKind::If {
                then_body,
                else_body,
                ..
            } => {
                let then_scope = self.table.push_scope(scope, ScopeKind::Block);
                self.map.scopes.insert((stmt.id, 0), then_scope);
                self.build_block(then_scope, then_body);
                if let Some(else_body) = else_body {
                    let else_scope = self.table.push_scope(scope, ScopeKind::Block);
                    self.map.scopes.insert((stmt.id, 1), else_scope);
                    self.build_block(else_scope, else_body);
                }
            }
            StmtKind::While { body, .. } => {
                let body_scope = self.table.push_scope(scope, ScopeKind::Block);
                self.map.scopes.insert((stmt.id, 0), body_scope);
                self.build_block(body_scope, body);
            }
            StmtKind::For {
                var, var_id, body, ..
            } => {
                let loop_scope = self.table.push_scope(scope, ScopeKind::Block);
                self.map.scopes.insert((stmt.id, 0), loop_scope);
                self.declare(
                    loop_scope,
                    Symbol {
                        name: var.clone(),
                        kind: SymbolKind::Variable,
                        storage: StorageClass::Ram,
                        is_const: false,
                        is_exported: false,
                        decl: *var_id,
                        ty: None,
                        scope: loop_scope,
                        loc: stmt.loc.clone(),
                        const_value: None,
                        imported_from: None,
                    },
                );
                self.build_block(loop_scope, body);
            }
            StmtKind::Match { cases, default, .. } => {
                for (index, case) in cases.iter().enumerate() {
                    let case_scope = self.table.push_scope(scope, ScopeKind::Block);
                    self.map.scopes.insert((stmt.id, index as u8), case_scope);
                    self.build_block(case_scope, &case.body);
                }
                if let Some(default) = default {
                    let default_scope = self.table.push_scope(scope, ScopeKind::Block);
                    self.map.scopes.insert((stmt.id, u8::MAX), default_scope);
                    self.build_block(default_scope, default);
                }
            }
            StmtKind::Break
            | StmtKind::Continue
            | StmtKind::Return(_)
            | StmtKind::Expression(_)
            | StmtKind::Asm(_) => {}
        }
    }

    fn declare(&mut self, scope: ScopeId, symbol: Symbol) -> Option<SymbolId> {
        let decl_node = symbol.decl;
        let name = symbol.name.clone();
        let loc = symbol.loc.clone();
        match self.table.declare(scope, symbol) {
            Ok(id) => {
                self.map.decl_symbols.insert(decl_node, id);
                Some(id)
            }
            Err(existing) => {
                let previous = self.table.symbol(existing).loc.clone();
                self.diags.report(
                    crate::diagnostics::Diagnostic::new(
                        DiagnosticCode::DuplicateDeclaration,
                        format!("'{}' is already declared in this scope", name),
                        loc,
                    )
                    .with_related("previous declaration is here", previous),
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Scanner;
    use crate::parser::Parser;

    fn build(source: &str) -> (SymbolTable, ScopeMap, DiagnosticBag, Program) {
        let mut diags = DiagnosticBag::new();
        let tokens = Scanner::new(source, "t.bl65").scan_tokens(&mut diags);
        let (program, pd) = Parser::new(tokens, "t.bl65").parse();
        diags.absorb(pd);
        let mut types = TypeTable::new();
        let builder = SymbolTableBuilder::new(&mut types, &mut diags);
        let (table, map) = builder.build(&program);
        (table, map, diags, program)
    }

    #[test]
    fn test_module_symbols() {
        let (table, _, diags, _) = build(
            "let score: word = 0\nexport function main()\n  let x: byte = 1\nend function\n",
        );
        assert!(!diags.has_errors(), "{:?}", diags.diagnostics());
        let score = table.lookup(table.module_scope, "score").unwrap();
        assert_eq!(table.symbol(score).kind, SymbolKind::Variable);
        let main = table.lookup(table.module_scope, "main").unwrap();
        assert_eq!(table.symbol(main).kind, SymbolKind::Function);
        assert!(table.symbol(main).is_exported);
    }

    #[test]
    fn test_duplicate_declaration() {
        let (_, _, diags, _) = build("let x: byte = 1\nlet x: byte = 2\n");
        let d = diags.find(DiagnosticCode::DuplicateDeclaration).unwrap();
        assert!(!d.related.is_empty());
    }

    #[test]
    fn test_storage_classes() {
        let (table, _, diags, _) = build(
            "let a: byte @zeropage = 0\nlet b: byte = 0\nconst C: byte = 5\nlet d: byte[4] @data = [1, 2, 3, 4]\n",
        );
        assert!(!diags.has_errors());
        let get = |name: &str| {
            let id = table.lookup(table.module_scope, name).unwrap();
            table.symbol(id).storage
        };
        assert_eq!(get("a"), StorageClass::ZeroPage);
        assert_eq!(get("b"), StorageClass::Ram);
        assert_eq!(get("C"), StorageClass::Data);
        assert_eq!(get("d"), StorageClass::Data);
    }

    #[test]
    fn test_enum_members_auto_increment() {
        let (table, _, diags, _) =
            build("enum Color\n  black\n  white = 5\n  red\nend enum\n");
        assert!(!diags.has_errors());
        let value = |name: &str| {
            let id = table.lookup(table.module_scope, name).unwrap();
            table.symbol(id).const_value
        };
        assert_eq!(value("black"), Some(0));
        assert_eq!(value("white"), Some(5));
        assert_eq!(value("red"), Some(6));
    }

    #[test]
    fn test_mapped_struct_offsets() {
        let (table, _, diags, _) = build(
            "@map vic at $d000\n  sprite_x: byte[8]\n  border: byte at $20\n  background: byte\nend map\n",
        );
        assert!(!diags.has_errors(), "{:?}", diags.diagnostics());
        let id = table.lookup(table.module_scope, "vic").unwrap();
        let mapped = table.mapped.get(&id).unwrap();
        assert_eq!(mapped.base, 0xD000);
        assert_eq!(mapped.field("sprite_x").unwrap().offset, 0);
        assert_eq!(mapped.field("sprite_x").unwrap().len, Some(8));
        assert_eq!(mapped.field("border").unwrap().offset, 0x20);
        assert_eq!(mapped.field("background").unwrap().offset, 0x21);
        assert_eq!(mapped.size, 0x22);
    }

    #[test]
    fn test_for_loop_scope() {
        let (table, map, diags, program) = build(
            "function f()\n  for i = 0 to 9\n    let t: byte = i\n  next\nend function\n",
        );
        assert!(!diags.has_errors(), "{:?}", diags.diagnostics());
        // The loop variable lives in the loop scope, not the function scope
        let f = match &program.decls[0] {
            Decl::Function(f) => f,
            _ => unreachable!(),
        };
        let body_scope = map.scopes[&(f.id, 0)];
        assert!(table.lookup_local(body_scope, "i").is_none());
        let for_stmt = &f.body[0];
        let loop_scope = map.scopes[&(for_stmt.id, 0)];
        assert!(table.lookup_local(loop_scope, "i").is_some());
    }
}
