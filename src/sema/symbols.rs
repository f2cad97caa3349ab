//! Symbols and scopes
//!
//! Scopes form a tree (global -> module -> function -> block) stored in an
//! arena and addressed by integer ids, so symbols and scopes can refer to
//! each other without reference cycles. Name resolution walks from the
//! current scope to the root.

use super::types::TypeId;
use crate::parser::ast::NodeId;
use crate::source::SourceLocation;
use std::collections::HashMap;

/// Symbol arena id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(pub u32);

/// Scope arena id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

/// What a symbol names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// Local or module-level variable
    Variable,
    /// Function parameter
    Parameter,
    /// Function
    Function,
    /// Type alias
    Type,
    /// Enum type
    Enum,
    /// One member of an enum (a byte constant)
    EnumMember,
    /// Memory-mapped struct pinned at a fixed address
    MappedVariable,
    /// Name brought in by an import
    ImportedSymbol,
}

/// Physical placement directive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    /// Zero page ($02-$71, packed under the 112-byte budget)
    ZeroPage,
    /// Main RAM (the default)
    Ram,
    /// Read-only data region
    Data,
    /// Memory-mapped at a fixed absolute address
    Map,
}

/// A declared name
#[derive(Debug, Clone)]
pub struct Symbol {
    /// Declared name
    pub name: String,
    /// What the name refers to
    pub kind: SymbolKind,
    /// Physical placement
    pub storage: StorageClass,
    /// Declared with `const`
    pub is_const: bool,
    /// Visible to other modules
    pub is_exported: bool,
    /// Declaration node
    pub decl: NodeId,
    /// Resolved type; late-bound by the type resolver
    pub ty: Option<TypeId>,
    /// Owning scope
    pub scope: ScopeId,
    /// Declaration location
    pub loc: SourceLocation,
    /// Compile-time value for constants and enum members
    pub const_value: Option<u32>,
    /// Module an imported symbol comes from
    pub imported_from: Option<String>,
}

/// Kinds of scope in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Root of the tree
    Global,
    /// One per module
    Module,
    /// Function body
    Function,
    /// Nested block (loop or branch body)
    Block,
}

/// One scope: a name table plus its parent link
#[derive(Debug, Clone)]
pub struct Scope {
    /// Arena id of this scope
    pub id: ScopeId,
    /// Parent scope; `None` only for the root
    pub parent: Option<ScopeId>,
    /// What introduced the scope
    pub kind: ScopeKind,
    names: HashMap<String, SymbolId>,
}

/// One field of a memory-mapped struct, with its resolved layout
#[derive(Debug, Clone)]
pub struct MappedField {
    /// Field name
    pub name: String,
    /// Field type
    pub ty: TypeId,
    /// Offset from the struct base
    pub offset: u32,
    /// Element count when the field is an array (a register range)
    pub len: Option<u32>,
}

/// Layout of a memory-mapped struct
#[derive(Debug, Clone)]
pub struct MappedStruct {
    /// Base address
    pub base: u32,
    /// Fields in declaration order with resolved offsets
    pub fields: Vec<MappedField>,
    /// Total extent in bytes
    pub size: u32,
}

impl MappedStruct {
    /// Find a field by name
    pub fn field(&self, name: &str) -> Option<&MappedField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Arena-backed symbol table for one module
#[derive(Debug, Clone)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
    symbols: Vec<Symbol>,
    /// Scope holding the module's top-level declarations
    pub module_scope: ScopeId,
    /// Layouts of `@map` structs declared in this module
    pub mapped: HashMap<SymbolId, MappedStruct>,
}

impl SymbolTable {
    /// Creates a table with a global root and one module scope
    pub fn new() -> Self {
        let root = Scope {
            id: ScopeId(0),
            parent: None,
            kind: ScopeKind::Global,
            names: HashMap::new(),
        };
        let module = Scope {
            id: ScopeId(1),
            parent: Some(ScopeId(0)),
            kind: ScopeKind::Module,
            names: HashMap::new(),
        };
        SymbolTable {
            scopes: vec![root, module],
            symbols: Vec::new(),
            module_scope: ScopeId(1),
            mapped: HashMap::new(),
        }
    }

    /// Opens a child scope
    pub fn push_scope(&mut self, parent: ScopeId, kind: ScopeKind) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope {
            id,
            parent: Some(parent),
            kind,
            names: HashMap::new(),
        });
        id
    }

    /// Declares a symbol in a scope. On a duplicate the existing symbol id
    /// is returned as the error payload so callers can point at it.
    pub fn declare(&mut self, scope: ScopeId, symbol: Symbol) -> Result<SymbolId, SymbolId> {
        if let Some(&existing) = self.scopes[scope.0 as usize].names.get(&symbol.name) {
            return Err(existing);
        }
        let id = SymbolId(self.symbols.len() as u32);
        self.scopes[scope.0 as usize]
            .names
            .insert(symbol.name.clone(), id);
        self.symbols.push(symbol);
        Ok(id)
    }

    /// Resolves a name by walking from `scope` to the root
    pub fn lookup(&self, scope: ScopeId, name: &str) -> Option<SymbolId> {
        let mut current = Some(scope);
        while let Some(scope_id) = current {
            let scope = &self.scopes[scope_id.0 as usize];
            if let Some(&id) = scope.names.get(name) {
                return Some(id);
            }
            current = scope.parent;
        }
        None
    }

    /// Resolves a name in exactly one scope, without walking up
    pub fn lookup_local(&self, scope: ScopeId, name: &str) -> Option<SymbolId> {
        self.scopes[scope.0 as usize].names.get(name).copied()
    }

    /// Symbol by id
    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0 as usize]
    }

    /// Mutable symbol by id (used by the type resolver to late-bind types)
    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0 as usize]
    }

    /// Scope by id
    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    /// All symbols in arena order
    pub fn symbols(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> {
        self.symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (SymbolId(i as u32), s))
    }

    /// Symbols declared directly in the module scope
    pub fn module_symbols(&self) -> Vec<SymbolId> {
        let mut ids: Vec<SymbolId> = self.scopes[self.module_scope.0 as usize]
            .names
            .values()
            .copied()
            .collect();
        ids.sort_by_key(|id| id.0);
        ids
    }

    /// Number of symbols
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// True when no symbols are declared
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceLocation;

    fn sym(name: &str, scope: ScopeId) -> Symbol {
        Symbol {
            name: name.to_string(),
            kind: SymbolKind::Variable,
            storage: StorageClass::Ram,
            is_const: false,
            is_exported: false,
            decl: NodeId(0),
            ty: None,
            scope,
            loc: SourceLocation::start_of("t.bl65"),
            const_value: None,
            imported_from: None,
        }
    }

    #[test]
    fn test_declare_and_lookup() {
        let mut table = SymbolTable::new();
        let scope = table.module_scope;
        let id = table.declare(scope, sym("x", scope)).unwrap();
        assert_eq!(table.lookup(scope, "x"), Some(id));
        assert_eq!(table.lookup(scope, "y"), None);
    }

    #[test]
    fn test_duplicate_detection() {
        let mut table = SymbolTable::new();
        let scope = table.module_scope;
        let first = table.declare(scope, sym("x", scope)).unwrap();
        let err = table.declare(scope, sym("x", scope)).unwrap_err();
        assert_eq!(err, first);
    }

    #[test]
    fn test_scope_chain_resolution() {
        let mut table = SymbolTable::new();
        let module = table.module_scope;
        let outer = table.declare(module, sym("x", module)).unwrap();

        let func = table.push_scope(module, ScopeKind::Function);
        let block = table.push_scope(func, ScopeKind::Block);

        // Inner scopes see the outer declaration
        assert_eq!(table.lookup(block, "x"), Some(outer));
        // But local lookup does not walk up
        assert_eq!(table.lookup_local(block, "x"), None);

        // Shadowing in the block wins
        let shadow = table.declare(block, sym("x", block)).unwrap();
        assert_eq!(table.lookup(block, "x"), Some(shadow));
        assert_eq!(table.lookup(func, "x"), Some(outer));
    }
}
