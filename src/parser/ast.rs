//! Abstract syntax tree for Blend65
//!
//! Nodes are structurally immutable after parsing. Every node carries a
//! [`SourceLocation`] and a [`NodeId`]; analysis results (resolved types,
//! coercion markers, optimization hints) attach out-of-band through
//! [`NodeMetadata`] rather than mutable node fields.

use crate::source::SourceLocation;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identity of an AST node, unique within one parsed program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// One parsed module (one source file)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    /// Module name from the `module` header, or `global` when implicit
    pub module_name: String,
    /// True when no explicit `module` declaration was present
    pub implicit_module: bool,
    /// Source file name
    pub file: String,
    /// Import declarations at file head
    pub imports: Vec<ImportDecl>,
    /// Top-level declarations
    pub decls: Vec<Decl>,
    /// Span of the whole file
    pub loc: SourceLocation,
}

/// `import a, b from some.module`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportDecl {
    /// Node identity
    pub id: NodeId,
    /// Imported names
    pub names: Vec<String>,
    /// Source module path
    pub module: String,
    /// Span of the declaration
    pub loc: SourceLocation,
}

/// Top-level declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Decl {
    /// Function declaration
    Function(FunctionDecl),
    /// Module-level variable or constant
    Variable(VarDecl),
    /// `type Name = T`
    TypeAlias(TypeAliasDecl),
    /// `enum Name ... end enum`
    Enum(EnumDecl),
    /// `@map name at $addr ... end map`
    MemoryMap(MemoryMapDecl),
}

impl Decl {
    /// Span of the declaration
    pub fn loc(&self) -> &SourceLocation {
        match self {
            Decl::Function(d) => &d.loc,
            Decl::Variable(d) => &d.loc,
            Decl::TypeAlias(d) => &d.loc,
            Decl::Enum(d) => &d.loc,
            Decl::MemoryMap(d) => &d.loc,
        }
    }

    /// Declared name
    pub fn name(&self) -> &str {
        match self {
            Decl::Function(d) => &d.name,
            Decl::Variable(d) => &d.name,
            Decl::TypeAlias(d) => &d.name,
            Decl::Enum(d) => &d.name,
            Decl::MemoryMap(d) => &d.name,
        }
    }

    /// Node identity
    pub fn id(&self) -> NodeId {
        match self {
            Decl::Function(d) => d.id,
            Decl::Variable(d) => d.id,
            Decl::TypeAlias(d) => d.id,
            Decl::Enum(d) => d.id,
            Decl::MemoryMap(d) => d.id,
        }
    }
}

/// Function declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    /// Node identity
    pub id: NodeId,
    /// Function name
    pub name: String,
    /// Parameter list
    pub params: Vec<Param>,
    /// Return type annotation; `None` means void
    pub ret: Option<TypeExpr>,
    /// Body statements
    pub body: Vec<Stmt>,
    /// Marked with `export`
    pub exported: bool,
    /// Empty body: an intrinsic stub (built-in `system` module)
    pub is_stub: bool,
    /// Span of the declaration
    pub loc: SourceLocation,
}

/// Function parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    /// Node identity
    pub id: NodeId,
    /// Parameter name
    pub name: String,
    /// Type annotation
    pub ty: TypeExpr,
    /// Span of the parameter
    pub loc: SourceLocation,
}

/// Storage class attribute on a variable declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageAttr {
    /// `@zeropage` - packed into the zero page
    ZeroPage,
    /// `@ram` - main RAM (the default)
    Ram,
    /// `@data` - read-only data region, constant initializer required
    Data,
}

/// Variable or constant declaration (module- or function-scoped)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarDecl {
    /// Node identity
    pub id: NodeId,
    /// Variable name
    pub name: String,
    /// Type annotation; may be omitted when inferable
    pub ty: Option<TypeExpr>,
    /// Initializer expression
    pub init: Option<Expr>,
    /// Declared with `const`
    pub is_const: bool,
    /// Storage class attribute, when present
    pub storage: Option<StorageAttr>,
    /// Marked with `export`
    pub exported: bool,
    /// Span of the declaration
    pub loc: SourceLocation,
}

/// `type Name = T`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeAliasDecl {
    /// Node identity
    pub id: NodeId,
    /// Alias name
    pub name: String,
    /// Aliased type
    pub ty: TypeExpr,
    /// Marked with `export`
    pub exported: bool,
    /// Span of the declaration
    pub loc: SourceLocation,
}

/// Enum declaration; members are byte constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumDecl {
    /// Node identity
    pub id: NodeId,
    /// Enum name
    pub name: String,
    /// Members in declaration order
    pub members: Vec<EnumMember>,
    /// Marked with `export`
    pub exported: bool,
    /// Span of the declaration
    pub loc: SourceLocation,
}

/// One enum member, with optional explicit value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumMember {
    /// Node identity
    pub id: NodeId,
    /// Member name
    pub name: String,
    /// Explicit value; successors auto-increment
    pub value: Option<u32>,
    /// Span of the member
    pub loc: SourceLocation,
}

/// Memory-mapped structure pinned at a fixed address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMapDecl {
    /// Node identity
    pub id: NodeId,
    /// Struct name (e.g. `vic`)
    pub name: String,
    /// Base address
    pub base: u32,
    /// Fields with offsets
    pub fields: Vec<MapField>,
    /// Marked with `export`
    pub exported: bool,
    /// Span of the declaration
    pub loc: SourceLocation,
}

/// One field of a memory map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapField {
    /// Node identity
    pub id: NodeId,
    /// Field name
    pub name: String,
    /// Field type (byte, word, or fixed-size array)
    pub ty: TypeExpr,
    /// Explicit offset from the base; sequential when omitted
    pub offset: Option<u32>,
    /// Span of the field
    pub loc: SourceLocation,
}

/// Type annotation as written in source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeExpr {
    /// Shape of the annotation
    pub kind: TypeExprKind,
    /// Span of the annotation
    pub loc: SourceLocation,
}

/// Shapes a type annotation can take
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeExprKind {
    /// Named type: `byte`, `word`, `boolean`, `void`, `string`, or an alias
    Named(String),
    /// Array `T[N]`; size omitted means inferred from the initializer
    Array(Box<TypeExpr>, Option<u32>),
    /// Pointer `*T`
    Pointer(Box<TypeExpr>),
    /// Callback (function pointer): `callback(params): ret`
    Callback(Vec<TypeExpr>, Option<Box<TypeExpr>>),
}

/// Statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    /// Node identity
    pub id: NodeId,
    /// Statement shape
    pub kind: StmtKind,
    /// Span of the statement
    pub loc: SourceLocation,
}

/// Statement shapes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StmtKind {
    /// Local declaration
    Let(VarDecl),
    /// `if cond then ... [else ...] end if`
    If {
        /// Branch condition
        cond: Expr,
        /// Taken when the condition is true
        then_body: Vec<Stmt>,
        /// Taken when the condition is false
        else_body: Option<Vec<Stmt>>,
    },
    /// `while cond ... end while`
    While {
        /// Loop condition
        cond: Expr,
        /// Loop body
        body: Vec<Stmt>,
    },
    /// `for i = from to to [step s] ... next`
    For {
        /// Induction variable name
        var: String,
        /// Node standing in for the induction variable's declaration
        var_id: NodeId,
        /// Initial value
        from: Expr,
        /// Inclusive upper bound
        to: Expr,
        /// Step expression; defaults to 1
        step: Option<Expr>,
        /// Loop body
        body: Vec<Stmt>,
    },
    /// `match x case v ... [default ...] end match`
    Match {
        /// Value being matched
        scrutinee: Expr,
        /// Case arms in order
        cases: Vec<MatchCase>,
        /// Default arm
        default: Option<Vec<Stmt>>,
    },
    /// `break`
    Break,
    /// `continue`
    Continue,
    /// `return [expr]`
    Return(Option<Expr>),
    /// Expression in statement position
    Expression(Expr),
    /// Inline assembly passed through to the output
    Asm(String),
}

/// One `case` arm of a match statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCase {
    /// Case value (constant expression)
    pub value: Expr,
    /// Arm body
    pub body: Vec<Stmt>,
    /// Span of the arm
    pub loc: SourceLocation,
}

/// Expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    /// Node identity
    pub id: NodeId,
    /// Expression shape
    pub kind: ExprKind,
    /// Span of the expression
    pub loc: SourceLocation,
}

/// Expression shapes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    /// Integer literal (byte when <= 255, else word)
    Number(u32),
    /// String literal
    Str(String),
    /// Boolean literal
    Bool(bool),
    /// `[a, b, c]`
    ArrayLiteral(Vec<Expr>),
    /// Name reference
    Identifier(String),
    /// Binary operation
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        lhs: Box<Expr>,
        /// Right operand
        rhs: Box<Expr>,
    },
    /// Unary operation
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand
        operand: Box<Expr>,
    },
    /// Assignment; `op` is the compound operator when not a plain `=`
    Assign {
        /// Compound operator (`+=` carries `Add`), `None` for `=`
        op: Option<BinaryOp>,
        /// Assignment target (identifier, index, or member)
        target: Box<Expr>,
        /// Assigned value
        value: Box<Expr>,
    },
    /// Call expression
    Call {
        /// Callee (identifier or callback-typed expression)
        callee: Box<Expr>,
        /// Arguments left to right
        args: Vec<Expr>,
    },
    /// `base[index]`
    Index {
        /// Indexed value
        base: Box<Expr>,
        /// Index expression
        index: Box<Expr>,
    },
    /// `base.member`
    Member {
        /// Accessed value
        base: Box<Expr>,
        /// Member name
        member: String,
    },
    /// `cond ? a : b`
    Ternary {
        /// Condition
        cond: Box<Expr>,
        /// Value when true
        then_expr: Box<Expr>,
        /// Value when false
        else_expr: Box<Expr>,
    },
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
    /// `&`
    BitAnd,
    /// `|`
    BitOr,
    /// `^`
    BitXor,
    /// `<<`
    Shl,
    /// `>>`
    Shr,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `&&` / `and`
    LogicalAnd,
    /// `||` / `or`
    LogicalOr,
}

impl BinaryOp {
    /// Comparison operators produce boolean results
    pub fn is_comparison(&self) -> bool {
        use BinaryOp::*;
        matches!(self, Eq | Ne | Lt | Le | Gt | Ge)
    }

    /// Short-circuit logical operators
    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::LogicalAnd | BinaryOp::LogicalOr)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::LogicalAnd => "&&",
            BinaryOp::LogicalOr => "||",
        };
        write!(f, "{}", s)
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    /// `-`
    Neg,
    /// `!` / `not`
    LogicalNot,
    /// `~`
    BitNot,
    /// `@` address-of
    AddressOf,
}

/// Implicit conversion kinds inserted by the type checker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoercionKind {
    /// byte -> word
    ZeroExtend,
    /// word -> byte (explicit contexts only)
    Truncate,
    /// boolean -> byte
    BoolToByte,
    /// byte -> boolean
    ByteToBool,
}

/// Keys for out-of-band node metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKey {
    /// Resolved type of an expression (type table id)
    ResolvedType,
    /// Coercion applied to an expression's value before use
    Coercion,
    /// Call resolves to an intrinsic registry entry
    IntrinsicCall,
    /// For loop qualifies for an X/Y index register counter
    LoopRegisterCandidate,
    /// Compile-time constant value of the expression
    ConstantValue,
    /// Symbol a name reference resolved to (symbol table id)
    SymbolRef,
    /// Inferred element count for an unsized array declaration
    InferredArraySize,
}

/// Metadata values, deliberately plain so the map stays type-erased
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    /// A type table id
    Type(u32),
    /// A coercion marker
    Coercion(CoercionKind),
    /// A symbol table id
    Symbol(u32),
    /// An integer payload
    Number(u32),
    /// A flag payload
    Flag(bool),
}

/// Out-of-band key/value metadata attached to AST nodes
#[derive(Debug, Clone, Default)]
pub struct NodeMetadata {
    entries: HashMap<(NodeId, MetadataKey), MetadataValue>,
}

impl NodeMetadata {
    /// Create an empty metadata map
    pub fn new() -> Self {
        NodeMetadata::default()
    }

    /// Attach a value to a node under a key, replacing any previous value
    pub fn set(&mut self, node: NodeId, key: MetadataKey, value: MetadataValue) {
        self.entries.insert((node, key), value);
    }

    /// Read a value back
    pub fn get(&self, node: NodeId, key: MetadataKey) -> Option<&MetadataValue> {
        self.entries.get(&(node, key))
    }

    /// Resolved type id of an expression, when the checker recorded one
    pub fn type_of(&self, node: NodeId) -> Option<u32> {
        match self.get(node, MetadataKey::ResolvedType) {
            Some(MetadataValue::Type(id)) => Some(*id),
            _ => None,
        }
    }

    /// Record an expression's resolved type id
    pub fn set_type(&mut self, node: NodeId, type_id: u32) {
        self.set(node, MetadataKey::ResolvedType, MetadataValue::Type(type_id));
    }

    /// Coercion marker on an expression, if any
    pub fn coercion_of(&self, node: NodeId) -> Option<CoercionKind> {
        match self.get(node, MetadataKey::Coercion) {
            Some(MetadataValue::Coercion(kind)) => Some(*kind),
            _ => None,
        }
    }

    /// Record a coercion marker
    pub fn set_coercion(&mut self, node: NodeId, kind: CoercionKind) {
        self.set(node, MetadataKey::Coercion, MetadataValue::Coercion(kind));
    }

    /// Symbol id a name reference resolved to
    pub fn symbol_of(&self, node: NodeId) -> Option<u32> {
        match self.get(node, MetadataKey::SymbolRef) {
            Some(MetadataValue::Symbol(id)) => Some(*id),
            _ => None,
        }
    }

    /// Record the symbol a name reference resolved to
    pub fn set_symbol(&mut self, node: NodeId, symbol_id: u32) {
        self.set(node, MetadataKey::SymbolRef, MetadataValue::Symbol(symbol_id));
    }

    /// Compile-time constant value, when known
    pub fn constant_of(&self, node: NodeId) -> Option<u32> {
        match self.get(node, MetadataKey::ConstantValue) {
            Some(MetadataValue::Number(v)) => Some(*v),
            _ => None,
        }
    }

    /// Number of entries (for diagnostics and tests)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no metadata has been attached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_roundtrip() {
        let mut meta = NodeMetadata::new();
        let node = NodeId(7);

        meta.set_type(node, 3);
        meta.set_coercion(node, CoercionKind::ZeroExtend);

        assert_eq!(meta.type_of(node), Some(3));
        assert_eq!(meta.coercion_of(node), Some(CoercionKind::ZeroExtend));
        assert_eq!(meta.type_of(NodeId(8)), None);
    }

    #[test]
    fn test_metadata_overwrite() {
        let mut meta = NodeMetadata::new();
        meta.set_type(NodeId(1), 2);
        meta.set_type(NodeId(1), 5);
        assert_eq!(meta.type_of(NodeId(1)), Some(5));
        assert_eq!(meta.len(), 1);
    }

    #[test]
    fn test_operator_classes() {
        assert!(BinaryOp::Lt.is_comparison());
        assert!(!BinaryOp::Add.is_comparison());
        assert!(BinaryOp::LogicalOr.is_logical());
        assert_eq!(BinaryOp::Shl.to_string(), "<<");
    }
}
