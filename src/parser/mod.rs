//! Parser module - recursive descent + Pratt expression parsing

pub mod ast;
#[allow(clippy::module_inception)]
pub mod parser;

pub use ast::{
    BinaryOp, CoercionKind, Decl, EnumDecl, Expr, ExprKind, FunctionDecl, ImportDecl, MapField,
    MatchCase, MemoryMapDecl, MetadataKey, MetadataValue, NodeId, NodeMetadata, Param, Program,
    Stmt, StmtKind, StorageAttr, TypeAliasDecl, TypeExpr, TypeExprKind, UnaryOp, VarDecl,
};
pub use parser::Parser;
