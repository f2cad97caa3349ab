//! # Blend65 - A Systems Language Compiler for the MOS 6502
//!
//! Blend65 is an ahead-of-time compiler for a statically typed systems
//! language targeting the 6502 family, notably the Commodore 64. Source
//! files compile to ACME-syntax assembly. The language is hardware-aware:
//! variables can be pinned to memory through `@map` declarations, storage
//! classes place data in the zero page, main RAM, or a read-only data
//! region, and built-in intrinsics expose raw loads, stores, and CPU
//! control.
//!
//! ## Pipeline
//!
//! ```text
//! Sources -> Scanner -> Parser -> AST
//!   -> SemanticAnalyzer (symbols, types, control flow, modules, layout)
//!   -> IlGenerator -> SsaConstructor -> Optimizer
//!   -> CodeGenerator (6502 / ACME)
//! ```
//!
//! ## Quick start
//!
//! ```rust
//! use blend65::{Compiler, CompileOptions, SourceFile};
//!
//! let source = r#"
//! export function main()
//!   poke($d020, 0)
//! end function
//! "#;
//!
//! let compiler = Compiler::new(CompileOptions::default());
//! let output = compiler
//!     .compile(&[SourceFile::new("main.bl65", source)])
//!     .expect("internal compiler error");
//!
//! assert!(output.succeeded());
//! assert!(output.assembly.contains("sta $d020"));
//! ```
//!
//! Bad source never panics and never returns `Err`; problems accumulate
//! as diagnostics on the output:
//!
//! ```rust
//! use blend65::{Compiler, CompileOptions, SourceFile};
//!
//! let output = Compiler::new(CompileOptions::default())
//!     .compile(&[SourceFile::new("bad.bl65", "export function main()\n  x = 1\nend function\n")])
//!     .unwrap();
//!
//! assert!(!output.succeeded());
//! assert!(output.diagnostics.has_errors());
//! ```

pub mod codegen;
pub mod compiler;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod ir;
pub mod lexer;
pub mod optimizer;
pub mod parser;
pub mod sema;
pub mod source;
pub mod ssa;

pub use compiler::{CompileOptions, CompileOutput, Compiler, SourceFile};
pub use config::{CompilerConfig, ExitBehavior, ExitCode, OptLevel};
pub use diagnostics::{Diagnostic, DiagnosticBag, DiagnosticCode, Severity};
pub use error::{Error, Result};
pub use lexer::{Scanner, Token, TokenKind};
pub use parser::{Parser, Program};
pub use sema::{AnalysisResult, SemanticAnalyzer};
pub use source::{SourceLocation, SourcePosition};

/// Version of the Blend65 compiler
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
