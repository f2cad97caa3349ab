//! Compilation session facade
//!
//! Drives the whole pipeline over one batch of sources:
//! lex -> parse -> semantic analysis -> IL -> SSA -> optimize -> 6502.
//! User-facing problems come back as diagnostics on the output; `Err` is
//! reserved for configuration problems and internal compiler errors. The
//! built-in `system` module joins every batch automatically.

use crate::codegen::asm::SourceMapEntry;
use crate::codegen::{CodeGenerator, CodegenOptions};
use crate::config::{CompilerConfig, ExitBehavior, OptLevel};
use crate::diagnostics::DiagnosticBag;
use crate::error::Result;
use crate::ir::IlGenerator;
use crate::lexer::Scanner;
use crate::optimizer::Optimizer;
use crate::parser::{Parser, Program};
use crate::sema::{SemanticAnalyzer, SYSTEM_SOURCE};
use crate::ssa::SsaConstructor;

/// One input file
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// File name used in diagnostics and the source map
    pub name: String,
    /// Source text
    pub text: String,
}

impl SourceFile {
    /// Creates a source file from name and text
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        SourceFile {
            name: name.into(),
            text: text.into(),
        }
    }
}

/// Compilation options
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Target machine
    pub target: String,
    /// Optimization level
    pub optimization: OptLevel,
    /// Behavior after `main` returns
    pub exit_behavior: ExitBehavior,
    /// Emit the source map
    pub debug_info: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            target: "c64".to_string(),
            optimization: OptLevel::default(),
            exit_behavior: ExitBehavior::default(),
            debug_info: false,
        }
    }
}

impl From<&CompilerConfig> for CompileOptions {
    fn from(config: &CompilerConfig) -> Self {
        CompileOptions {
            target: config.target.clone(),
            optimization: config.optimization,
            exit_behavior: config.exit_behavior,
            debug_info: false,
        }
    }
}

/// Result of one compilation
#[derive(Debug)]
pub struct CompileOutput {
    /// Generated ACME assembly; empty when compilation failed
    pub assembly: String,
    /// Generated-line -> source mapping (with `debug_info`)
    pub source_map: Vec<SourceMapEntry>,
    /// Everything reported along the way
    pub diagnostics: DiagnosticBag,
    /// IL instructions after optimization
    pub il_instruction_count: usize,
    /// Lines of generated assembly
    pub asm_line_count: usize,
}

impl CompileOutput {
    /// True when no errors were reported
    pub fn succeeded(&self) -> bool {
        !self.diagnostics.has_errors() && !self.assembly.is_empty()
    }

    fn failed(diagnostics: DiagnosticBag) -> Self {
        CompileOutput {
            assembly: String::new(),
            source_map: Vec::new(),
            diagnostics,
            il_instruction_count: 0,
            asm_line_count: 0,
        }
    }
}

/// Batch compiler
pub struct Compiler {
    options: CompileOptions,
}

impl Compiler {
    /// Creates a compiler with options
    pub fn new(options: CompileOptions) -> Self {
        Compiler { options }
    }

    /// Compiles a batch of sources to 6502 assembly
    pub fn compile(&self, sources: &[SourceFile]) -> Result<CompileOutput> {
        let mut diags = DiagnosticBag::new();

        // Phase 1: lex + parse, the built-in system module first
        let mut programs: Vec<Program> = Vec::new();
        programs.push(self.parse_one("<system>", SYSTEM_SOURCE, &mut diags));
        for source in sources {
            programs.push(self.parse_one(&source.name, &source.text, &mut diags));
        }
        if diags.has_errors() {
            tracing::debug!(errors = diags.error_count(), "stopping after parse");
            return Ok(CompileOutput::failed(diags));
        }

        // Phase 2: semantic analysis over the whole batch
        let mut analysis = SemanticAnalyzer::new().analyze(programs);
        diags.absorb(std::mem::take(&mut analysis.diags));
        if diags.has_errors() {
            tracing::debug!(errors = diags.error_count(), "stopping after analysis");
            return Ok(CompileOutput::failed(diags));
        }

        // Phase 3: IL generation
        let mut modules = IlGenerator::new(&analysis).generate()?;

        // Phase 4: SSA construction (verification failures are fatal)
        SsaConstructor::run(&mut modules)?;

        // Phase 5: optimization
        Optimizer::new(self.options.optimization.level())
            .optimize(&mut modules, &mut diags)?;
        if diags.has_errors() {
            return Ok(CompileOutput::failed(diags));
        }

        // Phase 6: 6502 code generation
        let output = CodeGenerator::new(CodegenOptions {
            exit_behavior: self.options.exit_behavior,
            debug: self.options.debug_info,
        })
        .generate(&modules)?;

        let il_instruction_count = modules
            .iter()
            .flat_map(|m| m.functions.iter())
            .map(|f| f.instruction_count())
            .sum();

        Ok(CompileOutput {
            assembly: output.assembly,
            source_map: output.source_map,
            diagnostics: diags,
            il_instruction_count,
            asm_line_count: output.lines,
        })
    }

    fn parse_one(&self, name: &str, text: &str, diags: &mut DiagnosticBag) -> Program {
        let tokens = Scanner::new(text, name).scan_tokens(diags);
        let (program, parse_diags) = Parser::new(tokens, name).parse();
        diags.absorb(parse_diags);
        program
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticCode;

    fn compile(source: &str) -> CompileOutput {
        Compiler::new(CompileOptions::default())
            .compile(&[SourceFile::new("main.bl65", source)])
            .unwrap()
    }

    #[test]
    fn test_end_to_end_success() {
        let output = compile(
            "export function main()\n  poke($d020, 0)\nend function\n",
        );
        assert!(output.succeeded(), "{:?}", output.diagnostics.diagnostics());
        assert!(output.assembly.contains("* = $0801"));
        assert!(output.asm_line_count > 0);
        assert!(output.il_instruction_count > 0);
    }

    #[test]
    fn test_parse_errors_stop_pipeline() {
        let output = compile("function (\n");
        assert!(!output.succeeded());
        assert!(output.assembly.is_empty());
        assert!(output.diagnostics.has_errors());
    }

    #[test]
    fn test_semantic_errors_stop_pipeline() {
        let output = compile(
            "export function main()\n  poke($d020, missing)\nend function\n",
        );
        assert!(!output.succeeded());
        assert!(output
            .diagnostics
            .find(DiagnosticCode::UndefinedVariable)
            .is_some());
    }

    #[test]
    fn test_system_imports_work() {
        let output = compile(
            "module game\nimport peek, poke from system\nexport function main()\n  poke($d020, peek($d021))\nend function\n",
        );
        assert!(output.succeeded(), "{:?}", output.diagnostics.diagnostics());
    }

    #[test]
    fn test_debug_info_produces_source_map() {
        let options = CompileOptions {
            debug_info: true,
            ..Default::default()
        };
        let output = Compiler::new(options)
            .compile(&[SourceFile::new(
                "main.bl65",
                "export function main()\n  poke($d020, 0)\nend function\n",
            )])
            .unwrap();
        assert!(output.succeeded());
        assert!(!output.source_map.is_empty());
        assert!(output
            .source_map
            .iter()
            .any(|e| e.loc.file() == "main.bl65"));
    }
}
