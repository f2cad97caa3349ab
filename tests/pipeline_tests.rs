//! End-to-end pipeline tests
//!
//! Each test drives the full compiler over real source text:
//! Scanner -> Parser -> SemanticAnalyzer -> IlGenerator -> SsaConstructor
//! -> Optimizer -> CodeGenerator.

use blend65::diagnostics::DiagnosticBag;
use blend65::ir::{IlGenerator, IlModule, Opcode};
use blend65::optimizer::Optimizer;
use blend65::sema::analyze_sources;
use blend65::ssa::SsaConstructor;
use blend65::{CompileOptions, Compiler, ExitBehavior, OptLevel, SourceFile};

fn compile(source: &str) -> blend65::CompileOutput {
    Compiler::new(CompileOptions::default())
        .compile(&[SourceFile::new("main.bl65", source)])
        .unwrap()
}

fn compile_with(source: &str, options: CompileOptions) -> blend65::CompileOutput {
    Compiler::new(options)
        .compile(&[SourceFile::new("main.bl65", source)])
        .unwrap()
}

/// Builds optimized IL without the backend, for IL-level assertions
fn optimized_il(source: &str, level: u8) -> Vec<IlModule> {
    let analysis = analyze_sources(&[("main.bl65", source)]);
    assert!(
        !analysis.has_errors(),
        "analysis failed: {:?}",
        analysis.diags.diagnostics()
    );
    let mut modules = IlGenerator::new(&analysis).generate().unwrap();
    SsaConstructor::run(&mut modules).unwrap();
    let mut diags = DiagnosticBag::new();
    Optimizer::new(level)
        .optimize(&mut modules, &mut diags)
        .unwrap();
    modules
}

// =============================================================================
// SCENARIO 1: byte arithmetic
// =============================================================================

#[test]
fn test_byte_arithmetic_il_shape() {
    let source = "function f(): byte\n  let x: byte = 2 + 3\n  return x\nend function\nexport function main()\n  poke($d020, f())\nend function\n";

    // Unoptimized: Const 2, Const 3, Add, Return
    let modules = optimized_il(source, 0);
    let f = modules[0].function("f").unwrap();
    let ops: Vec<&str> = f
        .blocks
        .iter()
        .flat_map(|b| b.instructions.iter())
        .map(|i| i.op.name())
        .collect();
    assert!(ops.contains(&"const"));
    assert!(ops.contains(&"add"));
    assert!(ops.contains(&"ret"));

    // After constant folding the body reduces to Const 5 / Return
    let modules = optimized_il(source, 2);
    let f = modules[0].function("f").unwrap();
    let ops: Vec<&str> = f
        .blocks
        .iter()
        .flat_map(|b| b.instructions.iter())
        .map(|i| i.op.name())
        .collect();
    assert!(!ops.contains(&"add"), "add must fold away: {:?}", ops);
    // The folded 5 survives either as a const instruction or directly as
    // the return operand once propagation has run
    let has_const_5 = f
        .blocks
        .iter()
        .flat_map(|b| b.instructions.iter())
        .any(|i| {
            matches!(i.op, Opcode::Const | Opcode::Return)
                && i.operands
                    .first()
                    .and_then(|v| v.as_const())
                    .map(|c| c.value == 5)
                    .unwrap_or(false)
        });
    assert!(has_const_5, "{}", f);
}

// =============================================================================
// SCENARIO 2: array literal with inferred size
// =============================================================================

#[test]
fn test_array_literal_inferred_size() {
    let output = compile(
        "let colors: byte[] = [2, 5, 6]\nexport function main()\n  poke($d020, colors[1])\nend function\n",
    );
    assert!(output.succeeded(), "{:?}", output.diagnostics.diagnostics());
    assert!(
        output.assembly.contains("!byte $02, $05, $06"),
        "{}",
        output.assembly
    );
}

#[test]
fn test_array_size_mismatch_rejected() {
    let output = compile(
        "let colors: byte[2] = [2, 5, 6]\nexport function main()\n  poke($d020, colors[0])\nend function\n",
    );
    assert!(!output.succeeded());
}

// =============================================================================
// SCENARIO 3: circular imports
// =============================================================================

#[test]
fn test_circular_imports_halt_pipeline() {
    let output = Compiler::new(CompileOptions::default())
        .compile(&[
            SourceFile::new(
                "a.bl65",
                "module a\nimport g from b\nexport function main()\n  g()\nend function\n",
            ),
            SourceFile::new(
                "b.bl65",
                "module b\nimport main from a\nexport function g()\n  nop()\nend function\n",
            ),
        ])
        .unwrap();
    assert!(!output.succeeded());
    let cycle = output
        .diagnostics
        .find(blend65::DiagnosticCode::CircularImport)
        .expect("cycle must be reported");
    assert!(cycle.message.contains("a"));
    assert!(cycle.message.contains("b"));
    assert!(cycle.message.contains("->"));
}

// =============================================================================
// SCENARIO 4: call vs void call, compile-time length
// =============================================================================

#[test]
fn test_call_variants_and_length() {
    let source = "function g(): byte\n  return 42\nend function\nfunction h()\n  nop()\nend function\nfunction len(): word\n  return length(\"hello\")\nend function\nexport function main()\n  let x: byte = g()\n  h()\n  pokew($0400, len())\n  poke($d020, x)\nend function\n";

    let modules = optimized_il(source, 0);
    let main = modules[0].function("main").unwrap();
    let ops: Vec<String> = main
        .blocks
        .iter()
        .flat_map(|b| b.instructions.iter())
        .map(|i| format!("{:?}", i.op))
        .collect();
    assert!(ops.iter().any(|o| o.starts_with("Call(")), "{:?}", ops);
    assert!(ops.iter().any(|o| o.starts_with("CallVoid(")), "{:?}", ops);

    // length("hello") folded to a constant 5 inside len()
    let len = modules[0].function("len").unwrap();
    let has_const_5 = len
        .blocks
        .iter()
        .flat_map(|b| b.instructions.iter())
        .any(|i| {
            i.op == Opcode::Const
                && i.operands[0]
                    .as_const()
                    .map(|c| c.value == 5)
                    .unwrap_or(false)
        });
    assert!(has_const_5, "{}", len);
}

// =============================================================================
// SCENARIO 5: raster-critical sequence
// =============================================================================

#[test]
fn test_raster_critical_sequence_pinned() {
    let source = "@map vic at $d000\n  border: byte at $20\nend map\nexport function main()\n  vic.border = 0\n  barrier()\n  vic.border = 1\nend function\n";
    let output = compile(source);
    assert!(output.succeeded(), "{:?}", output.diagnostics.diagnostics());

    let asm = &output.assembly;
    let stores: Vec<usize> = asm
        .match_indices("sta $d020")
        .map(|(at, _)| at)
        .collect();
    assert_eq!(stores.len(), 2, "both hardware writes survive:\n{}", asm);
    let barrier = asm.find("--- barrier ---").expect("barrier comment");
    assert!(stores[0] < barrier && barrier < stores[1], "{}", asm);
}

// =============================================================================
// SCENARIO 6: exit behavior
// =============================================================================

#[test]
fn test_exit_behavior_roundtrip() {
    let source = "export function main()\n  nop()\nend function\n";

    let basic = compile_with(
        source,
        CompileOptions {
            exit_behavior: ExitBehavior::Basic,
            ..Default::default()
        },
    );
    assert!(basic.assembly.contains("jmp $a474"), "{}", basic.assembly);

    let reset = compile_with(
        source,
        CompileOptions {
            exit_behavior: ExitBehavior::Reset,
            ..Default::default()
        },
    );
    assert!(reset.assembly.contains("jmp $fce2"), "{}", reset.assembly);

    let looped = compile_with(source, CompileOptions::default());
    assert!(
        looped.assembly.contains("jmp __exit_loop"),
        "{}",
        looped.assembly
    );
}

#[test]
fn test_exit_behavior_from_config() {
    let config = blend65::CompilerConfig::from_json(
        r#"{"compilerOptions": {"exitBehavior": "basic"}}"#,
    )
    .unwrap();
    let options = CompileOptions::from(&config);
    let output = compile_with("export function main()\n  nop()\nend function\n", options);
    assert!(output.assembly.contains("jmp $a474"));
}

// =============================================================================
// BOUNDARIES AND LAWS
// =============================================================================

#[test]
fn test_integer_literal_boundaries() {
    // 255 is a byte, 256 and 65535 are words, 65536 is an error
    let ok = compile(
        "export function main()\n  let a: byte = 255\n  let b: word = 256\n  let c: word = 65535\n  pokew($0400, b + c)\n  poke($d020, a)\nend function\n",
    );
    assert!(ok.succeeded(), "{:?}", ok.diagnostics.diagnostics());

    let overflow = compile(
        "export function main()\n  let c: word = 65536\n  pokew($0400, c)\nend function\n",
    );
    assert!(!overflow.succeeded());
    assert!(overflow
        .diagnostics
        .find(blend65::DiagnosticCode::InvalidNumberLiteral)
        .is_some());
}

#[test]
fn test_for_loop_counter_widths() {
    // Byte bounds fit an index register; word bounds force a word counter
    let output = compile(
        "export function main()\n  for i = 0 to 9\n    poke($d020, i)\n  next\n  for j = 0 to 999\n    pokew($0400, j)\n  next\nend function\n",
    );
    assert!(output.succeeded(), "{:?}", output.diagnostics.diagnostics());
}

#[test]
fn test_word_loop_counter_is_word_typed() {
    let modules = optimized_il(
        "export function main()\n  for j = 0 to 999\n    pokew($0400, j)\n  next\nend function\n",
        0,
    );
    let main = modules[0].function("main").unwrap();
    // The bound 999 appears as a word constant
    let has_word_bound = main
        .blocks
        .iter()
        .flat_map(|b| b.instructions.iter())
        .any(|i| {
            i.operands
                .iter()
                .filter_map(|v| v.as_const())
                .any(|c| c.value == 999)
        });
    assert!(has_word_bound, "{}", main);
}

#[test]
fn test_const_without_initializer() {
    let output = compile(
        "const SPEED: byte\nexport function main()\n  poke($d020, 0)\nend function\n",
    );
    assert!(!output.succeeded());
    assert!(output
        .diagnostics
        .find(blend65::DiagnosticCode::MissingConstInitializer)
        .is_some());
}

#[test]
fn test_missing_main_rejected() {
    let output = compile("function helper(): byte\n  return 1\nend function\n");
    assert!(!output.succeeded());
    assert!(output
        .diagnostics
        .find(blend65::DiagnosticCode::MissingMain)
        .is_some());
}

#[test]
fn test_mapped_struct_effective_addresses() {
    // base(s) + offset(f) shows up verbatim in the assembly
    let output = compile(
        "@map vic at $d000\n  sprite0_x: byte\n  sprite0_y: byte\n  background: byte at $21\nend map\nexport function main()\n  vic.sprite0_x = 100\n  vic.sprite0_y = 50\n  vic.background = 6\nend function\n",
    );
    assert!(output.succeeded(), "{:?}", output.diagnostics.diagnostics());
    let asm = &output.assembly;
    assert!(asm.contains("sta $d000"), "{}", asm);
    assert!(asm.contains("sta $d001"), "{}", asm);
    assert!(asm.contains("sta $d021"), "{}", asm);
}

#[test]
fn test_multi_module_program() {
    let output = Compiler::new(CompileOptions::default())
        .compile(&[
            SourceFile::new(
                "util.bl65",
                "module util\nexport function double(x: byte): byte\n  return x * 2\nend function\n",
            ),
            SourceFile::new(
                "main.bl65",
                "module game\nimport double from util\nexport function main()\n  poke($d020, double(3))\nend function\n",
            ),
        ])
        .unwrap();
    assert!(output.succeeded(), "{:?}", output.diagnostics.diagnostics());
    assert!(output.assembly.contains("f_util_double"));
}

#[test]
fn test_optimizer_level_from_options() {
    let source =
        "export function main()\n  let x: byte = 2 + 3\n  poke($d020, x)\nend function\n";
    let o0 = compile_with(
        source,
        CompileOptions {
            optimization: OptLevel::O0,
            ..Default::default()
        },
    );
    let o2 = compile_with(source, CompileOptions::default());
    assert!(o0.succeeded() && o2.succeeded());
    // O2 output is at most as large as O0
    assert!(o2.asm_line_count <= o0.asm_line_count);
}

#[test]
fn test_while_loop_with_break_continue() {
    let output = compile(
        "export function main()\n  let i: byte = 0\n  while true\n    i = i + 1\n    if i == 5 then\n      continue\n    end if\n    if i > 10 then\n      break\n    end if\n  end while\n  poke($d020, i)\nend function\n",
    );
    assert!(output.succeeded(), "{:?}", output.diagnostics.diagnostics());
}

#[test]
fn test_match_statement_compiles() {
    let output = compile(
        "enum Mode\n  idle\n  run = 3\nend enum\nexport function main()\n  let m: byte = run\n  match m\n  case idle\n    poke($d020, 0)\n  case run\n    poke($d020, 1)\n  default\n    poke($d020, 2)\n  end match\nend function\n",
    );
    assert!(output.succeeded(), "{:?}", output.diagnostics.diagnostics());
}

#[test]
fn test_callback_indirect_call() {
    let output = compile(
        "function on_tick(v: byte)\n  poke($d020, v)\nend function\nexport function main()\n  let handler: callback(byte) = on_tick\n  handler(7)\nend function\n",
    );
    assert!(output.succeeded(), "{:?}", output.diagnostics.diagnostics());
    assert!(output.assembly.contains("__icall_vec"), "{}", output.assembly);
}

#[test]
fn test_inline_asm_passthrough() {
    let output = compile(
        "export function main()\n  asm\n    lda #$07\n    sta $d020\n  end asm\nend function\n",
    );
    assert!(output.succeeded(), "{:?}", output.diagnostics.diagnostics());
    assert!(output.assembly.contains("lda #$07"), "{}", output.assembly);
}
