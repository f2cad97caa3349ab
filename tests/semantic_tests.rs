//! Semantic error and warning coverage, driven through the full compiler

use blend65::{CompileOptions, Compiler, DiagnosticCode, Severity, SourceFile};

fn compile(source: &str) -> blend65::CompileOutput {
    Compiler::new(CompileOptions::default())
        .compile(&[SourceFile::new("main.bl65", source)])
        .unwrap()
}

fn has_code(output: &blend65::CompileOutput, code: DiagnosticCode) -> bool {
    output.diagnostics.find(code).is_some()
}

#[test]
fn test_undefined_variable() {
    let output = compile("export function main()\n  poke($d020, nothing)\nend function\n");
    assert!(has_code(&output, DiagnosticCode::UndefinedVariable));
}

#[test]
fn test_type_mismatch_word_to_byte() {
    let output = compile(
        "export function main()\n  let w: word = 300\n  let b: byte = w\n  poke($d020, b)\nend function\n",
    );
    assert!(has_code(&output, DiagnosticCode::TypeMismatch));
}

#[test]
fn test_widening_is_implicit() {
    let output = compile(
        "export function main()\n  let b: byte = 5\n  let w: word = b\n  pokew($0400, w)\nend function\n",
    );
    assert!(output.succeeded(), "{:?}", output.diagnostics.diagnostics());
}

#[test]
fn test_assign_to_const() {
    let output = compile(
        "const LIMIT: byte = 10\nexport function main()\n  LIMIT = 11\nend function\n",
    );
    assert!(has_code(&output, DiagnosticCode::AssignToConst));
}

#[test]
fn test_duplicate_declaration_in_scope() {
    let output = compile(
        "export function main()\n  let x: byte = 1\n  let x: byte = 2\n  poke($d020, x)\nend function\n",
    );
    assert!(has_code(&output, DiagnosticCode::DuplicateDeclaration));
}

#[test]
fn test_shadowing_in_nested_scope_allowed() {
    let output = compile(
        "export function main()\n  let x: byte = 1\n  if x == 1 then\n    let x: byte = 2\n    poke($d020, x)\n  end if\n  poke($d021, x)\nend function\n",
    );
    assert!(output.succeeded(), "{:?}", output.diagnostics.diagnostics());
}

#[test]
fn test_call_arity_checked() {
    let output = compile(
        "function f(a: byte, b: byte): byte\n  return a + b\nend function\nexport function main()\n  poke($d020, f(1))\nend function\n",
    );
    assert!(!output.succeeded());
}

#[test]
fn test_intrinsic_arity_mismatch() {
    let output = compile("export function main()\n  peek()\nend function\n");
    assert!(has_code(&output, DiagnosticCode::IntrinsicArityMismatch));
}

#[test]
fn test_return_type_mismatch() {
    let output = compile(
        "function f(): void\n  return 5\nend function\nexport function main()\n  f()\nend function\n",
    );
    assert!(has_code(&output, DiagnosticCode::ReturnTypeMismatch));
}

#[test]
fn test_missing_return_path() {
    let output = compile(
        "function f(x: byte): byte\n  if x > 0 then\n    return x\n  end if\nend function\nexport function main()\n  poke($d020, f(1))\nend function\n",
    );
    assert!(has_code(&output, DiagnosticCode::ReturnTypeMismatch));
}

#[test]
fn test_break_outside_loop() {
    let output = compile("export function main()\n  break\nend function\n");
    assert!(!output.succeeded());
}

#[test]
fn test_module_not_found() {
    let output = compile(
        "module a\nimport f from missing_module\nexport function main()\n  nop()\nend function\n",
    );
    assert!(has_code(&output, DiagnosticCode::ModuleNotFound));
}

#[test]
fn test_unexported_symbol_not_importable() {
    let output = Compiler::new(CompileOptions::default())
        .compile(&[
            SourceFile::new(
                "util.bl65",
                "module util\nfunction hidden(): byte\n  return 1\nend function\nexport function visible(): byte\n  return hidden()\nend function\n",
            ),
            SourceFile::new(
                "main.bl65",
                "module game\nimport hidden from util\nexport function main()\n  poke($d020, hidden())\nend function\n",
            ),
        ])
        .unwrap();
    assert!(has_code(&output, DiagnosticCode::UndefinedVariable));
}

#[test]
fn test_zero_page_overflow() {
    let output = compile(
        "let big: byte[120] @zeropage\nexport function main()\n  poke($d020, big[0])\nend function\n",
    );
    assert!(has_code(&output, DiagnosticCode::ZeroPageOverflow));
}

#[test]
fn test_memory_overlap_between_maps() {
    let output = compile(
        "@map a at $d000\n  x: byte[8]\nend map\n@map b at $d004\n  y: byte\nend map\nexport function main()\n  a.x[0] = 1\n  b.y = 2\nend function\n",
    );
    assert!(has_code(&output, DiagnosticCode::MemoryOverlap));
}

#[test]
fn test_length_of_unknown_size() {
    let output = compile(
        "export function main(p: *byte)\n  pokew($0400, length(p))\nend function\n",
    );
    assert!(has_code(&output, DiagnosticCode::LengthUnknownSize));
}

#[test]
fn test_unused_variable_warning() {
    let output = compile(
        "export function main()\n  let unused: byte = 1\n  poke($d020, 0)\nend function\n",
    );
    // A warning, not an error: compilation succeeds
    assert!(output.succeeded(), "{:?}", output.diagnostics.diagnostics());
    let warning = output
        .diagnostics
        .find(DiagnosticCode::UnusedVariable)
        .expect("unused variable warning");
    assert_eq!(warning.severity, Severity::Warning);
}

#[test]
fn test_unused_function_warning() {
    let output = compile(
        "function never_called()\n  nop()\nend function\nexport function main()\n  poke($d020, 0)\nend function\n",
    );
    assert!(output.succeeded());
    assert!(has_code(&output, DiagnosticCode::UnusedFunction));
}

#[test]
fn test_unreachable_code_warning() {
    let output = compile(
        "export function main()\n  return\n  poke($d020, 0)\nend function\n",
    );
    assert!(output.succeeded(), "{:?}", output.diagnostics.diagnostics());
    assert!(has_code(&output, DiagnosticCode::UnreachableCode));
}

#[test]
fn test_implicit_conversion_warning() {
    let output = compile(
        "export function main()\n  let flag: boolean = true\n  let n: byte = flag\n  poke($d020, n)\nend function\n",
    );
    assert!(output.succeeded(), "{:?}", output.diagnostics.diagnostics());
    assert!(has_code(&output, DiagnosticCode::ImplicitConversion));
}

#[test]
fn test_division_by_zero_in_folding() {
    let output = compile(
        "export function main()\n  let x: byte = 4\n  let y: byte = x / (2 - 2)\n  poke($d020, y)\nend function\n",
    );
    assert!(has_code(&output, DiagnosticCode::DivisionByZero));
}

#[test]
fn test_data_requires_constant_initializer() {
    let output = compile(
        "function f(): byte\n  return 1\nend function\nlet table: byte[2] @data = [f(), 2]\nexport function main()\n  poke($d020, table[0])\nend function\n",
    );
    assert!(!output.succeeded());
}

#[test]
fn test_warnings_do_not_block() {
    let output = compile(
        "function main()\n  let x: byte = 1\n  poke($d020, x)\nend function\n",
    );
    // Implicit main export is only a warning
    assert!(output.succeeded(), "{:?}", output.diagnostics.diagnostics());
    assert!(has_code(&output, DiagnosticCode::ImplicitMainExport));
}
