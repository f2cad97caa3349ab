//! Diagnostic collection
//!
//! Phases never throw on bad source code. Each phase appends diagnostics to
//! a [`DiagnosticBag`] and returns its result; the pipeline orchestrator
//! checks `has_errors()` at phase boundaries. Warnings never block
//! progression.

use crate::source::SourceLocation;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Informational hint
    Hint,
    /// Does not block compilation
    Warning,
    /// Blocks progression past the current phase
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Hint => write!(f, "hint"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Stable diagnostic codes, one per error/warning kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticCode {
    // Lexer
    /// Character the lexer cannot start a token with
    InvalidCharacter,
    /// String literal missing its closing quote
    UnterminatedString,
    /// Malformed or out-of-range number literal
    InvalidNumberLiteral,

    // Parser
    /// Token that does not fit the grammar at this point
    UnexpectedToken,
    /// A specific token was required but missing
    ExpectedToken,
    /// Second `module` declaration in one file
    DuplicateModule,
    /// `module` after statements already forced the implicit module
    ModuleAfterImplicit,
    /// Construct not allowed at module scope
    InvalidModuleScope,
    /// Free-standing executable code at module scope
    ExecutableAtModuleScope,
    /// Declaration after executable code where order is fixed
    DeclarationAfterCode,
    /// Block never closed before end of file
    UnterminatedBlock,
    /// Missing `end` keyword closing a block
    MissingEndKeyword,
    /// `*` in an import path
    WildcardInPath,
    /// Re-export syntax is not supported
    ReexportNotSupported,
    /// Malformed import
    InvalidImportSyntax,
    /// `export` not followed by a declaration
    ExportRequiresDeclaration,

    // Semantic
    /// Use of a name with no visible declaration
    UndefinedVariable,
    /// Types do not match and no implicit conversion applies
    TypeMismatch,
    /// `const` declared without an initializer
    MissingConstInitializer,
    /// Name declared twice in one scope
    DuplicateDeclaration,
    /// More than one exported `main` across the batch
    DuplicateExportedMain,
    /// `main` missing from the batch
    MissingMain,
    /// Imported module does not exist
    ModuleNotFound,
    /// Import cycle between modules
    CircularImport,
    /// Assignment to a `const`
    AssignToConst,
    /// Arrays cannot be reassigned as a whole
    ArrayReassignment,
    /// `@` applied to something without a static address
    AddressOfNonLvalue,
    /// Returned value does not match the function's return type
    ReturnTypeMismatch,
    /// `@map` declaration outside module scope or with non-constant address
    InvalidMemoryMapScope,
    /// Zero-page symbols exceed the 112-byte budget
    ZeroPageOverflow,
    /// Two placed symbols overlap in memory
    MemoryOverlap,
    /// Array declared without size and without an inferable initializer
    CannotInferArraySize,
    /// `length` applied to a value whose size is unknown at compile time
    LengthUnknownSize,
    /// Intrinsic called with the wrong number of arguments
    IntrinsicArityMismatch,
    /// Division by zero discovered while folding constants
    DivisionByZero,

    // Warnings / hints
    /// `main` was exported implicitly
    ImplicitMainExport,
    /// Variable never read
    UnusedVariable,
    /// Function never called and not exported
    UnusedFunction,
    /// Import never used
    UnusedImport,
    /// Statement can never execute
    UnreachableCode,
    /// Store whose value is never observed
    DeadStore,
    /// Implicit numeric conversion applied
    ImplicitConversion,
    /// Zero-page usage at or past 80% of the budget
    ZeroPageNearOverflow,
}

impl DiagnosticCode {
    /// Default severity for this code
    pub fn default_severity(&self) -> Severity {
        use DiagnosticCode::*;
        match self {
            ImplicitMainExport | UnusedVariable | UnusedFunction | UnusedImport
            | UnreachableCode | DeadStore | ImplicitConversion | ZeroPageNearOverflow => {
                Severity::Warning
            }
            _ => Severity::Error,
        }
    }
}

/// A replacement edit offered alongside a diagnostic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedFix {
    /// Human-readable description of the fix
    pub description: String,
    /// Span to replace
    pub location: SourceLocation,
    /// Replacement text
    pub replacement: String,
}

/// A single diagnostic message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Severity of the diagnostic
    pub severity: Severity,
    /// Stable code identifying the kind
    pub code: DiagnosticCode,
    /// Message text
    pub message: String,
    /// Primary source location
    pub location: SourceLocation,
    /// Related locations (e.g. the previous declaration for a duplicate)
    pub related: Vec<(String, SourceLocation)>,
    /// Suggested fixes
    pub fixes: Vec<SuggestedFix>,
}

impl Diagnostic {
    /// Create a diagnostic with the code's default severity
    pub fn new(code: DiagnosticCode, message: impl Into<String>, location: SourceLocation) -> Self {
        Diagnostic {
            severity: code.default_severity(),
            code,
            message: message.into(),
            location,
            related: Vec::new(),
            fixes: Vec::new(),
        }
    }

    /// Attach a related location
    pub fn with_related(mut self, note: impl Into<String>, location: SourceLocation) -> Self {
        self.related.push((note.into(), location));
        self
    }

    /// Attach a suggested fix
    pub fn with_fix(mut self, fix: SuggestedFix) -> Self {
        self.fixes.push(fix);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} [{:?}] at {}",
            self.severity, self.message, self.code, self.location
        )
    }
}

/// Accumulating diagnostic collector shared by all phases
#[derive(Debug, Clone, Default)]
pub struct DiagnosticBag {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticBag {
    /// Create an empty bag
    pub fn new() -> Self {
        DiagnosticBag::default()
    }

    /// Append a diagnostic
    pub fn report(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    /// Append an error with the code's default severity
    pub fn error(
        &mut self,
        code: DiagnosticCode,
        message: impl Into<String>,
        location: SourceLocation,
    ) {
        let mut d = Diagnostic::new(code, message, location);
        d.severity = Severity::Error;
        self.report(d);
    }

    /// Append a warning
    pub fn warn(
        &mut self,
        code: DiagnosticCode,
        message: impl Into<String>,
        location: SourceLocation,
    ) {
        let mut d = Diagnostic::new(code, message, location);
        d.severity = Severity::Warning;
        self.report(d);
    }

    /// True if any error-severity diagnostic was reported
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Number of error-severity diagnostics
    pub fn error_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .count()
    }

    /// Highest severity reported so far
    pub fn max_severity(&self) -> Option<Severity> {
        self.diagnostics.iter().map(|d| d.severity).max()
    }

    /// All diagnostics in report order
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Move all diagnostics out of another bag into this one
    pub fn absorb(&mut self, mut other: DiagnosticBag) {
        self.diagnostics.append(&mut other.diagnostics);
    }

    /// True when nothing was reported
    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    /// First diagnostic with the given code, if any
    pub fn find(&self, code: DiagnosticCode) -> Option<&Diagnostic> {
        self.diagnostics.iter().find(|d| d.code == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceLocation;

    #[test]
    fn test_has_errors() {
        let mut bag = DiagnosticBag::new();
        assert!(!bag.has_errors());

        bag.warn(
            DiagnosticCode::UnusedVariable,
            "unused variable 'x'",
            SourceLocation::start_of("t.bl65"),
        );
        assert!(!bag.has_errors());
        assert_eq!(bag.max_severity(), Some(Severity::Warning));

        bag.error(
            DiagnosticCode::TypeMismatch,
            "expected byte, got word",
            SourceLocation::start_of("t.bl65"),
        );
        assert!(bag.has_errors());
        assert_eq!(bag.error_count(), 1);
        assert_eq!(bag.max_severity(), Some(Severity::Error));
    }

    #[test]
    fn test_absorb() {
        let mut a = DiagnosticBag::new();
        let mut b = DiagnosticBag::new();
        b.error(
            DiagnosticCode::UndefinedVariable,
            "undefined variable 'y'",
            SourceLocation::start_of("t.bl65"),
        );
        a.absorb(b);
        assert_eq!(a.diagnostics().len(), 1);
        assert!(a.find(DiagnosticCode::UndefinedVariable).is_some());
    }

    #[test]
    fn test_default_severities() {
        assert_eq!(
            DiagnosticCode::UnusedImport.default_severity(),
            Severity::Warning
        );
        assert_eq!(
            DiagnosticCode::CircularImport.default_severity(),
            Severity::Error
        );
    }
}
