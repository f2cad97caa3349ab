//! ACME assembly text model
//!
//! The code generator appends [`AsmLine`]s; rendering produces the final
//! text and, when requested, a source map associating each output line
//! with the source location and symbol it came from.

use crate::source::SourceLocation;
use serde::{Deserialize, Serialize};

/// One line of output
#[derive(Debug, Clone)]
pub struct AsmLine {
    /// Rendered text (indentation included)
    pub text: String,
    /// Source span the line was generated from
    pub loc: Option<SourceLocation>,
    /// Symbol (function or variable) the line belongs to
    pub symbol: Option<String>,
}

/// One row of the generated-line -> source mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMapEntry {
    /// Zero-based line index in the rendered assembly
    pub line: usize,
    /// Assembly text of the line
    pub text: String,
    /// Originating source location
    pub loc: SourceLocation,
    /// Symbol name, when known
    pub symbol: Option<String>,
}

/// Assembly output under construction
#[derive(Debug, Default)]
pub struct AsmWriter {
    lines: Vec<AsmLine>,
    /// Location stamped onto instruction lines until changed
    pub current_loc: Option<SourceLocation>,
    /// Symbol stamped onto instruction lines until changed
    pub current_symbol: Option<String>,
    next_local: u32,
}

impl AsmWriter {
    /// Creates an empty writer
    pub fn new() -> Self {
        AsmWriter::default()
    }

    /// Appends an instruction line (indented)
    pub fn instr(&mut self, text: impl Into<String>) {
        self.lines.push(AsmLine {
            text: format!("    {}", text.into()),
            loc: self.current_loc.clone(),
            symbol: self.current_symbol.clone(),
        });
    }

    /// Appends an instruction with a trailing comment
    pub fn instr_commented(&mut self, text: impl Into<String>, comment: &str) {
        self.instr(format!("{:<24}; {}", text.into(), comment));
    }

    /// Appends a label line (column zero)
    pub fn label(&mut self, name: &str) {
        self.lines.push(AsmLine {
            text: format!("{}:", name),
            loc: self.current_loc.clone(),
            symbol: self.current_symbol.clone(),
        });
    }

    /// Appends a comment line
    pub fn comment(&mut self, text: &str) {
        self.lines.push(AsmLine {
            text: format!("; {}", text),
            loc: None,
            symbol: None,
        });
    }

    /// Appends a raw line verbatim (directives, equates, inline asm)
    pub fn raw(&mut self, text: impl Into<String>) {
        self.lines.push(AsmLine {
            text: text.into(),
            loc: self.current_loc.clone(),
            symbol: self.current_symbol.clone(),
        });
    }

    /// Appends an empty line
    pub fn blank(&mut self) {
        self.lines.push(AsmLine {
            text: String::new(),
            loc: None,
            symbol: None,
        });
    }

    /// A fresh ACME local label (scoped to the enclosing global label)
    pub fn local_label(&mut self, stem: &str) -> String {
        let label = format!(".{}_{}", stem, self.next_local);
        self.next_local += 1;
        label
    }

    /// Renders the final assembly text
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(&line.text);
            out.push('\n');
        }
        out
    }

    /// Builds the source map over the rendered lines
    pub fn source_map(&self) -> Vec<SourceMapEntry> {
        self.lines
            .iter()
            .enumerate()
            .filter_map(|(index, line)| {
                line.loc.as_ref().map(|loc| SourceMapEntry {
                    line: index,
                    text: line.text.clone(),
                    loc: loc.clone(),
                    symbol: line.symbol.clone(),
                })
            })
            .collect()
    }

    /// Number of lines so far
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// True when nothing has been written
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Turns an IL entity name (`module.name`, `name%id`) into a valid ACME
/// label
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

/// Label of a function
pub fn function_label(qualified: &str) -> String {
    format!("f_{}", sanitize(qualified))
}

/// Label of a global variable
pub fn global_label(qualified: &str) -> String {
    format!("g_{}", sanitize(qualified))
}

/// Label of a function's exit (single `rts`)
pub fn exit_label(qualified: &str) -> String {
    format!("f_{}__exit", sanitize(qualified))
}

/// Label of a basic block within a function
pub fn block_label(qualified: &str, block: u32) -> String {
    format!("f_{}__bb{}", sanitize(qualified), block)
}

/// Label of a function's n-th parameter slot
pub fn param_label(qualified: &str, index: usize) -> String {
    format!("f_{}__p{}", sanitize(qualified), index)
}

/// Label of the thunk used to call a function indirectly
pub fn thunk_label(qualified: &str) -> String {
    format!("f_{}__thunk", sanitize(qualified))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels() {
        assert_eq!(function_label("game.main"), "f_game_main");
        assert_eq!(global_label("global.colors"), "g_global_colors");
        assert_eq!(block_label("game.main", 3), "f_game_main__bb3");
        assert_eq!(sanitize("x%4"), "x_4");
    }

    #[test]
    fn test_render_and_map() {
        let mut w = AsmWriter::new();
        w.comment("header");
        w.current_loc = Some(SourceLocation::start_of("t.bl65"));
        w.current_symbol = Some("main".to_string());
        w.label("f_main");
        w.instr("lda #$00");
        w.current_loc = None;
        w.instr("rts");

        let text = w.render();
        assert!(text.contains("; header"));
        assert!(text.contains("f_main:"));
        assert!(text.contains("    lda #$00"));

        let map = w.source_map();
        // Lines with a location: the label and the lda
        assert_eq!(map.len(), 2);
        assert_eq!(map[1].symbol.as_deref(), Some("main"));
    }

    #[test]
    fn test_local_labels_unique() {
        let mut w = AsmWriter::new();
        let a = w.local_label("cmp");
        let b = w.local_label("cmp");
        assert_ne!(a, b);
        assert!(a.starts_with('.'));
    }
}
