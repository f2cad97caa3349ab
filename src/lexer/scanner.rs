//! Scanner for Blend65 source text
//!
//! Produces the full token vector in one pass. Bad input never aborts the
//! scan: the scanner reports a diagnostic and recovers by skipping to the
//! next whitespace.

use super::token::{Token, TokenKind};
use crate::diagnostics::{DiagnosticBag, DiagnosticCode};
use crate::source::{SourceLocation, SourcePosition};

/// Largest value an integer literal may hold (word range)
const MAX_LITERAL: u32 = 0xFFFF;

/// Hand-written scanner over a single source file
pub struct Scanner {
    /// Source code as character vector
    source: Vec<char>,
    /// File name carried into every location
    file: String,
    /// Accumulated tokens
    tokens: Vec<Token>,
    /// Start index of the current token
    start: usize,
    /// Current index in source
    current: usize,
    /// Current line number (1-indexed)
    line: usize,
    /// Current column number (1-indexed)
    column: usize,
    /// Line/column/offset where the current token started
    token_start: SourcePosition,
}

impl Scanner {
    /// Creates a new scanner for one source file
    pub fn new(source: &str, file: &str) -> Self {
        Scanner {
            source: source.chars().collect(),
            file: file.to_string(),
            tokens: Vec::new(),
            start: 0,
            current: 0,
            line: 1,
            column: 1,
            token_start: SourcePosition::start_of(file),
        }
    }

    /// Scans the whole file, reporting problems into `diags`
    pub fn scan_tokens(mut self, diags: &mut DiagnosticBag) -> Vec<Token> {
        while !self.is_at_end() {
            self.start = self.current;
            self.token_start = self.position();
            self.scan_token(diags);
        }

        self.start = self.current;
        self.token_start = self.position();
        self.add_token(TokenKind::Eof);
        self.tokens
    }

    fn scan_token(&mut self, diags: &mut DiagnosticBag) {
        let c = self.advance();

        match c {
            ' ' | '\r' | '\t' => {}
            '\n' => {
                self.add_token(TokenKind::Newline);
                self.line += 1;
                self.column = 1;
            }

            '/' => {
                if self.match_char('/') {
                    self.skip_line_comment();
                } else if self.match_char('=') {
                    self.add_token(TokenKind::SlashAssign);
                } else {
                    self.add_token(TokenKind::Slash);
                }
            }

            '(' => self.add_token(TokenKind::LeftParen),
            ')' => self.add_token(TokenKind::RightParen),
            '[' => self.add_token(TokenKind::LeftBracket),
            ']' => self.add_token(TokenKind::RightBracket),
            ',' => self.add_token(TokenKind::Comma),
            '.' => self.add_token(TokenKind::Dot),
            ';' => self.add_token(TokenKind::Semicolon),
            '@' => self.add_token(TokenKind::At),
            '?' => self.add_token(TokenKind::Question),
            ':' => self.add_token(TokenKind::Colon),
            '~' => self.add_token(TokenKind::Tilde),

            '+' => {
                if self.match_char('=') {
                    self.add_token(TokenKind::PlusAssign);
                } else {
                    self.add_token(TokenKind::Plus);
                }
            }
            '-' => {
                if self.match_char('=') {
                    self.add_token(TokenKind::MinusAssign);
                } else {
                    self.add_token(TokenKind::Minus);
                }
            }
            '*' => {
                if self.match_char('=') {
                    self.add_token(TokenKind::StarAssign);
                } else {
                    self.add_token(TokenKind::Star);
                }
            }
            '%' => {
                if self.match_char('=') {
                    self.add_token(TokenKind::PercentAssign);
                } else {
                    self.add_token(TokenKind::Percent);
                }
            }
            '^' => {
                if self.match_char('=') {
                    self.add_token(TokenKind::CaretAssign);
                } else {
                    self.add_token(TokenKind::Caret);
                }
            }
            '&' => {
                if self.match_char('&') {
                    self.add_token(TokenKind::AmpAmp);
                } else if self.match_char('=') {
                    self.add_token(TokenKind::AmpAssign);
                } else {
                    self.add_token(TokenKind::Amp);
                }
            }
            '|' => {
                if self.match_char('|') {
                    self.add_token(TokenKind::PipePipe);
                } else if self.match_char('=') {
                    self.add_token(TokenKind::PipeAssign);
                } else {
                    self.add_token(TokenKind::Pipe);
                }
            }
            '!' => {
                if self.match_char('=') {
                    self.add_token(TokenKind::NotEq);
                } else {
                    self.add_token(TokenKind::Bang);
                }
            }
            '=' => {
                if self.match_char('=') {
                    self.add_token(TokenKind::EqEq);
                } else {
                    self.add_token(TokenKind::Assign);
                }
            }
            '<' => {
                if self.match_char('<') {
                    if self.match_char('=') {
                        self.add_token(TokenKind::ShlAssign);
                    } else {
                        self.add_token(TokenKind::Shl);
                    }
                } else if self.match_char('=') {
                    self.add_token(TokenKind::LtEq);
                } else {
                    self.add_token(TokenKind::Lt);
                }
            }
            '>' => {
                if self.match_char('>') {
                    if self.match_char('=') {
                        self.add_token(TokenKind::ShrAssign);
                    } else {
                        self.add_token(TokenKind::Shr);
                    }
                } else if self.match_char('=') {
                    self.add_token(TokenKind::GtEq);
                } else {
                    self.add_token(TokenKind::Gt);
                }
            }

            '"' => self.scan_string(diags),
            '$' => self.scan_radix_number(16, diags),

            c if c.is_ascii_digit() => self.scan_number(c, diags),
            c if c.is_alphabetic() || c == '_' => self.scan_identifier(diags),

            _ => {
                diags.error(
                    DiagnosticCode::InvalidCharacter,
                    format!("Unexpected character '{}'", c),
                    self.make_location(),
                );
                self.skip_to_whitespace();
            }
        }
    }

    fn skip_line_comment(&mut self) {
        while !self.is_at_end() && self.peek() != '\n' {
            self.advance();
        }
    }

    fn scan_string(&mut self, diags: &mut DiagnosticBag) {
        let mut value = String::new();

        while !self.is_at_end() && self.peek() != '"' && self.peek() != '\n' {
            if self.peek() == '\\' {
                self.advance();
                if self.is_at_end() {
                    break;
                }
                let escaped = self.advance();
                match escaped {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    'r' => value.push('\r'),
                    '0' => value.push('\0'),
                    '\\' => value.push('\\'),
                    '"' => value.push('"'),
                    other => {
                        diags.error(
                            DiagnosticCode::InvalidCharacter,
                            format!("Invalid escape sequence \\{}", other),
                            self.make_location(),
                        );
                    }
                }
            } else {
                value.push(self.advance());
            }
        }

        if self.is_at_end() || self.peek() == '\n' {
            diags.error(
                DiagnosticCode::UnterminatedString,
                "Unterminated string literal",
                self.make_location(),
            );
            return;
        }

        self.advance(); // closing quote
        self.add_token(TokenKind::Str(value));
    }

    /// Scans a number whose first digit `first` was already consumed.
    /// Handles decimal plus the `0x` and `0b` prefixes.
    fn scan_number(&mut self, first: char, diags: &mut DiagnosticBag) {
        if first == '0' && (self.peek() == 'x' || self.peek() == 'X') {
            self.advance();
            self.scan_radix_number(16, diags);
            return;
        }
        if first == '0' && (self.peek() == 'b' || self.peek() == 'B') {
            self.advance();
            self.scan_radix_number(2, diags);
            return;
        }

        while self.peek().is_ascii_digit() {
            self.advance();
        }

        if self.peek().is_alphanumeric() || self.peek() == '_' {
            diags.error(
                DiagnosticCode::InvalidNumberLiteral,
                format!("Malformed number literal '{}'", self.current_lexeme()),
                self.make_location(),
            );
            self.skip_to_whitespace();
            return;
        }

        let text = self.current_lexeme();
        match text.parse::<u32>() {
            Ok(value) if value <= MAX_LITERAL => self.add_token(TokenKind::Number(value)),
            _ => {
                diags.error(
                    DiagnosticCode::InvalidNumberLiteral,
                    format!("Integer literal '{}' exceeds word range (0-65535)", text),
                    self.make_location(),
                );
                self.skip_to_whitespace();
            }
        }
    }

    /// Scans digits of a `$`, `0x`, or `0b` literal after the prefix
    fn scan_radix_number(&mut self, radix: u32, diags: &mut DiagnosticBag) {
        let digits_start = self.current;
        while self.peek().is_ascii_alphanumeric() {
            self.advance();
        }

        let digits: String = self.source[digits_start..self.current].iter().collect();
        if digits.is_empty() {
            diags.error(
                DiagnosticCode::InvalidNumberLiteral,
                format!("Number literal '{}' has no digits", self.current_lexeme()),
                self.make_location(),
            );
            self.skip_to_whitespace();
            return;
        }

        match u32::from_str_radix(&digits, radix) {
            Ok(value) if value <= MAX_LITERAL => self.add_token(TokenKind::Number(value)),
            Ok(_) => {
                diags.error(
                    DiagnosticCode::InvalidNumberLiteral,
                    format!(
                        "Integer literal '{}' exceeds word range (0-65535)",
                        self.current_lexeme()
                    ),
                    self.make_location(),
                );
                self.skip_to_whitespace();
            }
            Err(_) => {
                diags.error(
                    DiagnosticCode::InvalidNumberLiteral,
                    format!("Malformed number literal '{}'", self.current_lexeme()),
                    self.make_location(),
                );
                self.skip_to_whitespace();
            }
        }
    }

    fn scan_identifier(&mut self, diags: &mut DiagnosticBag) {
        while self.peek().is_alphanumeric() || self.peek() == '_' {
            self.advance();
        }

        let text = self.current_lexeme();
        match TokenKind::keyword(&text) {
            Some(TokenKind::Asm) => {
                self.add_token(TokenKind::Asm);
                self.scan_asm_body(diags);
            }
            Some(kind) => self.add_token(kind),
            None => self.add_token(TokenKind::Identifier(text)),
        }
    }

    /// Captures the raw body of an `asm` block verbatim, up to (but not
    /// consuming) the `end asm` line, which is then tokenized normally.
    fn scan_asm_body(&mut self, diags: &mut DiagnosticBag) {
        // Skip the rest of the `asm` line
        while !self.is_at_end() && self.peek() != '\n' {
            self.advance();
        }

        let mut body = String::new();
        loop {
            if self.is_at_end() {
                diags.error(
                    DiagnosticCode::UnterminatedBlock,
                    "asm block is never closed with 'end asm'",
                    self.make_location(),
                );
                break;
            }

            // Consume the newline ending the previous line
            self.advance();
            self.line += 1;
            self.column = 1;

            // Peek the upcoming line without consuming it
            let line_start = self.current;
            let mut idx = line_start;
            while idx < self.source.len() && self.source[idx] != '\n' {
                idx += 1;
            }
            let line_text: String = self.source[line_start..idx].iter().collect();

            let trimmed = line_text.trim();
            if trimmed == "end asm" || trimmed.starts_with("end asm") {
                // Leave `end asm` for normal tokenization
                break;
            }

            body.push_str(&line_text);
            body.push('\n');
            self.current = idx;
            self.column += line_text.chars().count();
        }

        self.start = self.current;
        self.token_start = self.position();
        self.add_token(TokenKind::AsmBody(body));
    }

    fn skip_to_whitespace(&mut self) {
        while !self.is_at_end() && !self.peek().is_whitespace() {
            self.advance();
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> char {
        let c = self.source[self.current];
        self.current += 1;
        self.column += 1;
        c
    }

    fn peek(&self) -> char {
        if self.is_at_end() {
            '\0'
        } else {
            self.source[self.current]
        }
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.is_at_end() || self.source[self.current] != expected {
            false
        } else {
            self.current += 1;
            self.column += 1;
            true
        }
    }

    fn current_lexeme(&self) -> String {
        self.source[self.start..self.current].iter().collect()
    }

    fn position(&self) -> SourcePosition {
        SourcePosition {
            file: self.file.clone(),
            line: self.line,
            column: self.column,
            offset: self.current,
        }
    }

    fn make_location(&self) -> SourceLocation {
        let mut loc = SourceLocation::new(self.token_start.clone(), self.position());
        loc.text = Some(self.current_lexeme());
        loc
    }

    fn add_token(&mut self, kind: TokenKind) {
        let lexeme = self.current_lexeme();
        let location = self.make_location();
        self.tokens.push(Token::new(kind, lexeme, location));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(source: &str) -> (Vec<Token>, DiagnosticBag) {
        let mut diags = DiagnosticBag::new();
        let tokens = Scanner::new(source, "test.bl65").scan_tokens(&mut diags);
        (tokens, diags)
    }

    fn kinds(tokens: &[Token]) -> Vec<TokenKind> {
        tokens
            .iter()
            .filter(|t| !matches!(t.kind, TokenKind::Newline))
            .map(|t| t.kind.clone())
            .collect()
    }

    #[test]
    fn test_simple_declaration() {
        let (tokens, diags) = scan("let x: byte = 5");
        assert!(!diags.has_errors());
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Let,
                TokenKind::Identifier("x".to_string()),
                TokenKind::Colon,
                TokenKind::Identifier("byte".to_string()),
                TokenKind::Assign,
                TokenKind::Number(5),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_number_radixes() {
        let (tokens, diags) = scan("255 $d020 0x10 0b1010");
        assert!(!diags.has_errors());
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Number(255),
                TokenKind::Number(0xD020),
                TokenKind::Number(16),
                TokenKind::Number(10),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_out_of_range_literal() {
        let (_, diags) = scan("65536");
        assert!(diags.has_errors());
        assert!(diags.find(DiagnosticCode::InvalidNumberLiteral).is_some());

        let (_, diags) = scan("65535");
        assert!(!diags.has_errors());
    }

    #[test]
    fn test_compound_operators() {
        let (tokens, diags) = scan("x += 1 << 2 && y");
        assert!(!diags.has_errors());
        let k = kinds(&tokens);
        assert!(k.contains(&TokenKind::PlusAssign));
        assert!(k.contains(&TokenKind::Shl));
        assert!(k.contains(&TokenKind::AmpAmp));
    }

    #[test]
    fn test_string_escapes() {
        let (tokens, diags) = scan(r#""hi\n""#);
        assert!(!diags.has_errors());
        assert_eq!(tokens[0].kind, TokenKind::Str("hi\n".to_string()));
    }

    #[test]
    fn test_unterminated_string() {
        let (_, diags) = scan("\"oops");
        assert!(diags.find(DiagnosticCode::UnterminatedString).is_some());
    }

    #[test]
    fn test_comments_skipped() {
        let (tokens, diags) = scan("let x = 1 // trailing comment\n");
        assert!(!diags.has_errors());
        assert!(!kinds(&tokens)
            .iter()
            .any(|k| matches!(k, TokenKind::Slash)));
    }

    #[test]
    fn test_asm_block_capture() {
        let source = "asm\n  lda #$00\n  sta $d020\nend asm\n";
        let (tokens, diags) = scan(source);
        assert!(!diags.has_errors());
        assert_eq!(tokens[0].kind, TokenKind::Asm);
        match &tokens[1].kind {
            TokenKind::AsmBody(body) => {
                assert!(body.contains("lda #$00"));
                assert!(body.contains("sta $d020"));
            }
            other => panic!("expected asm body, got {:?}", other),
        }
        let rest = kinds(&tokens[2..]);
        assert_eq!(rest[0], TokenKind::End);
        assert_eq!(rest[1], TokenKind::Asm);
    }

    #[test]
    fn test_invalid_character_recovery() {
        let (tokens, diags) = scan("let ` x = 1");
        assert!(diags.find(DiagnosticCode::InvalidCharacter).is_some());
        // Scanning continues after the bad character
        assert!(kinds(&tokens).contains(&TokenKind::Identifier("x".to_string())));
    }

    #[test]
    fn test_locations_track_lines() {
        let (tokens, _) = scan("let x = 1\nlet y = 2");
        let y_tok = tokens
            .iter()
            .find(|t| t.kind == TokenKind::Identifier("y".to_string()))
            .unwrap();
        assert_eq!(y_tok.location.start.line, 2);
    }
}
