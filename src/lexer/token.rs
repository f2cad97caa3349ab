//! Token definitions for the Blend65 lexer

use crate::source::SourceLocation;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A single token from the source code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// The type of token
    pub kind: TokenKind,
    /// Original text of the token
    pub lexeme: String,
    /// Span of the token in its source file
    pub location: SourceLocation,
}

impl Token {
    /// Creates a new token with the given properties
    pub fn new(kind: TokenKind, lexeme: String, location: SourceLocation) -> Self {
        Token {
            kind,
            lexeme,
            location,
        }
    }
}

/// All possible token types in Blend65
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TokenKind {
    // Literals
    /// Integer literal; byte if <= 255 else word, decided by value alone
    Number(u32),
    /// String literal (escapes already resolved)
    Str(String),
    /// `true` literal
    True,
    /// `false` literal
    False,

    /// Identifier
    Identifier(String),
    /// Raw body of an `asm` block, kept verbatim
    AsmBody(String),

    // Keywords
    /// `module` keyword
    Module,
    /// `import` keyword
    Import,
    /// `export` keyword
    Export,
    /// `function` keyword
    Function,
    /// `end` keyword
    End,
    /// `if` keyword
    If,
    /// `then` keyword
    Then,
    /// `else` keyword
    Else,
    /// `while` keyword
    While,
    /// `for` keyword
    For,
    /// `to` keyword
    To,
    /// `step` keyword
    Step,
    /// `next` keyword
    Next,
    /// `match` keyword
    Match,
    /// `case` keyword
    Case,
    /// `default` keyword
    Default,
    /// `return` keyword
    Return,
    /// `break` keyword
    Break,
    /// `continue` keyword
    Continue,
    /// `let` keyword
    Let,
    /// `const` keyword
    Const,
    /// `type` keyword
    Type,
    /// `enum` keyword
    Enum,
    /// `callback` keyword
    Callback,
    /// `asm` keyword
    Asm,
    /// `and` operator word
    And,
    /// `or` operator word
    Or,
    /// `not` operator word
    Not,

    // Operators
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Star,
    /// `/`
    Slash,
    /// `%`
    Percent,
    /// `&`
    Amp,
    /// `|`
    Pipe,
    /// `^`
    Caret,
    /// `~`
    Tilde,
    /// `!`
    Bang,
    /// `<<`
    Shl,
    /// `>>`
    Shr,
    /// `==`
    EqEq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// `&&`
    AmpAmp,
    /// `||`
    PipePipe,
    /// `=`
    Assign,
    /// `+=`
    PlusAssign,
    /// `-=`
    MinusAssign,
    /// `*=`
    StarAssign,
    /// `/=`
    SlashAssign,
    /// `%=`
    PercentAssign,
    /// `&=`
    AmpAssign,
    /// `|=`
    PipeAssign,
    /// `^=`
    CaretAssign,
    /// `<<=`
    ShlAssign,
    /// `>>=`
    ShrAssign,
    /// `@` (address-of, storage attributes, memory maps)
    At,
    /// `?`
    Question,
    /// `:`
    Colon,

    // Delimiters
    /// `(`
    LeftParen,
    /// `)`
    RightParen,
    /// `[`
    LeftBracket,
    /// `]`
    RightBracket,
    /// `,`
    Comma,
    /// `.`
    Dot,
    /// `;`
    Semicolon,
    /// Newline (statement separator)
    Newline,

    /// End of file marker
    Eof,
}

lazy_static! {
    /// Reserved words of the language. `map`, `from`, and `at` stay
    /// contextual so they remain usable as identifiers.
    static ref KEYWORDS: HashMap<&'static str, TokenKind> = {
        let mut m = HashMap::new();
        m.insert("module", TokenKind::Module);
        m.insert("import", TokenKind::Import);
        m.insert("export", TokenKind::Export);
        m.insert("function", TokenKind::Function);
        m.insert("end", TokenKind::End);
        m.insert("if", TokenKind::If);
        m.insert("then", TokenKind::Then);
        m.insert("else", TokenKind::Else);
        m.insert("while", TokenKind::While);
        m.insert("for", TokenKind::For);
        m.insert("to", TokenKind::To);
        m.insert("step", TokenKind::Step);
        m.insert("next", TokenKind::Next);
        m.insert("match", TokenKind::Match);
        m.insert("case", TokenKind::Case);
        m.insert("default", TokenKind::Default);
        m.insert("return", TokenKind::Return);
        m.insert("break", TokenKind::Break);
        m.insert("continue", TokenKind::Continue);
        m.insert("let", TokenKind::Let);
        m.insert("const", TokenKind::Const);
        m.insert("type", TokenKind::Type);
        m.insert("enum", TokenKind::Enum);
        m.insert("callback", TokenKind::Callback);
        m.insert("asm", TokenKind::Asm);
        m.insert("true", TokenKind::True);
        m.insert("false", TokenKind::False);
        m.insert("and", TokenKind::And);
        m.insert("or", TokenKind::Or);
        m.insert("not", TokenKind::Not);
        m
    };
}

impl TokenKind {
    /// Look up a reserved word; returns `None` for plain identifiers
    pub fn keyword(s: &str) -> Option<TokenKind> {
        KEYWORDS.get(s).cloned()
    }

    /// Check if token is a keyword
    pub fn is_keyword(&self) -> bool {
        use TokenKind::*;
        matches!(
            self,
            Module
                | Import
                | Export
                | Function
                | End
                | If
                | Then
                | Else
                | While
                | For
                | To
                | Step
                | Next
                | Match
                | Case
                | Default
                | Return
                | Break
                | Continue
                | Let
                | Const
                | Type
                | Enum
                | Callback
                | Asm
                | True
                | False
                | And
                | Or
                | Not
        )
    }

    /// Keywords that begin a declaration (parser synchronization points)
    pub fn starts_declaration(&self) -> bool {
        use TokenKind::*;
        matches!(
            self,
            Function | Let | Const | Type | Enum | Import | Export | Module
        )
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Number(n) => write!(f, "{}", n),
            TokenKind::Str(s) => write!(f, "\"{}\"", s),
            TokenKind::Identifier(id) => write!(f, "{}", id),
            TokenKind::Newline => write!(f, "<newline>"),
            TokenKind::Eof => write!(f, "<eof>"),
            _ => write!(f, "{:?}", self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_lookup() {
        assert_eq!(TokenKind::keyword("function"), Some(TokenKind::Function));
        assert_eq!(TokenKind::keyword("callback"), Some(TokenKind::Callback));
        assert_eq!(TokenKind::keyword("sprite"), None);
        // Contextual words are not reserved
        assert_eq!(TokenKind::keyword("map"), None);
        assert_eq!(TokenKind::keyword("from"), None);
        assert_eq!(TokenKind::keyword("at"), None);
    }

    #[test]
    fn test_is_keyword() {
        assert!(TokenKind::While.is_keyword());
        assert!(!TokenKind::Number(42).is_keyword());
        assert!(!TokenKind::Identifier("vic".to_string()).is_keyword());
    }

    #[test]
    fn test_declaration_starters() {
        assert!(TokenKind::Function.starts_declaration());
        assert!(TokenKind::Const.starts_declaration());
        assert!(!TokenKind::While.starts_declaration());
    }
}
