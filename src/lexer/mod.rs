//! Lexer module - tokenization of Blend65 source text

pub mod scanner;
pub mod token;

pub use scanner::Scanner;
pub use token::{Token, TokenKind};
