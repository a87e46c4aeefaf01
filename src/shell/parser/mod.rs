pub mod ast;
pub mod lexer;
pub mod parser;

use thiserror::Error;

pub use ast::{Assignment, Command, Node, RedirectKind, Redirection};
pub use lexer::LexError;
pub use parser::{ParseError, Parser};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyntaxError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl SyntaxError {
    /// True when more input could complete the text, e.g. an open quote or
    /// a missing `fi`.
    pub fn is_incomplete(&self) -> bool {
        match self {
            SyntaxError::Lex(LexError::UnterminatedQuote { .. }) => true,
            SyntaxError::Parse(err) => err.at_end_of_input(),
        }
    }
}

/// Parses a complete source text. Blank input yields `Ok(None)`.
pub fn parse(text: &str) -> Result<Option<Node>, SyntaxError> {
    Parser::new(text)?.parse_program()
}
