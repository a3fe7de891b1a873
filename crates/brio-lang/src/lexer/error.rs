use smol_str::SmolStr;
use thiserror::Error;

use crate::range::Range;

#[derive(Error, Debug, PartialEq, Clone)]
pub enum LexerError {
    #[error("Unexpected character `{1}` on line {line}", line = .0.line())]
    UnexpectedCharacter(Range, char),
    #[error("Unterminated string starting on line {}", .0.line())]
    UnterminatedString(Range),
    #[error("Unexpected second decimal point in number on line {}", .0.line())]
    InvalidNumber(Range),
    #[error("Unclosed {1} starting on line {line}", line = .0.line())]
    UnclosedTag(Range, SmolStr),
    #[error("Unterminated comment starting on line {}", .0.line())]
    UnterminatedComment(Range),
}

impl LexerError {
    pub fn range(&self) -> Range {
        match self {
            LexerError::UnexpectedCharacter(range, _)
            | LexerError::UnterminatedString(range)
            | LexerError::InvalidNumber(range)
            | LexerError::UnclosedTag(range, _)
            | LexerError::UnterminatedComment(range) => *range,
        }
    }

    pub fn line(&self) -> u32 {
        self.range().line()
    }
}
