use smol_str::SmolStr;
use thiserror::Error;

use crate::lexer::token::Token;
use crate::range::Range;

#[derive(Error, Debug, PartialEq, Clone)]
pub enum SyntaxError {
    #[error("Unexpected token `{}` on line {}, expected {expected}", .token, .token.line())]
    UnexpectedToken { token: Token, expected: &'static str },
    #[error("Unexpected end of template on line {}", .0.line())]
    UnexpectedEof(Token),
    #[error("Unclosed tag(s): {}", describe_unclosed(.0))]
    UnclosedTag(Vec<(SmolStr, u32)>, Range),
    #[error("Unexpected closing of the tag '{found}' (expecting closing of the tag {expected}, opened on line {opened})")]
    MismatchedClose {
        token: Token,
        found: SmolStr,
        expected: SmolStr,
        opened: u32,
    },
    #[error("Unexpected closing of the tag '{1}' on line {line}", line = .0.line())]
    UnexpectedClose(Token, SmolStr),
    #[error("Unexpected tag '{1}' on line {line}", line = .0.line())]
    UnknownTag(Token, SmolStr),
    #[error("{message} on line {}", .token.line())]
    InvalidUsage { token: Token, message: String },
}

impl SyntaxError {
    pub fn range(&self) -> Range {
        match self {
            SyntaxError::UnexpectedToken { token, .. }
            | SyntaxError::UnexpectedEof(token)
            | SyntaxError::MismatchedClose { token, .. }
            | SyntaxError::UnexpectedClose(token, _)
            | SyntaxError::UnknownTag(token, _)
            | SyntaxError::InvalidUsage { token, .. } => token.range,
            SyntaxError::UnclosedTag(_, range) => *range,
        }
    }

    pub fn invalid_usage(token: &Token, message: impl Into<String>) -> Self {
        SyntaxError::InvalidUsage {
            token: token.clone(),
            message: message.into(),
        }
    }
}

fn describe_unclosed(tags: &[(SmolStr, u32)]) -> String {
    tags.iter()
        .map(|(name, line)| format!("{{{}}} opened on line {}", name, line))
        .collect::<Vec<_>>()
        .join(", ")
}
