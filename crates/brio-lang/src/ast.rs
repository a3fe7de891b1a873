use crate::lexer::token::Token;

pub mod error;
pub mod node;
pub mod parser;
pub mod scope;
mod statement;

pub use error::SyntaxError;
pub use node::{Expr, Node, NodeKind};
pub use parser::{Parser, TagShapes};

pub type Program = Vec<Node>;

/// Builds the template body from a token stream produced by the lexer.
pub fn parse(tokens: &[Token], custom_tags: &TagShapes) -> Result<Program, SyntaxError> {
    Parser::new(tokens, custom_tags).parse()
}
