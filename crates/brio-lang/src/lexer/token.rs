use std::fmt::{self, Display, Formatter};

use smol_str::SmolStr;

use crate::{number::Number, range::Range};

/// How a tag or print region was opened, which decides its closing delimiter.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Delimiter {
    /// `{% ... %}` or `{{ ... }}`
    Standard,
    /// `{name ...}`, `{/name}`, `{@meta}`, `{$.accessor}`
    Brace,
}

#[derive(PartialEq, Debug, Clone)]
pub struct Token {
    pub range: Range,
    pub kind: TokenKind,
    /// Whitespace that followed the token inside a tag.
    pub trailing_whitespace: SmolStr,
}

impl Token {
    pub fn new(range: Range, kind: TokenKind) -> Self {
        Self {
            range,
            kind,
            trailing_whitespace: SmolStr::default(),
        }
    }

    pub fn line(&self) -> u32 {
        self.range.start.line
    }

    pub fn is_eof(&self) -> bool {
        matches!(self.kind, TokenKind::Eof)
    }

    pub fn is_spaced(&self) -> bool {
        !self.trailing_whitespace.is_empty()
    }
}

#[derive(PartialEq, Debug, Clone)]
pub enum TokenKind {
    Text(String),
    Comment(String),
    TagOpen(Delimiter),
    TagClose,
    PrintOpen(Delimiter),
    PrintClose,
    /// `{/name}` or `{% endname %}`
    EndTag(SmolStr),
    Ident(SmolStr),
    StringLiteral(String),
    NumberLiteral(Number),
    // keywords
    And,
    As,
    False,
    In,
    Is,
    Not,
    Null,
    Or,
    True,
    // operators
    Asterisk,
    At,
    Bang,
    Colon,
    Comma,
    Dollar,
    Dot,
    DotDot,
    EqEq,
    EqEqEq,
    Equal,
    FatArrow,
    Gt,
    Gte,
    LBracket,
    LParen,
    Lt,
    Lte,
    Minus,
    NeEq,
    NeEqEq,
    Percent,
    Pipe,
    Plus,
    Question,
    RBracket,
    RParen,
    Slash,
    Tilde,
    TildeTilde,
    Eof,
}

impl TokenKind {
    /// Tokens that end a postfix `?`/`!` check rather than starting a ternary branch.
    pub fn ends_operand(&self) -> bool {
        matches!(
            self,
            TokenKind::TagClose
                | TokenKind::PrintClose
                | TokenKind::RParen
                | TokenKind::RBracket
                | TokenKind::Comma
                | TokenKind::Eof
                | TokenKind::And
                | TokenKind::Or
                | TokenKind::EqEq
                | TokenKind::EqEqEq
                | TokenKind::NeEq
                | TokenKind::NeEqEq
                | TokenKind::Lt
                | TokenKind::Lte
                | TokenKind::Gt
                | TokenKind::Gte
                | TokenKind::Asterisk
                | TokenKind::Slash
                | TokenKind::Percent
                | TokenKind::Tilde
                | TokenKind::TildeTilde
                | TokenKind::Is
                | TokenKind::In
                | TokenKind::Pipe
                | TokenKind::FatArrow
        )
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}", self.kind)
    }
}

impl Display for TokenKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            TokenKind::Text(text) => write!(f, "{}", text),
            TokenKind::Comment(comment) => write!(f, "{{#{}#}}", comment),
            TokenKind::TagOpen(Delimiter::Standard) => write!(f, "{{%"),
            TokenKind::TagOpen(Delimiter::Brace) => write!(f, "{{"),
            TokenKind::TagClose => write!(f, "%}}"),
            TokenKind::PrintOpen(_) => write!(f, "{{{{"),
            TokenKind::PrintClose => write!(f, "}}}}"),
            TokenKind::EndTag(name) => write!(f, "/{}", name),
            TokenKind::Ident(ident) => write!(f, "{}", ident),
            TokenKind::StringLiteral(s) => write!(f, "{:?}", s),
            TokenKind::NumberLiteral(n) => write!(f, "{}", n),
            TokenKind::And => write!(f, "and"),
            TokenKind::As => write!(f, "as"),
            TokenKind::False => write!(f, "false"),
            TokenKind::In => write!(f, "in"),
            TokenKind::Is => write!(f, "is"),
            TokenKind::Not => write!(f, "not"),
            TokenKind::Null => write!(f, "null"),
            TokenKind::Or => write!(f, "or"),
            TokenKind::True => write!(f, "true"),
            TokenKind::Asterisk => write!(f, "*"),
            TokenKind::At => write!(f, "@"),
            TokenKind::Bang => write!(f, "!"),
            TokenKind::Colon => write!(f, ":"),
            TokenKind::Comma => write!(f, ","),
            TokenKind::Dollar => write!(f, "$"),
            TokenKind::Dot => write!(f, "."),
            TokenKind::DotDot => write!(f, ".."),
            TokenKind::EqEq => write!(f, "=="),
            TokenKind::EqEqEq => write!(f, "==="),
            TokenKind::Equal => write!(f, "="),
            TokenKind::FatArrow => write!(f, "=>"),
            TokenKind::Gt => write!(f, ">"),
            TokenKind::Gte => write!(f, ">="),
            TokenKind::LBracket => write!(f, "["),
            TokenKind::LParen => write!(f, "("),
            TokenKind::Lt => write!(f, "<"),
            TokenKind::Lte => write!(f, "<="),
            TokenKind::Minus => write!(f, "-"),
            TokenKind::NeEq => write!(f, "!="),
            TokenKind::NeEqEq => write!(f, "!=="),
            TokenKind::Percent => write!(f, "%"),
            TokenKind::Pipe => write!(f, "|"),
            TokenKind::Plus => write!(f, "+"),
            TokenKind::Question => write!(f, "?"),
            TokenKind::RBracket => write!(f, "]"),
            TokenKind::RParen => write!(f, ")"),
            TokenKind::Slash => write!(f, "/"),
            TokenKind::Tilde => write!(f, "~"),
            TokenKind::TildeTilde => write!(f, "~~"),
            TokenKind::Eof => write!(f, "EOF"),
        }
    }
}
