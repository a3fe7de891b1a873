pub mod error;
pub mod token;

use error::LexerError;
use nom::Input;
use nom::Parser;
use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{char, digit1, satisfy},
    combinator::{map, map_res, opt, recognize},
    sequence::pair,
};
use rustc_hash::FxHashSet;
use smol_str::SmolStr;
use token::{Delimiter, Token, TokenKind};

use crate::number::Number;
use crate::range::{Range, Span};

/// Block tags known to the tokenizer. `end<name>` closes them.
pub const BLOCK_TAGS: &[&str] = &[
    "autoescape",
    "block",
    "escape",
    "filter",
    "for",
    "foreach",
    "if",
    "ignore",
    "macro",
    "set",
    "add",
    "var",
    "strip",
    "switch",
    "while",
];

/// Inline and intermediate tags that may open a brace-shorthand tag.
pub const INLINE_TAGS: &[&str] = &[
    "break",
    "case",
    "continue",
    "cycle",
    "default",
    "do",
    "elif",
    "else",
    "elseif",
    "extends",
    "foreachelse",
    "forelse",
    "import",
    "include",
    "insert",
    "parent",
    "raw",
    "unset",
    "use",
];

macro_rules! define_token_parser {
    ($name:ident, $tag:expr, $kind:expr) => {
        fn $name(input: Span) -> IResult<Span, Token> {
            map(tag($tag), |span: Span| Token::new(span.into(), $kind)).parse(input)
        }
    };
}

define_token_parser!(eq_eq_eq, "===", TokenKind::EqEqEq);
define_token_parser!(ne_eq_eq, "!==", TokenKind::NeEqEq);
define_token_parser!(eq_eq, "==", TokenKind::EqEq);
define_token_parser!(ne_eq, "!=", TokenKind::NeEq);
define_token_parser!(lt_gt, "<>", TokenKind::NeEq);
define_token_parser!(lte, "<=", TokenKind::Lte);
define_token_parser!(gte, ">=", TokenKind::Gte);
define_token_parser!(and_and, "&&", TokenKind::And);
define_token_parser!(or_or, "||", TokenKind::Or);
define_token_parser!(dot_dot, "..", TokenKind::DotDot);
define_token_parser!(fat_arrow, "=>", TokenKind::FatArrow);
define_token_parser!(tilde_tilde, "~~", TokenKind::TildeTilde);
define_token_parser!(plus, "+", TokenKind::Plus);
define_token_parser!(minus, "-", TokenKind::Minus);
define_token_parser!(asterisk, "*", TokenKind::Asterisk);
define_token_parser!(slash, "/", TokenKind::Slash);
define_token_parser!(percent, "%", TokenKind::Percent);
define_token_parser!(tilde, "~", TokenKind::Tilde);
define_token_parser!(bang, "!", TokenKind::Bang);
define_token_parser!(question, "?", TokenKind::Question);
define_token_parser!(colon, ":", TokenKind::Colon);
define_token_parser!(dot, ".", TokenKind::Dot);
define_token_parser!(comma, ",", TokenKind::Comma);
define_token_parser!(pipe, "|", TokenKind::Pipe);
define_token_parser!(l_paren, "(", TokenKind::LParen);
define_token_parser!(r_paren, ")", TokenKind::RParen);
define_token_parser!(l_bracket, "[", TokenKind::LBracket);
define_token_parser!(r_bracket, "]", TokenKind::RBracket);
define_token_parser!(equal, "=", TokenKind::Equal);
define_token_parser!(lt, "<", TokenKind::Lt);
define_token_parser!(gt, ">", TokenKind::Gt);
define_token_parser!(at, "@", TokenKind::At);
define_token_parser!(dollar, "$", TokenKind::Dollar);

/// Operators, longest first.
fn operators(input: Span) -> IResult<Span, Token> {
    alt((
        alt((
            eq_eq_eq, ne_eq_eq, eq_eq, ne_eq, lt_gt, lte, gte, and_and, or_or, dot_dot, fat_arrow, tilde_tilde,
        )),
        alt((
            plus, minus, asterisk, slash, percent, tilde, bang, question, colon, dot, comma,
        )),
        alt((pipe, l_paren, r_paren, l_bracket, r_bracket, equal, lt, gt, at, dollar)),
    ))
    .parse(input)
}

fn identifier(input: Span) -> IResult<Span, Span> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))
    .parse(input)
}

fn ident_or_keyword(input: Span) -> IResult<Span, Token> {
    map(identifier, |span: Span| {
        let kind = match *span.fragment() {
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "not" => TokenKind::Not,
            "is" => TokenKind::Is,
            "in" => TokenKind::In,
            "as" => TokenKind::As,
            "true" | "TRUE" => TokenKind::True,
            "false" | "FALSE" => TokenKind::False,
            "null" | "none" | "NULL" => TokenKind::Null,
            ident => TokenKind::Ident(SmolStr::new(ident)),
        };
        Token::new(span.into(), kind)
    })
    .parse(input)
}

fn parse_number(fragment: &str) -> Result<Number, std::num::ParseFloatError> {
    match fragment.parse::<i64>() {
        Ok(i) if !fragment.contains('.') => Ok(Number::Int(i)),
        _ => fragment.parse::<f64>().map(Number::Float),
    }
}

fn number_literal(input: Span) -> IResult<Span, Token> {
    map_res(recognize(pair(digit1, opt(pair(char('.'), digit1)))), |span: Span| {
        parse_number(span.fragment()).map(|n| Token::new(span.into(), TokenKind::NumberLiteral(n)))
    })
    .parse(input)
}

/// Digits directly after a `.` are a path segment (`items.0.1`), never a fraction.
fn integer_literal(input: Span) -> IResult<Span, Token> {
    map_res(digit1, |span: Span| {
        parse_number(span.fragment()).map(|n| Token::new(span.into(), TokenKind::NumberLiteral(n)))
    })
    .parse(input)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn ident_prefix(s: &str) -> &str {
    let end = s
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_alphanumeric() || *c == '_') || (*i == 0 && !is_ident_start(*c)))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    &s[..end]
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Opening {
    Comment,
    Tag(Delimiter),
    Print(Delimiter),
}

impl Opening {
    fn open_len(&self) -> usize {
        match self {
            Opening::Comment | Opening::Tag(Delimiter::Standard) | Opening::Print(Delimiter::Standard) => 2,
            Opening::Tag(Delimiter::Brace) | Opening::Print(Delimiter::Brace) => 1,
        }
    }

    fn close(&self) -> &'static str {
        match self {
            Opening::Comment => "#}",
            Opening::Tag(Delimiter::Standard) => "%}",
            Opening::Print(Delimiter::Standard) => "}}",
            Opening::Tag(Delimiter::Brace) | Opening::Print(Delimiter::Brace) => "}",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Options {
    /// Drop the newline that directly follows a tag.
    pub auto_trim: bool,
    pub block_tags: FxHashSet<SmolStr>,
    pub inline_tags: FxHashSet<SmolStr>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            auto_trim: false,
            block_tags: BLOCK_TAGS.iter().map(|t| SmolStr::new(t)).collect(),
            inline_tags: INLINE_TAGS.iter().map(|t| SmolStr::new(t)).collect(),
        }
    }
}

impl Options {
    pub fn with_tag(mut self, name: &str, is_block: bool) -> Self {
        if is_block {
            self.block_tags.insert(SmolStr::new(name));
        } else {
            self.inline_tags.insert(SmolStr::new(name));
        }
        self
    }

    pub fn is_tag(&self, name: &str) -> bool {
        self.block_tags.contains(name) || self.inline_tags.contains(name)
    }
}

pub struct Lexer {
    options: Options,
}

impl Lexer {
    pub fn new(options: Options) -> Self {
        Self { options }
    }

    pub fn tokenize(&self, input: &str) -> Result<Vec<Token>, LexerError> {
        let mut tokens = Vec::new();
        let mut span = Span::new(input);

        while !span.fragment().is_empty() {
            let Some((offset, opening)) = self.find_opening(span.fragment()) else {
                let (rest, text) = span.take_split(span.fragment().len());
                tokens.push(Token::new(text.into(), TokenKind::Text(text.fragment().to_string())));
                span = rest;
                break;
            };

            if offset > 0 {
                let (rest, text) = span.take_split(offset);
                tokens.push(Token::new(text.into(), TokenKind::Text(text.fragment().to_string())));
                span = rest;
            }

            span = match opening {
                Opening::Comment => self.comment(span, &mut tokens)?,
                _ => self.tag(span, opening, &mut tokens)?,
            };
        }

        tokens.push(Token::new(span.into(), TokenKind::Eof));
        Ok(tokens)
    }

    /// Finds the earliest delimiter in HTML text. A single `{` only opens a tag when a
    /// known tag name, `/name`, `@name` or `$.` follows it.
    fn find_opening(&self, fragment: &str) -> Option<(usize, Opening)> {
        fragment.match_indices('{').find_map(|(i, _)| {
            let rest = &fragment[i + 1..];
            let mut chars = rest.chars();
            let opening = match chars.next()? {
                '{' => Some(Opening::Print(Delimiter::Standard)),
                '%' => Some(Opening::Tag(Delimiter::Standard)),
                '#' => Some(Opening::Comment),
                '/' if chars.next().is_some_and(is_ident_start) => Some(Opening::Tag(Delimiter::Brace)),
                '@' if chars.next().is_some_and(is_ident_start) => Some(Opening::Print(Delimiter::Brace)),
                '$' if chars.next() == Some('.') => Some(Opening::Print(Delimiter::Brace)),
                c if is_ident_start(c) && self.options.is_tag(ident_prefix(rest)) => Some(Opening::Tag(Delimiter::Brace)),
                _ => None,
            };
            opening.map(|o| (i, o))
        })
    }

    fn comment<'a>(&self, span: Span<'a>, tokens: &mut Vec<Token>) -> Result<Span<'a>, LexerError> {
        let open: Range = span.take(2).into();
        let body = &span.fragment()[2..];
        let end = body.find("#}").ok_or(LexerError::UnterminatedComment(open))?;
        let (rest, comment) = span.take_split(end + 4);
        tokens.push(Token::new(comment.into(), TokenKind::Comment(body[..end].to_string())));
        Ok(rest)
    }

    fn tag<'a>(&self, span: Span<'a>, opening: Opening, tokens: &mut Vec<Token>) -> Result<Span<'a>, LexerError> {
        let (mut span, open) = span.take_split(opening.open_len());
        let open_range: Range = open.into();
        let close = opening.close();
        let first_index = tokens.len() + 1;

        tokens.push(Token::new(
            open_range,
            match opening {
                Opening::Print(delimiter) => TokenKind::PrintOpen(delimiter),
                Opening::Tag(delimiter) => TokenKind::TagOpen(delimiter),
                Opening::Comment => TokenKind::Comment(String::new()),
            },
        ));

        loop {
            let fragment = span.fragment();
            let whitespace = fragment.len() - fragment.trim_start().len();
            if whitespace > 0 {
                let (rest, ws) = span.take_split(whitespace);
                if tokens.len() > first_index {
                    if let Some(last) = tokens.last_mut() {
                        last.trailing_whitespace = SmolStr::new(ws.fragment());
                    }
                }
                span = rest;
            }

            let fragment = span.fragment();
            if fragment.is_empty() {
                return Err(LexerError::UnclosedTag(open_range, SmolStr::new(&open.fragment()[..])));
            }

            if fragment.starts_with(close) {
                let (rest, closing) = span.take_split(close.len());
                let kind = match opening {
                    Opening::Print(_) => TokenKind::PrintClose,
                    _ => TokenKind::TagClose,
                };
                tokens.push(Token::new(closing.into(), kind));
                span = rest;
                break;
            }

            let at_start = tokens.len() == first_index;
            let (rest, token) = if at_start && matches!(opening, Opening::Tag(_)) {
                self.tag_name(span)?
            } else {
                let after_dot = tokens.last().is_some_and(|t| t.kind == TokenKind::Dot);
                self.next_token(span, after_dot)?
            };
            tokens.push(token);
            span = rest;
        }

        if let Opening::Tag(delimiter) = opening {
            let is_ignore = matches!(tokens.get(first_index), Some(Token { kind: TokenKind::Ident(name), .. }) if name == "ignore");
            if is_ignore {
                span = self.verbatim(span, open_range, delimiter, tokens)?;
            }

            if self.options.auto_trim {
                let fragment = span.fragment();
                let newline = if fragment.starts_with("\r\n") {
                    2
                } else if fragment.starts_with('\n') {
                    1
                } else {
                    0
                };
                span = span.take_from(newline);
            }
        }

        Ok(span)
    }

    /// The first word of a tag: `/name` and `end<name>` become closing tokens.
    fn tag_name<'a>(&self, span: Span<'a>) -> Result<(Span<'a>, Token), LexerError> {
        let fragment = span.fragment();

        if let Some(rest) = fragment.strip_prefix('/') {
            let name = ident_prefix(rest);
            if !name.is_empty() {
                let (rest, end) = span.take_split(name.len() + 1);
                return Ok((rest, Token::new(end.into(), TokenKind::EndTag(SmolStr::new(name)))));
            }
        }

        let name = ident_prefix(fragment);
        if let Some(closing) = name.strip_prefix("end") {
            if self.options.block_tags.contains(closing) {
                let (rest, end) = span.take_split(name.len());
                return Ok((rest, Token::new(end.into(), TokenKind::EndTag(SmolStr::new(closing)))));
            }
        }

        self.next_token(span, false)
    }

    fn next_token<'a>(&self, span: Span<'a>, after_dot: bool) -> Result<(Span<'a>, Token), LexerError> {
        let Some(c) = span.fragment().chars().next() else {
            return Err(LexerError::UnclosedTag(span.into(), SmolStr::new("tag")));
        };

        match c {
            '\'' | '"' => self.string_literal(span, c),
            c if c.is_ascii_digit() => {
                let parsed = if after_dot { integer_literal(span) } else { number_literal(span) };
                let (rest, token) = parsed.map_err(|_| LexerError::InvalidNumber(span.take(1).into()))?;
                let mut tail = rest.fragment().chars();
                if !after_dot && tail.next() == Some('.') && tail.next().is_some_and(|c| c.is_ascii_digit()) {
                    return Err(LexerError::InvalidNumber(token.range));
                }
                Ok((rest, token))
            }
            c if is_ident_start(c) => {
                ident_or_keyword(span).map_err(|_| LexerError::UnexpectedCharacter(span.take(1).into(), c))
            }
            c => operators(span).map_err(|_| LexerError::UnexpectedCharacter(span.take(c.len_utf8()).into(), c)),
        }
    }

    /// Scans a quoted string, decoding `\n`, `\t`, `\\` and the escaped quote.
    fn string_literal<'a>(&self, span: Span<'a>, quote: char) -> Result<(Span<'a>, Token), LexerError> {
        let fragment = span.fragment();
        let mut value = String::new();
        let mut chars = fragment.char_indices().skip(1);

        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, '\\')) => value.push('\\'),
                    Some((_, q)) if q == quote => value.push(q),
                    Some((_, other)) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => break,
                },
                c if c == quote => {
                    let (rest, literal) = span.take_split(i + c.len_utf8());
                    return Ok((rest, Token::new(literal.into(), TokenKind::StringLiteral(value))));
                }
                c => value.push(c),
            }
        }

        Err(LexerError::UnterminatedString(span.take(1).into()))
    }

    /// Passes everything up to the matching `{/ignore}` through as text.
    fn verbatim<'a>(
        &self,
        span: Span<'a>,
        open_range: Range,
        delimiter: Delimiter,
        tokens: &mut Vec<Token>,
    ) -> Result<Span<'a>, LexerError> {
        let fragment = span.fragment();
        let closing = ["{/ignore}", "{% endignore %}", "{%endignore%}"]
            .iter()
            .filter_map(|candidate| fragment.find(candidate).map(|i| (i, candidate.len())))
            .min_by_key(|(i, _)| *i);
        let Some((offset, len)) = closing else {
            return Err(LexerError::UnclosedTag(open_range, SmolStr::new("{ignore}")));
        };

        let (span, text) = span.take_split(offset);
        if offset > 0 {
            tokens.push(Token::new(text.into(), TokenKind::Text(text.fragment().to_string())));
        }

        let (rest, end) = span.take_split(len);
        let range: Range = end.into();
        tokens.push(Token::new(range, TokenKind::TagOpen(delimiter)));
        tokens.push(Token::new(range, TokenKind::EndTag(SmolStr::new("ignore"))));
        tokens.push(Token::new(range, TokenKind::TagClose));
        Ok(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn kinds(input: &str) -> Result<Vec<TokenKind>, LexerError> {
        Lexer::new(Options::default())
            .tokenize(input)
            .map(|tokens| tokens.into_iter().map(|t| t.kind).collect())
    }

    fn ident(name: &str) -> TokenKind {
        TokenKind::Ident(SmolStr::new(name))
    }

    #[rstest]
    #[case::plain_html("<p>hello</p>", vec![TokenKind::Text("<p>hello</p>".to_string()), TokenKind::Eof])]
    #[case::css_braces("a { color: red }", vec![TokenKind::Text("a { color: red }".to_string()), TokenKind::Eof])]
    #[case::print(
        "{{ name }}",
        vec![TokenKind::PrintOpen(Delimiter::Standard), ident("name"), TokenKind::PrintClose, TokenKind::Eof]
    )]
    #[case::brace_tag(
        "{if x}y{/if}",
        vec![
            TokenKind::TagOpen(Delimiter::Brace), ident("if"), ident("x"), TokenKind::TagClose,
            TokenKind::Text("y".to_string()),
            TokenKind::TagOpen(Delimiter::Brace), TokenKind::EndTag(SmolStr::new("if")), TokenKind::TagClose,
            TokenKind::Eof,
        ]
    )]
    #[case::brace_elif(
        "{elif y}",
        vec![TokenKind::TagOpen(Delimiter::Brace), ident("elif"), ident("y"), TokenKind::TagClose, TokenKind::Eof]
    )]
    #[case::end_keyword(
        "{% endforeach %}",
        vec![TokenKind::TagOpen(Delimiter::Standard), TokenKind::EndTag(SmolStr::new("foreach")), TokenKind::TagClose, TokenKind::Eof]
    )]
    #[case::comment(
        "a{# note #}b",
        vec![
            TokenKind::Text("a".to_string()),
            TokenKind::Comment(" note ".to_string()),
            TokenKind::Text("b".to_string()),
            TokenKind::Eof,
        ]
    )]
    #[case::loop_meta(
        "{@index}",
        vec![TokenKind::PrintOpen(Delimiter::Brace), TokenKind::At, ident("index"), TokenKind::PrintClose, TokenKind::Eof]
    )]
    #[case::longest_operator(
        "{{ a === b !== c }}",
        vec![
            TokenKind::PrintOpen(Delimiter::Standard), ident("a"), TokenKind::EqEqEq, ident("b"), TokenKind::NeEqEq, ident("c"),
            TokenKind::PrintClose, TokenKind::Eof,
        ]
    )]
    #[case::range(
        "{{ 1..5 }}",
        vec![
            TokenKind::PrintOpen(Delimiter::Standard),
            TokenKind::NumberLiteral(Number::Int(1)), TokenKind::DotDot, TokenKind::NumberLiteral(Number::Int(5)),
            TokenKind::PrintClose, TokenKind::Eof,
        ]
    )]
    #[case::decimal(
        "{{ 1.5 }}",
        vec![TokenKind::PrintOpen(Delimiter::Standard), TokenKind::NumberLiteral(Number::Float(1.5)), TokenKind::PrintClose, TokenKind::Eof]
    )]
    #[case::numeric_path(
        "{{ a.0.1 }}",
        vec![
            TokenKind::PrintOpen(Delimiter::Standard), ident("a"), TokenKind::Dot, TokenKind::NumberLiteral(Number::Int(0)),
            TokenKind::Dot, TokenKind::NumberLiteral(Number::Int(1)), TokenKind::PrintClose, TokenKind::Eof,
        ]
    )]
    #[case::string_escapes(
        r#"{{ "a\n\t\\\"b" }}"#,
        vec![TokenKind::PrintOpen(Delimiter::Standard), TokenKind::StringLiteral("a\n\t\\\"b".to_string()), TokenKind::PrintClose, TokenKind::Eof]
    )]
    #[case::modulo_before_close(
        "{% set x = a % 2 %}",
        vec![
            TokenKind::TagOpen(Delimiter::Standard), ident("set"), ident("x"), TokenKind::Equal, ident("a"), TokenKind::Percent,
            TokenKind::NumberLiteral(Number::Int(2)), TokenKind::TagClose, TokenKind::Eof,
        ]
    )]
    #[case::keywords(
        "{{ a and not b or c is null }}",
        vec![
            TokenKind::PrintOpen(Delimiter::Standard), ident("a"), TokenKind::And, TokenKind::Not, ident("b"), TokenKind::Or,
            ident("c"), TokenKind::Is, TokenKind::Null, TokenKind::PrintClose, TokenKind::Eof,
        ]
    )]
    #[case::ignore(
        "{ignore}{{ raw }}{/ignore}",
        vec![
            TokenKind::TagOpen(Delimiter::Brace), ident("ignore"), TokenKind::TagClose,
            TokenKind::Text("{{ raw }}".to_string()),
            TokenKind::TagOpen(Delimiter::Brace), TokenKind::EndTag(SmolStr::new("ignore")), TokenKind::TagClose,
            TokenKind::Eof,
        ]
    )]
    fn test_tokenize(#[case] input: &str, #[case] expected: Vec<TokenKind>) {
        assert_eq!(kinds(input), Ok(expected));
    }

    #[rstest]
    #[case::unterminated_string("line1\n{{ 'abc }}", 2)]
    #[case::unclosed_print("\n\n{{ name", 3)]
    #[case::unterminated_comment("{# never", 1)]
    #[case::second_decimal("{{ 1.2.3 }}", 1)]
    #[case::bad_character("{{ a ; b }}", 1)]
    fn test_tokenize_error_line(#[case] input: &str, #[case] line: u32) {
        let err = Lexer::new(Options::default()).tokenize(input).unwrap_err();
        assert_eq!(err.line(), line);
    }

    #[test]
    fn test_trailing_whitespace_and_lines() {
        let tokens = Lexer::new(Options::default()).tokenize("a\n{{ f (x) }}").unwrap();
        let f = tokens.iter().find(|t| t.kind == ident("f")).unwrap();

        assert!(f.is_spaced());
        assert_eq!(f.line(), 2);
    }

    #[test]
    fn test_auto_trim_drops_newline_after_tag() {
        let options = Options {
            auto_trim: true,
            ..Options::default()
        };
        let tokens = Lexer::new(options).tokenize("{if x}\nA{/if}\n").unwrap();
        let texts = tokens
            .into_iter()
            .filter_map(|t| match t.kind {
                TokenKind::Text(s) => Some(s),
                _ => None,
            })
            .collect::<Vec<_>>();

        assert_eq!(texts, vec!["A".to_string()]);
    }

    #[test]
    fn test_custom_tag_shorthand() {
        let options = Options::default().with_tag("spaceless", true);
        let tokens = kinds_with(options, "{spaceless}x{/spaceless}");
        assert_eq!(tokens[1], ident("spaceless"));
    }

    fn kinds_with(options: Options, input: &str) -> Vec<TokenKind> {
        Lexer::new(options)
            .tokenize(input)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    proptest! {
        #[test]
        fn test_text_without_braces_is_single_token(text in "[^{]{1,64}") {
            let tokens = kinds(&text).unwrap();
            prop_assert_eq!(tokens, vec![TokenKind::Text(text.clone()), TokenKind::Eof]);
        }
    }
}
