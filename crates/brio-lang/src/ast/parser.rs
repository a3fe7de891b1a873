use rustc_hash::FxHashMap;
use smol_str::SmolStr;

use super::error::SyntaxError;
use super::node::{
    Arg, BinaryOp, Callee, Expr, FilterCall, Ident, InMode, IsTest, Literal, Node, PathSegment, UnaryOp,
};
use super::scope::{Scope, ScopeState};
use crate::lexer::token::{Token, TokenKind};

/// Names accepted on the right of `is` as a named check.
pub const CHECK_NAMES: &[&str] = &[
    "array", "bool", "boolean", "callable", "const", "decimal", "double", "empty", "even", "float", "int", "integer",
    "iterable", "number", "numeric", "object", "odd", "scalar", "set", "string", "template",
];

/// Custom tags known to the parser, mapped to whether they take a body.
pub type TagShapes = FxHashMap<SmolStr, bool>;

pub struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    pub(super) scopes: Vec<Scope>,
    pub(super) root: Vec<Node>,
    pub(super) custom_tags: &'a TagShapes,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token], custom_tags: &'a TagShapes) -> Self {
        Self {
            tokens,
            pos: 0,
            scopes: Vec::new(),
            root: Vec::new(),
            custom_tags,
        }
    }

    pub(super) fn peek(&self) -> &'a Token {
        self.peek_nth(0)
    }

    pub(super) fn peek_nth(&self, n: usize) -> &'a Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[(self.pos + n).min(last)]
    }

    pub(super) fn advance(&mut self) -> &'a Token {
        let token = self.peek();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    pub(super) fn back(&mut self) {
        self.pos = self.pos.saturating_sub(1);
    }

    pub(super) fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(super) fn expect(&mut self, kind: TokenKind, expected: &'static str) -> Result<&'a Token, SyntaxError> {
        if self.peek().kind == kind {
            Ok(self.advance())
        } else {
            Err(self.unexpected(expected))
        }
    }

    pub(super) fn expect_ident(&mut self, expected: &'static str) -> Result<Ident, SyntaxError> {
        match &self.peek().kind {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name.clone())
            }
            _ => Err(self.unexpected(expected)),
        }
    }

    pub(super) fn unexpected(&self, expected: &'static str) -> SyntaxError {
        let token = self.peek().clone();
        if token.is_eof() {
            SyntaxError::UnexpectedEof(token)
        } else {
            SyntaxError::UnexpectedToken { token, expected }
        }
    }

    pub fn parse_expression(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<Expr, SyntaxError> {
        let cond = self.parse_binary(0)?;

        match self.peek().kind {
            TokenKind::Question => {
                self.advance();
                if self.eat(&TokenKind::Colon) {
                    let otherwise = self.parse_ternary()?;
                    return Ok(Expr::Elvis(Box::new(cond), Box::new(otherwise)));
                }
                let then = self.parse_ternary()?;
                self.expect(TokenKind::Colon, "`:` in ternary expression")?;
                let otherwise = self.parse_ternary()?;
                Ok(Expr::Ternary {
                    cond: Box::new(cond),
                    then: Box::new(then),
                    otherwise: Box::new(otherwise),
                })
            }
            TokenKind::Bang => {
                self.advance();
                if self.eat(&TokenKind::Colon) {
                    let otherwise = self.parse_ternary()?;
                    return Ok(Expr::Coalesce(Box::new(cond), Box::new(otherwise)));
                }
                let then = self.parse_ternary()?;
                self.expect(TokenKind::Colon, "`:` in ternary expression")?;
                let otherwise = self.parse_ternary()?;
                Ok(Expr::IfSet {
                    cond: Box::new(cond),
                    then: Box::new(then),
                    otherwise: Box::new(otherwise),
                })
            }
            _ => Ok(cond),
        }
    }

    fn infix_precedence(&self) -> Option<u8> {
        let precedence = match self.peek().kind {
            TokenKind::Or => 1,
            TokenKind::And => 2,
            TokenKind::EqEq
            | TokenKind::NeEq
            | TokenKind::EqEqEq
            | TokenKind::NeEqEq
            | TokenKind::Lt
            | TokenKind::Lte
            | TokenKind::Gt
            | TokenKind::Gte => 3,
            TokenKind::Is | TokenKind::In => 4,
            TokenKind::Not if self.peek_nth(1).kind == TokenKind::In => 4,
            TokenKind::DotDot => 5,
            TokenKind::Tilde | TokenKind::TildeTilde => 6,
            TokenKind::Plus | TokenKind::Minus => 7,
            TokenKind::Asterisk | TokenKind::Slash | TokenKind::Percent => 8,
            _ => return None,
        };
        Some(precedence)
    }

    fn parse_binary(&mut self, min_precedence: u8) -> Result<Expr, SyntaxError> {
        let mut lhs = self.parse_unary(true)?;

        while let Some(precedence) = self.infix_precedence() {
            if precedence < min_precedence {
                break;
            }

            let op = self.advance();
            lhs = match &op.kind {
                TokenKind::Is => {
                    let negated = self.eat(&TokenKind::Not);
                    let test = self.parse_is_test()?;
                    Expr::Is {
                        value: Box::new(lhs),
                        test,
                        negated,
                    }
                }
                TokenKind::In => self.parse_in(lhs, false)?,
                TokenKind::Not => {
                    self.advance();
                    self.parse_in(lhs, true)?
                }
                TokenKind::DotDot => {
                    let to = self.parse_binary(precedence + 1)?;
                    Expr::Range {
                        from: Box::new(lhs),
                        to: Box::new(to),
                    }
                }
                kind => {
                    let op = match kind {
                        TokenKind::Or => BinaryOp::Or,
                        TokenKind::And => BinaryOp::And,
                        TokenKind::EqEq => BinaryOp::Eq,
                        TokenKind::NeEq => BinaryOp::NotEq,
                        TokenKind::EqEqEq => BinaryOp::Identical,
                        TokenKind::NeEqEq => BinaryOp::NotIdentical,
                        TokenKind::Lt => BinaryOp::Lt,
                        TokenKind::Lte => BinaryOp::Lte,
                        TokenKind::Gt => BinaryOp::Gt,
                        TokenKind::Gte => BinaryOp::Gte,
                        TokenKind::Tilde => BinaryOp::Concat,
                        TokenKind::TildeTilde => BinaryOp::ConcatSpace,
                        TokenKind::Plus => BinaryOp::Add,
                        TokenKind::Minus => BinaryOp::Sub,
                        TokenKind::Asterisk => BinaryOp::Mul,
                        TokenKind::Slash => BinaryOp::Div,
                        _ => BinaryOp::Rem,
                    };
                    let rhs = self.parse_binary(precedence + 1)?;
                    Expr::Binary(op, Box::new(lhs), Box::new(rhs))
                }
            };
        }

        Ok(lhs)
    }

    fn parse_is_test(&mut self) -> Result<IsTest, SyntaxError> {
        let token = self.peek();
        match &token.kind {
            TokenKind::Ident(name) if CHECK_NAMES.contains(&name.as_str()) => {
                self.advance();
                Ok(IsTest::Check(name.clone()))
            }
            TokenKind::Ident(name) if name.starts_with(|c: char| c.is_ascii_uppercase()) => {
                self.advance();
                Ok(IsTest::TypeName(name.clone()))
            }
            TokenKind::Ident(_)
            | TokenKind::Null
            | TokenKind::True
            | TokenKind::False
            | TokenKind::NumberLiteral(_)
            | TokenKind::StringLiteral(_)
            | TokenKind::Minus
            | TokenKind::LParen
            | TokenKind::LBracket
            | TokenKind::Dollar
            | TokenKind::At => Ok(IsTest::Value(Box::new(self.parse_unary(false)?))),
            _ => Err(self.unexpected("a test name or value after `is`")),
        }
    }

    fn starts_term(kind: &TokenKind) -> bool {
        matches!(
            kind,
            TokenKind::Ident(_)
                | TokenKind::StringLiteral(_)
                | TokenKind::NumberLiteral(_)
                | TokenKind::LBracket
                | TokenKind::LParen
                | TokenKind::Dollar
                | TokenKind::At
        )
    }

    fn parse_in(&mut self, needle: Expr, negated: bool) -> Result<Expr, SyntaxError> {
        let explicit = match &self.peek().kind {
            TokenKind::Ident(word) if Self::starts_term(&self.peek_nth(1).kind) => match word.as_str() {
                "string" => Some(InMode::String),
                "list" => Some(InMode::List),
                "keys" => Some(InMode::Keys),
                "auto" => Some(InMode::Auto),
                _ => None,
            },
            _ => None,
        };
        if explicit.is_some() {
            self.advance();
        }

        let haystack = self.parse_binary(5)?;
        let mode = explicit.unwrap_or(match haystack {
            Expr::Array(_) => InMode::List,
            Expr::Literal(Literal::String(_)) => InMode::String,
            _ => InMode::Auto,
        });

        Ok(Expr::In {
            needle: Box::new(needle),
            haystack: Box::new(haystack),
            mode,
            negated,
        })
    }

    fn parse_unary(&mut self, allow_filters: bool) -> Result<Expr, SyntaxError> {
        match self.peek().kind {
            TokenKind::Bang | TokenKind::Not => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary(allow_filters)?)))
            }
            TokenKind::Minus => {
                self.advance();
                match self.parse_unary(allow_filters)? {
                    Expr::Literal(Literal::Number(n)) => Ok(Expr::Literal(Literal::Number(-n))),
                    operand => Ok(Expr::Unary(UnaryOp::Neg, Box::new(operand))),
                }
            }
            TokenKind::Tilde => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::BitNot, Box::new(self.parse_unary(allow_filters)?)))
            }
            TokenKind::Plus => {
                self.advance();
                self.parse_unary(allow_filters)
            }
            _ => self.parse_postfix(allow_filters),
        }
    }

    fn parse_postfix(&mut self, allow_filters: bool) -> Result<Expr, SyntaxError> {
        let mut expr = self.parse_primary()?;

        loop {
            match &self.peek().kind {
                TokenKind::Dot => {
                    self.advance();
                    let token = self.advance();
                    let segment = match &token.kind {
                        TokenKind::Ident(name) if self.peek().kind == TokenKind::LParen && !token.is_spaced() => {
                            self.advance();
                            let args = self.parse_args()?;
                            expr = Expr::Call {
                                target: Callee::Method {
                                    object: Box::new(expr),
                                    name: name.clone(),
                                },
                                args,
                            };
                            continue;
                        }
                        TokenKind::Ident(name) => PathSegment::Name(name.clone()),
                        TokenKind::NumberLiteral(n) => {
                            PathSegment::Index(Box::new(Expr::Literal(Literal::Number(*n))))
                        }
                        // keywords are valid property names: `user.is`, `item.null`
                        kind @ (TokenKind::And
                        | TokenKind::Or
                        | TokenKind::Not
                        | TokenKind::Is
                        | TokenKind::In
                        | TokenKind::As
                        | TokenKind::True
                        | TokenKind::False
                        | TokenKind::Null) => PathSegment::Name(SmolStr::new(kind.to_string())),
                        _ => {
                            self.back();
                            return Err(self.unexpected("a property name after `.`"));
                        }
                    };
                    expr = Self::attach(expr, segment);
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect(TokenKind::RBracket, "`]`")?;
                    expr = Self::attach(expr, PathSegment::Index(Box::new(index)));
                }
                TokenKind::Pipe if allow_filters => {
                    let filters = self.parse_filters()?;
                    expr = match expr {
                        Expr::Filtered { base, filters: mut chain } => {
                            chain.extend(filters);
                            Expr::Filtered { base, filters: chain }
                        }
                        base => Expr::Filtered {
                            base: Box::new(base),
                            filters,
                        },
                    };
                }
                TokenKind::Question if self.peek_nth(1).kind.ends_operand() => {
                    self.advance();
                    expr = Expr::NotEmpty(Box::new(expr));
                }
                TokenKind::Bang if self.peek_nth(1).kind.ends_operand() => {
                    self.advance();
                    expr = Expr::IsSet(Box::new(expr));
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    fn attach(expr: Expr, segment: PathSegment) -> Expr {
        match expr {
            Expr::Var(name, mut path) => {
                path.push(segment);
                Expr::Var(name, path)
            }
            Expr::Accessor {
                name,
                mut path,
                args: None,
            } => {
                path.push(segment);
                Expr::Accessor { name, path, args: None }
            }
            Expr::LoopMeta(mut path) => match segment {
                PathSegment::Name(name) => {
                    path.push(name);
                    Expr::LoopMeta(path)
                }
                segment => Expr::Get(Box::new(Expr::LoopMeta(path)), segment),
            },
            base => Expr::Get(Box::new(base), segment),
        }
    }

    /// `|name:arg:arg|other`
    pub(super) fn parse_filters(&mut self) -> Result<Vec<FilterCall>, SyntaxError> {
        let mut filters = Vec::new();
        while self.eat(&TokenKind::Pipe) {
            filters.push(self.parse_filter_call()?);
        }
        Ok(filters)
    }

    pub(super) fn parse_filter_call(&mut self) -> Result<FilterCall, SyntaxError> {
        let name = self.expect_ident("a filter name")?;
        let mut args = Vec::new();
        while self.eat(&TokenKind::Colon) {
            args.push(self.parse_unary(false)?);
        }
        Ok(FilterCall { name, args })
    }

    /// Arguments after an opening parenthesis, up to and including `)`.
    pub(super) fn parse_args(&mut self) -> Result<Vec<Arg>, SyntaxError> {
        let mut args = Vec::new();
        while !self.eat(&TokenKind::RParen) {
            let named = match (&self.peek().kind, &self.peek_nth(1).kind) {
                (TokenKind::Ident(name), TokenKind::Equal) => Some(name.clone()),
                _ => None,
            };
            if named.is_some() {
                self.advance();
                self.advance();
            }
            args.push(Arg {
                name: named,
                value: self.parse_expression()?,
            });

            if !self.eat(&TokenKind::Comma) {
                self.expect(TokenKind::RParen, "`,` or `)` in argument list")?;
                break;
            }
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, SyntaxError> {
        let token = self.advance();

        match &token.kind {
            TokenKind::NumberLiteral(n) => Ok(Expr::Literal(Literal::Number(*n))),
            TokenKind::StringLiteral(s) => Ok(Expr::Literal(Literal::String(s.clone()))),
            TokenKind::True => Ok(Expr::Literal(Literal::Bool(true))),
            TokenKind::False => Ok(Expr::Literal(Literal::Bool(false))),
            TokenKind::Null => Ok(Expr::Literal(Literal::Null)),
            TokenKind::Ident(name) if self.peek().kind == TokenKind::LParen && !token.is_spaced() => {
                self.advance();
                self.mark_recursive_call(name);
                let args = self.parse_args()?;
                Ok(Expr::Call {
                    target: Callee::Function(name.clone()),
                    args,
                })
            }
            TokenKind::Ident(name) => Ok(Expr::Var(name.clone(), Vec::new())),
            TokenKind::LParen => {
                let expr = self.parse_expression()?;
                self.expect(TokenKind::RParen, "`)`")?;
                Ok(expr)
            }
            TokenKind::LBracket => self.parse_array(),
            TokenKind::At => {
                let name = self.expect_ident("a loop property after `@`")?;
                Ok(Expr::LoopMeta(vec![name]))
            }
            TokenKind::Dollar => self.parse_accessor(),
            _ => {
                self.back();
                Err(self.unexpected("an expression"))
            }
        }
    }

    fn parse_array(&mut self) -> Result<Expr, SyntaxError> {
        let mut entries = Vec::new();
        while !self.eat(&TokenKind::RBracket) {
            let first = self.parse_expression()?;
            let entry = if self.eat(&TokenKind::FatArrow) {
                (Some(first), self.parse_expression()?)
            } else {
                (None, first)
            };
            entries.push(entry);

            if !self.eat(&TokenKind::Comma) {
                self.expect(TokenKind::RBracket, "`,` or `]` in array literal")?;
                break;
            }
        }
        Ok(Expr::Array(entries))
    }

    /// `$.name`, `$.name.path[index]`, `$.name(args)`
    fn parse_accessor(&mut self) -> Result<Expr, SyntaxError> {
        self.expect(TokenKind::Dot, "`.` after `$`")?;
        let name = self.expect_ident("an accessor name")?;

        if self.peek().kind == TokenKind::LParen {
            self.advance();
            let args = self.parse_args()?;
            return Ok(Expr::Accessor {
                name,
                path: Vec::new(),
                args: Some(args),
            });
        }

        Ok(Expr::Accessor {
            name,
            path: Vec::new(),
            args: None,
        })
    }

    fn mark_recursive_call(&mut self, name: &str) {
        if let Some(scope) = self
            .scopes
            .iter_mut()
            .rev()
            .find(|scope| matches!(&scope.state, ScopeState::Macro { name: macro_name, .. } if macro_name == name))
        {
            if let ScopeState::Macro { recursive, .. } = &mut scope.state {
                *recursive = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::{Lexer, Options};
    use crate::number::Number;
    use rstest::rstest;

    fn expr(source: &str) -> Result<Expr, SyntaxError> {
        let tokens = Lexer::new(Options::default()).tokenize(&format!("{{{{ {} }}}}", source)).unwrap();
        let shapes = TagShapes::default();
        let mut parser = Parser::new(&tokens, &shapes);
        parser.advance();
        let expr = parser.parse_expression()?;
        parser.expect(TokenKind::PrintClose, "`}}`")?;
        Ok(expr)
    }

    fn var(name: &str) -> Expr {
        Expr::var(name)
    }

    fn num(n: i64) -> Expr {
        Expr::Literal(Literal::Number(Number::Int(n)))
    }

    fn bin(op: BinaryOp, a: Expr, b: Expr) -> Expr {
        Expr::Binary(op, Box::new(a), Box::new(b))
    }

    #[rstest]
    #[case::precedence("a + b * c", bin(BinaryOp::Add, var("a"), bin(BinaryOp::Mul, var("b"), var("c"))))]
    #[case::left_assoc("a - b - c", bin(BinaryOp::Sub, bin(BinaryOp::Sub, var("a"), var("b")), var("c")))]
    #[case::boolean("a or b and c", bin(BinaryOp::Or, var("a"), bin(BinaryOp::And, var("b"), var("c"))))]
    #[case::comparison_over_concat("a ~ b == c", bin(BinaryOp::Eq, bin(BinaryOp::Concat, var("a"), var("b")), var("c")))]
    #[case::negative_literal("-3", num(-3))]
    #[case::path(
        "user.name[0]",
        Expr::Var("user".into(), vec![PathSegment::Name("name".into()), PathSegment::Index(Box::new(num(0)))])
    )]
    #[case::filters(
        "name|upper|truncate:5",
        Expr::Filtered {
            base: Box::new(var("name")),
            filters: vec![
                FilterCall { name: "upper".into(), args: vec![] },
                FilterCall { name: "truncate".into(), args: vec![num(5)] },
            ],
        }
    )]
    #[case::filter_binds_tighter("a ~ b|upper", bin(
        BinaryOp::Concat,
        var("a"),
        Expr::Filtered { base: Box::new(var("b")), filters: vec![FilterCall { name: "upper".into(), args: vec![] }] },
    ))]
    #[case::ternary("a ? b : c", Expr::Ternary { cond: Box::new(var("a")), then: Box::new(var("b")), otherwise: Box::new(var("c")) })]
    #[case::elvis("a ?: b", Expr::Elvis(Box::new(var("a")), Box::new(var("b"))))]
    #[case::elvis_spaced("a ? : b", Expr::Elvis(Box::new(var("a")), Box::new(var("b"))))]
    #[case::coalesce("a !: b", Expr::Coalesce(Box::new(var("a")), Box::new(var("b"))))]
    #[case::not_empty_check("a? and b", bin(BinaryOp::And, Expr::NotEmpty(Box::new(var("a"))), var("b")))]
    #[case::is_set_check("a!", Expr::IsSet(Box::new(var("a"))))]
    #[case::ternary_on_comparison("a > 1 ? b : c", Expr::Ternary {
        cond: Box::new(bin(BinaryOp::Gt, var("a"), num(1))),
        then: Box::new(var("b")),
        otherwise: Box::new(var("c")),
    })]
    #[case::range("1..n", Expr::Range { from: Box::new(num(1)), to: Box::new(var("n")) })]
    #[case::is_check("x is int", Expr::Is { value: Box::new(var("x")), test: IsTest::Check("int".into()), negated: false })]
    #[case::is_not_type("x is not User", Expr::Is { value: Box::new(var("x")), test: IsTest::TypeName("User".into()), negated: true })]
    #[case::is_value("x is 5", Expr::Is { value: Box::new(var("x")), test: IsTest::Value(Box::new(num(5))), negated: false })]
    #[case::in_list("x in [1, 2]", Expr::In {
        needle: Box::new(var("x")),
        haystack: Box::new(Expr::Array(vec![(None, num(1)), (None, num(2))])),
        mode: InMode::List,
        negated: false,
    })]
    #[case::not_in_keys("x not in keys map", Expr::In {
        needle: Box::new(var("x")),
        haystack: Box::new(var("map")),
        mode: InMode::Keys,
        negated: true,
    })]
    #[case::in_variable_named_list("x in list", Expr::In {
        needle: Box::new(var("x")),
        haystack: Box::new(var("list")),
        mode: InMode::Auto,
        negated: false,
    })]
    #[case::loop_meta("@parent.index", Expr::LoopMeta(vec!["parent".into(), "index".into()]))]
    #[case::accessor("$.get.page", Expr::Accessor { name: "get".into(), path: vec![PathSegment::Name("page".into())], args: None })]
    #[case::accessor_call("$.fetch('a.tpl')", Expr::Accessor {
        name: "fetch".into(),
        path: vec![],
        args: Some(vec![Arg { name: None, value: Expr::string("a.tpl") }]),
    })]
    #[case::named_args("greet(name=\"Sam\")", Expr::Call {
        target: Callee::Function("greet".into()),
        args: vec![Arg { name: Some("name".into()), value: Expr::string("Sam") }],
    })]
    #[case::method("user.label(1)", Expr::Call {
        target: Callee::Method { object: Box::new(var("user")), name: "label".into() },
        args: vec![Arg { name: None, value: num(1) }],
    })]
    #[case::map_literal("['a' => 1]", Expr::Array(vec![(Some(Expr::string("a")), num(1))]))]
    fn test_parse_expression(#[case] source: &str, #[case] expected: Expr) {
        assert_eq!(expr(source), Ok(expected));
    }

    #[rstest]
    #[case::dangling_operator("a +")]
    #[case::unclosed_paren("(a")]
    #[case::trailing_token("a b")]
    #[case::missing_colon("a ? b")]
    fn test_parse_expression_error(#[case] source: &str) {
        assert!(expr(source).is_err());
    }
}
