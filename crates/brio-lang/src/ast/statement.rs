use smol_str::SmolStr;

use super::error::SyntaxError;
use super::node::{Expr, Literal, Node, NodeKind, PathSegment, SetMode, SetValue, Target};
use super::parser::Parser;
use super::scope::{Scope, ScopeState, SwitchBranch};
use crate::lexer::token::{Token, TokenKind};

impl Parser<'_> {
    /// Parses the whole token stream into the template body.
    pub fn parse(mut self) -> Result<Vec<Node>, SyntaxError> {
        loop {
            let token = self.advance();
            match &token.kind {
                TokenKind::Text(text) => self.push(Node::new(token.line(), NodeKind::Text(text.clone()))),
                TokenKind::Comment(_) => {}
                TokenKind::PrintOpen(_) => {
                    let expr = self.parse_expression()?;
                    self.expect(TokenKind::PrintClose, "`}}` or `}`")?;
                    self.push(Node::new(token.line(), NodeKind::Print { expr, raw: false }));
                }
                TokenKind::TagOpen(_) => {
                    self.parse_tag(token)?;
                    self.expect(TokenKind::TagClose, "end of tag")?;
                }
                TokenKind::Eof => break,
                _ => {
                    self.back();
                    return Err(self.unexpected("text or a tag"));
                }
            }
        }

        if !self.scopes.is_empty() {
            let unclosed = self.scopes.iter().map(|scope| (scope.name.clone(), scope.line)).collect();
            return Err(SyntaxError::UnclosedTag(unclosed, self.peek().range));
        }

        Ok(self.root)
    }

    fn push(&mut self, node: Node) {
        match self.scopes.last_mut() {
            Some(scope) => scope.body.push(node),
            None => self.root.push(node),
        }
    }

    fn open(&mut self, name: &str, line: u32, state: ScopeState) {
        let level = self.scopes.len();
        self.scopes.push(Scope::new(name, line, level, state));
    }

    fn parse_tag(&mut self, open: &Token) -> Result<(), SyntaxError> {
        let line = open.line();
        let token = self.advance();

        let name = match &token.kind {
            TokenKind::EndTag(name) => return self.close_scope(token, name),
            TokenKind::Ident(name) => name.clone(),
            _ => {
                self.back();
                return Err(self.unexpected("a tag name"));
            }
        };

        match name.as_str() {
            "if" => {
                let cond = self.parse_expression()?;
                self.open("if", line, ScopeState::If {
                    branches: Vec::new(),
                    cond,
                    in_else: false,
                });
            }
            "elseif" | "elif" => {
                let cond = self.parse_expression()?;
                match self.scopes.last_mut() {
                    Some(Scope {
                        body,
                        state:
                            ScopeState::If {
                                branches,
                                cond: current,
                                in_else: false,
                            },
                        ..
                    }) => {
                        let previous = std::mem::replace(current, cond);
                        branches.push((previous, std::mem::take(body)));
                    }
                    _ => return Err(SyntaxError::invalid_usage(token, format!("Unexpected tag '{}'", name))),
                }
            }
            "else" => match self.scopes.last_mut() {
                Some(Scope {
                    body,
                    state: ScopeState::If {
                        branches,
                        cond,
                        in_else,
                    },
                    ..
                }) if !*in_else => {
                    let cond = std::mem::replace(cond, Expr::Literal(Literal::Null));
                    branches.push((cond, std::mem::take(body)));
                    *in_else = true;
                }
                Some(Scope {
                    body,
                    state: ScopeState::Loop { loop_body, .. },
                    ..
                }) if loop_body.is_none() => *loop_body = Some(std::mem::take(body)),
                _ => return Err(SyntaxError::invalid_usage(token, "Unexpected tag 'else'")),
            },
            "foreachelse" | "forelse" => match self.scopes.last_mut() {
                Some(Scope {
                    body,
                    state: ScopeState::Loop { loop_body, .. },
                    ..
                }) if loop_body.is_none() => *loop_body = Some(std::mem::take(body)),
                _ => return Err(SyntaxError::invalid_usage(token, format!("Unexpected tag '{}'", name))),
            },
            "foreach" => {
                let source = self.parse_expression()?;
                self.expect(TokenKind::As, "`as` in foreach")?;
                let first = self.expect_ident("a loop variable")?;
                let (key, value) = if self.eat(&TokenKind::FatArrow) {
                    (Some(first), self.expect_ident("a loop value variable")?)
                } else {
                    (None, first)
                };
                self.open("foreach", line, ScopeState::Loop {
                    source,
                    key,
                    value,
                    loop_body: None,
                });
            }
            "for" => {
                let first = self.expect_ident("a loop variable")?;
                let (key, value) = if self.eat(&TokenKind::Comma) {
                    (Some(first), self.expect_ident("a loop value variable")?)
                } else {
                    (None, first)
                };
                self.expect(TokenKind::In, "`in` in for")?;
                let source = self.parse_expression()?;
                self.open("for", line, ScopeState::Loop {
                    source,
                    key,
                    value,
                    loop_body: None,
                });
            }
            "while" => {
                let cond = self.parse_expression()?;
                self.open("while", line, ScopeState::While { cond });
            }
            "switch" => {
                let subject = self.parse_expression()?;
                self.open("switch", line, ScopeState::Switch {
                    subject,
                    cases: Vec::new(),
                    current: None,
                    default: None,
                });
            }
            "case" => {
                let mut values = vec![self.parse_expression()?];
                while self.eat(&TokenKind::Comma) {
                    values.push(self.parse_expression()?);
                }
                match self.scopes.last_mut() {
                    Some(scope) if scope.is_switch() => {
                        scope.flush_switch_branch();
                        if let ScopeState::Switch { current, .. } = &mut scope.state {
                            *current = Some(SwitchBranch::Case(values));
                        }
                    }
                    _ => return Err(SyntaxError::invalid_usage(token, "Unexpected tag 'case'")),
                }
            }
            "default" => match self.scopes.last_mut() {
                Some(scope) if scope.is_switch() => {
                    scope.flush_switch_branch();
                    if let ScopeState::Switch { current, default, .. } = &mut scope.state {
                        if default.is_some() {
                            return Err(SyntaxError::invalid_usage(token, "Switch accepts only one 'default'"));
                        }
                        *current = Some(SwitchBranch::Default);
                    }
                }
                _ => return Err(SyntaxError::invalid_usage(token, "Unexpected tag 'default'")),
            },
            "set" | "add" | "var" => {
                let mode = if name == "add" { SetMode::Add } else { SetMode::Set };
                let target = self.parse_target()?;
                if self.eat(&TokenKind::Equal) {
                    let value = self.parse_expression()?;
                    self.push(Node::new(line, NodeKind::Set {
                        target,
                        value: SetValue::Expr(value),
                        mode,
                    }));
                } else {
                    let filters = self.parse_filters()?;
                    self.open(&name, line, ScopeState::Set { target, filters, mode });
                }
            }
            "unset" => {
                let mut targets = vec![self.parse_target()?];
                while !matches!(self.peek().kind, TokenKind::TagClose | TokenKind::Eof) {
                    self.eat(&TokenKind::Comma);
                    targets.push(self.parse_target()?);
                }
                self.push(Node::new(line, NodeKind::Unset(targets)));
            }
            "block" => {
                let block = self.parse_name("a block name")?;
                self.open("block", line, ScopeState::Block { name: block });
            }
            "parent" => {
                if !self.scopes.iter().any(|scope| matches!(scope.state, ScopeState::Block { .. })) {
                    return Err(SyntaxError::invalid_usage(token, "Tag {parent} may only be used inside a block"));
                }
                self.push(Node::new(line, NodeKind::Parent));
            }
            "extends" => {
                if !self.scopes.is_empty() {
                    return Err(SyntaxError::invalid_usage(token, "Tag {extends} can not be nested"));
                }
                let parent = self.parse_expression()?;
                self.push(Node::new(line, NodeKind::Extends(parent)));
            }
            "use" => {
                let source = self.parse_string("a template name")?;
                self.push(Node::new(line, NodeKind::Use(source)));
            }
            "insert" => {
                let source = self.parse_string("a template name")?;
                self.push(Node::new(line, NodeKind::Insert(source)));
            }
            "include" => {
                let template = self.parse_expression()?;
                let mut params = Vec::new();
                while let (TokenKind::Ident(param), TokenKind::Equal) = (&self.peek().kind, &self.peek_nth(1).kind) {
                    let param = param.clone();
                    self.advance();
                    self.advance();
                    params.push((param, self.parse_expression()?));
                }
                self.push(Node::new(line, NodeKind::Include { name: template, params }));
            }
            "import" => self.parse_import(line)?,
            "macro" => self.parse_macro(line)?,
            "filter" => {
                let filters = if self.peek().kind == TokenKind::Pipe {
                    self.parse_filters()?
                } else {
                    let mut filters = vec![self.parse_filter_call()?];
                    filters.extend(self.parse_filters()?);
                    filters
                };
                self.open("filter", line, ScopeState::Filter { filters });
            }
            "autoescape" | "escape" => {
                let enabled = match &self.peek().kind {
                    TokenKind::True => true,
                    TokenKind::False => false,
                    TokenKind::Ident(word) if word == "on" => true,
                    TokenKind::Ident(word) if word == "off" => false,
                    TokenKind::TagClose => {
                        self.open(&name, line, ScopeState::Autoescape { enabled: true });
                        return Ok(());
                    }
                    _ => return Err(self.unexpected("true, false, on or off")),
                };
                self.advance();
                self.open(&name, line, ScopeState::Autoescape { enabled });
            }
            "strip" => self.open("strip", line, ScopeState::Strip),
            "ignore" => self.open("ignore", line, ScopeState::Ignore),
            "cycle" => {
                let mut values = vec![self.parse_expression()?];
                while self.eat(&TokenKind::Comma) {
                    values.push(self.parse_expression()?);
                }
                self.push(Node::new(line, NodeKind::Cycle(values)));
            }
            "do" => {
                let expr = self.parse_expression()?;
                self.push(Node::new(line, NodeKind::Do(expr)));
            }
            "raw" => {
                let expr = self.parse_expression()?;
                self.push(Node::new(line, NodeKind::Print { expr, raw: true }));
            }
            "break" | "continue" => {
                let allowed = self
                    .scopes
                    .iter()
                    .rev()
                    .take_while(|scope| !matches!(scope.state, ScopeState::Macro { .. }))
                    .any(|scope| scope.is_loop() || (name == "break" && scope.is_switch()));
                if !allowed {
                    return Err(SyntaxError::invalid_usage(
                        token,
                        format!("Tag {{{}}} may only be used inside a loop", name),
                    ));
                }
                let kind = if name == "break" { NodeKind::Break } else { NodeKind::Continue };
                self.push(Node::new(line, kind));
            }
            _ => match self.custom_tags.get(&name).copied() {
                Some(is_block) => self.parse_custom_tag(name, line, is_block)?,
                None if self.peek().kind == TokenKind::LParen => {
                    self.back();
                    let expr = self.parse_expression()?;
                    self.push(Node::new(line, NodeKind::Print { expr, raw: false }));
                }
                None => return Err(SyntaxError::UnknownTag(token.clone(), name)),
            },
        }

        Ok(())
    }

    fn close_scope(&mut self, token: &Token, name: &SmolStr) -> Result<(), SyntaxError> {
        let Some(scope) = self.scopes.last() else {
            return Err(SyntaxError::UnexpectedClose(token.clone(), name.clone()));
        };

        if &scope.name != name {
            return Err(SyntaxError::MismatchedClose {
                token: token.clone(),
                found: name.clone(),
                expected: scope.name.clone(),
                opened: scope.line,
            });
        }

        if let Some(scope) = self.scopes.pop() {
            let line = scope.line;
            self.push(Node::new(line, scope.finish()));
        }
        Ok(())
    }

    /// `x`, `x.a.b`, `x[expr]`, `x[]`
    fn parse_target(&mut self) -> Result<Target, SyntaxError> {
        let name = self.expect_ident("a variable name")?;
        let mut path = Vec::new();
        let mut append = false;

        loop {
            match self.peek().kind {
                TokenKind::Dot if !append => {
                    self.advance();
                    let token = self.advance();
                    match &token.kind {
                        TokenKind::Ident(segment) => path.push(PathSegment::Name(segment.clone())),
                        TokenKind::NumberLiteral(n) => {
                            path.push(PathSegment::Index(Box::new(Expr::Literal(Literal::Number(*n)))))
                        }
                        _ => {
                            self.back();
                            return Err(self.unexpected("a property name after `.`"));
                        }
                    }
                }
                TokenKind::LBracket if !append => {
                    self.advance();
                    if self.eat(&TokenKind::RBracket) {
                        append = true;
                    } else {
                        let index = self.parse_expression()?;
                        self.expect(TokenKind::RBracket, "`]`")?;
                        path.push(PathSegment::Index(Box::new(index)));
                    }
                }
                _ => break,
            }
        }

        Ok(Target { name, path, append })
    }

    fn parse_name(&mut self, expected: &'static str) -> Result<SmolStr, SyntaxError> {
        match &self.peek().kind {
            TokenKind::StringLiteral(s) => {
                self.advance();
                Ok(SmolStr::new(s))
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name.clone())
            }
            _ => Err(self.unexpected(expected)),
        }
    }

    fn parse_string(&mut self, expected: &'static str) -> Result<String, SyntaxError> {
        match &self.peek().kind {
            TokenKind::StringLiteral(s) => {
                self.advance();
                Ok(s.clone())
            }
            _ => Err(self.unexpected(expected)),
        }
    }

    /// `{import 'tpl' as ns}` or `{import [a, b] from 'tpl'}`
    fn parse_import(&mut self, line: u32) -> Result<(), SyntaxError> {
        let names = if self.eat(&TokenKind::LBracket) {
            let mut names = Vec::new();
            while !self.eat(&TokenKind::RBracket) {
                names.push(self.expect_ident("a macro name")?);
                if !self.eat(&TokenKind::Comma) {
                    self.expect(TokenKind::RBracket, "`,` or `]`")?;
                    break;
                }
            }
            match &self.peek().kind {
                TokenKind::Ident(word) if word == "from" => {
                    self.advance();
                }
                _ => return Err(self.unexpected("`from` in import")),
            }
            Some(names)
        } else {
            None
        };

        let source = self.parse_string("a template name")?;
        let alias = if self.eat(&TokenKind::As) {
            Some(self.expect_ident("a namespace")?)
        } else {
            None
        };

        self.push(Node::new(line, NodeKind::Import { source, names, alias }));
        Ok(())
    }

    /// `{macro name(a, b='x')}`
    fn parse_macro(&mut self, line: u32) -> Result<(), SyntaxError> {
        let name = self.expect_ident("a macro name")?;
        let mut params = Vec::new();

        if self.eat(&TokenKind::LParen) {
            while !self.eat(&TokenKind::RParen) {
                let param = self.expect_ident("a parameter name")?;
                let default = if self.eat(&TokenKind::Equal) {
                    let token = self.peek();
                    match self.parse_expression()? {
                        Expr::Literal(literal) => Some(literal),
                        _ => {
                            return Err(SyntaxError::invalid_usage(
                                token,
                                "Macro parameter defaults must be scalar literals",
                            ));
                        }
                    }
                } else {
                    None
                };
                params.push((param, default));

                if !self.eat(&TokenKind::Comma) {
                    self.expect(TokenKind::RParen, "`,` or `)` in parameter list")?;
                    break;
                }
            }
        }

        self.open("macro", line, ScopeState::Macro {
            name,
            params,
            recursive: false,
        });
        Ok(())
    }

    fn parse_custom_tag(&mut self, name: SmolStr, line: u32, is_block: bool) -> Result<(), SyntaxError> {
        let mut args = Vec::new();
        let mut assign = None;

        while !matches!(self.peek().kind, TokenKind::TagClose | TokenKind::Eof) {
            if self.eat(&TokenKind::As) {
                assign = Some(self.expect_ident("a variable name after `as`")?);
                continue;
            }
            args.push(self.parse_expression()?);
            self.eat(&TokenKind::Comma);
        }

        if is_block {
            self.open(&name, line, ScopeState::Custom { args, assign });
        } else {
            self.push(Node::new(line, NodeKind::Tag {
                name,
                args,
                assign,
                body: None,
            }));
        }
        Ok(())
    }
}
