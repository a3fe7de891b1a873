//! Compile-time bookkeeping for open block tags.
//!
//! A [`Scope`] is pushed when a block tag opens and popped when its closing tag
//! arrives. Intermediate tags (`else`, `case`, ...) update the scope state; the
//! close handler turns the scope into a finished [`Node`].

use smol_str::SmolStr;

use super::node::{Expr, FilterCall, Ident, Literal, MacroDef, Node, NodeKind, Param, SetMode, SetValue, Target};

#[derive(Debug, Clone)]
pub struct Scope {
    /// The tag name as written, which the closing tag must repeat.
    pub name: SmolStr,
    pub line: u32,
    pub level: usize,
    /// Nodes produced since the scope (or its current branch) opened.
    pub body: Vec<Node>,
    pub state: ScopeState,
}

#[derive(Debug, Clone)]
pub enum ScopeState {
    If {
        branches: Vec<(Expr, Vec<Node>)>,
        cond: Expr,
        in_else: bool,
    },
    Loop {
        source: Expr,
        key: Option<Ident>,
        value: Ident,
        /// Set once the empty branch starts; holds the finished loop body.
        loop_body: Option<Vec<Node>>,
    },
    While {
        cond: Expr,
    },
    Switch {
        subject: Expr,
        cases: Vec<(Vec<Expr>, Vec<Node>)>,
        current: Option<SwitchBranch>,
        default: Option<Vec<Node>>,
    },
    Set {
        target: Target,
        filters: Vec<FilterCall>,
        mode: SetMode,
    },
    Block {
        name: Ident,
    },
    Macro {
        name: Ident,
        params: Vec<(Ident, Option<Literal>)>,
        recursive: bool,
    },
    Filter {
        filters: Vec<FilterCall>,
    },
    Autoescape {
        enabled: bool,
    },
    Strip,
    Ignore,
    Custom {
        args: Vec<Expr>,
        assign: Option<Ident>,
    },
}

#[derive(Debug, Clone)]
pub enum SwitchBranch {
    Case(Vec<Expr>),
    Default,
}

impl Scope {
    pub fn new(name: &str, line: u32, level: usize, state: ScopeState) -> Self {
        Self {
            name: SmolStr::new(name),
            line,
            level,
            body: Vec::new(),
            state,
        }
    }

    pub fn is_loop(&self) -> bool {
        matches!(self.state, ScopeState::Loop { .. } | ScopeState::While { .. })
    }

    pub fn is_switch(&self) -> bool {
        matches!(self.state, ScopeState::Switch { .. })
    }

    /// Files the nodes collected for the current switch branch.
    pub fn flush_switch_branch(&mut self) {
        let body = std::mem::take(&mut self.body);
        if let ScopeState::Switch { cases, current, default, .. } = &mut self.state {
            match current.take() {
                Some(SwitchBranch::Case(values)) => cases.push((values, body)),
                Some(SwitchBranch::Default) => *default = Some(body),
                // text before the first case is dropped
                None => {}
            }
        }
    }

    /// Turns the closed scope into its node.
    pub fn finish(mut self) -> NodeKind {
        if self.is_switch() {
            self.flush_switch_branch();
        }

        let body = self.body;
        match self.state {
            ScopeState::If {
                mut branches,
                cond,
                in_else,
            } => {
                if in_else {
                    NodeKind::If {
                        branches,
                        otherwise: Some(body),
                    }
                } else {
                    branches.push((cond, body));
                    NodeKind::If {
                        branches,
                        otherwise: None,
                    }
                }
            }
            ScopeState::Loop {
                source,
                key,
                value,
                loop_body,
            } => match loop_body {
                Some(loop_body) => NodeKind::Loop {
                    source,
                    key,
                    value,
                    body: loop_body,
                    empty: Some(body),
                },
                None => NodeKind::Loop {
                    source,
                    key,
                    value,
                    body,
                    empty: None,
                },
            },
            ScopeState::While { cond } => NodeKind::While { cond, body },
            ScopeState::Switch {
                subject, cases, default, ..
            } => NodeKind::Switch {
                subject,
                cases,
                default,
            },
            ScopeState::Set { target, filters, mode } => NodeKind::Set {
                target,
                value: SetValue::Capture { body, filters },
                mode,
            },
            ScopeState::Block { name } => NodeKind::Block { name, body },
            ScopeState::Macro {
                name,
                params,
                recursive,
            } => NodeKind::Macro(MacroDef {
                name,
                params: params
                    .into_iter()
                    .map(|(name, default)| Param { name, default })
                    .collect(),
                body,
                recursive,
                line: self.line,
            }),
            ScopeState::Filter { filters } => NodeKind::FilterBlock { filters, body },
            ScopeState::Autoescape { enabled } => NodeKind::Autoescape { enabled, body },
            ScopeState::Strip => NodeKind::Strip(body),
            ScopeState::Ignore => NodeKind::Text(
                body.into_iter()
                    .filter_map(|node| match node.kind {
                        NodeKind::Text(text) => Some(text),
                        _ => None,
                    })
                    .collect(),
            ),
            ScopeState::Custom { args, assign } => NodeKind::Tag {
                name: self.name,
                args,
                assign,
                body: Some(body),
            },
        }
    }
}
