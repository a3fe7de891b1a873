use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::number::Number;

pub type Ident = SmolStr;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    /// `.name`
    Name(Ident),
    /// `[expr]` or `.0`
    Index(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterCall {
    pub name: Ident,
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Not,
    Neg,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Identical,
    NotIdentical,
    Lt,
    Lte,
    Gt,
    Gte,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Concat,
    ConcatSpace,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Identical
                | BinaryOp::NotIdentical
                | BinaryOp::Lt
                | BinaryOp::Lte
                | BinaryOp::Gt
                | BinaryOp::Gte
        )
    }
}

/// Right-hand side of `is`.
#[derive(Debug, Clone, PartialEq)]
pub enum IsTest {
    /// A named check such as `int`, `empty` or `odd`.
    Check(Ident),
    /// Instance-of against a host object's type name.
    TypeName(Ident),
    /// Strict equality against a value.
    Value(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InMode {
    Auto,
    String,
    List,
    Keys,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    pub name: Option<Ident>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Callee {
    /// `name(...)`: a macro, a function, or a filter used as a function.
    Function(Ident),
    /// `object.name(...)`: a method call, or a namespaced macro when `object` is an import alias.
    Method { object: Box<Expr>, name: Ident },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Var(Ident, Vec<PathSegment>),
    /// Property or index access on something that is not a plain variable.
    Get(Box<Expr>, PathSegment),
    /// `@index`, `@parent.first`
    LoopMeta(Vec<Ident>),
    /// `$.name.path` or `$.name(args)`
    Accessor {
        name: Ident,
        path: Vec<PathSegment>,
        args: Option<Vec<Arg>>,
    },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    /// `a ?: b`
    Elvis(Box<Expr>, Box<Expr>),
    /// `a !: b`
    Coalesce(Box<Expr>, Box<Expr>),
    /// `a ! b : c`
    IfSet {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    /// `a?`
    NotEmpty(Box<Expr>),
    /// `a!`
    IsSet(Box<Expr>),
    Is {
        value: Box<Expr>,
        test: IsTest,
        negated: bool,
    },
    In {
        needle: Box<Expr>,
        haystack: Box<Expr>,
        mode: InMode,
        negated: bool,
    },
    Range {
        from: Box<Expr>,
        to: Box<Expr>,
    },
    Call {
        target: Callee,
        args: Vec<Arg>,
    },
    Array(Vec<(Option<Expr>, Expr)>),
    Filtered {
        base: Box<Expr>,
        filters: Vec<FilterCall>,
    },
}

impl Expr {
    pub fn string(s: impl Into<String>) -> Self {
        Expr::Literal(Literal::String(s.into()))
    }

    pub fn var(name: &str) -> Self {
        Expr::Var(Ident::new(name), Vec::new())
    }

    /// Returns the literal string if the expression is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Expr::Literal(Literal::String(s)) => Some(s),
            _ => None,
        }
    }

    /// `name` or `name|filter...`: the shape the if-empty rewrite applies to.
    pub fn is_plain_variable(&self) -> bool {
        match self {
            Expr::Var(..) => true,
            Expr::Filtered { base, .. } => matches!(**base, Expr::Var(..)),
            _ => false,
        }
    }
}

/// Assignment target of `set`, `add`, `var` and `unset`.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub name: Ident,
    pub path: Vec<PathSegment>,
    /// `name[]`
    pub append: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetValue {
    Expr(Expr),
    Capture { body: Vec<Node>, filters: Vec<FilterCall> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    Set,
    /// Only assigns when the target is unset.
    Add,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: Ident,
    pub default: Option<Literal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MacroDef {
    pub name: Ident,
    pub params: Vec<Param>,
    pub body: Vec<Node>,
    /// The body calls the macro itself.
    pub recursive: bool,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub line: u32,
    pub kind: NodeKind,
}

impl Node {
    pub fn new(line: u32, kind: NodeKind) -> Self {
        Self { line, kind }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Text(String),
    Print {
        expr: Expr,
        raw: bool,
    },
    If {
        branches: Vec<(Expr, Vec<Node>)>,
        otherwise: Option<Vec<Node>>,
    },
    Loop {
        source: Expr,
        key: Option<Ident>,
        value: Ident,
        body: Vec<Node>,
        empty: Option<Vec<Node>>,
    },
    While {
        cond: Expr,
        body: Vec<Node>,
    },
    Switch {
        subject: Expr,
        cases: Vec<(Vec<Expr>, Vec<Node>)>,
        default: Option<Vec<Node>>,
    },
    Set {
        target: Target,
        value: SetValue,
        mode: SetMode,
    },
    Unset(Vec<Target>),
    Block {
        name: Ident,
        body: Vec<Node>,
    },
    /// `{parent}` inside an overriding block.
    Parent,
    Extends(Expr),
    Use(String),
    Include {
        name: Expr,
        params: Vec<(Ident, Expr)>,
    },
    Insert(String),
    Import {
        source: String,
        names: Option<Vec<Ident>>,
        alias: Option<Ident>,
    },
    Macro(MacroDef),
    FilterBlock {
        filters: Vec<FilterCall>,
        body: Vec<Node>,
    },
    Autoescape {
        enabled: bool,
        body: Vec<Node>,
    },
    Strip(Vec<Node>),
    Cycle(Vec<Expr>),
    Do(Expr),
    Break,
    Continue,
    /// A tag from the extension registry.
    Tag {
        name: Ident,
        args: Vec<Expr>,
        assign: Option<Ident>,
        body: Option<Vec<Node>>,
    },
}
