//! The resolved intermediate representation.
//!
//! The compiler lowers the AST into these nodes after inheritance, includes,
//! macros and escaping have been decided. The IR is what gets persisted in the
//! compilation cache; closure generation runs over it on every load.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::number::Number;
use crate::options::Options;
use crate::value::Value;

pub mod builder;

pub use crate::ast::node::{BinaryOp, InMode, UnaryOp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Const {
    Null,
    Bool(bool),
    Number(Number),
    String(SmolStr),
}

impl Const {
    pub fn to_value(&self) -> Value {
        match self {
            Const::Null => Value::Null,
            Const::Bool(b) => Value::Bool(*b),
            Const::Number(n) => Value::Number(*n),
            Const::String(s) => Value::String(s.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    Name(SmolStr),
    Index(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopField {
    Index,
    Iteration,
    First,
    Last,
    RevIndex,
    Length,
    Key,
}

impl LoopField {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "index" => Some(LoopField::Index),
            "iteration" => Some(LoopField::Iteration),
            "first" => Some(LoopField::First),
            "last" => Some(LoopField::Last),
            "revindex" => Some(LoopField::RevIndex),
            "length" => Some(LoopField::Length),
            "key" => Some(LoopField::Key),
            _ => None,
        }
    }

    pub fn needs_length(&self) -> bool {
        matches!(self, LoopField::Last | LoopField::RevIndex | LoopField::Length)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Const(Const),
    Var {
        name: SmolStr,
        path: Vec<Segment>,
    },
    Get {
        base: Box<Expr>,
        segment: Segment,
    },
    /// `depth` counts enclosing loops outward from the innermost one.
    LoopMeta {
        depth: usize,
        field: LoopField,
    },
    /// `$.get.x`, `$.server.x`, ...
    Global {
        source: SmolStr,
        path: Vec<Segment>,
    },
    /// A host accessor callback.
    Accessor {
        name: SmolStr,
        args: Vec<Expr>,
        path: Vec<Segment>,
    },
    BlockDefined {
        name: SmolStr,
        local: bool,
    },
    Fetch {
        name: Box<Expr>,
        vars: Option<Box<Expr>>,
    },
    TemplateExists(Box<Expr>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Elvis(Box<Expr>, Box<Expr>),
    Coalesce(Box<Expr>, Box<Expr>),
    IfSet {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    NotEmpty(Box<Expr>),
    IsSet(Box<Expr>),
    Check {
        name: SmolStr,
        value: Box<Expr>,
    },
    InstanceOf {
        value: Box<Expr>,
        type_name: SmolStr,
    },
    In {
        needle: Box<Expr>,
        haystack: Box<Expr>,
        mode: InMode,
    },
    Range {
        from: Box<Expr>,
        to: Box<Expr>,
    },
    Array(Vec<(Option<Expr>, Expr)>),
    Filter {
        name: SmolStr,
        base: Box<Expr>,
        args: Vec<Expr>,
    },
    Call {
        name: SmolStr,
        args: Vec<Expr>,
    },
    /// `$.call(name, ...)`: the function is chosen at render time.
    DynamicCall {
        name: Box<Expr>,
        args: Vec<Expr>,
        restricted: bool,
    },
    Method {
        object: Box<Expr>,
        name: SmolStr,
        args: Vec<Expr>,
    },
    /// A call into the unit's macro table.
    Macro {
        name: SmolStr,
        args: Vec<Expr>,
    },
    /// Renders a body to a string, optionally in a fresh variable scope.
    Render {
        bindings: Vec<(SmolStr, Expr)>,
        body: Vec<Op>,
        isolated: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub name: SmolStr,
    pub path: Vec<Segment>,
    pub append: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopOp {
    pub source: Expr,
    pub key: Option<SmolStr>,
    pub value: SmolStr,
    pub body: Vec<Op>,
    pub empty: Option<Vec<Op>>,
    /// Set when the body reads `@last`, `@revindex` or `@length`.
    pub needs_length: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Text(String),
    Print {
        expr: Expr,
        escape: bool,
    },
    If {
        branches: Vec<(Expr, Vec<Op>)>,
        otherwise: Option<Vec<Op>>,
    },
    Loop(Box<LoopOp>),
    While {
        cond: Expr,
        body: Vec<Op>,
    },
    Switch {
        subject: Expr,
        cases: Vec<(Vec<Expr>, Vec<Op>)>,
        default: Option<Vec<Op>>,
    },
    Assign {
        target: Target,
        value: Expr,
        only_if_unset: bool,
    },
    Unset(Vec<Target>),
    Block {
        name: SmolStr,
        body: Vec<Op>,
    },
    /// `{parent}` resolved at render time.
    BlockSuper,
    /// Dynamic `{extends}`: renders the parent with this unit's blocks as overrides.
    Extends {
        parent: Expr,
    },
    Include {
        name: Expr,
        params: Vec<(SmolStr, Expr)>,
    },
    Scope {
        bindings: Vec<(SmolStr, Expr)>,
        body: Vec<Op>,
    },
    Cycle {
        values: Vec<Expr>,
        escape: bool,
    },
    Eval(Expr),
    Break,
    Continue,
    Tag {
        name: SmolStr,
        args: Vec<Expr>,
        body: Option<Vec<Op>>,
        assign: Option<SmolStr>,
        escape: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroDef {
    pub params: Vec<SmolStr>,
    pub body: Vec<Op>,
}

/// The persisted form of a compiled template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub name: SmolStr,
    pub options: Options,
    pub body: Vec<Op>,
    /// Blocks handed to a dynamic parent as overrides.
    pub blocks: IndexMap<SmolStr, Vec<Op>>,
    pub macros: IndexMap<SmolStr, MacroDef>,
    /// Every template read while compiling, with the mtime that was read.
    pub dependencies: IndexMap<SmolStr, u64>,
}

impl Unit {
    pub fn new(name: impl Into<SmolStr>, options: Options) -> Self {
        Self {
            name: name.into(),
            options,
            body: Vec::new(),
            blocks: IndexMap::new(),
            macros: IndexMap::new(),
            dependencies: IndexMap::new(),
        }
    }
}
