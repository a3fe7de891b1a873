//! Shorthand constructors for IR fragments, used by generators and tests.

use smol_str::SmolStr;

use super::{BinaryOp, Const, Expr, Op, Segment, Target};
use crate::number::Number;

pub fn null() -> Expr {
    Expr::Const(Const::Null)
}

pub fn string(s: impl Into<SmolStr>) -> Expr {
    Expr::Const(Const::String(s.into()))
}

pub fn number(n: impl Into<Number>) -> Expr {
    Expr::Const(Const::Number(n.into()))
}

pub fn boolean(b: bool) -> Expr {
    Expr::Const(Const::Bool(b))
}

pub fn var(name: impl Into<SmolStr>) -> Expr {
    Expr::Var {
        name: name.into(),
        path: Vec::new(),
    }
}

pub fn attr(base: Expr, name: impl Into<SmolStr>) -> Expr {
    match base {
        Expr::Var { name: var, mut path } => {
            path.push(Segment::Name(name.into()));
            Expr::Var { name: var, path }
        }
        base => Expr::Get {
            base: Box::new(base),
            segment: Segment::Name(name.into()),
        },
    }
}

pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

pub fn elvis(lhs: Expr, rhs: Expr) -> Expr {
    Expr::Elvis(Box::new(lhs), Box::new(rhs))
}

pub fn filter(name: impl Into<SmolStr>, base: Expr, args: Vec<Expr>) -> Expr {
    Expr::Filter {
        name: name.into(),
        base: Box::new(base),
        args,
    }
}

pub fn call(name: impl Into<SmolStr>, args: Vec<Expr>) -> Expr {
    Expr::Call { name: name.into(), args }
}

pub fn text(s: impl Into<String>) -> Op {
    Op::Text(s.into())
}

pub fn print(expr: Expr, escape: bool) -> Op {
    Op::Print { expr, escape }
}

pub fn assign(name: impl Into<SmolStr>, value: Expr) -> Op {
    Op::Assign {
        target: Target {
            name: name.into(),
            path: Vec::new(),
            append: false,
        },
        value,
        only_if_unset: false,
    }
}

/// Folds `exprs` into `a ?: b ?: ... ?: fallback`.
pub fn first_of(exprs: Vec<Expr>, fallback: Expr) -> Expr {
    exprs.into_iter().rev().fold(fallback, |acc, expr| elvis(expr, acc))
}
