use smol_str::SmolStr;
use thiserror::Error;

use crate::error::Error as TemplateError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Undefined variable \"{0}\"")]
    UndefinedVariable(SmolStr),
    #[error("Unsupported operand types for {op}: {lhs} and {rhs}")]
    InvalidOperands { op: &'static str, lhs: String, rhs: String },
    #[error("Divided by 0")]
    ZeroDivision,
    #[error("Value of type {0} is not iterable")]
    NotIterable(String),
    #[error("Cannot assign to \"{0}\"")]
    InvalidTarget(SmolStr),
    #[error("Filter '{name}' failed: {message}")]
    Filter { name: SmolStr, message: String },
    #[error("Function '{name}' failed: {message}")]
    Function { name: SmolStr, message: String },
    #[error("Unknown function '{0}'")]
    UnknownFunction(SmolStr),
    #[error("Method '{name}' failed: {message}")]
    Method { name: SmolStr, message: String },
    #[error("Accessor '$.{name}' failed: {message}")]
    Accessor { name: SmolStr, message: String },
    #[error("Tag '{name}' failed: {message}")]
    Tag { name: SmolStr, message: String },
    #[error("Security violation: {0}")]
    Security(String),
    #[error("Maximum recursion depth {limit} exceeded in '{name}'")]
    RecursionLimit { name: SmolStr, limit: usize },
    #[error("Unable to load template '{name}': {message}")]
    TemplateUnavailable { name: SmolStr, message: String },
    /// Rendering an included, fetched or parent template failed.
    #[error("{0}")]
    Template(Box<TemplateError>),
    #[error("Failed to write output")]
    Write,
}

impl RuntimeError {
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::UndefinedVariable(_) => "RuntimeError::UndefinedVariable",
            RuntimeError::InvalidOperands { .. } => "RuntimeError::InvalidOperands",
            RuntimeError::ZeroDivision => "RuntimeError::ZeroDivision",
            RuntimeError::NotIterable(_) => "RuntimeError::NotIterable",
            RuntimeError::InvalidTarget(_) => "RuntimeError::InvalidTarget",
            RuntimeError::Filter { .. } => "RuntimeError::Filter",
            RuntimeError::Function { .. } | RuntimeError::UnknownFunction(_) => "RuntimeError::Function",
            RuntimeError::Method { .. } => "RuntimeError::Method",
            RuntimeError::Accessor { .. } => "RuntimeError::Accessor",
            RuntimeError::Tag { .. } => "RuntimeError::Tag",
            RuntimeError::Security(_) => "RuntimeError::Security",
            RuntimeError::RecursionLimit { .. } => "RuntimeError::RecursionLimit",
            RuntimeError::TemplateUnavailable { .. } | RuntimeError::Template(_) => "RuntimeError::Template",
            RuntimeError::Write => "RuntimeError::Write",
        }
    }
}
