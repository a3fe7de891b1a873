use smol_str::SmolStr;
use thiserror::Error;

use crate::error::Error as TemplateError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("{message} on line {line}")]
    InvalidUsage { message: String, line: u32 },
    #[error("Security violation on line {line}: {message}")]
    Security { message: String, line: u32 },
    #[error("Unknown filter '{name}' on line {line}")]
    UnknownFilter { name: SmolStr, line: u32 },
    #[error("Unknown function '{name}' on line {line}")]
    UnknownFunction { name: SmolStr, line: u32 },
    #[error("Unknown accessor '$.{name}' on line {line}")]
    UnknownAccessor { name: SmolStr, line: u32 },
    #[error("Unknown tag '{name}' on line {line}")]
    UnknownTag { name: SmolStr, line: u32 },
    #[error("Template '{name}' not found: {reason}")]
    MissingTemplate { name: SmolStr, reason: String, line: u32 },
    #[error("Recursion limit of {limit} reached while expanding '{name}' on line {line}")]
    Recursion { name: SmolStr, limit: usize, line: u32 },
    /// A template pulled in by `extends`, `include`, `import`, `use` or `insert` failed to compile.
    #[error("{0}")]
    Dependency(Box<TemplateError>),
}

impl CompileError {
    pub fn line(&self) -> Option<u32> {
        match self {
            CompileError::InvalidUsage { line, .. }
            | CompileError::Security { line, .. }
            | CompileError::UnknownFilter { line, .. }
            | CompileError::UnknownFunction { line, .. }
            | CompileError::UnknownAccessor { line, .. }
            | CompileError::UnknownTag { line, .. }
            | CompileError::MissingTemplate { line, .. }
            | CompileError::Recursion { line, .. } => Some(*line),
            CompileError::Dependency(_) => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            CompileError::InvalidUsage { .. } => "CompileError::InvalidUsage",
            CompileError::Security { .. } => "CompileError::Security",
            CompileError::UnknownFilter { .. } => "CompileError::UnknownFilter",
            CompileError::UnknownFunction { .. } => "CompileError::UnknownFunction",
            CompileError::UnknownAccessor { .. } => "CompileError::UnknownAccessor",
            CompileError::UnknownTag { .. } => "CompileError::UnknownTag",
            CompileError::MissingTemplate { .. } => "CompileError::MissingTemplate",
            CompileError::Recursion { .. } => "CompileError::Recursion",
            CompileError::Dependency(_) => "CompileError::Dependency",
        }
    }
}
