use miette::{Diagnostic, SourceOffset, SourceSpan};

use crate::ast::error::SyntaxError;
use crate::compiler::error::CompileError;
use crate::lexer::error::LexerError;
use crate::loader::error::{CacheError, SourceError};
use crate::options::ConfigError;
use crate::range::Range;
use crate::runtime::error::RuntimeError;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum InnerError {
    #[error(transparent)]
    Lexer(#[from] LexerError),
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl InnerError {
    pub fn code(&self) -> &'static str {
        match self {
            InnerError::Lexer(_) => "LexerError::TokenizeError",
            InnerError::Syntax(SyntaxError::UnexpectedToken { .. }) => "SyntaxError::UnexpectedToken",
            InnerError::Syntax(SyntaxError::UnexpectedEof(_)) => "SyntaxError::UnexpectedEof",
            InnerError::Syntax(SyntaxError::UnclosedTag(..)) => "SyntaxError::UnclosedTag",
            InnerError::Syntax(SyntaxError::MismatchedClose { .. } | SyntaxError::UnexpectedClose(..)) => {
                "SyntaxError::MismatchedClose"
            }
            InnerError::Syntax(SyntaxError::UnknownTag(..)) => "SyntaxError::UnknownTag",
            InnerError::Syntax(SyntaxError::InvalidUsage { .. }) => "CompileError::InvalidUsage",
            InnerError::Compile(e) => e.code(),
            InnerError::Runtime(e) => e.code(),
            InnerError::Cache(_) => "CacheError",
            InnerError::Source(SourceError::NotFound(_)) => "SourceError::NotFound",
            InnerError::Source(SourceError::Io { .. }) => "SourceError::Io",
            InnerError::Config(_) => "ConfigError",
        }
    }
}

/// A template error with enough context to render a diagnostic.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
#[error("{cause}")]
pub struct Error {
    pub cause: InnerError,
    /// Name of the template the error belongs to.
    pub template: String,
    pub source_code: String,
    pub location: SourceSpan,
}

impl Error {
    pub fn new(template: impl Into<String>, source_code: impl Into<String>, cause: InnerError, line: Option<u32>) -> Self {
        let source_code = source_code.into();
        let location = match line {
            Some(line) => line_span(&source_code, line),
            None => SourceSpan::new(0.into(), 0),
        };
        Self {
            cause,
            template: template.into(),
            source_code,
            location,
        }
    }

    pub fn from_lexer(template: &str, source: &str, error: LexerError) -> Self {
        let location = range_span(source, error.range());
        Self {
            cause: error.into(),
            template: template.to_string(),
            source_code: source.to_string(),
            location,
        }
    }

    pub fn from_syntax(template: &str, source: &str, error: SyntaxError) -> Self {
        let location = range_span(source, error.range());
        Self {
            cause: error.into(),
            template: template.to_string(),
            source_code: source.to_string(),
            location,
        }
    }

    pub fn from_compile(template: &str, source: String, error: CompileError) -> Self {
        let line = error.line();
        Self::new(template, source, error.into(), line)
    }

    /// A render failure. Failures of nested templates surface as their own error.
    pub fn from_runtime(template: &str, error: RuntimeError) -> Self {
        match error {
            RuntimeError::Template(inner) => *inner,
            error => Self::new(template, String::new(), error.into(), None),
        }
    }

    pub fn from_cache(template: &str, error: CacheError) -> Self {
        Self::new(template, String::new(), error.into(), None)
    }

    pub fn from_source(template: &str, error: SourceError) -> Self {
        Self::new(template, String::new(), error.into(), None)
    }

    pub fn from_config(error: ConfigError) -> Self {
        Self::new(String::new(), String::new(), error.into(), None)
    }

    pub fn code(&self) -> &'static str {
        self.cause.code()
    }

    /// The 1-based line the error points at, when it has one.
    pub fn line(&self) -> Option<u32> {
        match &self.cause {
            InnerError::Lexer(e) => Some(e.line()),
            InnerError::Syntax(e) => Some(e.range().line()),
            InnerError::Compile(e) => e.line(),
            _ => None,
        }
    }
}

fn line_span(source: &str, line: u32) -> SourceSpan {
    let offset = SourceOffset::from_location(source, line as usize, 1);
    let length = source[offset.offset().min(source.len())..]
        .lines()
        .next()
        .map_or(0, str::len);
    SourceSpan::new(offset, length.max(1))
}

fn range_span(source: &str, range: Range) -> SourceSpan {
    let start = SourceOffset::from_location(source, range.start.line as usize, range.start.column);
    let end = SourceOffset::from_location(source, range.end.line as usize, range.end.column);
    SourceSpan::new(start, std::cmp::max(end.offset().saturating_sub(start.offset()), 1))
}

impl Diagnostic for Error {
    fn code<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        Some(Box::new(self.cause.code()))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        let msg = match &self.cause {
            InnerError::Syntax(SyntaxError::UnclosedTag(..)) => {
                Some("Close every block tag, for example `{/if}` or `{% endif %}`.".to_string())
            }
            InnerError::Syntax(SyntaxError::MismatchedClose { expected, .. }) => {
                Some(format!("Close `{}` before closing an outer tag.", expected))
            }
            InnerError::Compile(CompileError::UnknownFilter { name, .. }) => {
                Some(format!("Register '{}' with `Extensions::with_filter` or check its spelling.", name))
            }
            InnerError::Compile(CompileError::UnknownFunction { name, .. }) => {
                Some(format!("Register '{}' with `Extensions::with_function` or declare a macro.", name))
            }
            InnerError::Compile(CompileError::Security { .. }) => {
                Some("The construct is disabled by the compiler options.".to_string())
            }
            InnerError::Runtime(RuntimeError::UndefinedVariable(name)) => {
                Some(format!("Pass '{}' in the context or turn off `force_verify`.", name))
            }
            InnerError::Cache(_) => Some("Check that the cache directory exists and is writable.".to_string()),
            _ => None,
        };

        msg.map(|m| Box::new(m) as Box<dyn std::fmt::Display>)
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = miette::LabeledSpan> + '_>> {
        if self.source_code.is_empty() {
            return None;
        }
        Some(Box::new(std::iter::once(miette::LabeledSpan::new_with_span(
            Some(self.cause.to_string()),
            self.location,
        ))))
    }

    fn source_code(&self) -> Option<&dyn miette::SourceCode> {
        Some(&self.source_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::Position;
    use rstest::rstest;

    #[rstest]
    #[case::first_line("a\nbb\nccc", 1, 0, 1)]
    #[case::second_line("a\nbb\nccc", 2, 2, 2)]
    #[case::last_line("a\nbb\nccc", 3, 5, 3)]
    fn test_line_span(#[case] source: &str, #[case] line: u32, #[case] offset: usize, #[case] len: usize) {
        let span = line_span(source, line);
        assert_eq!(span.offset(), offset);
        assert_eq!(span.len(), len);
    }

    #[test]
    fn test_lexer_error_points_at_range() {
        let range = Range::new(Position::new(2, 3), Position::new(2, 4));
        let err = Error::from_lexer("t", "ab\ncd$ef", LexerError::UnexpectedCharacter(range, '$'));
        assert_eq!(err.location.offset(), 5);
        assert_eq!(err.code(), "LexerError::TokenizeError");
        assert_eq!(err.line(), Some(2));
    }

    #[test]
    fn test_runtime_error_unwraps_nested_template_error() {
        let inner = Error::from_source("partial", SourceError::NotFound("partial".into()));
        let err = Error::from_runtime("page", RuntimeError::Template(Box::new(inner.clone())));
        assert_eq!(err, inner);
    }

    #[test]
    fn test_compile_error_code_in_diagnostic() {
        let err = Error::from_compile("t", "x".to_string(), CompileError::Security {
            message: "no".to_string(),
            line: 1,
        });
        assert_eq!(Diagnostic::code(&err).map(|c| c.to_string()), Some("CompileError::Security".to_string()));
        assert!(Diagnostic::help(&err).is_some());
    }
}
