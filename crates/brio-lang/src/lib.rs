//! `brio-lang` compiles brio templates into reusable render units.
//!
//! ## Examples
//!
//! ```rust
//! use brio_lang::{CompilerConfig, Context, Engine, MemorySource};
//!
//! let sources = MemorySource::default()
//!     .with("layout", "<title>{block title}Site{/block}</title>")
//!     .with("page", "{extends 'layout'}{block title}{{ name|upper }}{/block}");
//! let engine = Engine::new(CompilerConfig::default(), sources);
//!
//! let html = engine.render("page", &Context::new().with("name", "home")).unwrap();
//! assert_eq!(html, "<title>HOME</title>");
//!
//! // One-off templates without a source directory
//! assert_eq!(brio_lang::render_str("{{ 1 + 2 }}", &Context::new()).unwrap(), "3");
//! ```
mod ast;
mod codegen;
mod compiler;
mod config;
mod context;
mod error;
mod extension;
pub mod ir;
mod lexer;
mod loader;
mod number;
mod options;
mod range;
mod runtime;
mod template;
mod value;

pub use ast::SyntaxError;
pub use compiler::{CompilationSession, CompileError, CompilerConfig, DEFAULT_MAX_RECURSION, compile_source, compile_template};
pub use config::Config;
pub use context::Context;
pub use error::{Error, InnerError};
pub use extension::{
    AccessorCall, Extension, Extensions, FilterEntry, FunctionEntry, Registry, TagCall, TagEntry,
};
pub use lexer::error::LexerError;
pub use lexer::token::{Token, TokenKind};
pub use lexer::{Lexer, Options as LexerOptions};
pub use loader::error::{CacheError, SourceError};
pub use loader::{
    ArtifactStore, Engine, FsArtifactStore, FsSource, MemorySource, SourceProvider, WriteOutcome, cache_key,
};
pub use number::Number;
pub use options::{ConfigError, Options};
pub use range::{Position, Range};
pub use runtime::{Host, NoHost, RuntimeError};
pub use template::{Persistence, Template};
pub use value::{Map, Object, RangeValue, Value};

/// Compiles `source` with the default configuration and renders it once.
pub fn render_str(source: &str, context: &Context) -> Result<String, Error> {
    let config = CompilerConfig::default();
    let unit = compile_source(&config, &MemorySource::default(), "string", source)?;
    Template::from_unit(unit, &config.extensions)?.render(context)
}

/// Tokenizes `source` with the default lexer options.
pub fn tokenize(source: &str) -> Result<Vec<Token>, Error> {
    Lexer::new(LexerOptions::default())
        .tokenize(source)
        .map_err(|e| Error::from_lexer("string", source, e))
}
