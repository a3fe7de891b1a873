//! Lowers parsed templates into [`ir::Unit`]s.
//!
//! A compile runs inside one [`CompilationSession`]: it resolves static
//! inheritance, inlines macros and `force_include` includes, decides escaping and
//! records every template it reads as a dependency of the unit.

use std::sync::Arc;

use smol_str::SmolStr;

use crate::error::Error;
use crate::extension::Extensions;
use crate::ir;
use crate::loader::SourceProvider;
use crate::options::Options;

mod compile;
pub mod error;
pub mod escape;
mod expr;
mod inherit;
mod session;

pub use error::CompileError;
pub use session::CompilationSession;

/// Depth limit for recursive macros and nested macro expansion.
pub const DEFAULT_MAX_RECURSION: usize = 32;

#[derive(Debug, Clone)]
pub struct CompilerConfig {
    pub options: Options,
    /// `{if x}` on a plain variable tests for emptiness instead of failing on undefined.
    pub if_empty: bool,
    pub allow_exec: bool,
    pub max_recursion: usize,
    pub extensions: Arc<Extensions>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            options: Options::AUTO_ESCAPE,
            if_empty: true,
            allow_exec: false,
            max_recursion: DEFAULT_MAX_RECURSION,
            extensions: Arc::new(Extensions::default()),
        }
    }
}

impl CompilerConfig {
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn with_extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = Arc::new(extensions);
        self
    }
}

/// Reads `name` from `sources` and compiles it.
pub fn compile_template(config: &CompilerConfig, sources: &dyn SourceProvider, name: &str) -> Result<ir::Unit, Error> {
    let mut session = CompilationSession::new(config, sources, name);
    let source = session
        .read_root()
        .map_err(|e| Error::from_compile(name, String::new(), e))?;
    compile_with(session, name, source)
}

/// Compiles `source` under `name`. Templates it pulls in are read from `sources`.
pub fn compile_source(
    config: &CompilerConfig,
    sources: &dyn SourceProvider,
    name: &str,
    source: impl Into<String>,
) -> Result<ir::Unit, Error> {
    compile_with(CompilationSession::new(config, sources, name), name, source.into())
}

fn compile_with(mut session: CompilationSession<'_>, name: &str, source: String) -> Result<ir::Unit, Error> {
    let program = session.parse(SmolStr::new(name), &source)?;
    session
        .compile_program(program)
        .map_err(|e| match e {
            CompileError::Dependency(inner) => *inner,
            e => Error::from_compile(name, source, e),
        })
}
