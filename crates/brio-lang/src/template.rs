use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use smol_str::SmolStr;

use crate::codegen::{self, Body, Macros, render_body};
use crate::context::Context;
use crate::error::Error;
use crate::extension::Extensions;
use crate::ir;
use crate::loader::{self, SourceProvider};
use crate::options::Options;
use crate::runtime::{Frame, Host, NoHost, RuntimeError};

/// What happened to the artifact when the template was compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// Written to (or read from) the artifact store.
    Persisted,
    /// Caching is off for this option set, or the engine has no store.
    Disabled,
    /// Another writer held the lock; this unit is transient.
    Contended,
    /// The write failed; this unit is transient.
    Failed,
}

/// A compiled, renderable template.
pub struct Template {
    unit: ir::Unit,
    body: Body,
    macros: Arc<Macros>,
    persistence: Persistence,
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("name", &self.unit.name)
            .field("options", &self.unit.options)
            .field("dependencies", &self.unit.dependencies)
            .field("persistence", &self.persistence)
            .finish()
    }
}

impl Template {
    /// Builds the render closures for `unit`.
    pub fn from_unit(unit: ir::Unit, extensions: &Arc<Extensions>) -> Result<Self, Error> {
        let compiled = codegen::generate(&unit, extensions)
            .map_err(|e| Error::from_compile(&unit.name, String::new(), e))?;
        Ok(Self {
            unit,
            body: compiled.body,
            macros: compiled.macros,
            persistence: Persistence::Disabled,
        })
    }

    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn name(&self) -> &str {
        &self.unit.name
    }

    pub fn options(&self) -> Options {
        self.unit.options
    }

    pub fn dependencies(&self) -> &IndexMap<SmolStr, u64> {
        &self.unit.dependencies
    }

    pub fn unit(&self) -> &ir::Unit {
        &self.unit
    }

    pub fn persistence(&self) -> Persistence {
        self.persistence
    }

    /// `true` while every dependency still has the mtime recorded at compile time.
    pub fn verify(&self, sources: &dyn SourceProvider) -> bool {
        loader::dependencies_fresh(&self.unit.dependencies, sources)
    }

    /// Renders without a host: `include`, `extends` and `$.fetch` of other templates fail.
    pub fn render(&self, context: &Context) -> Result<String, Error> {
        self.render_with(&NoHost, context)
    }

    pub fn render_with(&self, host: &dyn Host, context: &Context) -> Result<String, Error> {
        let mut frame = Frame::new(context, host);
        let mut out = String::new();
        self.render_in(&mut frame, &mut out)
            .map_err(|e| Error::from_runtime(self.name(), e))?;
        Ok(out)
    }

    pub fn render_to(&self, context: &Context, writer: &mut impl fmt::Write) -> Result<(), Error> {
        let out = self.render(context)?;
        writer
            .write_str(&out)
            .map_err(|_| Error::from_runtime(self.name(), RuntimeError::Write))
    }

    /// Renders into `out` inside an existing frame, with this template's macros in scope.
    pub(crate) fn render_in(&self, frame: &mut Frame<'_>, out: &mut String) -> Result<(), RuntimeError> {
        let previous = std::mem::replace(&mut frame.macros, Arc::clone(&self.macros));
        let options = std::mem::replace(&mut frame.options, self.options());
        let result = render_body(&self.body, frame, out);
        frame.macros = previous;
        frame.options = options;
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompilerConfig, compile_source};
    use crate::loader::MemorySource;

    fn template(sources: &MemorySource, source: &str) -> Template {
        let config = CompilerConfig::default().with_options(Options::AUTO_ESCAPE | Options::FORCE_INCLUDE);
        let unit = compile_source(&config, sources, "page", source).unwrap();
        Template::from_unit(unit, &config.extensions).unwrap()
    }

    #[test]
    fn test_render_to_writer() {
        let template = template(&MemorySource::default(), "Hi {{ name }}");
        let mut out = String::new();
        template
            .render_to(&Context::new().with("name", "<Ann>"), &mut out)
            .unwrap();
        assert_eq!(out, "Hi &lt;Ann&gt;");
    }

    #[test]
    fn test_verify_tracks_dependency_mtime() {
        let sources = MemorySource::default().with("part", "A");
        let template = template(&sources, "{include 'part'}");
        assert!(template.verify(&sources));

        sources.insert("part", "B");
        assert!(!template.verify(&sources));
    }

    #[test]
    fn test_missing_dependency_is_stale() {
        let template = template(&MemorySource::default().with("part", "A"), "{include 'part'}");
        assert!(!template.verify(&MemorySource::default()));
    }

    #[test]
    fn test_include_without_host_fails() {
        let config = CompilerConfig::default();
        let unit = compile_source(&config, &MemorySource::default(), "page", "{include name}").unwrap();
        let template = Template::from_unit(unit, &config.extensions).unwrap();
        let err = template.render(&Context::new().with("name", "part")).unwrap_err();
        assert_eq!(err.code(), "SourceError::NotFound");
    }
}
