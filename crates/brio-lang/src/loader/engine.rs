use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use super::error::CacheError;
use super::source::{FsSource, SourceProvider, dependencies_fresh};
use super::store::{ArtifactStore, FsArtifactStore, WriteOutcome};
use crate::compiler::{CompilerConfig, compile_template};
use crate::config::Config;
use crate::context::Context;
use crate::error::Error;
use crate::ir;
use crate::options::Options;
use crate::runtime::Host;
use crate::template::{Persistence, Template};

/// `hex(options)@sha256(name)`.
pub fn cache_key(name: &str, options: Options) -> String {
    let digest = Sha256::digest(name.as_bytes());
    let hash = digest.iter().map(|b| format!("{:02x}", b)).collect::<String>();
    format!("{:x}@{}", options.bits(), hash)
}

/// Compiles, caches and renders templates from one source.
///
/// Compiled templates are kept in memory per `(name, options)`. With an artifact
/// store, the resolved IR is also persisted and reused by later engines as long as
/// every dependency keeps the mtime recorded at compile time.
pub struct Engine<S = FsSource, A = FsArtifactStore> {
    config: CompilerConfig,
    sources: S,
    store: Option<A>,
    strict_cache: bool,
    templates: DashMap<String, Arc<Template>>,
}

impl Engine {
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let compiler = CompilerConfig::default().with_options(config.options().map_err(Error::from_config)?);
        let engine = Engine::new(compiler, FsSource::new(&config.templates, &config.extension))
            .with_strict_cache(config.strict_cache);
        Ok(match &config.cache_dir {
            Some(dir) => engine.with_store(FsArtifactStore::new(dir)),
            None => engine,
        })
    }
}

impl<S: SourceProvider> Engine<S> {
    /// An engine without an artifact store.
    pub fn new(config: CompilerConfig, sources: S) -> Self {
        Self {
            config,
            sources,
            store: None,
            strict_cache: false,
            templates: DashMap::new(),
        }
    }
}

impl<S: SourceProvider, A: ArtifactStore> Engine<S, A> {
    pub fn with_store<B: ArtifactStore>(self, store: B) -> Engine<S, B> {
        Engine {
            config: self.config,
            sources: self.sources,
            store: Some(store),
            strict_cache: self.strict_cache,
            templates: DashMap::new(),
        }
    }

    /// Fail instead of falling back to a transient template when an artifact can't be written.
    pub fn with_strict_cache(mut self, strict_cache: bool) -> Self {
        self.strict_cache = strict_cache;
        self
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn sources(&self) -> &S {
        &self.sources
    }

    /// Drops every in-memory template. Persisted artifacts stay.
    pub fn clear(&self) {
        self.templates.clear();
    }

    pub fn get_template(&self, name: &str) -> Result<Arc<Template>, Error> {
        self.get_template_with(name, self.config.options)
    }

    pub fn get_template_with(&self, name: &str, options: Options) -> Result<Arc<Template>, Error> {
        let key = cache_key(name, options);

        let cached = self.templates.get(&key).map(|entry| Arc::clone(entry.value()));
        if let Some(template) = cached {
            if !options.contains(Options::AUTO_RELOAD) || template.verify(&self.sources) {
                tracing::debug!(template = name, "in-memory cache hit");
                return Ok(template);
            }
            tracing::info!(template = name, "dependencies changed, recompiling");
        }

        let template = Arc::new(self.load(name, options, &key)?);
        self.templates.insert(key, Arc::clone(&template));
        Ok(template)
    }

    pub fn render(&self, name: &str, context: &Context) -> Result<String, Error> {
        self.get_template(name)?.render_with(self, context)
    }

    fn load(&self, name: &str, options: Options, key: &str) -> Result<Template, Error> {
        let store = match &self.store {
            Some(store) if !options.contains(Options::DISABLE_CACHE) => store,
            _ => return Ok(self.compile(name, options)?.with_persistence(Persistence::Disabled)),
        };

        if !options.contains(Options::FORCE_COMPILE)
            && let Some(template) = self.load_persisted(store, name, options, key)
        {
            tracing::debug!(template = name, key, "loaded persisted artifact");
            return Ok(template);
        }

        let template = self.compile(name, options)?;
        let persistence = self.persist(store, name, key, template.unit())?;
        Ok(template.with_persistence(persistence))
    }

    fn compile(&self, name: &str, options: Options) -> Result<Template, Error> {
        tracing::debug!(template = name, %options, "compiling");
        let config = CompilerConfig {
            options,
            ..self.config.clone()
        };
        let unit = compile_template(&config, &self.sources, name)?;
        Template::from_unit(unit, &self.config.extensions)
    }

    /// A persisted template that is still fresh, if there is one.
    fn load_persisted(&self, store: &A, name: &str, options: Options, key: &str) -> Option<Template> {
        let bytes = match store.read_artifact(key) {
            Ok(bytes) => bytes?,
            Err(e) => {
                tracing::warn!(template = name, error = %e, "ignoring unreadable artifact");
                return None;
            }
        };

        let unit = match serde_json::from_slice::<ir::Unit>(&bytes) {
            Ok(unit) if unit.name == name && unit.options == options => unit,
            Ok(_) => return None,
            Err(e) => {
                let error = CacheError::Corrupt {
                    key: key.to_string(),
                    message: e.to_string(),
                };
                tracing::warn!(template = name, error = %error, "ignoring artifact");
                return None;
            }
        };

        if !dependencies_fresh(&unit.dependencies, &self.sources) {
            tracing::info!(template = name, "persisted artifact is stale, recompiling");
            return None;
        }

        Template::from_unit(unit, &self.config.extensions)
            .ok()
            .map(|template| template.with_persistence(Persistence::Persisted))
    }

    fn persist(&self, store: &A, name: &str, key: &str, unit: &ir::Unit) -> Result<Persistence, Error> {
        let written = serde_json::to_vec(unit)
            .map_err(|e| CacheError::Write {
                key: key.to_string(),
                message: e.to_string(),
            })
            .and_then(|bytes| store.write_artifact_atomic(key, &bytes));

        match written {
            Ok(WriteOutcome::Written) => Ok(Persistence::Persisted),
            Ok(WriteOutcome::Contended) => {
                tracing::warn!(template = name, key, "artifact is locked by another writer, using a transient unit");
                Ok(Persistence::Contended)
            }
            Err(e) if self.strict_cache => Err(Error::from_cache(name, e)),
            Err(e) => {
                tracing::warn!(template = name, error = %e, "failed to persist artifact, using a transient unit");
                Ok(Persistence::Failed)
            }
        }
    }
}

impl<S: SourceProvider, A: ArtifactStore> Host for Engine<S, A> {
    fn load_template(&self, name: &str, options: Options) -> Result<Arc<Template>, Error> {
        self.get_template_with(name, options)
    }

    fn template_exists(&self, name: &str) -> bool {
        self.sources.exists(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MemorySource;

    fn engine(sources: MemorySource) -> Engine<MemorySource> {
        Engine::new(CompilerConfig::default(), sources)
    }

    #[test]
    fn test_cache_key_format() {
        let key = cache_key("index", Options::AUTO_ESCAPE);
        let (options, hash) = key.split_once('@').unwrap();
        assert_eq!(options, "200");
        assert_eq!(hash.len(), 64);
        assert_ne!(key, cache_key("index", Options::AUTO_ESCAPE | Options::AUTO_TRIM));
    }

    #[test]
    fn test_memory_hit_returns_same_template() {
        let engine = engine(MemorySource::default().with("a", "x"));
        let first = engine.get_template("a").unwrap();
        let second = engine.get_template("a").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.persistence(), Persistence::Disabled);
    }

    #[test]
    fn test_auto_reload_recompiles_changed_source() {
        let engine = Engine::new(
            CompilerConfig::default().with_options(Options::AUTO_ESCAPE | Options::AUTO_RELOAD),
            MemorySource::default().with("a", "one"),
        );
        assert_eq!(engine.render("a", &Context::new()).unwrap(), "one");
        engine.sources().insert("a", "two");
        assert_eq!(engine.render("a", &Context::new()).unwrap(), "two");
    }

    #[test]
    fn test_without_auto_reload_keeps_memory_entry() {
        let engine = engine(MemorySource::default().with("a", "one"));
        assert_eq!(engine.render("a", &Context::new()).unwrap(), "one");
        engine.sources().insert("a", "two");
        assert_eq!(engine.render("a", &Context::new()).unwrap(), "one");
    }

    #[test]
    fn test_persisted_artifact_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let sources = || MemorySource::default().with("a", "hello");

        let first = engine(sources()).with_store(FsArtifactStore::new(dir.path()));
        assert_eq!(first.get_template("a").unwrap().persistence(), Persistence::Persisted);
        assert!(first.store.as_ref().is_some_and(|store| store.exists(&cache_key("a", Options::AUTO_ESCAPE))));

        // Same logical mtime, so the artifact is fresh for a second engine.
        let second = engine(sources()).with_store(FsArtifactStore::new(dir.path()));
        let template = second.get_template("a").unwrap();
        assert_eq!(template.persistence(), Persistence::Persisted);
        assert_eq!(template.render(&Context::new()).unwrap(), "hello");
    }

    #[test]
    fn test_unwritable_store_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();

        let lenient = engine(MemorySource::default().with("a", "x")).with_store(FsArtifactStore::new(blocker.join("cache")));
        assert_eq!(lenient.get_template("a").unwrap().persistence(), Persistence::Failed);

        let strict = engine(MemorySource::default().with("a", "x"))
            .with_store(FsArtifactStore::new(blocker.join("cache")))
            .with_strict_cache(true);
        assert_eq!(strict.get_template("a").unwrap_err().code(), "CacheError");
    }

    #[test]
    fn test_missing_template() {
        let err = engine(MemorySource::default()).get_template("nope").unwrap_err();
        assert_eq!(err.code(), "CompileError::MissingTemplate");
    }

    #[test]
    fn test_included_template_uses_caller_options() {
        let engine = engine(MemorySource::default().with("page", "{include 'row'}").with("row", "{{ v }}"));
        let context = Context::new().with("v", "<b>");

        let raw = engine.get_template_with("page", Options::NONE).unwrap();
        assert_eq!(raw.render_with(&engine, &context).unwrap(), "<b>");
        assert!(engine.templates.contains_key(&cache_key("row", Options::NONE)));

        assert_eq!(engine.render("page", &context).unwrap(), "&lt;b&gt;");
    }
}
