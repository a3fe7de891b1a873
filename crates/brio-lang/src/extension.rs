//! Name-indexed registries for filters, functions, `is`-tests, tags and accessors.
//!
//! Every entry is either an [`Extension::Alias`], a host callable invoked at render
//! time, or an [`Extension::Generator`], a compile-time hook that receives the
//! [`CompilationSession`] and returns an IR fragment.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use smol_str::SmolStr;

use crate::ast::node as ast;
use crate::ast::parser::TagShapes;
use crate::compiler::CompilationSession;
use crate::compiler::error::CompileError;
use crate::ir::{Expr, Op, Segment};
use crate::value::Value;

pub mod accessors;
pub mod checks;
pub mod filters;
pub mod functions;
pub mod tags;

pub type FilterFn = Arc<dyn Fn(&Value, &[Value]) -> Result<Value, String> + Send + Sync>;
pub type FilterGenerator = fn(&mut CompilationSession<'_>, Expr, Vec<Expr>) -> Result<Expr, CompileError>;
pub type FunctionFn = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;
pub type CheckFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type CheckGenerator = fn(&mut CompilationSession<'_>, Expr) -> Result<Expr, CompileError>;
/// Receives the evaluated arguments and, for block tags, the rendered body.
pub type TagFn = Arc<dyn Fn(&[Value], Option<&str>) -> Result<Value, String> + Send + Sync>;
pub type TagGenerator = fn(&mut CompilationSession<'_>, TagCall<'_>) -> Result<Vec<Op>, CompileError>;
pub type AccessorFn = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;
pub type AccessorGenerator = fn(&mut CompilationSession<'_>, AccessorCall) -> Result<Expr, CompileError>;

#[derive(Clone)]
pub enum Extension<A, G> {
    Alias(A),
    Generator(G),
}

#[derive(Clone)]
pub struct FilterEntry {
    pub kind: Extension<FilterFn, FilterGenerator>,
    /// Output is already escaped and must not be escaped again.
    pub safe: bool,
}

#[derive(Clone)]
pub struct FunctionEntry {
    pub func: FunctionFn,
    /// Refused when native functions are disabled.
    pub restricted: bool,
}

#[derive(Clone)]
pub struct TagEntry {
    pub kind: Extension<TagFn, TagGenerator>,
    pub safe: bool,
    pub is_block: bool,
}

pub type CheckEntry = Extension<CheckFn, CheckGenerator>;
pub type AccessorEntry = Extension<AccessorFn, AccessorGenerator>;

/// A custom tag occurrence handed to a tag generator.
pub struct TagCall<'a> {
    pub name: &'a str,
    pub args: &'a [ast::Expr],
    pub assign: Option<&'a SmolStr>,
    /// The compiled body of a block tag.
    pub body: Option<Vec<Op>>,
}

/// A `$.name...` occurrence handed to an accessor generator.
#[derive(Debug)]
pub struct AccessorCall {
    pub name: SmolStr,
    pub path: Vec<Segment>,
    pub args: Option<Vec<Expr>>,
}

#[derive(Clone)]
pub struct Registry<T> {
    entries: FxHashMap<SmolStr, T>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: FxHashMap::default(),
        }
    }
}

impl<T> Registry<T> {
    pub fn is_valid(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn resolve(&self, name: &str) -> Option<&T> {
        self.entries.get(name)
    }

    pub fn insert(&mut self, name: impl Into<SmolStr>, entry: T) {
        self.entries.insert(name.into(), entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SmolStr, &T)> {
        self.entries.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names = self.entries.keys().map(SmolStr::as_str).collect::<Vec<_>>();
        names.sort_unstable();
        names
    }
}

impl<T> FromIterator<(SmolStr, T)> for Registry<T> {
    fn from_iter<I: IntoIterator<Item = (SmolStr, T)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// All registries used by one compiler configuration.
///
/// `Extensions::default()` holds the built-ins; the `with_*` methods add host
/// extensions on top, replacing built-ins of the same name.
#[derive(Clone)]
pub struct Extensions {
    pub filters: Registry<FilterEntry>,
    pub functions: Registry<FunctionEntry>,
    pub checks: Registry<CheckEntry>,
    pub tags: Registry<TagEntry>,
    pub accessors: Registry<AccessorEntry>,
    pub constants: FxHashMap<SmolStr, Value>,
}

impl Default for Extensions {
    fn default() -> Self {
        Self {
            filters: filters::BUILTIN_FILTERS.clone(),
            functions: functions::BUILTIN_FUNCTIONS.clone(),
            checks: checks::BUILTIN_CHECKS.clone(),
            tags: tags::BUILTIN_TAGS.clone(),
            accessors: accessors::BUILTIN_ACCESSORS.clone(),
            constants: FxHashMap::default(),
        }
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("filters", &self.filters.names())
            .field("functions", &self.functions.names())
            .field("checks", &self.checks.names())
            .field("tags", &self.tags.names())
            .field("accessors", &self.accessors.names())
            .finish()
    }
}

impl Extensions {
    pub fn with_filter<F>(mut self, name: &str, safe: bool, filter: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.filters.insert(name, FilterEntry {
            kind: Extension::Alias(Arc::new(filter)),
            safe,
        });
        self
    }

    pub fn with_filter_generator(mut self, name: &str, safe: bool, generator: FilterGenerator) -> Self {
        self.filters.insert(name, FilterEntry {
            kind: Extension::Generator(generator),
            safe,
        });
        self
    }

    pub fn with_function<F>(mut self, name: &str, function: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(name, FunctionEntry {
            func: Arc::new(function),
            restricted: false,
        });
        self
    }

    pub fn with_check<F>(mut self, name: &str, check: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.checks.insert(name, Extension::Alias(Arc::new(check)));
        self
    }

    pub fn with_tag<F>(mut self, name: &str, is_block: bool, safe: bool, tag: F) -> Self
    where
        F: Fn(&[Value], Option<&str>) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.tags.insert(name, TagEntry {
            kind: Extension::Alias(Arc::new(tag)),
            safe,
            is_block,
        });
        self
    }

    pub fn with_tag_generator(mut self, name: &str, is_block: bool, generator: TagGenerator) -> Self {
        self.tags.insert(name, TagEntry {
            kind: Extension::Generator(generator),
            safe: false,
            is_block,
        });
        self
    }

    pub fn with_accessor<F>(mut self, name: &str, accessor: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.accessors.insert(name, Extension::Alias(Arc::new(accessor)));
        self
    }

    pub fn with_constant(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.constants.insert(SmolStr::new(name), value.into());
        let constants = self.constants.clone();
        self.functions.insert("constant", FunctionEntry {
            func: Arc::new(move |args: &[Value]| {
                let name = args.first().map(Value::to_key).unwrap_or_default();
                constants
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| format!("undefined constant `{}`", name))
            }),
            restricted: false,
        });
        self
    }

    /// Custom tag names and whether each takes a body.
    pub fn tag_shapes(&self) -> TagShapes {
        self.tags
            .iter()
            .map(|(name, entry)| (name.clone(), entry.is_block))
            .collect()
    }

    pub fn lexer_options(&self, auto_trim: bool) -> crate::lexer::Options {
        self.tags.iter().fold(
            crate::lexer::Options {
                auto_trim,
                ..Default::default()
            },
            |options, (name, entry)| options.with_tag(name, entry.is_block),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_extensions_override_builtins() {
        let extensions = Extensions::default().with_filter("upper", true, |_, _| Ok(Value::from("custom")));
        let Some(FilterEntry {
            kind: Extension::Alias(filter),
            safe,
        }) = extensions.filters.resolve("upper")
        else {
            panic!("expected an alias filter");
        };

        assert!(*safe);
        assert_eq!(filter(&Value::from("x"), &[]).unwrap(), Value::from("custom"));
    }

    #[test]
    fn test_tag_shapes_include_builtin_block_tags() {
        let shapes = Extensions::default().tag_shapes();
        assert_eq!(shapes.get("spaceless"), Some(&true));
        assert_eq!(shapes.get("firstof"), Some(&false));
    }
}
