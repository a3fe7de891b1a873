use std::sync::Arc;

use rustc_hash::FxHashMap;
use smol_str::SmolStr;

use super::error::RuntimeError;
use crate::codegen::{Body, Macros};
use crate::compiler::DEFAULT_MAX_RECURSION;
use crate::context::Context;
use crate::error::Error;
use crate::ir::LoopField;
use crate::loader::error::SourceError;
use crate::options::Options;
use crate::template::Template;
use crate::value::Value;

/// How a statement finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Normal,
    Break,
    Continue,
}

/// Loads the templates a render reaches through `include`, `extends` and `$.fetch`.
pub trait Host {
    /// Loads `name` compiled with `options`, the options of the template asking for it.
    fn load_template(&self, name: &str, options: Options) -> Result<Arc<Template>, Error>;

    fn template_exists(&self, name: &str) -> bool;
}

/// A host without templates, used when a template is rendered on its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHost;

impl Host for NoHost {
    fn load_template(&self, name: &str, _options: Options) -> Result<Arc<Template>, Error> {
        Err(Error::from_source(name, SourceError::NotFound(SmolStr::new(name))))
    }

    fn template_exists(&self, _name: &str) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct LoopState {
    pub index: usize,
    /// Only counted when the body reads `@last`, `@revindex` or `@length`.
    pub length: Option<usize>,
    pub key: Value,
}

/// Block bodies visible through `{parent}`: the override chain and the position in it.
pub type SuperChain = (Arc<[Arc<Body>]>, usize);

/// Mutable state of one render.
pub struct Frame<'a> {
    pub vars: FxHashMap<SmolStr, Value>,
    pub context: &'a Context,
    pub host: &'a dyn Host,
    pub loops: Vec<LoopState>,
    /// Block overrides collected from dynamic children, most derived first.
    pub overrides: FxHashMap<SmolStr, Vec<Arc<Body>>>,
    pub supers: Vec<SuperChain>,
    pub macros: Arc<Macros>,
    /// Options of the template currently rendering.
    pub options: Options,
    cycles: FxHashMap<usize, usize>,
    depth: usize,
    max_depth: usize,
}

impl<'a> Frame<'a> {
    pub fn new(context: &'a Context, host: &'a dyn Host) -> Self {
        Self {
            vars: context
                .vars()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            context,
            host,
            loops: Vec::new(),
            overrides: FxHashMap::default(),
            supers: Vec::new(),
            macros: Arc::default(),
            options: Options::NONE,
            cycles: FxHashMap::default(),
            depth: 0,
            max_depth: DEFAULT_MAX_RECURSION,
        }
    }

    /// A frame for a template rendered from inside this one, such as `$.fetch`.
    pub fn nested<'b>(&self, context: &'b Context) -> Frame<'b>
    where
        'a: 'b,
    {
        let mut frame = Frame::new(context, self.host);
        frame.depth = self.depth;
        frame.max_depth = self.max_depth;
        frame.options = self.options;
        frame
    }

    /// Reads a variable. Undefined variables are an error only when `strict`.
    pub fn var(&self, name: &SmolStr, strict: bool) -> Result<Value, RuntimeError> {
        match self.vars.get(name) {
            Some(value) => Ok(value.clone()),
            None if strict => Err(RuntimeError::UndefinedVariable(name.clone())),
            None => Ok(Value::Null),
        }
    }

    pub fn loop_meta(&self, depth: usize, field: LoopField) -> Value {
        let Some(state) = self
            .loops
            .len()
            .checked_sub(depth + 1)
            .and_then(|i| self.loops.get(i))
        else {
            return Value::Null;
        };

        match field {
            LoopField::Index => Value::from(state.index),
            LoopField::Iteration => Value::from(state.index + 1),
            LoopField::First => Value::Bool(state.index == 0),
            LoopField::Last => Value::Bool(state.length.is_some_and(|len| state.index + 1 == len)),
            LoopField::RevIndex => state
                .length
                .map(|len| Value::from(len.saturating_sub(state.index + 1)))
                .unwrap_or_default(),
            LoopField::Length => state.length.map(Value::from).unwrap_or_default(),
            LoopField::Key => state.key.clone(),
        }
    }

    /// Position of the next value for the `{cycle}` at `site`.
    pub fn next_cycle(&mut self, site: usize) -> usize {
        let counter = self.cycles.entry(site).or_default();
        let current = *counter;
        *counter += 1;
        current
    }

    /// Enters a macro, include or parent template.
    pub fn descend(&mut self, name: &str) -> Result<(), RuntimeError> {
        if self.depth >= self.max_depth {
            return Err(RuntimeError::RecursionLimit {
                name: SmolStr::new(name),
                limit: self.max_depth,
            });
        }
        self.depth += 1;
        Ok(())
    }

    pub fn ascend(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Swaps in a scope holding only `vars`; the previous scope is returned for [`Frame::restore`].
    pub fn isolate(&mut self, vars: FxHashMap<SmolStr, Value>) -> Scope {
        Scope {
            vars: std::mem::replace(&mut self.vars, vars),
            loops: std::mem::take(&mut self.loops),
        }
    }

    pub fn restore(&mut self, scope: Scope) {
        self.vars = scope.vars;
        self.loops = scope.loops;
    }
}

/// A saved variable scope.
pub struct Scope {
    vars: FxHashMap<SmolStr, Value>,
    loops: Vec<LoopState>,
}
