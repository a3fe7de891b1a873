use rustc_hash::FxHashMap;
use serde::Serialize;
use smol_str::SmolStr;

use crate::options::ConfigError;
use crate::value::{Map, Value};

/// Variables and `$.get`-style globals passed to a render.
#[derive(Debug, Clone, Default)]
pub struct Context {
    vars: Map,
    globals: FxHashMap<SmolStr, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a context from any serializable value with a map at the top.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, ConfigError> {
        let json = serde_json::to_value(value).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Self::from_json(json)
    }

    pub fn from_json(json: serde_json::Value) -> Result<Self, ConfigError> {
        match Value::from(json) {
            Value::Map(map) => Ok(Self {
                vars: map.as_ref().clone(),
                globals: FxHashMap::default(),
            }),
            Value::Null => Ok(Self::default()),
            other => Err(ConfigError::Invalid(format!(
                "context must be an object, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<Value>) {
        self.vars.insert(SmolStr::new(name), value.into());
    }

    /// Sets a global source such as `get`, `session` or `server`, read with `$.<source>`.
    pub fn with_global(mut self, source: &str, value: impl Into<Value>) -> Self {
        self.globals.insert(SmolStr::new(source), value.into());
        self
    }

    pub fn vars(&self) -> &Map {
        &self.vars
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// The global source `source`. `$.env` falls back to the process environment.
    pub fn global(&self, source: &str) -> Option<Value> {
        match self.globals.get(source) {
            Some(value) => Some(value.clone()),
            None if source == "env" => Some(std::env::vars().collect()),
            None => None,
        }
    }

    /// A context with the same globals and `vars` as its variables.
    pub fn fork(&self, vars: &Value) -> Self {
        Self {
            vars: vars
                .entries()
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k.to_key(), v))
                .collect(),
            globals: self.globals.clone(),
        }
    }
}
