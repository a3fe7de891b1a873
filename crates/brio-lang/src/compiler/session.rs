use std::sync::Arc;

use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use smol_str::SmolStr;

use super::error::CompileError;
use super::escape::SafetyTracker;
use super::{CompilerConfig, inherit};
use crate::ast::{self, Program, TagShapes, node::MacroDef};
use crate::error::Error;
use crate::ir::{self, Op, Unit};
use crate::lexer::{self, Lexer};
use crate::loader::SourceProvider;
use crate::options::Options;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) enum Breakable {
    Loop,
    Switch,
}

#[derive(Debug, Default)]
pub(super) struct LoopFrame {
    pub needs_length: bool,
}

/// State of one compile: the template being lowered plus everything it pulls in.
pub struct CompilationSession<'a> {
    config: &'a CompilerConfig,
    sources: &'a dyn SourceProvider,
    name: SmolStr,
    line: u32,
    pub(super) safety: SafetyTracker,
    pub(super) autoescape: Vec<bool>,
    pub(super) strip: Vec<bool>,
    pub(super) loops: Vec<LoopFrame>,
    pub(super) breakables: Vec<Breakable>,
    pub(super) macros: FxHashMap<SmolStr, Arc<MacroDef>>,
    pub(super) namespaces: FxHashMap<SmolStr, FxHashMap<SmolStr, Arc<MacroDef>>>,
    pub(super) expanding: Vec<Arc<MacroDef>>,
    macro_keys: Vec<(Arc<MacroDef>, SmolStr)>,
    pub(super) macro_table: IndexMap<SmolStr, ir::MacroDef>,
    pub(super) block_names: FxHashSet<SmolStr>,
    dependencies: IndexMap<SmolStr, u64>,
    pub(super) extends_chain: Vec<SmolStr>,
    pub(super) dynamic_child: bool,
    pub(super) including: Vec<SmolStr>,
    ast_cache: FxHashMap<SmolStr, Program>,
    lexer_options: lexer::Options,
    tag_shapes: TagShapes,
}

impl<'a> CompilationSession<'a> {
    pub fn new(config: &'a CompilerConfig, sources: &'a dyn SourceProvider, name: &str) -> Self {
        Self {
            config,
            sources,
            name: SmolStr::new(name),
            line: 1,
            safety: SafetyTracker::default(),
            autoescape: vec![config.options.contains(Options::AUTO_ESCAPE)],
            strip: vec![config.options.contains(Options::AUTO_STRIP)],
            loops: Vec::new(),
            breakables: Vec::new(),
            macros: FxHashMap::default(),
            namespaces: FxHashMap::default(),
            expanding: Vec::new(),
            macro_keys: Vec::new(),
            macro_table: IndexMap::new(),
            block_names: FxHashSet::default(),
            dependencies: IndexMap::new(),
            extends_chain: Vec::new(),
            dynamic_child: false,
            including: Vec::new(),
            ast_cache: FxHashMap::default(),
            lexer_options: config
                .extensions
                .lexer_options(config.options.contains(Options::AUTO_TRIM)),
            tag_shapes: config.extensions.tag_shapes(),
        }
    }

    pub fn config(&self) -> &'a CompilerConfig {
        self.config
    }

    pub fn options(&self) -> Options {
        self.config.options
    }

    pub fn unit_name(&self) -> &str {
        &self.name
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub(super) fn set_line(&mut self, line: u32) {
        self.line = line;
    }

    pub fn constant(&self, name: &str) -> Option<&'a Value> {
        self.config.extensions.constants.get(name)
    }

    /// Whether the unit being compiled defines a block with this name.
    pub fn has_block(&self, name: &str) -> bool {
        self.block_names.contains(name)
    }

    pub fn mark_safe(&mut self, name: &str) {
        self.safety.mark_safe(name);
    }

    pub fn mark_unsafe(&mut self, name: &str) {
        self.safety.mark_unsafe(name);
    }

    /// Whether a printed value with the given safety needs escaping here.
    pub fn escape_for(&self, safe: bool) -> bool {
        !safe && self.autoescape.last().copied().unwrap_or(false)
    }

    pub(super) fn strip_enabled(&self) -> bool {
        self.strip.last().copied().unwrap_or(false)
    }

    pub fn invalid_usage(&self, message: impl Into<String>) -> CompileError {
        CompileError::InvalidUsage {
            message: message.into(),
            line: self.line,
        }
    }

    pub fn security(&self, message: impl Into<String>) -> CompileError {
        CompileError::Security {
            message: message.into(),
            line: self.line,
        }
    }

    /// Reads the template being compiled and records it as a dependency.
    pub(super) fn read_root(&mut self) -> Result<String, CompileError> {
        let name = self.name.clone();
        self.read(&name)
    }

    fn read(&mut self, name: &str) -> Result<String, CompileError> {
        let (source, mtime) = self
            .sources
            .read_source(name)
            .map_err(|e| CompileError::MissingTemplate {
                name: SmolStr::new(name),
                reason: e.to_string(),
                line: self.line,
            })?;
        self.dependencies.insert(SmolStr::new(name), mtime);
        Ok(source)
    }

    pub(super) fn parse(&self, name: SmolStr, source: &str) -> Result<Program, Error> {
        let tokens = Lexer::new(self.lexer_options.clone())
            .tokenize(source)
            .map_err(|e| Error::from_lexer(&name, source, e))?;
        ast::parse(&tokens, &self.tag_shapes).map_err(|e| Error::from_syntax(&name, source, e))
    }

    /// Reads and parses another template, recording it as a dependency.
    pub(super) fn load_ast(&mut self, name: &str) -> Result<Program, CompileError> {
        if let Some(program) = self.ast_cache.get(name) {
            return Ok(program.clone());
        }

        tracing::debug!(template = %self.name, dependency = name, "loading dependency");
        let source = self.read(name)?;
        let program = self
            .parse(SmolStr::new(name), &source)
            .map_err(|e| CompileError::Dependency(Box::new(e)))?;
        self.ast_cache.insert(SmolStr::new(name), program.clone());
        Ok(program)
    }

    /// Table key for a recursive macro. Imported macros may share a name with local ones.
    pub(super) fn macro_key(&mut self, def: &Arc<MacroDef>) -> SmolStr {
        if let Some((_, key)) = self.macro_keys.iter().find(|(d, _)| Arc::ptr_eq(d, def)) {
            return key.clone();
        }

        let mut key = def.name.clone();
        let mut n = 1;
        while self.macro_keys.iter().any(|(_, k)| *k == key) {
            n += 1;
            key = SmolStr::new(format!("{}_{}", def.name, n));
        }
        self.macro_keys.push((Arc::clone(def), key.clone()));
        key
    }

    /// Compiles `body` with no visible loops, breakables or safe variables.
    pub(super) fn compile_isolated(&mut self, body: &[ast::Node]) -> Result<Vec<Op>, CompileError> {
        let safety = std::mem::take(&mut self.safety);
        let loops = std::mem::take(&mut self.loops);
        let breakables = std::mem::take(&mut self.breakables);
        let line = self.line;

        let result = self.compile_nodes(body);

        self.safety = safety;
        self.loops = loops;
        self.breakables = breakables;
        self.line = line;
        result
    }

    /// Registers every macro declared in `nodes`. Earlier declarations win.
    pub(super) fn hoist_macros(&mut self, nodes: &[ast::Node]) {
        for node in nodes {
            if let ast::NodeKind::Macro(def) = &node.kind {
                self.macros
                    .entry(def.name.clone())
                    .or_insert_with(|| Arc::new(def.clone()));
            }
            for children in inherit::children(&node.kind) {
                self.hoist_macros(children);
            }
        }
    }

    pub(super) fn compile_program(mut self, program: Program) -> Result<Unit, CompileError> {
        self.extends_chain.push(self.name.clone());
        let expanded = inherit::expand(&mut self, program)?;

        let mut unit = Unit::new(self.name.clone(), self.config.options);
        match expanded.dynamic {
            None => {
                self.hoist_macros(&expanded.body);
                self.block_names = inherit::block_names(&expanded.body);
                unit.body = self.compile_nodes(&expanded.body)?;
            }
            Some(dynamic) => {
                self.dynamic_child = true;
                self.hoist_macros(&expanded.body);
                for nodes in dynamic.blocks.values() {
                    self.hoist_macros(nodes);
                }
                self.block_names = dynamic.blocks.keys().cloned().collect();

                unit.body = self.compile_nodes(&expanded.body)?;
                self.set_line(dynamic.line);
                let parent = self.compile_expr(&dynamic.parent)?;
                unit.body.push(Op::Extends { parent });

                let preamble_safety = self.safety.clone();
                for (name, nodes) in &dynamic.blocks {
                    self.safety = preamble_safety.clone();
                    let body = self.compile_nodes(nodes)?;
                    unit.blocks.insert(name.clone(), body);
                }
            }
        }

        unit.macros = std::mem::take(&mut self.macro_table);
        unit.dependencies = std::mem::take(&mut self.dependencies);
        tracing::debug!(
            template = %unit.name,
            dependencies = unit.dependencies.len(),
            macros = unit.macros.len(),
            "compiled template"
        );
        Ok(unit)
    }
}
