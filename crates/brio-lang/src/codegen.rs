//! Turns an [`ir::Unit`] into closures.
//!
//! Names are resolved against the registries once, while the closures are
//! built; rendering only calls through. This step also runs when a unit is
//! loaded from the cache, so it never reads template sources.

use std::sync::Arc;

use indexmap::IndexMap;
use smol_str::SmolStr;

use crate::compiler::error::CompileError;
use crate::context::Context;
use crate::extension::{Extension, Extensions, FilterEntry};
use crate::extension::filters::escape_html;
use crate::ir::{self, BinaryOp, Expr, Op, Segment};
use crate::options::Options;
use crate::runtime::{self, Flow, Frame, LoopState, RuntimeError};
use crate::template::Template;
use crate::value::{Map, RangeValue, Value};

mod compiled;

pub use compiled::{Body, CompiledExpr, CompiledMacro, CompiledOp, Macros, render_body};

/// Block bodies a dynamic child hands to its parent.
pub type Blocks = IndexMap<SmolStr, Arc<Body>>;

pub struct CompiledUnit {
    pub body: Body,
    pub macros: Arc<Macros>,
}

fn compiled_expr<F>(f: F) -> CompiledExpr
where
    F: Fn(&mut Frame<'_>) -> Result<Value, RuntimeError> + Send + Sync + 'static,
{
    Box::new(f)
}

fn compiled_op<F>(f: F) -> CompiledOp
where
    F: Fn(&mut Frame<'_>, &mut String) -> Result<Flow, RuntimeError> + Send + Sync + 'static,
{
    Box::new(f)
}

enum PathStep {
    Key(Value),
    Index(CompiledExpr),
}

struct CompiledTarget {
    name: SmolStr,
    path: Vec<PathStep>,
    append: bool,
}

impl CompiledTarget {
    fn keys(&self, frame: &mut Frame<'_>) -> Result<Vec<Value>, RuntimeError> {
        self.path
            .iter()
            .map(|step| match step {
                PathStep::Key(key) => Ok(key.clone()),
                PathStep::Index(index) => index(frame),
            })
            .collect()
    }

    fn read(&self, frame: &mut Frame<'_>) -> Result<Value, RuntimeError> {
        let base = frame.var(&self.name, false)?;
        walk(frame, base, &self.path)
    }
}

pub struct Codegen {
    extensions: Arc<Extensions>,
    strict: bool,
    name: SmolStr,
    blocks: Arc<Blocks>,
}

/// Builds the closures for `unit`.
pub fn generate(unit: &ir::Unit, extensions: &Arc<Extensions>) -> Result<CompiledUnit, CompileError> {
    let mut codegen = Codegen {
        extensions: Arc::clone(extensions),
        strict: unit.options.contains(Options::FORCE_VERIFY),
        name: unit.name.clone(),
        blocks: Arc::default(),
    };

    let macros = unit
        .macros
        .iter()
        .map(|(name, def)| {
            Ok((name.clone(), CompiledMacro {
                params: def.params.clone(),
                body: codegen.body(&def.body)?,
            }))
        })
        .collect::<Result<Macros, CompileError>>()?;
    let macros = Arc::new(macros);

    let blocks = unit
        .blocks
        .iter()
        .map(|(name, ops)| {
            let body = codegen.body(ops)?;
            Ok((name.clone(), Arc::new(vec![with_macros(Arc::clone(&macros), body)])))
        })
        .collect::<Result<Blocks, CompileError>>()?;
    codegen.blocks = Arc::new(blocks);

    Ok(CompiledUnit {
        body: codegen.body(&unit.body)?,
        macros,
    })
}

/// Renders `body` with the macro table of the unit it came from.
fn with_macros(macros: Arc<Macros>, body: Body) -> CompiledOp {
    compiled_op(move |frame: &mut Frame<'_>, out: &mut String| {
        let previous = std::mem::replace(&mut frame.macros, Arc::clone(&macros));
        let result = render_body(&body, frame, out);
        frame.macros = previous;
        result
    })
}

fn write_value(out: &mut String, value: &Value, escape: bool) {
    match (value, escape) {
        (Value::String(s), false) => out.push_str(s),
        (value, false) => out.push_str(&value.to_string()),
        (value, true) => out.push_str(&escape_html(&value.to_string())),
    }
}

fn walk(frame: &mut Frame<'_>, mut value: Value, steps: &[PathStep]) -> Result<Value, RuntimeError> {
    for step in steps {
        value = match step {
            PathStep::Key(key) => runtime::get(&value, key),
            PathStep::Index(index) => {
                let key = index(frame)?;
                runtime::get(&value, &key)
            }
        };
    }
    Ok(value)
}

fn eval_all(exprs: &[CompiledExpr], frame: &mut Frame<'_>) -> Result<Vec<Value>, RuntimeError> {
    exprs.iter().map(|expr| expr(frame)).collect()
}

fn restore_var(frame: &mut Frame<'_>, name: &SmolStr, saved: Option<Value>) {
    match saved {
        Some(value) => {
            frame.vars.insert(name.clone(), value);
        }
        None => {
            frame.vars.remove(name);
        }
    }
}

fn load(frame: &Frame<'_>, name: &str) -> Result<Arc<Template>, RuntimeError> {
    frame
        .host
        .load_template(name, frame.options)
        .map_err(|e| RuntimeError::Template(Box::new(e)))
}

/// Renders `body` in a scope holding only `vars`.
fn render_isolated(
    frame: &mut Frame<'_>,
    name: &str,
    vars: impl IntoIterator<Item = (SmolStr, Value)>,
    body: &[CompiledOp],
) -> Result<Value, RuntimeError> {
    frame.descend(name)?;
    let scope = frame.isolate(vars.into_iter().collect());
    let mut out = String::new();
    let result = render_body(body, frame, &mut out);
    frame.restore(scope);
    frame.ascend();
    result.map(|_| Value::from(out))
}

impl Codegen {
    pub fn body(&self, ops: &[Op]) -> Result<Body, CompileError> {
        ops.iter().map(|op| self.op(op)).collect()
    }

    fn exprs(&self, exprs: &[Expr]) -> Result<Vec<CompiledExpr>, CompileError> {
        exprs.iter().map(|expr| self.expr(expr)).collect()
    }

    fn bindings(&self, bindings: &[(SmolStr, Expr)]) -> Result<Vec<(SmolStr, CompiledExpr)>, CompileError> {
        bindings
            .iter()
            .map(|(name, expr)| Ok((name.clone(), self.expr(expr)?)))
            .collect()
    }

    fn path(&self, segments: &[Segment]) -> Result<Vec<PathStep>, CompileError> {
        segments
            .iter()
            .map(|segment| {
                Ok(match segment {
                    Segment::Name(name) => PathStep::Key(Value::String(name.clone())),
                    Segment::Index(index) => PathStep::Index(self.expr(index)?),
                })
            })
            .collect()
    }

    fn target(&self, target: &ir::Target) -> Result<CompiledTarget, CompileError> {
        Ok(CompiledTarget {
            name: target.name.clone(),
            path: self.path(&target.path)?,
            append: target.append,
        })
    }

    pub fn expr(&self, expr: &Expr) -> Result<CompiledExpr, CompileError> {
        self.expr_in(expr, self.strict)
    }

    /// Compiles `expr` for a position that must not fail on an undefined variable.
    fn lenient(&self, expr: &Expr) -> Result<CompiledExpr, CompileError> {
        self.expr_in(expr, false)
    }

    fn expr_in(&self, expr: &Expr, strict: bool) -> Result<CompiledExpr, CompileError> {
        Ok(match expr {
            Expr::Const(c) => {
                let value = c.to_value();
                compiled_expr(move |_: &mut Frame<'_>| Ok(value.clone()))
            }
            Expr::Var { name, path } => {
                let name = name.clone();
                let path = self.path(path)?;
                compiled_expr(move |frame: &mut Frame<'_>| {
                    let base = frame.var(&name, strict)?;
                    walk(frame, base, &path)
                })
            }
            Expr::Get { base, segment } => {
                let base = self.expr_in(base, strict)?;
                let path = self.path(std::slice::from_ref(segment))?;
                compiled_expr(move |frame: &mut Frame<'_>| {
                    let base = base(frame)?;
                    walk(frame, base, &path)
                })
            }
            Expr::LoopMeta { depth, field } => {
                let (depth, field) = (*depth, *field);
                compiled_expr(move |frame: &mut Frame<'_>| Ok(frame.loop_meta(depth, field)))
            }
            Expr::Global { source, path } => {
                let source = source.clone();
                let path = self.path(path)?;
                compiled_expr(move |frame: &mut Frame<'_>| {
                    let base = frame.context.global(&source).unwrap_or_default();
                    walk(frame, base, &path)
                })
            }
            Expr::Accessor { name, args, path } => {
                let Some(Extension::Alias(accessor)) = self.extensions.accessors.resolve(name) else {
                    return Err(CompileError::UnknownAccessor {
                        name: name.clone(),
                        line: 0,
                    });
                };
                let accessor = Arc::clone(accessor);
                let name = name.clone();
                let args = self.exprs(args)?;
                let path = self.path(path)?;
                compiled_expr(move |frame: &mut Frame<'_>| {
                    let args = eval_all(&args, frame)?;
                    let value = accessor(&args).map_err(|message| RuntimeError::Accessor {
                        name: name.clone(),
                        message,
                    })?;
                    walk(frame, value, &path)
                })
            }
            Expr::BlockDefined { name, local } => {
                let name = name.clone();
                let local = *local;
                compiled_expr(move |frame: &mut Frame<'_>| Ok(Value::Bool(local || frame.overrides.contains_key(&name))))
            }
            Expr::Fetch { name, vars } => {
                let name = self.expr(name)?;
                let vars = vars.as_deref().map(|vars| self.expr(vars)).transpose()?;
                compiled_expr(move |frame: &mut Frame<'_>| {
                    let name = name(frame)?.to_string();
                    let vars = match &vars {
                        Some(vars) => vars(frame)?,
                        None => Value::Null,
                    };
                    let template = load(frame, &name)?;
                    let context: Context = frame.context.fork(&vars);
                    let mut nested = frame.nested(&context);
                    nested.descend(&name)?;
                    let mut out = String::new();
                    template.render_in(&mut nested, &mut out)?;
                    Ok(Value::from(out))
                })
            }
            Expr::TemplateExists(name) => {
                let name = self.expr(name)?;
                compiled_expr(move |frame: &mut Frame<'_>| {
                    let name = name(frame)?.to_string();
                    Ok(Value::Bool(frame.host.template_exists(&name)))
                })
            }
            Expr::Unary { op, operand } => {
                let op = *op;
                let operand = self.expr(operand)?;
                compiled_expr(move |frame: &mut Frame<'_>| runtime::unary(op, &operand(frame)?))
            }
            Expr::Binary { op, lhs, rhs } => {
                let op = *op;
                let lhs = self.expr(lhs)?;
                let rhs = self.expr(rhs)?;
                match op {
                    BinaryOp::Or => compiled_expr(move |frame: &mut Frame<'_>| {
                        Ok(Value::Bool(lhs(frame)?.is_true() || rhs(frame)?.is_true()))
                    }),
                    BinaryOp::And => compiled_expr(move |frame: &mut Frame<'_>| {
                        Ok(Value::Bool(lhs(frame)?.is_true() && rhs(frame)?.is_true()))
                    }),
                    op => compiled_expr(move |frame: &mut Frame<'_>| {
                        let lhs = lhs(frame)?;
                        let rhs = rhs(frame)?;
                        runtime::binary(op, &lhs, &rhs)
                    }),
                }
            }
            Expr::Ternary { cond, then, otherwise } => {
                let cond = self.expr(cond)?;
                let then = self.expr(then)?;
                let otherwise = self.expr(otherwise)?;
                compiled_expr(move |frame: &mut Frame<'_>| {
                    if cond(frame)?.is_true() { then(frame) } else { otherwise(frame) }
                })
            }
            Expr::Elvis(lhs, rhs) => {
                let lhs = self.lenient(lhs)?;
                let rhs = self.expr(rhs)?;
                compiled_expr(move |frame: &mut Frame<'_>| {
                    let value = lhs(frame)?;
                    if value.is_true() { Ok(value) } else { rhs(frame) }
                })
            }
            Expr::Coalesce(lhs, rhs) => {
                let lhs = self.lenient(lhs)?;
                let rhs = self.expr(rhs)?;
                compiled_expr(move |frame: &mut Frame<'_>| {
                    let value = lhs(frame)?;
                    if value.is_null() { rhs(frame) } else { Ok(value) }
                })
            }
            Expr::IfSet { cond, then, otherwise } => {
                let cond = self.lenient(cond)?;
                let then = self.expr(then)?;
                let otherwise = self.expr(otherwise)?;
                compiled_expr(move |frame: &mut Frame<'_>| {
                    if cond(frame)?.is_null() { otherwise(frame) } else { then(frame) }
                })
            }
            Expr::NotEmpty(value) => {
                let value = self.lenient(value)?;
                compiled_expr(move |frame: &mut Frame<'_>| Ok(Value::Bool(value(frame)?.is_true())))
            }
            Expr::IsSet(value) => {
                let value = self.lenient(value)?;
                compiled_expr(move |frame: &mut Frame<'_>| Ok(Value::Bool(!value(frame)?.is_null())))
            }
            Expr::Check { name, value } => {
                let Some(Extension::Alias(check)) = self.extensions.checks.resolve(name) else {
                    return Err(CompileError::InvalidUsage {
                        message: format!("Unknown check 'is {}'", name),
                        line: 0,
                    });
                };
                let check = Arc::clone(check);
                let value = self.expr(value)?;
                compiled_expr(move |frame: &mut Frame<'_>| Ok(Value::Bool(check(&value(frame)?))))
            }
            Expr::InstanceOf { value, type_name } => {
                let value = self.expr(value)?;
                let type_name = type_name.clone();
                compiled_expr(move |frame: &mut Frame<'_>| {
                    Ok(Value::Bool(match value(frame)? {
                        Value::Object(object) => object.type_name() == type_name,
                        _ => false,
                    }))
                })
            }
            Expr::In { needle, haystack, mode } => {
                let mode = *mode;
                let needle = self.expr(needle)?;
                let haystack = self.expr(haystack)?;
                compiled_expr(move |frame: &mut Frame<'_>| {
                    let needle = needle(frame)?;
                    let haystack = haystack(frame)?;
                    Ok(Value::Bool(runtime::contains(&needle, &haystack, mode)))
                })
            }
            Expr::Range { from, to } => {
                let from = self.expr(from)?;
                let to = self.expr(to)?;
                compiled_expr(move |frame: &mut Frame<'_>| {
                    let from = from(frame)?;
                    let to = to(frame)?;
                    match (from.to_number(), to.to_number()) {
                        (Some(a), Some(b)) => {
                            Ok(Value::Range(RangeValue::new(a.to_int(), b.to_int(), 1)))
                        }
                        _ => Err(RuntimeError::InvalidOperands {
                            op: "..",
                            lhs: from.type_name().to_string(),
                            rhs: to.type_name().to_string(),
                        }),
                    }
                })
            }
            Expr::Array(items) => {
                let keyed = items.iter().any(|(key, _)| key.is_some());
                let items = items
                    .iter()
                    .map(|(key, value)| Ok((key.as_ref().map(|key| self.expr(key)).transpose()?, self.expr(value)?)))
                    .collect::<Result<Vec<_>, CompileError>>()?;
                compiled_expr(move |frame: &mut Frame<'_>| {
                    if !keyed {
                        let values = items
                            .iter()
                            .map(|(_, value)| value(frame))
                            .collect::<Result<Vec<_>, _>>()?;
                        return Ok(Value::array(values));
                    }

                    let mut map = Map::new();
                    let mut next = 0usize;
                    for (key, value) in &items {
                        let value = value(frame)?;
                        let key = match key {
                            Some(key) => key(frame)?.to_key(),
                            None => SmolStr::new(next.to_string()),
                        };
                        if let Ok(index) = key.parse::<usize>() {
                            next = next.max(index + 1);
                        }
                        map.insert(key, value);
                    }
                    Ok(Value::map(map))
                })
            }
            Expr::Filter { name, base, args } => {
                let Some(FilterEntry {
                    kind: Extension::Alias(filter),
                    ..
                }) = self.extensions.filters.resolve(name)
                else {
                    return Err(CompileError::UnknownFilter {
                        name: name.clone(),
                        line: 0,
                    });
                };
                let filter = Arc::clone(filter);
                let name = name.clone();
                let base = self.expr_in(base, strict)?;
                let args = self.exprs(args)?;
                compiled_expr(move |frame: &mut Frame<'_>| {
                    let base = base(frame)?;
                    let args = eval_all(&args, frame)?;
                    filter(&base, &args).map_err(|message| RuntimeError::Filter {
                        name: name.clone(),
                        message,
                    })
                })
            }
            Expr::Call { name, args } => {
                let Some(function) = self.extensions.functions.resolve(name) else {
                    return Err(CompileError::UnknownFunction {
                        name: name.clone(),
                        line: 0,
                    });
                };
                let function = Arc::clone(&function.func);
                let name = name.clone();
                let args = self.exprs(args)?;
                compiled_expr(move |frame: &mut Frame<'_>| {
                    let args = eval_all(&args, frame)?;
                    function(&args).map_err(|message| RuntimeError::Function {
                        name: name.clone(),
                        message,
                    })
                })
            }
            Expr::DynamicCall { name, args, restricted } => {
                let extensions = Arc::clone(&self.extensions);
                let restricted = *restricted;
                let name = self.expr(name)?;
                let args = self.exprs(args)?;
                compiled_expr(move |frame: &mut Frame<'_>| {
                    let name = name(frame)?.to_key();
                    let Some(function) = extensions.functions.resolve(&name) else {
                        return Err(RuntimeError::UnknownFunction(name));
                    };
                    if restricted && function.restricted {
                        return Err(RuntimeError::Security(format!("Function '{}' is not allowed", name)));
                    }
                    let args = eval_all(&args, frame)?;
                    (function.func)(&args).map_err(|message| RuntimeError::Function { name, message })
                })
            }
            Expr::Method { object, name, args } => {
                let object = self.expr_in(object, strict)?;
                let name = name.clone();
                let args = self.exprs(args)?;
                compiled_expr(move |frame: &mut Frame<'_>| {
                    let object = object(frame)?;
                    let args = eval_all(&args, frame)?;
                    let result = match &object {
                        Value::Object(object) => object.call_method(&name, &args),
                        other => Err(format!("{} has no methods", other.type_name())),
                    };
                    result.map_err(|message| RuntimeError::Method {
                        name: name.clone(),
                        message,
                    })
                })
            }
            Expr::Macro { name, args } => {
                let name = name.clone();
                let args = self.exprs(args)?;
                compiled_expr(move |frame: &mut Frame<'_>| {
                    let values = eval_all(&args, frame)?;
                    let macros = Arc::clone(&frame.macros);
                    let Some(def) = macros.get(&name) else {
                        return Err(RuntimeError::UnknownFunction(name.clone()));
                    };
                    render_isolated(frame, &name, def.params.iter().cloned().zip(values), &def.body)
                })
            }
            Expr::Render { bindings, body, isolated } => {
                let bindings = self.bindings(bindings)?;
                let body = self.body(body)?;
                let name = self.name.clone();
                if *isolated {
                    compiled_expr(move |frame: &mut Frame<'_>| {
                        let vars = bindings
                            .iter()
                            .map(|(name, value)| Ok((name.clone(), value(frame)?)))
                            .collect::<Result<Vec<_>, RuntimeError>>()?;
                        render_isolated(frame, &name, vars, &body)
                    })
                } else {
                    compiled_expr(move |frame: &mut Frame<'_>| {
                        for (name, value) in &bindings {
                            let value = value(frame)?;
                            frame.vars.insert(name.clone(), value);
                        }
                        let mut out = String::new();
                        render_body(&body, frame, &mut out)?;
                        Ok(Value::from(out))
                    })
                }
            }
        })
    }

    fn op(&self, op: &Op) -> Result<CompiledOp, CompileError> {
        Ok(match op {
            Op::Text(text) => {
                let text = text.clone();
                compiled_op(move |_: &mut Frame<'_>, out: &mut String| {
                    out.push_str(&text);
                    Ok(Flow::Normal)
                })
            }
            Op::Print { expr, escape } => {
                let expr = self.expr(expr)?;
                let escape = *escape;
                compiled_op(move |frame: &mut Frame<'_>, out: &mut String| {
                    write_value(out, &expr(frame)?, escape);
                    Ok(Flow::Normal)
                })
            }
            Op::If { branches, otherwise } => {
                let branches = branches
                    .iter()
                    .map(|(cond, body)| Ok((self.expr(cond)?, self.body(body)?)))
                    .collect::<Result<Vec<_>, CompileError>>()?;
                let otherwise = otherwise.as_deref().map(|body| self.body(body)).transpose()?;
                compiled_op(move |frame: &mut Frame<'_>, out: &mut String| {
                    for (cond, body) in &branches {
                        if cond(frame)?.is_true() {
                            return render_body(body, frame, out);
                        }
                    }
                    match &otherwise {
                        Some(body) => render_body(body, frame, out),
                        None => Ok(Flow::Normal),
                    }
                })
            }
            Op::Loop(op) => self.loop_op(op)?,
            Op::While { cond, body } => {
                let cond = self.expr(cond)?;
                let body = self.body(body)?;
                compiled_op(move |frame: &mut Frame<'_>, out: &mut String| {
                    while cond(frame)?.is_true() {
                        if render_body(&body, frame, out)? == Flow::Break {
                            break;
                        }
                    }
                    Ok(Flow::Normal)
                })
            }
            Op::Switch { subject, cases, default } => {
                let subject = self.expr(subject)?;
                let cases = cases
                    .iter()
                    .map(|(values, body)| Ok((self.exprs(values)?, self.body(body)?)))
                    .collect::<Result<Vec<_>, CompileError>>()?;
                let default = default.as_deref().map(|body| self.body(body)).transpose()?;
                compiled_op(move |frame: &mut Frame<'_>, out: &mut String| {
                    let subject = subject(frame)?.to_string();
                    for (values, body) in &cases {
                        for value in values {
                            if value(frame)?.to_string() == subject {
                                return render_body(body, frame, out);
                            }
                        }
                    }
                    match &default {
                        Some(body) => render_body(body, frame, out),
                        None => Ok(Flow::Normal),
                    }
                })
            }
            Op::Assign {
                target,
                value,
                only_if_unset,
            } => {
                let target = self.target(target)?;
                let value = self.expr(value)?;
                let only_if_unset = *only_if_unset;
                compiled_op(move |frame: &mut Frame<'_>, _: &mut String| {
                    if only_if_unset && !target.read(frame)?.is_null() {
                        return Ok(Flow::Normal);
                    }
                    let value = value(frame)?;
                    let keys = target.keys(frame)?;
                    let root = frame.vars.entry(target.name.clone()).or_default();
                    runtime::assign(root, &target.name, &keys, target.append, value)?;
                    Ok(Flow::Normal)
                })
            }
            Op::Unset(targets) => {
                let targets = targets
                    .iter()
                    .map(|target| self.target(target))
                    .collect::<Result<Vec<_>, _>>()?;
                compiled_op(move |frame: &mut Frame<'_>, _: &mut String| {
                    for target in &targets {
                        let keys = target.keys(frame)?;
                        if keys.is_empty() {
                            frame.vars.remove(&target.name);
                        } else if let Some(root) = frame.vars.get_mut(&target.name) {
                            runtime::unset(root, &keys);
                        }
                    }
                    Ok(Flow::Normal)
                })
            }
            Op::Block { name, body } => {
                let name = name.clone();
                let own = Arc::new(self.body(body)?);
                compiled_op(move |frame: &mut Frame<'_>, out: &mut String| {
                    let chain = frame
                        .overrides
                        .get(&name)
                        .filter(|chain| !chain.is_empty())
                        .map(|chain| {
                            chain
                                .iter()
                                .cloned()
                                .chain(std::iter::once(Arc::clone(&own)))
                                .collect::<Arc<[Arc<Body>]>>()
                        });
                    let Some(chain) = chain else {
                        return render_body(&own, frame, out);
                    };
                    frame.supers.push((Arc::clone(&chain), 0));
                    let result = render_body(&chain[0], frame, out);
                    frame.supers.pop();
                    result
                })
            }
            Op::BlockSuper => compiled_op(|frame: &mut Frame<'_>, out: &mut String| {
                let Some((chain, index)) = frame.supers.last().cloned() else {
                    return Ok(Flow::Normal);
                };
                let Some(body) = chain.get(index + 1).cloned() else {
                    return Ok(Flow::Normal);
                };
                frame.supers.push((chain, index + 1));
                let result = render_body(&body, frame, out);
                frame.supers.pop();
                result
            }),
            Op::Extends { parent } => {
                let parent = self.expr(parent)?;
                let blocks = Arc::clone(&self.blocks);
                compiled_op(move |frame: &mut Frame<'_>, out: &mut String| {
                    let parent = parent(frame)?;
                    let name = match parent.values() {
                        Some(names) => names
                            .iter()
                            .map(ToString::to_string)
                            .find(|name| frame.host.template_exists(name))
                            .ok_or_else(|| RuntimeError::TemplateUnavailable {
                                name: SmolStr::new(names.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")),
                                message: "none of the candidates exist".to_string(),
                            })?,
                        _ => parent.to_string(),
                    };
                    let template = load(frame, &name)?;
                    frame.descend(&name)?;
                    let saved = frame.overrides.clone();
                    for (block, body) in blocks.iter() {
                        frame.overrides.entry(block.clone()).or_default().push(Arc::clone(body));
                    }
                    let result = template.render_in(frame, out);
                    frame.overrides = saved;
                    frame.ascend();
                    result.map(|_| Flow::Normal)
                })
            }
            Op::Include { name, params } => {
                let name = self.expr(name)?;
                let params = self.bindings(params)?;
                compiled_op(move |frame: &mut Frame<'_>, out: &mut String| {
                    let name = name(frame)?.to_string();
                    let template = load(frame, &name)?;
                    let mut vars = frame.vars.clone();
                    for (param, value) in &params {
                        let value = value(frame)?;
                        vars.insert(param.clone(), value);
                    }

                    frame.descend(&name)?;
                    let scope = frame.isolate(vars);
                    let overrides = std::mem::take(&mut frame.overrides);
                    let supers = std::mem::take(&mut frame.supers);
                    let result = template.render_in(frame, out);
                    frame.overrides = overrides;
                    frame.supers = supers;
                    frame.restore(scope);
                    frame.ascend();
                    result.map(|_| Flow::Normal)
                })
            }
            Op::Scope { bindings, body } => {
                let bindings = self.bindings(bindings)?;
                let body = self.body(body)?;
                compiled_op(move |frame: &mut Frame<'_>, out: &mut String| {
                    let mut values = Vec::with_capacity(bindings.len());
                    for (name, value) in &bindings {
                        values.push((name.clone(), value(frame)?));
                    }
                    let saved = frame.vars.clone();
                    frame.vars.extend(values);
                    let result = render_body(&body, frame, out);
                    frame.vars = saved;
                    result
                })
            }
            Op::Cycle { values, escape } => {
                let values = self.exprs(values)?;
                let escape = *escape;
                let site = Arc::new(());
                compiled_op(move |frame: &mut Frame<'_>, out: &mut String| {
                    let mut items = eval_all(&values, frame)?;
                    let spread = match items.as_slice() {
                        [single] if !single.is_scalar() => single.values(),
                        _ => None,
                    };
                    if let Some(list) = spread {
                        items = list;
                    }
                    if items.is_empty() {
                        return Ok(Flow::Normal);
                    }
                    let index = frame.next_cycle(Arc::as_ptr(&site) as usize) % items.len();
                    write_value(out, &items[index], escape);
                    Ok(Flow::Normal)
                })
            }
            Op::Eval(expr) => {
                let expr = self.expr(expr)?;
                compiled_op(move |frame: &mut Frame<'_>, _: &mut String| {
                    expr(frame)?;
                    Ok(Flow::Normal)
                })
            }
            Op::Break => compiled_op(|_: &mut Frame<'_>, _: &mut String| Ok(Flow::Break)),
            Op::Continue => compiled_op(|_: &mut Frame<'_>, _: &mut String| Ok(Flow::Continue)),
            Op::Tag {
                name,
                args,
                body,
                assign,
                escape,
            } => {
                let Some(Extension::Alias(tag)) = self.extensions.tags.resolve(name).map(|entry| &entry.kind) else {
                    return Err(CompileError::UnknownTag {
                        name: name.clone(),
                        line: 0,
                    });
                };
                let tag = Arc::clone(tag);
                let name = name.clone();
                let args = self.exprs(args)?;
                let body = body.as_deref().map(|body| self.body(body)).transpose()?;
                let assign = assign.clone();
                let escape = *escape;
                compiled_op(move |frame: &mut Frame<'_>, out: &mut String| {
                    let args = eval_all(&args, frame)?;
                    let content = match &body {
                        Some(body) => {
                            let mut content = String::new();
                            render_body(body, frame, &mut content)?;
                            Some(content)
                        }
                        None => None,
                    };
                    let value = tag(&args, content.as_deref()).map_err(|message| RuntimeError::Tag {
                        name: name.clone(),
                        message,
                    })?;
                    match &assign {
                        Some(var) => {
                            frame.vars.insert(var.clone(), value);
                        }
                        None => write_value(out, &value, escape),
                    }
                    Ok(Flow::Normal)
                })
            }
        })
    }

    fn loop_op(&self, op: &ir::LoopOp) -> Result<CompiledOp, CompileError> {
        let source = self.expr(&op.source)?;
        let body = self.body(&op.body)?;
        let empty = op.empty.as_deref().map(|body| self.body(body)).transpose()?;
        let key = op.key.clone();
        let value = op.value.clone();
        let needs_length = op.needs_length;

        Ok(compiled_op(move |frame: &mut Frame<'_>, out: &mut String| {
            let source = source(frame)?;
            let (length, items): (usize, Box<dyn Iterator<Item = (Value, Value)>>) = match source {
                Value::Range(range) => (
                    range.len(),
                    Box::new((0..range.len()).filter_map(move |i| range.get(i).map(|n| (Value::from(i), Value::from(n))))),
                ),
                source => {
                    let entries = runtime::iterate(&source)?;
                    (entries.len(), Box::new(entries.into_iter()))
                }
            };

            if length == 0 {
                return match &empty {
                    Some(body) => render_body(body, frame, out),
                    None => Ok(Flow::Normal),
                };
            }

            let saved_value = frame.vars.get(&value).cloned();
            let saved_key = key.as_ref().map(|key| (key.clone(), frame.vars.get(key).cloned()));
            frame.loops.push(LoopState {
                index: 0,
                length: needs_length.then_some(length),
                key: Value::Null,
            });

            let mut result = Ok(Flow::Normal);
            for (index, (k, v)) in items.enumerate() {
                if let Some(state) = frame.loops.last_mut() {
                    state.index = index;
                    state.key = k.clone();
                }
                if let Some(key) = &key {
                    frame.vars.insert(key.clone(), k);
                }
                frame.vars.insert(value.clone(), v);

                match render_body(&body, frame, out) {
                    Ok(Flow::Break) => break,
                    Ok(_) => {}
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }

            frame.loops.pop();
            restore_var(frame, &value, saved_value);
            if let Some((key, saved)) = saved_key {
                restore_var(frame, &key, saved);
            }
            result
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder;
    use crate::ir::{Const, LoopField, LoopOp, Target, Unit};
    use crate::runtime::NoHost;
    use rstest::rstest;

    fn render(body: Vec<Op>, context: &Context) -> Result<String, RuntimeError> {
        render_unit(Unit { body, ..Unit::new("test", Options::NONE) }, context)
    }

    fn render_unit(unit: Unit, context: &Context) -> Result<String, RuntimeError> {
        let compiled = generate(&unit, &Arc::new(Extensions::default())).unwrap();
        let mut frame = Frame::new(context, &NoHost);
        frame.macros = Arc::clone(&compiled.macros);
        let mut out = String::new();
        render_body(&compiled.body, &mut frame, &mut out)?;
        Ok(out)
    }

    fn print(expr: Expr) -> Op {
        Op::Print { expr, escape: true }
    }

    fn loop_over(source: Expr, body: Vec<Op>, empty: Option<Vec<Op>>) -> Op {
        Op::Loop(Box::new(LoopOp {
            source,
            key: None,
            value: SmolStr::new("item"),
            body,
            empty,
            needs_length: true,
        }))
    }

    #[rstest]
    #[case::escaped(Value::from("<b>\"x\" & y</b>"), true, "&lt;b&gt;&quot;x&quot; &amp; y&lt;/b&gt;")]
    #[case::raw(Value::from("<b>"), false, "<b>")]
    #[case::number(Value::from(1.5), true, "1.5")]
    #[case::null(Value::Null, true, "")]
    fn test_print(#[case] value: Value, #[case] escape: bool, #[case] expected: &str) {
        let context = Context::new().with("v", value);
        let out = render(vec![Op::Print { expr: builder::var("v"), escape }], &context).unwrap();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_loop_metadata() {
        let context = Context::new().with("items", vec![10, 20, 30]);
        let body = vec![
            print(Expr::LoopMeta {
                depth: 0,
                field: LoopField::Index,
            }),
            Op::If {
                branches: vec![(
                    Expr::LoopMeta {
                        depth: 0,
                        field: LoopField::Last,
                    },
                    vec![Op::Text(".".to_string())],
                )],
                otherwise: Some(vec![Op::Text(",".to_string())]),
            },
        ];
        let out = render(vec![loop_over(builder::var("items"), body, None)], &context).unwrap();
        assert_eq!(out, "0,1,2.");
    }

    #[rstest]
    #[case::empty_list(Value::from(Vec::<i64>::new()), "none")]
    #[case::undefined(Value::Null, "none")]
    #[case::items(Value::from(vec![1]), "1")]
    fn test_loop_empty_branch(#[case] items: Value, #[case] expected: &str) {
        let context = Context::new().with("items", items);
        let op = loop_over(
            builder::var("items"),
            vec![print(builder::var("item"))],
            Some(vec![Op::Text("none".to_string())]),
        );
        assert_eq!(render(vec![op], &context).unwrap(), expected);
    }

    #[test]
    fn test_loop_restores_variable() {
        let context = Context::new().with("item", "outer");
        let ops = vec![
            loop_over(
                Expr::Range {
                    from: Box::new(builder::number(1)),
                    to: Box::new(builder::number(3)),
                },
                vec![print(builder::var("item"))],
                None,
            ),
            print(builder::var("item")),
        ];
        assert_eq!(render(ops, &context).unwrap(), "123outer");
    }

    #[test]
    fn test_break_stops_loop() {
        let context = Context::new().with("items", vec![1, 2, 3]);
        let body = vec![
            Op::If {
                branches: vec![(
                    builder::binary(BinaryOp::Eq, builder::var("item"), builder::number(2)),
                    vec![Op::Break],
                )],
                otherwise: None,
            },
            print(builder::var("item")),
        ];
        assert_eq!(render(vec![loop_over(builder::var("items"), body, None)], &context).unwrap(), "1");
    }

    #[test]
    fn test_assign_path_and_append() {
        let target = |name: &str, path: Vec<Segment>, append: bool| Target {
            name: SmolStr::new(name),
            path,
            append,
        };
        let ops = vec![
            Op::Assign {
                target: target("user", vec![Segment::Name(SmolStr::new("name"))], false),
                value: builder::string("Ann"),
                only_if_unset: false,
            },
            Op::Assign {
                target: target("xs", vec![], true),
                value: builder::number(1),
                only_if_unset: false,
            },
            Op::Assign {
                target: target("xs", vec![], true),
                value: builder::number(2),
                only_if_unset: false,
            },
            print(builder::attr(builder::var("user"), "name")),
            print(builder::filter("join", builder::var("xs"), vec![builder::string("-")])),
        ];
        assert_eq!(render(ops, &Context::new()).unwrap(), "Ann1-2");
    }

    #[test]
    fn test_add_only_assigns_unset() {
        let ops = vec![
            Op::Assign {
                target: Target {
                    name: SmolStr::new("a"),
                    path: vec![],
                    append: false,
                },
                value: builder::number(2),
                only_if_unset: true,
            },
            print(builder::var("a")),
        ];
        assert_eq!(render(ops.clone(), &Context::new().with("a", 1)).unwrap(), "1");
        assert_eq!(render(ops, &Context::new()).unwrap(), "2");
    }

    #[test]
    fn test_switch_compares_as_strings() {
        let op = Op::Switch {
            subject: builder::var("n"),
            cases: vec![
                (vec![builder::string("1"), builder::string("2")], vec![Op::Text("low".to_string())]),
                (vec![builder::number(3)], vec![Op::Text("three".to_string())]),
            ],
            default: Some(vec![Op::Text("other".to_string())]),
        };
        assert_eq!(render(vec![op.clone()], &Context::new().with("n", 2)).unwrap(), "low");
        assert_eq!(render(vec![op.clone()], &Context::new().with("n", "3")).unwrap(), "three");
        assert_eq!(render(vec![op], &Context::new().with("n", 9)).unwrap(), "other");
    }

    #[test]
    fn test_cycle_per_site() {
        let cycle = Op::Cycle {
            values: vec![builder::string("a"), builder::string("b")],
            escape: false,
        };
        let op = loop_over(
            Expr::Range {
                from: Box::new(builder::number(1)),
                to: Box::new(builder::number(3)),
            },
            vec![cycle],
            None,
        );
        assert_eq!(render(vec![op], &Context::new()).unwrap(), "aba");
    }

    #[test]
    fn test_recursive_macro_from_table() {
        let mut unit = Unit::new("test", Options::NONE);
        unit.macros.insert(SmolStr::new("countdown"), ir::MacroDef {
            params: vec![SmolStr::new("n")],
            body: vec![
                print(builder::var("n")),
                Op::If {
                    branches: vec![(
                        builder::binary(BinaryOp::Gt, builder::var("n"), builder::number(0)),
                        vec![Op::Print {
                            expr: Expr::Macro {
                                name: SmolStr::new("countdown"),
                                args: vec![builder::binary(BinaryOp::Sub, builder::var("n"), builder::number(1))],
                            },
                            escape: false,
                        }],
                    )],
                    otherwise: None,
                },
            ],
        });
        unit.body = vec![Op::Print {
            expr: Expr::Macro {
                name: SmolStr::new("countdown"),
                args: vec![builder::number(3)],
            },
            escape: false,
        }];
        assert_eq!(render_unit(unit, &Context::new()).unwrap(), "3210");
    }

    #[test]
    fn test_runaway_macro_hits_depth_limit() {
        let mut unit = Unit::new("test", Options::NONE);
        let call = Expr::Macro {
            name: SmolStr::new("loop"),
            args: vec![],
        };
        unit.macros.insert(SmolStr::new("loop"), ir::MacroDef {
            params: vec![],
            body: vec![print(call.clone())],
        });
        unit.body = vec![print(call)];
        let err = render_unit(unit, &Context::new()).unwrap_err();
        assert_eq!(err.code(), "RuntimeError::RecursionLimit");
    }

    #[test]
    fn test_force_verify_makes_undefined_an_error() {
        let unit = Unit {
            body: vec![print(builder::var("missing"))],
            ..Unit::new("test", Options::FORCE_VERIFY)
        };
        assert_eq!(
            render_unit(unit, &Context::new()),
            Err(RuntimeError::UndefinedVariable(SmolStr::new("missing")))
        );
    }

    #[test]
    fn test_not_empty_is_lenient_under_force_verify() {
        let unit = Unit {
            body: vec![print(Expr::NotEmpty(Box::new(builder::var("missing"))))],
            ..Unit::new("test", Options::FORCE_VERIFY)
        };
        assert_eq!(render_unit(unit, &Context::new()).unwrap(), "");
    }

    #[test]
    fn test_array_literal_with_keys() {
        let expr = Expr::Array(vec![
            (None, builder::string("a")),
            (Some(builder::string("k")), builder::string("b")),
            (None, builder::string("c")),
        ]);
        let op = Op::Print {
            expr: builder::filter("json_encode", expr, vec![]),
            escape: false,
        };
        assert_eq!(render(vec![op], &Context::new()).unwrap(), r#"{"0":"a","k":"b","1":"c"}"#);
    }

    #[test]
    fn test_unknown_filter_fails_generation() {
        let unit = Unit {
            body: vec![print(builder::filter("nope", Expr::Const(Const::Null), vec![]))],
            ..Unit::new("test", Options::NONE)
        };
        assert!(matches!(
            generate(&unit, &Arc::new(Extensions::default())),
            Err(CompileError::UnknownFilter { .. })
        ));
    }

    struct SingleParent(Arc<Template>);

    impl runtime::Host for SingleParent {
        fn load_template(&self, _name: &str, _options: Options) -> Result<Arc<Template>, crate::error::Error> {
            Ok(Arc::clone(&self.0))
        }

        fn template_exists(&self, _name: &str) -> bool {
            true
        }
    }

    #[test]
    fn test_extends_drops_child_overrides_after_parent_render() {
        let extensions = Arc::new(Extensions::default());
        let parent = Unit {
            body: vec![Op::Block {
                name: SmolStr::new("b"),
                body: vec![builder::text("parent")],
            }],
            ..Unit::new("parent", Options::NONE)
        };
        let host = SingleParent(Arc::new(Template::from_unit(parent, &extensions).unwrap()));

        let mut child = Unit {
            body: vec![
                Op::Extends {
                    parent: builder::string("parent"),
                },
                Op::Block {
                    name: SmolStr::new("b"),
                    body: vec![builder::text("own")],
                },
            ],
            ..Unit::new("child", Options::NONE)
        };
        child.blocks.insert(SmolStr::new("b"), vec![builder::text("child")]);
        let compiled = generate(&child, &extensions).unwrap();

        let context = Context::new();
        let mut frame = Frame::new(&context, &host);
        let mut out = String::new();
        render_body(&compiled.body, &mut frame, &mut out).unwrap();
        assert_eq!(out, "childown");
        assert!(frame.overrides.is_empty());
    }
}
