use std::sync::LazyLock;

use smol_str::SmolStr;

use super::{AccessorCall, AccessorEntry, Extension, Registry};
use crate::compiler::CompilationSession;
use crate::compiler::error::CompileError;
use crate::ir::{Const, Expr, Segment, builder};
use crate::options::Options;
use crate::value::Value;

/// Maps supplied on the render context and readable as `$.<source>.key`.
pub const GLOBAL_SOURCES: [&str; 9] = ["get", "post", "cookie", "session", "request", "files", "server", "env", "globals"];

pub static BUILTIN_ACCESSORS: LazyLock<Registry<AccessorEntry>> = LazyLock::new(|| {
    let mut map = Registry::default();

    for source in GLOBAL_SOURCES {
        map.insert(source, Extension::Generator(global as super::AccessorGenerator));
    }
    map.insert("tpl", Extension::Generator(tpl as super::AccessorGenerator));
    map.insert("const", Extension::Generator(constant as super::AccessorGenerator));
    map.insert("call", Extension::Generator(call as super::AccessorGenerator));
    map.insert("fetch", Extension::Generator(fetch as super::AccessorGenerator));
    map.insert("block", Extension::Generator(block as super::AccessorGenerator));

    map
});

fn global(session: &mut CompilationSession<'_>, call: AccessorCall) -> Result<Expr, CompileError> {
    if call.args.is_some() {
        return Err(session.invalid_usage(format!("Accessor $.{} is not callable", call.name)));
    }
    Ok(Expr::Global {
        source: call.name,
        path: call.path,
    })
}

/// `$.tpl.name`, `$.tpl.options`.
fn tpl(session: &mut CompilationSession<'_>, call: AccessorCall) -> Result<Expr, CompileError> {
    let (property, rest) = split_name(session, &call)?;
    let value = match property.as_str() {
        "name" => builder::string(session.unit_name()),
        "options" => builder::number(i64::from(session.options().bits())),
        other => return Err(session.invalid_usage(format!("Unknown template property '{}'", other))),
    };
    Ok(with_path(value, rest))
}

fn constant(session: &mut CompilationSession<'_>, call: AccessorCall) -> Result<Expr, CompileError> {
    let (name, rest) = split_name(session, &call)?;
    let value = match session.constant(&name) {
        Some(value) => match to_const(value) {
            Some(c) => Expr::Const(c),
            None => builder::call("constant", vec![builder::string(name.clone())]),
        },
        None => return Err(session.invalid_usage(format!("Undefined constant '{}'", name))),
    };
    Ok(with_path(value, rest))
}

/// `$.call('name', args...)` dispatches on a name known only at render time.
fn call(session: &mut CompilationSession<'_>, call: AccessorCall) -> Result<Expr, CompileError> {
    let Some(mut args) = call.args.filter(|args| !args.is_empty()) else {
        return Err(session.invalid_usage("Accessor $.call expects a function name"));
    };
    let name = args.remove(0);
    let expr = Expr::DynamicCall {
        name: Box::new(name),
        args,
        restricted: session.options().contains(Options::DENY_NATIVE_FUNCS),
    };
    Ok(with_path(expr, call.path))
}

/// `$.fetch('name', vars?)` renders another template to a string.
fn fetch(session: &mut CompilationSession<'_>, call: AccessorCall) -> Result<Expr, CompileError> {
    let Some(mut args) = call.args.filter(|args| !args.is_empty()) else {
        return Err(session.invalid_usage("Accessor $.fetch expects a template name"));
    };
    let name = args.remove(0);
    let vars = (!args.is_empty()).then(|| Box::new(args.remove(0)));
    Ok(with_path(
        Expr::Fetch {
            name: Box::new(name),
            vars,
        },
        call.path,
    ))
}

/// `$.block.name` is true when the block is defined here or by a child.
fn block(session: &mut CompilationSession<'_>, call: AccessorCall) -> Result<Expr, CompileError> {
    let (name, _) = split_name(session, &call)?;
    Ok(Expr::BlockDefined {
        local: session.has_block(&name),
        name,
    })
}

fn split_name<'c>(session: &CompilationSession<'_>, call: &'c AccessorCall) -> Result<(SmolStr, &'c [Segment]), CompileError> {
    match call.path.split_first() {
        Some((Segment::Name(name), rest)) if call.args.is_none() => Ok((name.clone(), rest)),
        _ => Err(session.invalid_usage(format!("Accessor $.{} expects a property name", call.name))),
    }
}

fn with_path(expr: Expr, path: impl IntoIterator<Item = impl ToOwnedSegment>) -> Expr {
    path.into_iter().fold(expr, |base, segment| Expr::Get {
        base: Box::new(base),
        segment: segment.into_segment(),
    })
}

trait ToOwnedSegment {
    fn into_segment(self) -> Segment;
}

impl ToOwnedSegment for Segment {
    fn into_segment(self) -> Segment {
        self
    }
}

impl ToOwnedSegment for &Segment {
    fn into_segment(self) -> Segment {
        self.clone()
    }
}

fn to_const(value: &Value) -> Option<Const> {
    match value {
        Value::Null => Some(Const::Null),
        Value::Bool(b) => Some(Const::Bool(*b)),
        Value::Number(n) => Some(Const::Number(*n)),
        Value::String(s) => Some(Const::String(s.clone())),
        _ => None,
    }
}
