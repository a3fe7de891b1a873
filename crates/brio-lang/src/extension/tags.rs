use std::sync::{Arc, LazyLock};

use regex_lite::Regex;
use smol_str::SmolStr;

use super::{Extension, Registry, TagCall, TagEntry};
use crate::ast::node::{Expr as AstExpr, Literal};
use crate::compiler::CompilationSession;
use crate::compiler::error::CompileError;
use crate::ir::{Expr, Op, builder};
use crate::options::Options;
use crate::value::Value;

static BETWEEN_TAGS: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r">\s+<").ok());

pub static BUILTIN_TAGS: LazyLock<Registry<TagEntry>> = LazyLock::new(|| {
    let mut map = Registry::default();

    map.insert("spaceless", TagEntry {
        kind: Extension::Alias(Arc::new(spaceless_tag)),
        safe: true,
        is_block: true,
    });
    generator(&mut map, "firstof", firstof);
    generator(&mut map, "templatetag", templatetag);
    generator(&mut map, "setsafe", setsafe);
    generator(&mut map, "exec", exec);

    map
});

fn generator(
    map: &mut Registry<TagEntry>,
    name: &str,
    generator: fn(&mut CompilationSession<'_>, TagCall<'_>) -> Result<Vec<Op>, CompileError>,
) {
    map.insert(name, TagEntry {
        kind: Extension::Generator(generator),
        safe: false,
        is_block: false,
    });
}

fn spaceless_tag(_: &[Value], body: Option<&str>) -> Result<Value, String> {
    Ok(Value::from(spaceless(body.unwrap_or_default())))
}

/// Drops whitespace between HTML tags.
pub fn spaceless(s: &str) -> String {
    match BETWEEN_TAGS.as_ref() {
        Some(re) => re.replace_all(s.trim(), "><").into_owned(),
        None => s.trim().to_string(),
    }
}

/// `{firstof a b 'fallback'}` prints (or assigns) the first non-empty argument.
fn firstof(session: &mut CompilationSession<'_>, call: TagCall<'_>) -> Result<Vec<Op>, CompileError> {
    if call.args.is_empty() {
        return Err(session.invalid_usage("Tag {firstof} expects at least one argument"));
    }

    let mut safe = true;
    let mut exprs = Vec::with_capacity(call.args.len());
    for arg in call.args {
        let (expr, arg_safe) = session.compile_expr_with_safety(arg)?;
        safe &= arg_safe;
        exprs.push(expr);
    }

    let value = builder::first_of(exprs, builder::string(""));
    Ok(vec![emit(session, call.assign, value, safe)])
}

fn templatetag(session: &mut CompilationSession<'_>, call: TagCall<'_>) -> Result<Vec<Op>, CompileError> {
    let name = match call.args {
        [AstExpr::Var(name, path)] if path.is_empty() => name.as_str(),
        [AstExpr::Literal(Literal::String(name))] => name.as_str(),
        _ => return Err(session.invalid_usage("Tag {templatetag} expects one keyword")),
    };

    let text = match name {
        "openblock" => "{%",
        "closeblock" => "%}",
        "openvariable" => "{{",
        "closevariable" => "}}",
        "openbrace" => "{",
        "closebrace" => "}",
        "opencomment" => "{#",
        "closecomment" => "#}",
        name => return Err(session.invalid_usage(&format!("Unknown templatetag '{}'", name))),
    };
    Ok(vec![builder::text(text)])
}

/// `{setsafe name}` marks a variable as already escaped.
fn setsafe(session: &mut CompilationSession<'_>, call: TagCall<'_>) -> Result<Vec<Op>, CompileError> {
    for arg in call.args {
        match arg {
            AstExpr::Var(name, path) if path.is_empty() => session.mark_safe(name),
            _ => return Err(session.invalid_usage("Tag {setsafe} expects variable names")),
        }
    }
    Ok(Vec::new())
}

/// `{exec fn arg... [as var]}` calls a registered function.
fn exec(session: &mut CompilationSession<'_>, call: TagCall<'_>) -> Result<Vec<Op>, CompileError> {
    if !session.config().allow_exec {
        return Err(session.security("Tag {exec} is disabled"));
    }

    let (name, args) = match call.args {
        [AstExpr::Var(name, path), args @ ..] if path.is_empty() => (name.clone(), args),
        [AstExpr::Literal(Literal::String(name)), args @ ..] => (name.into(), args),
        _ => return Err(session.invalid_usage("Tag {exec} expects a function name")),
    };

    let Some(entry) = session.config().extensions.functions.resolve(&name) else {
        return Err(CompileError::UnknownFunction {
            name,
            line: session.line(),
        });
    };
    if entry.restricted && session.options().contains(Options::DENY_NATIVE_FUNCS) {
        return Err(session.security(&format!("Function '{}' is not allowed", name)));
    }

    let args = args
        .iter()
        .map(|arg| session.compile_expr(arg))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(vec![emit(session, call.assign, builder::call(name, args), false)])
}

fn emit(session: &mut CompilationSession<'_>, assign: Option<&SmolStr>, value: Expr, safe: bool) -> Op {
    match assign {
        Some(name) => {
            if safe {
                session.mark_safe(name);
            } else {
                session.mark_unsafe(name);
            }
            builder::assign(name.clone(), value)
        }
        None => builder::print(value, session.escape_for(safe)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::between_tags("<p>\n  <b>x</b>  </p>", "<p><b>x</b></p>")]
    #[case::keeps_text_spaces("  <i>a b</i> ", "<i>a b</i>")]
    fn test_spaceless(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(spaceless(input), expected);
    }

    #[test]
    fn test_builtin_shapes() {
        assert!(BUILTIN_TAGS.resolve("spaceless").is_some_and(|t| t.is_block && t.safe));
        assert!(BUILTIN_TAGS.resolve("exec").is_some_and(|t| !t.is_block));
    }
}
