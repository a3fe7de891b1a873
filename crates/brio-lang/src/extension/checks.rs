use std::sync::{Arc, LazyLock};

use super::{CheckEntry, Extension, Registry};
use crate::compiler::CompilationSession;
use crate::compiler::error::CompileError;
use crate::ir::{Const, Expr, UnaryOp, builder};
use crate::number::Number;
use crate::value::Value;

pub static BUILTIN_CHECKS: LazyLock<Registry<CheckEntry>> = LazyLock::new(|| {
    let mut map = Registry::default();

    alias(&mut map, &["string"], |v| matches!(v, Value::String(_)));
    alias(&mut map, &["array"], |v| matches!(v, Value::Array(_) | Value::Map(_)));
    alias(&mut map, &["iterable"], Value::is_iterable);
    alias(&mut map, &["bool", "boolean"], |v| matches!(v, Value::Bool(_)));
    alias(&mut map, &["int", "integer"], |v| matches!(v, Value::Number(Number::Int(_))));
    alias(&mut map, &["float", "double", "decimal"], |v| matches!(v, Value::Number(Number::Float(_))));
    alias(&mut map, &["number", "numeric"], Value::is_numeric);
    alias(&mut map, &["scalar"], Value::is_scalar);
    alias(&mut map, &["object"], |v| matches!(v, Value::Object(_)));
    alias(&mut map, &["callable"], |v| matches!(v, Value::Object(o) if o.is_callable()));
    alias(&mut map, &["odd"], |v| v.is_numeric() && v.to_number().is_some_and(|n| n.to_int() % 2 != 0));
    alias(&mut map, &["even"], |v| v.is_numeric() && v.to_number().is_some_and(|n| n.to_int() % 2 == 0));

    generator(&mut map, "set", |_, value| Ok(Expr::IsSet(Box::new(value))));
    generator(&mut map, "empty", |_, value| {
        Ok(Expr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(Expr::NotEmpty(Box::new(value))),
        })
    });
    generator(&mut map, "template", |_, value| Ok(Expr::TemplateExists(Box::new(value))));
    generator(&mut map, "const", |session, value| match value {
        Expr::Const(Const::String(name)) => Ok(builder::boolean(session.constant(&name).is_some())),
        _ => Err(session.invalid_usage("Check 'const' expects a constant name as a string literal")),
    });

    map
});

fn alias<F>(map: &mut Registry<CheckEntry>, names: &[&str], check: F)
where
    F: Fn(&Value) -> bool + Send + Sync + 'static,
{
    let check: super::CheckFn = Arc::new(check);
    for name in names {
        map.insert(*name, Extension::Alias(Arc::clone(&check)));
    }
}

fn generator(
    map: &mut Registry<CheckEntry>,
    name: &str,
    generator: fn(&mut CompilationSession<'_>, Expr) -> Result<Expr, CompileError>,
) {
    map.insert(name, Extension::Generator(generator));
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn check(name: &str, value: Value) -> bool {
        match BUILTIN_CHECKS.resolve(name) {
            Some(Extension::Alias(check)) => check(&value),
            _ => panic!("`{}` is not an alias check", name),
        }
    }

    #[rstest]
    #[case::string("string", Value::from("a"), true)]
    #[case::int("int", Value::from(1), true)]
    #[case::integer_float("integer", Value::from(1.0), false)]
    #[case::numeric_string("numeric", Value::from("1.5"), true)]
    #[case::odd("odd", Value::from(3), true)]
    #[case::even_string("even", Value::from("4"), true)]
    #[case::even_text("even", Value::from("abc"), false)]
    #[case::iterable("iterable", Value::from(vec![1]), true)]
    #[case::scalar("scalar", Value::Null, false)]
    fn test_alias_checks(#[case] name: &str, #[case] value: Value, #[case] expected: bool) {
        assert_eq!(check(name, value), expected);
    }

    #[test]
    fn test_generators_registered() {
        for name in ["set", "empty", "template", "const"] {
            assert!(matches!(BUILTIN_CHECKS.resolve(name), Some(Extension::Generator(_))), "{}", name);
        }
    }
}
