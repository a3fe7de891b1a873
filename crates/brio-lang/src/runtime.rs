//! Render-time semantics of the template language.
//!
//! The generated closures call into these helpers for operators, membership,
//! property access and assignment. Keeping them here means the closures only
//! wire values together.

use std::sync::Arc;

use smol_str::SmolStr;

use crate::ir::{BinaryOp, InMode, UnaryOp};
use crate::number::Number;
use crate::value::{Map, Value};

pub mod error;
mod frame;

pub use error::RuntimeError;
pub use frame::{Flow, Frame, Host, LoopState, NoHost, Scope, SuperChain};

fn operator_name(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Or => "or",
        BinaryOp::And => "and",
        BinaryOp::Eq => "==",
        BinaryOp::NotEq => "!=",
        BinaryOp::Identical => "===",
        BinaryOp::NotIdentical => "!==",
        BinaryOp::Lt => "<",
        BinaryOp::Lte => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Gte => ">=",
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Rem => "%",
        BinaryOp::Concat => "~",
        BinaryOp::ConcatSpace => "~~",
    }
}

pub fn unary(op: UnaryOp, value: &Value) -> Result<Value, RuntimeError> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!value.is_true())),
        UnaryOp::Neg => numeric(value)
            .map(|n| Value::Number(-n))
            .ok_or_else(|| RuntimeError::InvalidOperands {
                op: "-",
                lhs: value.type_name().to_string(),
                rhs: String::new(),
            }),
        UnaryOp::BitNot => numeric(value)
            .map(|n| Value::from(!n.to_int()))
            .ok_or_else(|| RuntimeError::InvalidOperands {
                op: "~",
                lhs: value.type_name().to_string(),
                rhs: String::new(),
            }),
    }
}

fn numeric(value: &Value) -> Option<Number> {
    match value {
        Value::Array(_) | Value::Map(_) | Value::Range(_) | Value::Object(_) => None,
        value => value.to_number(),
    }
}

/// Applies a binary operator to two evaluated operands.
///
/// `and`/`or` short-circuit in the generated code; here they only combine truthiness.
pub fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, RuntimeError> {
    let arithmetic = |f: fn(Number, Number) -> Option<Number>| match (numeric(lhs), numeric(rhs)) {
        (Some(a), Some(b)) => f(a, b).map(Value::Number).ok_or(RuntimeError::ZeroDivision),
        _ => Err(RuntimeError::InvalidOperands {
            op: operator_name(op),
            lhs: lhs.type_name().to_string(),
            rhs: rhs.type_name().to_string(),
        }),
    };

    match op {
        BinaryOp::Or => Ok(Value::Bool(lhs.is_true() || rhs.is_true())),
        BinaryOp::And => Ok(Value::Bool(lhs.is_true() && rhs.is_true())),
        BinaryOp::Eq => Ok(Value::Bool(lhs.loose_eq(rhs))),
        BinaryOp::NotEq => Ok(Value::Bool(!lhs.loose_eq(rhs))),
        BinaryOp::Identical => Ok(Value::Bool(lhs.strict_eq(rhs))),
        BinaryOp::NotIdentical => Ok(Value::Bool(!lhs.strict_eq(rhs))),
        BinaryOp::Lt => Ok(Value::Bool(lhs.compare(rhs).is_lt())),
        BinaryOp::Lte => Ok(Value::Bool(lhs.compare(rhs).is_le())),
        BinaryOp::Gt => Ok(Value::Bool(lhs.compare(rhs).is_gt())),
        BinaryOp::Gte => Ok(Value::Bool(lhs.compare(rhs).is_ge())),
        BinaryOp::Add => match (lhs, rhs) {
            (Value::Array(_) | Value::Map(_), Value::Array(_) | Value::Map(_)) => Ok(union(lhs, rhs)),
            _ => arithmetic(|a, b| Some(a.add(b))),
        },
        BinaryOp::Sub => arithmetic(|a, b| Some(a.sub(b))),
        BinaryOp::Mul => arithmetic(|a, b| Some(a.mul(b))),
        BinaryOp::Div => arithmetic(Number::div),
        BinaryOp::Rem => arithmetic(Number::rem),
        BinaryOp::Concat => Ok(Value::from(format!("{}{}", lhs, rhs))),
        BinaryOp::ConcatSpace => Ok(Value::from(format!("{} {}", lhs, rhs))),
    }
}

/// `a + b` on collections: keys of `a` win, missing keys come from `b`.
fn union(lhs: &Value, rhs: &Value) -> Value {
    let mut merged = to_map(lhs);
    for (key, value) in to_map(rhs) {
        merged.entry(key).or_insert(value);
    }
    if merged.keys().enumerate().all(|(i, k)| k.parse::<usize>() == Ok(i)) {
        Value::array(merged.into_values().collect())
    } else {
        Value::map(merged)
    }
}

fn to_map(value: &Value) -> Map {
    value
        .entries()
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k.to_key(), v))
        .collect()
}

/// Membership test behind `in` and the `in` filter.
pub fn contains(needle: &Value, haystack: &Value, mode: InMode) -> bool {
    let in_string = || {
        let needle = needle.to_string();
        !needle.is_empty() && haystack.to_string().contains(&needle)
    };
    let in_list = || {
        haystack
            .values()
            .is_some_and(|values| values.iter().any(|v| v.loose_eq(needle)))
    };

    match mode {
        InMode::String => in_string(),
        InMode::List => in_list(),
        InMode::Keys => haystack
            .entries()
            .is_some_and(|entries| entries.iter().any(|(k, _)| k.loose_eq(needle))),
        InMode::Auto => match haystack {
            Value::String(_) => in_string(),
            Value::Range(r) => needle
                .to_number()
                .filter(|n| n.is_integral())
                .is_some_and(|n| {
                    let n = n.to_int();
                    (r.start.min(r.end)..=r.start.max(r.end)).contains(&n) && (n - r.start) % r.step == 0
                }),
            _ => in_list(),
        },
    }
}

/// `value.key` / `value[key]`. Missing keys read as null.
pub fn get(value: &Value, key: &Value) -> Value {
    value.get(key).unwrap_or_default()
}

/// Pairs produced by iterating `value`. Null iterates as empty.
pub fn iterate(value: &Value) -> Result<Vec<(Value, Value)>, RuntimeError> {
    match value {
        Value::Null => Ok(Vec::new()),
        value => value
            .entries()
            .ok_or_else(|| RuntimeError::NotIterable(value.type_name().to_string())),
    }
}

/// Writes `value` at `path` inside `root`, creating intermediate maps.
/// With `append`, the value is pushed onto the collection found at `path`.
pub fn assign(root: &mut Value, name: &SmolStr, path: &[Value], append: bool, value: Value) -> Result<(), RuntimeError> {
    let Some((key, rest)) = path.split_first() else {
        if !append {
            *root = value;
            return Ok(());
        }
        return push(root, name, value);
    };

    match root {
        Value::Null => {
            *root = Value::map(Map::new());
            assign(root, name, path, append, value)
        }
        Value::Array(items) if array_index(key, items.len()).is_none() => {
            *root = Value::map(to_map(root));
            assign(root, name, path, append, value)
        }
        Value::Array(items) => {
            let index = array_index(key, items.len()).unwrap_or_default();
            let items = Arc::make_mut(items);
            if index == items.len() {
                items.push(Value::Null);
            }
            assign(&mut items[index], name, rest, append, value)
        }
        Value::Map(map) => {
            let slot = Arc::make_mut(map).entry(key.to_key()).or_default();
            assign(slot, name, rest, append, value)
        }
        _ => Err(RuntimeError::InvalidTarget(name.clone())),
    }
}

/// An index that writes into an array: an existing slot or the next one.
fn array_index(key: &Value, len: usize) -> Option<usize> {
    match key {
        Value::Number(n) if n.is_integral() && n.to_int() >= 0 => Some(n.to_int() as usize),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .filter(|index| *index <= len)
}

fn push(root: &mut Value, name: &SmolStr, value: Value) -> Result<(), RuntimeError> {
    match root {
        Value::Null => {
            *root = Value::array(vec![value]);
            Ok(())
        }
        Value::Array(items) => {
            Arc::make_mut(items).push(value);
            Ok(())
        }
        Value::Map(map) => {
            let map = Arc::make_mut(map);
            let next = map
                .keys()
                .filter_map(|k| k.parse::<usize>().ok())
                .max()
                .map_or(0, |n| n + 1);
            map.insert(SmolStr::new(next.to_string()), value);
            Ok(())
        }
        _ => Err(RuntimeError::InvalidTarget(name.clone())),
    }
}

/// Removes the entry at `path`. Missing entries are ignored.
pub fn unset(root: &mut Value, path: &[Value]) {
    let Some((key, rest)) = path.split_first() else {
        return;
    };
    match root {
        Value::Map(map) if rest.is_empty() => {
            Arc::make_mut(map).shift_remove(key.to_key().as_str());
        }
        Value::Map(map) => {
            if let Some(slot) = Arc::make_mut(map).get_mut(key.to_key().as_str()) {
                unset(slot, rest);
            }
        }
        Value::Array(items) => {
            let Some(index) = key.to_key().parse::<usize>().ok().filter(|i| *i < items.len()) else {
                return;
            };
            if rest.is_empty() {
                Arc::make_mut(items).remove(index);
            } else {
                unset(&mut Arc::make_mut(items)[index], rest);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::add_ints(BinaryOp::Add, Value::from(1), Value::from(2), Value::from(3))]
    #[case::add_numeric_string(BinaryOp::Add, Value::from("2"), Value::from(3), Value::from(5))]
    #[case::div_to_float(BinaryOp::Div, Value::from(7), Value::from(2), Value::from(3.5))]
    #[case::rem(BinaryOp::Rem, Value::from(7), Value::from(3), Value::from(1))]
    #[case::concat(BinaryOp::Concat, Value::from("a"), Value::from(1), Value::from("a1"))]
    #[case::concat_space(BinaryOp::ConcatSpace, Value::from("a"), Value::from("b"), Value::from("a b"))]
    #[case::loose_eq(BinaryOp::Eq, Value::from("1"), Value::from(1), Value::TRUE)]
    #[case::strict_eq(BinaryOp::Identical, Value::from("1"), Value::from(1), Value::FALSE)]
    #[case::lt(BinaryOp::Lt, Value::from(2), Value::from(10), Value::TRUE)]
    #[case::or_is_bool(BinaryOp::Or, Value::from("a"), Value::Null, Value::TRUE)]
    fn test_binary(#[case] op: BinaryOp, #[case] lhs: Value, #[case] rhs: Value, #[case] expected: Value) {
        assert_eq!(binary(op, &lhs, &rhs).unwrap(), expected);
    }

    #[rstest]
    #[case::div(BinaryOp::Div)]
    #[case::rem(BinaryOp::Rem)]
    fn test_zero_division(#[case] op: BinaryOp) {
        assert_eq!(binary(op, &Value::from(1), &Value::from(0)), Err(RuntimeError::ZeroDivision));
    }

    #[test]
    fn test_arithmetic_on_array_fails() {
        let err = binary(BinaryOp::Sub, &Value::from(vec![1]), &Value::from(1)).unwrap_err();
        assert_eq!(err.code(), "RuntimeError::InvalidOperands");
    }

    #[test]
    fn test_union_keeps_left_keys() {
        let lhs = Value::from_iter([("a", 1), ("b", 2)]);
        let rhs = Value::from_iter([("b", 3), ("c", 4)]);
        assert_eq!(
            binary(BinaryOp::Add, &lhs, &rhs).unwrap(),
            Value::from_iter([("a", 1), ("b", 2), ("c", 4)])
        );
    }

    #[rstest]
    #[case::string_mode(Value::from("ell"), Value::from("hello"), InMode::String, true)]
    #[case::list_mode(Value::from(2), Value::from(vec![1, 2]), InMode::List, true)]
    #[case::list_loose(Value::from("2"), Value::from(vec![1, 2]), InMode::List, true)]
    #[case::keys_mode(Value::from("a"), Value::from_iter([("a", 1)]), InMode::Keys, true)]
    #[case::keys_miss(Value::from(1), Value::from_iter([("a", 1)]), InMode::Keys, false)]
    #[case::auto_string(Value::from("x"), Value::from("abc"), InMode::Auto, false)]
    #[case::auto_range(Value::from(3), Value::from(crate::value::RangeValue::new(1, 5, 2)), InMode::Auto, true)]
    #[case::auto_range_step(Value::from(2), Value::from(crate::value::RangeValue::new(1, 5, 2)), InMode::Auto, false)]
    fn test_contains(#[case] needle: Value, #[case] haystack: Value, #[case] mode: InMode, #[case] expected: bool) {
        assert_eq!(contains(&needle, &haystack, mode), expected);
    }

    #[test]
    fn test_assign_creates_nested_maps() {
        let mut root = Value::Null;
        let name = SmolStr::new("x");
        assign(&mut root, &name, &[Value::from("a"), Value::from("b")], false, Value::from(1)).unwrap();
        assert_eq!(root, Value::from_iter([("a", Value::from_iter([("b", 1)]))]));
    }

    #[test]
    fn test_assign_append() {
        let mut root = Value::from(vec![1]);
        let name = SmolStr::new("xs");
        assign(&mut root, &name, &[], true, Value::from(2)).unwrap();
        assert_eq!(root, Value::from(vec![1, 2]));
    }

    #[test]
    fn test_assign_into_scalar_fails() {
        let mut root = Value::from(1);
        let name = SmolStr::new("n");
        let err = assign(&mut root, &name, &[Value::from("a")], false, Value::Null).unwrap_err();
        assert_eq!(err, RuntimeError::InvalidTarget(name));
    }

    #[test]
    fn test_unset_nested() {
        let mut root = Value::from_iter([("a", Value::from_iter([("b", 1), ("c", 2)]))]);
        unset(&mut root, &[Value::from("a"), Value::from("b")]);
        assert_eq!(root, Value::from_iter([("a", Value::from_iter([("c", 2)]))]));
    }

    #[test]
    fn test_iterate_null_is_empty() {
        assert!(iterate(&Value::Null).unwrap().is_empty());
        assert!(iterate(&Value::from(1)).is_err());
    }
}
