use std::cmp::Ordering;
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

use indexmap::IndexMap;
use itertools::Itertools;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use smol_str::SmolStr;

use crate::number::Number;

pub type Map = IndexMap<SmolStr, Value>;

/// A host value exposed to templates with its own attributes and methods.
///
/// Attribute reads go through [`Object::get_attr`]. Method calls (`user.name()`)
/// go through [`Object::call_method`] and are refused when the `disable_methods`
/// option is active.
pub trait Object: Debug + Send + Sync {
    /// Name used by `is TypeName` instance checks.
    fn type_name(&self) -> &str;

    fn get_attr(&self, _name: &str) -> Option<Value> {
        None
    }

    fn call_method(&self, name: &str, _args: &[Value]) -> Result<Value, String> {
        Err(format!("{} has no method `{}`", self.type_name(), name))
    }

    fn is_callable(&self) -> bool {
        false
    }

    /// Values produced when the object is used as a loop source.
    fn iterate(&self) -> Option<Vec<Value>> {
        None
    }

    fn render(&self) -> String {
        format!("[object {}]", self.type_name())
    }
}

/// Inclusive integer range produced by `a..b` and `range()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RangeValue {
    pub start: i64,
    pub end: i64,
    pub step: i64,
}

impl RangeValue {
    /// The direction follows the endpoints; `step` is taken as a magnitude.
    pub fn new(start: i64, end: i64, step: i64) -> Self {
        let step = step.checked_abs().unwrap_or(i64::MAX).max(1);
        Self {
            start,
            end,
            step: if end < start { -step } else { step },
        }
    }

    /// Number of items, saturating at `usize::MAX` for ranges wider than the address space.
    pub fn len(&self) -> usize {
        let span = (self.end as i128 - self.start as i128).unsigned_abs();
        usize::try_from(span / self.step.unsigned_abs() as u128)
            .unwrap_or(usize::MAX)
            .saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn get(&self, index: usize) -> Option<i64> {
        if index >= self.len() {
            return None;
        }
        let value = (self.start as i128).checked_add((self.step as i128).checked_mul(index as i128)?)?;
        i64::try_from(value).ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        (0..self.len()).map_while(|i| self.get(i))
    }
}

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(SmolStr),
    Array(Arc<Vec<Value>>),
    Map(Arc<Map>),
    Range(RangeValue),
    Object(Arc<dyn Object>),
}

impl Value {
    pub const NULL: Value = Value::Null;
    pub const TRUE: Value = Value::Bool(true);
    pub const FALSE: Value = Value::Bool(false);

    pub fn array(values: Vec<Value>) -> Self {
        Value::Array(Arc::new(values))
    }

    pub fn map(map: Map) -> Self {
        Value::Map(Arc::new(map))
    }

    pub fn object(object: impl Object + 'static) -> Self {
        Value::Object(Arc::new(object))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The "empty" test of the template language: null, false, zero, `""`, `"0"`
    /// and empty containers are empty.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(b) => !b,
            Value::Number(n) => n.is_zero(),
            Value::String(s) => s.is_empty() || s == "0",
            Value::Array(a) => a.is_empty(),
            Value::Map(m) => m.is_empty(),
            Value::Range(_) => false,
            Value::Object(_) => false,
        }
    }

    pub fn is_true(&self) -> bool {
        !self.is_empty()
    }

    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(Number::Int(_)) => "int",
            Value::Number(Number::Float(_)) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Range(_) => "range",
            Value::Object(o) => o.type_name(),
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Value::Bool(_) | Value::Number(_) | Value::String(_))
    }

    pub fn is_iterable(&self) -> bool {
        match self {
            Value::Array(_) | Value::Map(_) | Value::Range(_) => true,
            Value::Object(o) => o.iterate().is_some(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Numeric view used by arithmetic. Strings are parsed leniently.
    pub fn to_number(&self) -> Option<Number> {
        match self {
            Value::Null => Some(Number::Int(0)),
            Value::Bool(b) => Some(Number::Int(*b as i64)),
            Value::Number(n) => Some(*n),
            Value::String(s) => Some(parse_numeric(s).unwrap_or_default()),
            _ => None,
        }
    }

    /// `true` for numbers and numeric strings.
    pub fn is_numeric(&self) -> bool {
        match self {
            Value::Number(_) => true,
            Value::String(s) => parse_numeric(s).is_some(),
            _ => false,
        }
    }

    pub fn len(&self) -> Option<usize> {
        match self {
            Value::String(s) => Some(s.chars().count()),
            Value::Array(a) => Some(a.len()),
            Value::Map(m) => Some(m.len()),
            Value::Range(r) => Some(r.len()),
            Value::Object(o) => o.iterate().map(|v| v.len()),
            _ => None,
        }
    }

    /// Key/value pairs in iteration order, or `None` for non-iterable values.
    pub fn entries(&self) -> Option<Vec<(Value, Value)>> {
        match self {
            Value::Array(a) => Some(a.iter().enumerate().map(|(i, v)| (Value::from(i), v.clone())).collect()),
            Value::Map(m) => Some(m.iter().map(|(k, v)| (Value::String(k.clone()), v.clone())).collect()),
            Value::Range(r) => Some(r.iter().enumerate().map(|(i, n)| (Value::from(i), Value::from(n))).collect()),
            Value::Object(o) => o
                .iterate()
                .map(|values| values.into_iter().enumerate().map(|(i, v)| (Value::from(i), v)).collect()),
            _ => None,
        }
    }

    /// Values in iteration order.
    pub fn values(&self) -> Option<Vec<Value>> {
        self.entries().map(|entries| entries.into_iter().map(|(_, v)| v).collect())
    }

    /// Reads `self[key]`. Missing keys yield `None`.
    pub fn get(&self, key: &Value) -> Option<Value> {
        match (self, key) {
            (Value::Array(a), key) => key.as_index().and_then(|i| a.get(i).cloned()),
            (Value::Map(m), key) => m.get(key.to_key().as_str()).cloned(),
            (Value::Range(r), key) => key.as_index().and_then(|i| r.get(i)).map(Value::from),
            (Value::String(s), key) => key
                .as_index()
                .and_then(|i| s.chars().nth(i))
                .map(|c| Value::String(c.to_string().into())),
            (Value::Object(o), key) => o.get_attr(key.to_key().as_str()),
            _ => None,
        }
    }

    pub fn get_attr(&self, name: &str) -> Option<Value> {
        self.get(&Value::String(name.into()))
    }

    fn as_index(&self) -> Option<usize> {
        match self {
            Value::Number(n) if n.is_integral() && n.to_int() >= 0 => Some(n.to_int() as usize),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Mapping key for this value.
    pub fn to_key(&self) -> SmolStr {
        match self {
            Value::String(s) => s.clone(),
            other => other.to_string().into(),
        }
    }

    /// Loose equality (`==`): numeric strings compare as numbers.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Null, v) | (v, Value::Null) => v.is_empty(),
            (Value::Bool(a), v) | (v, Value::Bool(a)) => *a == v.is_true(),
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Number(a), Value::String(s)) | (Value::String(s), Value::Number(a)) => {
                parse_numeric(s).is_some_and(|b| *a == b)
            }
            (Value::String(a), Value::String(b)) => match (parse_numeric(a), parse_numeric(b)) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            },
            (a, b) => a.strict_eq(b),
        }
    }

    /// Strict equality (`===`): same type and same value.
    pub fn strict_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a.is_int() == b.is_int() && a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.strict_eq(y)),
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| v.strict_eq(w)))
            }
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Ordering used by `<`, `>`, `sort` and friends.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::String(a), Value::String(b)) => match (parse_numeric(a), parse_numeric(b)) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => a.cmp(b),
            },
            (Value::Array(a), Value::Array(b)) => a.len().cmp(&b.len()),
            (a, b) => match (a.to_number(), b.to_number()) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => a.to_string().cmp(&b.to_string()),
            },
        }
    }
}

/// Parses a numeric string the way the template language treats `"12"` or `" 1.5"`.
pub fn parse_numeric(s: &str) -> Option<Number> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    s.parse::<i64>()
        .map(Number::Int)
        .ok()
        .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(Number::Float))
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.strict_eq(other)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Value::Null => Ok(()),
            Value::Bool(true) => write!(f, "1"),
            Value::Bool(false) => Ok(()),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Array(_) | Value::Map(_) | Value::Range(_) => {
                write!(f, "{}", serde_json::to_string(self).map_err(|_| fmt::Error)?)
            }
            Value::Object(o) => write!(f, "{}", o.render()),
        }
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{:?}", s.as_str()),
            Value::Array(a) => write!(f, "[{}]", a.iter().map(|v| format!("{:?}", v)).join(", ")),
            Value::Map(m) => write!(f, "{{{}}}", m.iter().map(|(k, v)| format!("{:?}: {:?}", k.as_str(), v)).join(", ")),
            Value::Range(r) => write!(f, "{}..{}", r.start, r.end),
            Value::Object(o) => write!(f, "{:?}", o),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(Number::Int(i)) => serializer.serialize_i64(*i),
            Value::Number(Number::Float(f)) => serializer.serialize_f64(*f),
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(a) => {
                let mut seq = serializer.serialize_seq(Some(a.len()))?;
                for v in a.iter() {
                    seq.serialize_element(v)?;
                }
                seq.end()
            }
            Value::Map(m) => {
                let mut map = serializer.serialize_map(Some(m.len()))?;
                for (k, v) in m.iter() {
                    map.serialize_entry(k.as_str(), v)?;
                }
                map.end()
            }
            Value::Range(r) => {
                let mut seq = serializer.serialize_seq(Some(r.len()))?;
                for n in r.iter() {
                    seq.serialize_element(&n)?;
                }
                seq.end()
            }
            Value::Object(o) => serializer.serialize_str(&o.render()),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Number(Number::Int(i)),
                None => Value::Number(Number::Float(n.as_f64().unwrap_or(f64::NAN))),
            },
            serde_json::Value::String(s) => Value::String(s.into()),
            serde_json::Value::Array(a) => Value::array(a.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(o) => Value::map(o.into_iter().map(|(k, v)| (SmolStr::from(k), Value::from(v))).collect()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into())
    }
}

impl From<SmolStr> for Value {
    fn from(s: SmolStr) -> Self {
        Value::String(s)
    }
}

impl From<Number> for Value {
    fn from(n: Number) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(Number::Int(n))
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(Number::Int(n as i64))
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(Number::Float(n))
    }
}

impl From<RangeValue> for Value {
    fn from(r: RangeValue) -> Self {
        Value::Range(r)
    }
}

impl From<Map> for Value {
    fn from(m: Map) -> Self {
        Value::map(m)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Value::array(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_default()
    }
}

impl<K: Into<SmolStr>, V: Into<Value>> FromIterator<(K, V)> for Value {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Value::map(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::null(Value::Null, true)]
    #[case::zero(Value::from(0), true)]
    #[case::zero_string(Value::from("0"), true)]
    #[case::empty_string(Value::from(""), true)]
    #[case::empty_array(Value::array(vec![]), true)]
    #[case::space(Value::from(" "), false)]
    #[case::float(Value::from(0.5), false)]
    #[case::array(Value::from(vec![1]), false)]
    fn test_is_empty(#[case] value: Value, #[case] expected: bool) {
        assert_eq!(value.is_empty(), expected);
    }

    #[rstest]
    #[case::numeric_string(Value::from("10"), Value::from(10), true)]
    #[case::float_string(Value::from("1.5"), Value::from(1.5), true)]
    #[case::text(Value::from("abc"), Value::from(0), false)]
    #[case::null_empty(Value::Null, Value::from(""), true)]
    #[case::bool(Value::TRUE, Value::from("yes"), true)]
    fn test_loose_eq(#[case] a: Value, #[case] b: Value, #[case] expected: bool) {
        assert_eq!(a.loose_eq(&b), expected);
    }

    #[test]
    fn test_strict_eq_distinguishes_types() {
        assert!(!Value::from("1").strict_eq(&Value::from(1)));
        assert!(!Value::from(1).strict_eq(&Value::from(1.0)));
        assert!(Value::from(1).strict_eq(&Value::from(1)));
    }

    #[rstest]
    #[case::ascending(RangeValue::new(1, 5, 1), vec![1, 2, 3, 4, 5])]
    #[case::descending(RangeValue::new(3, 0, 1), vec![3, 2, 1, 0])]
    #[case::stepped(RangeValue::new(0, 10, 4), vec![0, 4, 8])]
    #[case::single(RangeValue::new(2, 2, 1), vec![2])]
    fn test_range_iter(#[case] range: RangeValue, #[case] expected: Vec<i64>) {
        assert_eq!(range.iter().collect::<Vec<_>>(), expected);
        assert_eq!(range.len(), expected.len());
    }

    #[rstest]
    #[case::full_width(RangeValue::new(i64::MIN, i64::MAX, 1), usize::MAX, Some(i64::MIN + 1))]
    #[case::full_width_descending(RangeValue::new(i64::MAX, i64::MIN, 1), usize::MAX, Some(i64::MAX - 1))]
    #[case::huge_step(RangeValue::new(i64::MIN, i64::MAX, i64::MAX), 3, Some(-1))]
    fn test_range_extremes(#[case] range: RangeValue, #[case] len: usize, #[case] second: Option<i64>) {
        assert_eq!(range.len(), len);
        assert_eq!(range.get(1), second);
        assert_eq!(range.get(len), None);
    }

    #[rstest]
    #[case::array_index(Value::from(vec!["a", "b"]), Value::from(1), Some(Value::from("b")))]
    #[case::array_out_of_bounds(Value::from(vec!["a"]), Value::from(3), None)]
    #[case::map_key(Value::from_iter([("k", 1)]), Value::from("k"), Some(Value::from(1)))]
    #[case::range_index(Value::Range(RangeValue::new(5, 9, 1)), Value::from(2), Some(Value::from(7)))]
    fn test_get(#[case] value: Value, #[case] key: Value, #[case] expected: Option<Value>) {
        assert_eq!(value.get(&key), expected);
    }

    #[rstest]
    #[case::null(Value::Null, "")]
    #[case::truthy(Value::TRUE, "1")]
    #[case::array(Value::from(vec![1, 2]), "[1,2]")]
    #[case::map(Value::from_iter([("a", "b")]), r#"{"a":"b"}"#)]
    fn test_display(#[case] value: Value, #[case] expected: &str) {
        assert_eq!(value.to_string(), expected);
    }

    #[test]
    fn test_from_json_keeps_key_order() {
        let value = Value::from(serde_json::json!({"z": 1, "a": 2}));
        let keys = match value {
            Value::Map(m) => m.keys().cloned().collect::<Vec<_>>(),
            _ => vec![],
        };
        assert_eq!(keys, vec![SmolStr::new("z"), SmolStr::new("a")]);
    }
}
