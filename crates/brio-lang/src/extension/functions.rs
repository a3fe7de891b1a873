use std::sync::{Arc, LazyLock};

use chrono::{TimeZone, Utc};
use itertools::Itertools;

use super::{FunctionEntry, Registry, filters};
use crate::number::Number;
use crate::value::{RangeValue, Value};

pub static BUILTIN_FUNCTIONS: LazyLock<Registry<FunctionEntry>> = LazyLock::new(|| {
    let mut map = Registry::default();

    allowed(&mut map, "count", |args| Ok(Value::from(first(args).len().unwrap_or(0))));
    allowed(&mut map, "is_string", |args| Ok(matches!(first(args), Value::String(_)).into()));
    allowed(&mut map, "is_array", |args| {
        Ok(matches!(first(args), Value::Array(_) | Value::Map(_)).into())
    });
    allowed(&mut map, "is_numeric", |args| Ok(first(args).is_numeric().into()));
    allowed(&mut map, "is_int", |args| {
        Ok(matches!(first(args), Value::Number(Number::Int(_))).into())
    });
    allowed(&mut map, "is_double", |args| {
        Ok(matches!(first(args), Value::Number(Number::Float(_))).into())
    });
    allowed(&mut map, "is_object", |args| Ok(matches!(first(args), Value::Object(_)).into()));
    allowed(&mut map, "gettype", |args| Ok(first(args).type_name().into()));
    // Replaced by `Extensions::with_constant` once constants are registered.
    allowed(&mut map, "constant", |args| Err(format!("undefined constant `{}`", first(args))));
    allowed(&mut map, "strtotime", |args| {
        Ok(filters::parse_date(&first(args).to_string())
            .map(|date| Value::from(date.timestamp()))
            .unwrap_or(Value::FALSE))
    });
    allowed(&mut map, "json_encode", |args| {
        serde_json::to_string(first(args)).map(Value::from).map_err(|e| e.to_string())
    });
    allowed(&mut map, "json_decode", |args| {
        serde_json::from_str::<serde_json::Value>(&first(args).to_string())
            .map(Value::from)
            .map_err(|e| e.to_string())
    });
    allowed(&mut map, "strip_tags", |args| delegate("striptags", args));
    allowed(&mut map, "nl2br", |args| delegate("nl2br", args));
    allowed(&mut map, "explode", |args| match args {
        [delimiter, s, ..] => {
            let delimiter = delimiter.to_string();
            if delimiter.is_empty() {
                return Err("empty delimiter".to_string());
            }
            Ok(Value::array(s.to_string().split(delimiter.as_str()).map(Value::from).collect()))
        }
        _ => Err("expected a delimiter and a string".to_string()),
    });
    allowed(&mut map, "implode", |args| match args {
        [glue, values, ..] => Ok(values
            .values()
            .unwrap_or_default()
            .iter()
            .map(Value::to_string)
            .join(&glue.to_string())
            .into()),
        _ => Err("expected glue and an array".to_string()),
    });

    restricted(&mut map, "range", |args| {
        let [from, to, rest @ ..] = args else {
            return Err("expected a start and an end".to_string());
        };
        let from = from.to_number().ok_or("start is not a number")?.to_int();
        let to = to.to_number().ok_or("end is not a number")?.to_int();
        let step = rest.first().and_then(Value::to_number).map(Number::to_int).unwrap_or(1);
        Ok(RangeValue::new(from, to, step).into())
    });
    restricted(&mut map, "min", |args| {
        Ok(spread(args).into_iter().min_by(|a, b| a.compare(b)).unwrap_or_default())
    });
    restricted(&mut map, "max", |args| {
        Ok(spread(args).into_iter().max_by(|a, b| a.compare(b)).unwrap_or_default())
    });
    restricted(&mut map, "getenv", |args| Ok(std::env::var(first(args).to_string()).ok().into()));
    restricted(&mut map, "file_exists", |args| {
        Ok(std::path::Path::new(&first(args).to_string()).exists().into())
    });
    restricted(&mut map, "time", |_| Ok(Value::from(Utc::now().timestamp())));
    restricted(&mut map, "date", |args| {
        let format = args.first().map(Value::to_string).unwrap_or_else(|| "%Y-%m-%d".to_string());
        let date = match args.get(1) {
            Some(ts) => {
                let ts = ts.to_number().ok_or("timestamp is not a number")?.to_int();
                Utc.timestamp_opt(ts, 0).single().ok_or("timestamp out of range")?
            }
            None => Utc::now(),
        };
        Ok(date.format(&format).to_string().into())
    });

    map
});

fn allowed<F>(map: &mut Registry<FunctionEntry>, name: &str, function: F)
where
    F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
{
    map.insert(name, FunctionEntry {
        func: Arc::new(function),
        restricted: false,
    });
}

fn restricted<F>(map: &mut Registry<FunctionEntry>, name: &str, function: F)
where
    F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
{
    map.insert(name, FunctionEntry {
        func: Arc::new(function),
        restricted: true,
    });
}

fn first(args: &[Value]) -> &Value {
    args.first().unwrap_or(&Value::NULL)
}

fn delegate(filter: &str, args: &[Value]) -> Result<Value, String> {
    filters::apply(filter, first(args), &[]).unwrap_or_else(|| Err(format!("filter `{}` is not available", filter)))
}

/// `min(1, 2)` and `min([1, 2])` both look at the same values.
fn spread(args: &[Value]) -> Vec<Value> {
    match args {
        [single] if single.is_iterable() => single.values().unwrap_or_default(),
        args => args.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn call(name: &str, args: Vec<Value>) -> Result<Value, String> {
        let entry = BUILTIN_FUNCTIONS.resolve(name).unwrap();
        (entry.func)(&args)
    }

    #[rstest]
    #[case::count("count", vec![Value::from(vec![1, 2])], Value::from(2))]
    #[case::is_string("is_string", vec![Value::from("a")], Value::TRUE)]
    #[case::is_int("is_int", vec![Value::from(1.5)], Value::FALSE)]
    #[case::gettype("gettype", vec![Value::from(1.5)], Value::from("float"))]
    #[case::explode("explode", vec![Value::from(","), Value::from("a,b")], Value::from(vec!["a", "b"]))]
    #[case::implode("implode", vec![Value::from("-"), Value::from(vec![1, 2])], Value::from("1-2"))]
    #[case::json_decode("json_decode", vec![Value::from("[1,2]")], Value::from(vec![1, 2]))]
    #[case::strtotime("strtotime", vec![Value::from("1970-01-02")], Value::from(86400))]
    #[case::strtotime_invalid("strtotime", vec![Value::from("someday")], Value::FALSE)]
    #[case::min("min", vec![Value::from(3), Value::from(1)], Value::from(1))]
    #[case::max_array("max", vec![Value::from(vec![3, 7, 1])], Value::from(7))]
    #[case::range("range", vec![Value::from(1), Value::from(3)], Value::from(RangeValue::new(1, 3, 1)))]
    #[case::date("date", vec![Value::from("%Y-%m-%d"), Value::from(0)], Value::from("1970-01-01"))]
    fn test_functions(#[case] name: &str, #[case] args: Vec<Value>, #[case] expected: Value) {
        assert_eq!(call(name, args).unwrap(), expected);
    }

    #[test]
    fn test_restricted_split() {
        for name in ["range", "min", "max", "getenv", "file_exists", "time", "date"] {
            assert!(BUILTIN_FUNCTIONS.resolve(name).unwrap().restricted, "{}", name);
        }
        for name in ["count", "is_string", "json_encode", "explode", "implode", "constant"] {
            assert!(!BUILTIN_FUNCTIONS.resolve(name).unwrap().restricted, "{}", name);
        }
    }

    #[test]
    fn test_explode_rejects_empty_delimiter() {
        assert!(call("explode", vec![Value::from(""), Value::from("abc")]).is_err());
    }
}
