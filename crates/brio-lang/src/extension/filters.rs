use std::sync::{Arc, LazyLock, Mutex};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use itertools::Itertools;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use regex_lite::Regex;
use rustc_hash::FxHashMap;

use super::{Extension, FilterEntry, Registry};
use crate::compiler::CompilationSession;
use crate::compiler::error::CompileError;
use crate::ir::{Expr, InMode, builder};
use crate::number::Number;
use crate::value::{Map, RangeValue, Value};

static REGEX_CACHE: LazyLock<Mutex<FxHashMap<String, Regex>>> = LazyLock::new(|| Mutex::new(FxHashMap::default()));

/// Characters left alone by `urlencode` and `escape:'url'`.
const URL_UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub static BUILTIN_FILTERS: LazyLock<Registry<FilterEntry>> = LazyLock::new(|| {
    let mut map = Registry::default();

    alias(&mut map, &["upper", "up"], false, |value, _| Ok(value.to_string().to_uppercase().into()));
    alias(&mut map, &["lower", "low"], false, |value, _| Ok(value.to_string().to_lowercase().into()));
    alias(&mut map, &["capitalize"], false, |value, _| {
        let s = value.to_string().to_lowercase();
        Ok(upper_first(&s).into())
    });
    alias(&mut map, &["capfirst"], false, |value, _| Ok(upper_first(&value.to_string()).into()));
    alias(&mut map, &["title"], false, |value, _| {
        Ok(value
            .to_string()
            .split(' ')
            .map(|word| upper_first(&word.to_lowercase()))
            .join(" ")
            .into())
    });
    alias(&mut map, &["trim"], false, |value, args| {
        let s = value.to_string();
        Ok(match args {
            [chars, ..] => {
                let chars = chars.to_string();
                s.trim_matches(|c| chars.contains(c)).into()
            }
            [] => s.trim().into(),
        })
    });
    alias(&mut map, &["strip"], false, |value, _| {
        Ok(value.to_string().split_whitespace().join(" ").into())
    });
    alias(&mut map, &["length", "count"], false, |value, _| {
        Ok(Value::from(value.len().unwrap_or(0)))
    });
    alias(&mut map, &["truncate"], false, |value, args| {
        let length = usize_arg(args, 0).unwrap_or(80);
        let etc = str_arg(args, 1).unwrap_or_else(|| "...".to_string());
        let by_words = args.get(2).is_some_and(Value::is_true);
        let middle = args.get(3).is_some_and(Value::is_true);
        Ok(truncate(&value.to_string(), length, &etc, by_words, middle).into())
    });
    alias(&mut map, &["truncatechars"], false, |value, args| {
        let length = usize_arg(args, 0).ok_or("expected a length")?;
        let s = value.to_string();
        if s.chars().count() <= length {
            return Ok(s.into());
        }
        let kept = s.chars().take(length.saturating_sub(1)).collect::<String>();
        Ok(format!("{}…", kept).into())
    });
    alias(&mut map, &["truncatewords"], false, |value, args| {
        let length = usize_arg(args, 0).ok_or("expected a word count")?;
        let s = value.to_string();
        let words = s.split_whitespace().collect::<Vec<_>>();
        if words.len() <= length {
            return Ok(s.into());
        }
        Ok(format!("{} …", words[..length].join(" ")).into())
    });
    alias(&mut map, &["escape", "e"], true, |value, args| {
        let s = value.to_string();
        match str_arg(args, 0).as_deref().unwrap_or("html") {
            "html" => Ok(escape_html(&s).into()),
            "url" => Ok(utf8_percent_encode(&s, URL_UNRESERVED).to_string().into()),
            "js" => Ok(escape_js(&s).into()),
            mode => Err(format!("unknown escape mode `{}`", mode)),
        }
    });
    alias(&mut map, &["unescape"], false, |value, args| {
        let s = value.to_string();
        match str_arg(args, 0).as_deref().unwrap_or("html") {
            "html" => Ok(unescape_html(&s).into()),
            "url" => percent_encoding::percent_decode_str(&s)
                .decode_utf8()
                .map(|s| Value::from(s.to_string()))
                .map_err(|e| e.to_string()),
            mode => Err(format!("unknown escape mode `{}`", mode)),
        }
    });
    alias(&mut map, &["safe", "raw"], true, |value, _| Ok(value.clone()));
    alias(&mut map, &["replace"], false, |value, args| match args {
        [search, replace, ..] => Ok(value.to_string().replace(&search.to_string(), &replace.to_string()).into()),
        _ => Err("expected a search string and a replacement".to_string()),
    });
    alias(&mut map, &["ereplace"], false, |value, args| match args {
        [pattern, replace, ..] => {
            with_regex(&pattern.to_string(), |re| re.replace_all(&value.to_string(), replace.to_string().as_str()).into_owned())
                .map(Value::from)
        }
        _ => Err("expected a pattern and a replacement".to_string()),
    });
    alias(&mut map, &["match"], false, |value, args| {
        let pattern = str_arg(args, 0).ok_or("expected a glob pattern")?;
        glob::Pattern::new(&pattern)
            .map(|p| Value::Bool(p.matches(&value.to_string())))
            .map_err(|e| e.to_string())
    });
    alias(&mut map, &["ematch"], false, |value, args| {
        let pattern = str_arg(args, 0).ok_or("expected a pattern")?;
        with_regex(&pattern, |re| re.is_match(&value.to_string())).map(Value::Bool)
    });
    alias(&mut map, &["split"], false, |value, args| match value {
        Value::Array(_) => Ok(value.clone()),
        value => {
            let delimiter = str_arg(args, 0).unwrap_or_else(|| ",".to_string());
            let s = value.to_string();
            if s.is_empty() {
                return Ok(Value::array(Vec::new()));
            }
            Ok(Value::array(s.split(delimiter.as_str()).map(Value::from).collect()))
        }
    });
    alias(&mut map, &["esplit"], false, |value, args| match value {
        Value::Array(_) => Ok(value.clone()),
        value => {
            let pattern = str_arg(args, 0).unwrap_or_else(|| r"\s*,\s*".to_string());
            let s = value.to_string();
            with_regex(&pattern, |re| Value::array(re.split(&s).map(Value::from).collect()))
        }
    });
    alias(&mut map, &["join"], false, |value, args| {
        let glue = str_arg(args, 0).unwrap_or_else(|| ", ".to_string());
        match value.values() {
            Some(values) => Ok(values.iter().map(Value::to_string).join(&glue).into()),
            None => Ok(value.to_string().into()),
        }
    });
    alias(&mut map, &["range"], false, |value, args| {
        let from = value.to_number().ok_or("expected a number")?.to_int();
        let to = args.first().and_then(Value::to_number).ok_or("expected an end value")?.to_int();
        let step = args.get(1).and_then(Value::to_number).map(Number::to_int).unwrap_or(1);
        Ok(RangeValue::new(from, to, step).into())
    });
    alias(&mut map, &["date_format", "date"], false, |value, args| {
        let format = str_arg(args, 0).unwrap_or_else(|| DEFAULT_DATE_FORMAT.to_string());
        let date = to_datetime(value).ok_or_else(|| format!("`{}` is not a date", value))?;
        Ok(date.format(&format).to_string().into())
    });
    generator(&mut map, &["default"], false, |_, base, mut args| {
        let fallback = if args.is_empty() { builder::string("") } else { args.remove(0) };
        Ok(builder::elvis(base, fallback))
    });
    generator(&mut map, &["in"], false, |session, needle, mut args| {
        if args.is_empty() {
            return Err(session.invalid_usage("Filter 'in' expects a haystack"));
        }
        Ok(Expr::In {
            needle: Box::new(needle),
            haystack: Box::new(args.remove(0)),
            mode: InMode::Auto,
        })
    });
    alias(&mut map, &["cut"], false, |value, args| {
        let needle = str_arg(args, 0).unwrap_or_else(|| " ".to_string());
        Ok(value.to_string().replace(&needle, "").into())
    });
    alias(&mut map, &["pluralize"], false, |value, args| {
        let spec = str_arg(args, 0).unwrap_or_else(|| "s".to_string());
        let (singular, plural) = match spec.split_once(',') {
            Some((singular, plural)) => (singular.to_string(), plural.to_string()),
            None => (String::new(), spec),
        };
        let count = match value {
            Value::Array(_) | Value::Map(_) => Number::from(value.len().unwrap_or(0)),
            value => value.to_number().unwrap_or_default(),
        };
        Ok(Value::from(if count == Number::Int(1) { singular } else { plural }))
    });
    alias(&mut map, &["slugify"], false, |value, _| Ok(slugify(&value.to_string()).into()));
    alias(&mut map, &["urlencode"], false, |value, _| {
        Ok(utf8_percent_encode(&value.to_string(), URL_UNRESERVED).to_string().into())
    });
    alias(&mut map, &["linebreaksbr", "nl2br"], true, |value, _| {
        Ok(escape_html(&value.to_string()).replace("\r\n", "\n").replace('\n', "<br />\n").into())
    });
    alias(&mut map, &["striptags"], false, |value, _| {
        with_regex("<[^>]*>", |re| re.replace_all(&value.to_string(), "").into_owned()).map(Value::from)
    });
    alias(&mut map, &["reverse"], false, |value, _| match value {
        Value::String(s) => Ok(s.chars().rev().collect::<String>().into()),
        value => match value.values() {
            Some(values) => Ok(Value::array(values.into_iter().rev().collect())),
            None => Ok(value.clone()),
        },
    });
    alias(&mut map, &["first"], false, |value, _| match value {
        Value::String(s) => Ok(s.chars().next().map(|c| c.to_string()).into()),
        value => Ok(value.values().and_then(|values| values.into_iter().next()).into()),
    });
    alias(&mut map, &["last"], false, |value, _| match value {
        Value::String(s) => Ok(s.chars().last().map(|c| c.to_string()).into()),
        value => Ok(value.values().and_then(|values| values.into_iter().last()).into()),
    });
    alias(&mut map, &["keys"], false, |value, _| match value.entries() {
        Some(entries) => Ok(Value::array(entries.into_iter().map(|(k, _)| k).collect())),
        None => Ok(Value::array(Vec::new())),
    });
    alias(&mut map, &["sort"], false, |value, _| match value.values() {
        Some(values) => Ok(Value::array(values.into_iter().sorted_by(|a, b| a.compare(b)).collect())),
        None => Ok(value.clone()),
    });
    alias(&mut map, &["dictsort"], false, |value, args| match (value, args.first()) {
        (Value::Map(map), None) => Ok(Value::map(
            map.iter()
                .sorted_by(|(a, _), (b, _)| a.cmp(b))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Map>(),
        )),
        (value, Some(key)) => match value.values() {
            Some(values) => Ok(Value::array(
                values
                    .into_iter()
                    .sorted_by(|a, b| {
                        let a = a.get(key).unwrap_or_default();
                        let b = b.get(key).unwrap_or_default();
                        a.compare(&b)
                    })
                    .collect(),
            )),
            None => Ok(value.clone()),
        },
        (value, None) => Ok(value.clone()),
    });
    alias(&mut map, &["json_encode", "json"], true, |value, _| {
        serde_json::to_string(value).map(Value::from).map_err(|e| e.to_string())
    });
    alias(&mut map, &["abs"], false, |value, _| {
        value
            .to_number()
            .map(|n| Value::Number(n.abs()))
            .ok_or_else(|| format!("`{}` is not a number", value.type_name()))
    });
    alias(&mut map, &["round"], false, |value, args| {
        let precision = args.first().and_then(Value::to_number).map(Number::to_int).unwrap_or(0);
        value
            .to_number()
            .map(|n| Value::Number(n.round(precision as i32)))
            .ok_or_else(|| format!("`{}` is not a number", value.type_name()))
    });
    alias(&mut map, &["substr"], false, |value, args| {
        let s = value.to_string();
        let count = s.chars().count() as i64;
        let start = args.first().and_then(Value::to_number).map(Number::to_int).unwrap_or(0);
        let start = if start < 0 { (count + start).max(0) } else { start.min(count) } as usize;
        let taken = match args.get(1).and_then(Value::to_number).map(Number::to_int) {
            Some(length) if length < 0 => (count - start as i64 + length).max(0) as usize,
            Some(length) => length as usize,
            None => usize::MAX,
        };
        Ok(s.chars().skip(start).take(taken).collect::<String>().into())
    });
    alias(&mut map, &["hostname"], false, |value, _| {
        Ok(url::Url::parse(&value.to_string())
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .into())
    });
    alias(&mut map, &["iterable"], false, |value, _| Ok(Value::Bool(value.is_iterable())));

    map
});

fn alias<F>(map: &mut Registry<FilterEntry>, names: &[&str], safe: bool, filter: F)
where
    F: Fn(&Value, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
{
    let filter: super::FilterFn = Arc::new(filter);
    for name in names {
        map.insert(*name, FilterEntry {
            kind: Extension::Alias(Arc::clone(&filter)),
            safe,
        });
    }
}

fn generator(
    map: &mut Registry<FilterEntry>,
    names: &[&str],
    safe: bool,
    generator: fn(&mut CompilationSession<'_>, Expr, Vec<Expr>) -> Result<Expr, CompileError>,
) {
    for name in names {
        map.insert(*name, FilterEntry {
            kind: Extension::Generator(generator),
            safe,
        });
    }
}

fn str_arg(args: &[Value], index: usize) -> Option<String> {
    args.get(index).map(Value::to_string)
}

fn usize_arg(args: &[Value], index: usize) -> Option<usize> {
    args.get(index)
        .and_then(Value::to_number)
        .map(|n| n.to_int().max(0) as usize)
}

fn with_regex<T>(pattern: &str, f: impl FnOnce(&Regex) -> T) -> Result<T, String> {
    let mut cache = REGEX_CACHE.lock().map_err(|e| e.to_string())?;
    if let Some(re) = cache.get(pattern) {
        return Ok(f(re));
    }
    let re = Regex::new(pattern).map_err(|e| format!("invalid regular expression `{}`: {}", pattern, e))?;
    let result = f(&re);
    cache.insert(pattern.to_string(), re);
    Ok(result)
}

fn upper_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Escapes `&`, `<`, `>` and `"` for HTML output.
pub fn escape_html(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn unescape_html(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn escape_js(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\'' => escaped.push_str("\\'"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '<' | '>' | '&' => escaped.push_str(&format!("\\u{:04x}", c as u32)),
            c => escaped.push(c),
        }
    }
    escaped
}

fn truncate(s: &str, length: usize, etc: &str, by_words: bool, middle: bool) -> String {
    let count = s.chars().count();
    if count <= length {
        return s.to_string();
    }

    if middle {
        let head = s.chars().take(length / 2).collect::<String>();
        let tail = s.chars().skip(count - length / 2).collect::<String>();
        return format!("{}{}{}", head, etc, tail);
    }

    let mut kept = s.chars().take(length + 1).collect::<String>();
    if by_words {
        match kept.rfind(char::is_whitespace) {
            Some(end) => kept.truncate(end),
            None => kept = kept.chars().take(length).collect(),
        }
        kept.truncate(kept.trim_end().len());
    } else {
        kept = kept.chars().take(length).collect();
    }
    format!("{}{}", kept, etc)
}

fn slugify(s: &str) -> String {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .join("-")
}

fn to_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => Utc.timestamp_opt(n.to_int(), 0).single(),
        Value::String(s) => parse_date(s),
        _ => None,
    }
}

/// Accepts unix timestamps, RFC 3339 and the common `Y-m-d[ H:M:S]` forms.
pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = s.parse::<i64>() {
        return Utc.timestamp_opt(ts, 0).single();
    }
    if s.eq_ignore_ascii_case("now") {
        return Some(Utc::now());
    }
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(s, DEFAULT_DATE_FORMAT).ok().map(|d| d.and_utc()))
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|d| d.and_utc())
        })
}

/// Applies a built-in alias filter by name.
pub fn apply(name: &str, value: &Value, args: &[Value]) -> Option<Result<Value, String>> {
    match &BUILTIN_FILTERS.resolve(name)?.kind {
        Extension::Alias(filter) => Some(filter(value, args)),
        Extension::Generator(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn run(name: &str, value: Value, args: Vec<Value>) -> Value {
        apply(name, &value, &args).unwrap().unwrap()
    }

    #[rstest]
    #[case::upper("upper", "hello", vec![], "HELLO")]
    #[case::capitalize("capitalize", "hELLO", vec![], "Hello")]
    #[case::capfirst("capfirst", "hELLO", vec![], "HELLO")]
    #[case::title("title", "the quick fox", vec![], "The Quick Fox")]
    #[case::truncate("truncate", "HELLO WORLD", vec![Value::from(5)], "HELLO...")]
    #[case::truncate_short("truncate", "hi", vec![Value::from(5)], "hi")]
    #[case::truncate_words("truncate", "hello big world", vec![Value::from(8), Value::from("…"), Value::TRUE], "hello…")]
    #[case::truncate_middle("truncate", "abcdefghij", vec![Value::from(4), Value::from(".."), Value::FALSE, Value::TRUE], "ab..ij")]
    #[case::truncatechars("truncatechars", "abcdef", vec![Value::from(4)], "abc…")]
    #[case::truncatewords("truncatewords", "a b c d", vec![Value::from(2)], "a b …")]
    #[case::escape("escape", "<a href=\"x\">&</a>", vec![], "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;")]
    #[case::escape_url("escape", "a b/c", vec![Value::from("url")], "a%20b%2Fc")]
    #[case::escape_js("escape", "it's\n", vec![Value::from("js")], "it\\'s\\n")]
    #[case::unescape("unescape", "&lt;b&gt;", vec![], "<b>")]
    #[case::replace("replace", "a-b-c", vec![Value::from("-"), Value::from("+")], "a+b+c")]
    #[case::ereplace("ereplace", "a1b22", vec![Value::from("[0-9]+"), Value::from("#")], "a#b#")]
    #[case::cut("cut", "a b c", vec![], "abc")]
    #[case::slugify("slugify", "Hello, World!", vec![], "hello-world")]
    #[case::urlencode("urlencode", "a&b=c d", vec![], "a%26b%3Dc%20d")]
    #[case::nl2br("nl2br", "a\n<b>", vec![], "a<br />\n&lt;b&gt;")]
    #[case::striptags("striptags", "<p>hi <b>there</b></p>", vec![], "hi there")]
    #[case::reverse("reverse", "abc", vec![], "cba")]
    #[case::substr("substr", "hello", vec![Value::from(1), Value::from(3)], "ell")]
    #[case::substr_negative("substr", "hello", vec![Value::from(-3)], "llo")]
    #[case::hostname("hostname", "https://example.com/path", vec![], "example.com")]
    #[case::date("date", "2024-03-01 10:20:30", vec![Value::from("%d.%m.%Y")], "01.03.2024")]
    #[case::date_timestamp("date_format", "0", vec![Value::from("%Y")], "1970")]
    #[case::pluralize_one("pluralize", "1", vec![], "")]
    #[case::pluralize_many("pluralize", "2", vec![Value::from("y,ies")], "ies")]
    fn test_string_filters(#[case] name: &str, #[case] value: &str, #[case] args: Vec<Value>, #[case] expected: &str) {
        assert_eq!(run(name, Value::from(value), args).to_string(), expected);
    }

    #[rstest]
    #[case::split_join("split", Value::from("a,b"), vec![], Value::from(vec!["a", "b"]))]
    #[case::esplit("esplit", Value::from("a , b,c"), vec![], Value::from(vec!["a", "b", "c"]))]
    #[case::join("join", Value::from(vec!["a", "b"]), vec![Value::from("-")], Value::from("a-b"))]
    #[case::length_array("length", Value::from(vec![1, 2, 3]), vec![], Value::from(3))]
    #[case::length_string("count", Value::from("héllo"), vec![], Value::from(5))]
    #[case::first("first", Value::from(vec![1, 2]), vec![], Value::from(1))]
    #[case::last("last", Value::from(vec![1, 2]), vec![], Value::from(2))]
    #[case::sort("sort", Value::from(vec![3, 1, 2]), vec![], Value::from(vec![1, 2, 3]))]
    #[case::keys("keys", [("a", 1), ("b", 2)].into_iter().collect::<Value>(), vec![], Value::from(vec!["a", "b"]))]
    #[case::abs("abs", Value::from(-4), vec![], Value::from(4))]
    #[case::round("round", Value::from(2.346), vec![Value::from(2)], Value::from(2.35))]
    #[case::range("range", Value::from(1), vec![Value::from(3)], Value::from(RangeValue::new(1, 3, 1)))]
    #[case::match_glob("match", Value::from("photo.jpg"), vec![Value::from("*.jpg")], Value::TRUE)]
    #[case::ematch("ematch", Value::from("abc123"), vec![Value::from("^[a-z]+[0-9]+$")], Value::TRUE)]
    #[case::json("json_encode", Value::from(vec!["<a>"]), vec![], Value::from(r#"["<a>"]"#))]
    #[case::iterable("iterable", Value::from("abc"), vec![], Value::FALSE)]
    fn test_value_filters(#[case] name: &str, #[case] value: Value, #[case] args: Vec<Value>, #[case] expected: Value) {
        assert_eq!(run(name, value, args), expected);
    }

    #[test]
    fn test_dictsort_by_key() {
        let rows = Value::from(vec![
            [("n", 2)].into_iter().collect::<Value>(),
            [("n", 1)].into_iter().collect::<Value>(),
        ]);
        let sorted = run("dictsort", rows, vec![Value::from("n")]);
        assert_eq!(sorted.to_string(), r#"[{"n":1},{"n":2}]"#);
    }

    #[test]
    fn test_invalid_regex_is_an_error() {
        assert!(apply("ematch", &Value::from("x"), &[Value::from("(")]).unwrap().is_err());
    }

    #[test]
    fn test_safe_flags() {
        for (name, safe) in [("escape", true), ("e", true), ("raw", true), ("json", true), ("upper", false)] {
            assert_eq!(BUILTIN_FILTERS.resolve(name).map(|f| f.safe), Some(safe), "{}", name);
        }
    }
}
