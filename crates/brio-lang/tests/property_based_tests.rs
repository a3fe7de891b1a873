//! Property-based tests for rendering and tokenizing.
use brio_lang::{Context, Number, RangeValue, TokenKind, Value};
use proptest::prelude::*;

mod strategies {
    use super::*;

    /// Markup without any `{`, so no tag can open.
    pub fn html_text() -> impl Strategy<Value = String> {
        "[^{]{0,64}"
    }

    pub fn unsafe_text() -> impl Strategy<Value = String> {
        "[a-z<>&\" ]{0,32}"
    }

    pub fn ident() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,8}".prop_filter("Avoid keywords", |s| {
            !matches!(s.as_str(), "true" | "false" | "null" | "as" | "in" | "is" | "not" | "and" | "or")
        })
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

proptest! {
    #[test]
    fn literal_text_renders_unchanged(text in strategies::html_text()) {
        prop_assert_eq!(brio_lang::render_str(&text, &Context::new()).unwrap(), text);
    }

    #[test]
    fn literal_text_is_a_single_token(text in "[^{]{1,64}") {
        let tokens = brio_lang::tokenize(&text).unwrap();
        prop_assert_eq!(tokens.len(), 2);
        prop_assert_eq!(&tokens[0].kind, &TokenKind::Text(text.clone()));
        prop_assert_eq!(&tokens[1].kind, &TokenKind::Eof);
    }

    #[test]
    fn printed_variables_are_escaped(name in strategies::ident(), value in strategies::unsafe_text()) {
        let source = format!("[{{{{ {} }}}}]", name);
        let context = Context::new().with(&name, value.as_str());
        prop_assert_eq!(
            brio_lang::render_str(&source, &context).unwrap(),
            format!("[{}]", escape(&value))
        );
    }

    #[test]
    fn loop_renders_every_item(items in prop::collection::vec(0i64..1000, 0..16)) {
        let source = "{foreach items as item}{{ item }};{/foreach}";
        let expected = items.iter().map(|item| format!("{};", item)).collect::<String>();
        let context = Context::new().with("items", Value::from(items));
        prop_assert_eq!(brio_lang::render_str(source, &context).unwrap(), expected);
    }

    #[test]
    fn integer_arithmetic_never_panics(a in any::<i64>(), b in any::<i64>()) {
        let (x, y) = (Number::Int(a), Number::Int(b));
        let _ = (x.add(y), x.sub(y), x.mul(y));
        prop_assert_eq!(x.div(y).is_some(), b != 0);
        prop_assert_eq!(x.rem(y).is_some(), b != 0);
    }

    #[test]
    fn range_items_stay_between_endpoints(start in any::<i64>(), end in any::<i64>(), step in any::<i64>()) {
        let range = RangeValue::new(start, end, step);
        let (low, high) = (start.min(end), start.max(end));
        prop_assert_eq!(range.get(0), Some(start));
        for item in range.iter().take(64) {
            prop_assert!(low <= item && item <= high);
        }
        let last = range.get(range.len() - 1);
        prop_assert!(last.is_none_or(|item| low <= item && item <= high));
        prop_assert_eq!(range.get(range.len()), None);
    }
}
