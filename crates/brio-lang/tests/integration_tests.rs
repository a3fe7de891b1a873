use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use brio_lang::{
    CompilerConfig, Context, Engine, FsArtifactStore, FsSource, MemorySource, Options, Persistence, Value,
};
use rstest::{fixture, rstest};

#[fixture]
fn engine() -> Engine<MemorySource> {
    let sources = MemorySource::default()
        .with("layout", "<title>{block title}Site{/block}</title><main>{block content}{/block}</main>")
        .with(
            "page",
            "{extends 'layout'}{block title}{{ title }} | {parent}{/block}{block content}{{ body }}{/block}",
        )
        .with("dynamic", "{extends parent}{block content}dyn:{parent}{/block}")
        .with("alt", "<alt>{block content}alt{/block}</alt>")
        .with("row", "<li>{{ item }}</li>")
        .with("list", "<ul>{foreach items as item}{include 'row' item=item}{/foreach}</ul>")
        .with("macros", "{macro badge(text, kind='info')}<b class=\"{{ kind }}\">{{ text }}</b>{/macro}")
        .with("uses_macros", "{import 'macros' as ui}{{ ui.badge('new') }}")
        .with("fetch", "[{{ $.fetch('row', ['item' => 'x']) }}]");
    Engine::new(CompilerConfig::default(), sources)
}

#[rstest]
#[case::literal_text("<p>plain <b>html</b></p>", Context::new(), "<p>plain <b>html</b></p>")]
#[case::escaping(
    "{{ v }}",
    Context::new().with("v", "<a href=\"x\">&</a>"),
    "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;"
)]
#[case::autoescape_off("{autoescape false}{{ v }}{/autoescape}", Context::new().with("v", "<b>"), "<b>")]
#[case::raw_tag("{raw v}", Context::new().with("v", "<b>"), "<b>")]
#[case::loop_index(
    "{foreach items as item}{if @first}{else},{/if}{@index}{/foreach}",
    Context::new().with("items", vec![10, 20, 30]),
    "0,1,2"
)]
#[case::loop_first_last(
    "{foreach items as item}{if @first}[{/if}{{ item }}{if @last}]{/if}{/foreach}",
    Context::new().with("items", vec![10, 20, 30]),
    "[102030]"
)]
#[case::loop_empty_branch(
    "{foreach items as item}x{foreachelse}empty{/foreach}",
    Context::new().with("items", Vec::<i64>::new()),
    "empty"
)]
#[case::loop_not_empty(
    "{foreach items as item}x{foreachelse}empty{/foreach}",
    Context::new().with("items", vec![1]),
    "x"
)]
#[case::key_value_loop(
    "{foreach user as k => v}{{ k }}={{ v }};{/foreach}",
    Context::new().with("user", Value::from_iter([("a", 1), ("b", 2)])),
    "a=1;b=2;"
)]
#[case::conditional_yes(
    "{if user.active}Yes{else}No{/if}",
    Context::new().with("user", Value::from_iter([("active", true)])),
    "Yes"
)]
#[case::conditional_no(
    "{if user.active}Yes{else}No{/if}",
    Context::new().with("user", Value::from_iter([("active", false)])),
    "No"
)]
#[case::filter_chain("{{ name|upper|truncate:5 }}", Context::new().with("name", "hello world"), "HELLO...")]
#[case::macro_default("{macro greet(name=\"World\")}Hello {{name}}!{/macro}{{ greet() }}", Context::new(), "Hello World!")]
#[case::macro_named_arg(
    "{macro greet(name=\"World\")}Hello {{name}}!{/macro}{{ greet(name=\"Sam\") }}",
    Context::new(),
    "Hello Sam!"
)]
#[case::recursive_macro(
    "{macro down(n)}{{ n }}{if n > 0}{{ down(n - 1) }}{/if}{/macro}{{ down(3) }}",
    Context::new(),
    "3210"
)]
#[case::set_and_print("{set total = price * 2}{{ total }}", Context::new().with("price", 21), "42")]
#[case::elvis("{{ missing ?: 'fallback' }}", Context::new(), "fallback")]
#[case::range_loop("{for i in 1..3}{{ i }}{/for}", Context::new(), "123")]
#[case::switch_case(
    "{switch n}{case 1}one{case 2, 3}few{default}many{/switch}",
    Context::new().with("n", 3),
    "few"
)]
#[case::cycle(
    "{foreach items as item}{cycle 'odd', 'even'} {/foreach}",
    Context::new().with("items", vec![1, 2, 3]),
    "odd even odd "
)]
#[case::filter_block("{filter|upper}shout {{ who }}{/filter}", Context::new().with("who", "me"), "SHOUT ME")]
#[case::while_with_break(
    "{set i = 0}{while true}{set i = i + 1}{if i > 3}{break}{/if}{{ i }}{/while}",
    Context::new(),
    "123"
)]
#[case::loop_reassignment_escapes_earlier_print(
    "{set x = 'a'}{foreach items as i}{{ x }}|{set x = i}{/foreach}",
    Context::new().with("items", vec!["<b>", "<i>"]),
    "a|&lt;b&gt;|"
)]
#[case::while_reassignment_escapes_earlier_print(
    "{set x = 'a'}{set n = 0}{while n < 2}{{ x }}|{set x = items[n]}{set n = n + 1}{/while}",
    Context::new().with("items", vec!["<b>", "<i>"]),
    "a|&lt;b&gt;|"
)]
#[case::capture_through_unescape_stays_escaped(
    "{set y|unescape}{{ v }}{/set}{{ y }}",
    Context::new().with("v", "<script>"),
    "&lt;script&gt;"
)]
#[case::filter_called_as_function("[{{ default(missing, 'fb') }}]", Context::new(), "[fb]")]
#[case::full_width_range(
    "{for i in lo..hi}{{ i }},{if @index == 1}{break}{/if}{/for}",
    Context::new().with("lo", i64::MIN).with("hi", i64::MAX),
    "-9223372036854775808,-9223372036854775807,"
)]
#[case::elif_shorthand("{if a}x{elif b}y{/if}", Context::new().with("a", false).with("b", true), "y")]
fn test_render(#[case] source: &str, #[case] context: Context, #[case] expected: &str) {
    assert_eq!(brio_lang::render_str(source, &context).unwrap(), expected);
}

#[rstest]
#[case::min_by_minus_one("{{ (-9223372036854775807 - 1) / -1 }}")]
#[case::min_mod_minus_one("{{ (-9223372036854775807 - 1) % -1 }}")]
#[case::by_zero("{{ 1 / 0 }}")]
fn test_integer_overflow_does_not_panic(#[case] source: &str) {
    let _ = brio_lang::render_str(source, &Context::new());
}

#[test]
fn test_unclosed_tag_names_tag_and_line() {
    let err = brio_lang::render_str("<p>\n{if true}\nx", &Context::new()).unwrap_err();
    assert_eq!(err.code(), "SyntaxError::UnclosedTag");
    assert!(err.to_string().contains("{if}"), "{}", err);
    assert!(err.to_string().contains("line 2"), "{}", err);
}

#[test]
fn test_mismatched_close() {
    let err = brio_lang::render_str("{if a}\n{foreach xs as x}{/if}", &Context::new()).unwrap_err();
    assert_eq!(err.code(), "SyntaxError::MismatchedClose");
    assert_eq!(
        err.to_string(),
        "Unexpected closing of the tag 'if' (expecting closing of the tag foreach, opened on line 2)"
    );
}

#[rstest]
fn test_static_inheritance(engine: Engine<MemorySource>) {
    let context = Context::new().with("title", "Home").with("body", "<hi>");
    assert_eq!(
        engine.render("page", &context).unwrap(),
        "<title>Home | Site</title><main>&lt;hi&gt;</main>"
    );
}

#[rstest]
#[case::layout("layout", "<title>Site</title><main>dyn:</main>")]
#[case::alt("alt", "<alt>dyn:alt</alt>")]
fn test_dynamic_inheritance(engine: Engine<MemorySource>, #[case] parent: &str, #[case] expected: &str) {
    let context = Context::new().with("parent", parent);
    assert_eq!(engine.render("dynamic", &context).unwrap(), expected);
}

#[rstest]
fn test_include_per_item(engine: Engine<MemorySource>) {
    let context = Context::new().with("items", vec!["a", "<b>"]);
    assert_eq!(
        engine.render("list", &context).unwrap(),
        "<ul><li>a</li><li>&lt;b&gt;</li></ul>"
    );
}

#[rstest]
fn test_imported_macro(engine: Engine<MemorySource>) {
    assert_eq!(
        engine.render("uses_macros", &Context::new()).unwrap(),
        "<b class=\"info\">new</b>"
    );
}

#[rstest]
fn test_fetch_renders_other_template(engine: Engine<MemorySource>) {
    assert_eq!(engine.render("fetch", &Context::new()).unwrap(), "[<li>x</li>]");
}

#[rstest]
fn test_missing_include_fails_at_render(engine: Engine<MemorySource>) {
    engine.sources().insert("broken", "{include name}");
    let err = engine
        .render("broken", &Context::new().with("name", "nowhere"))
        .unwrap_err();
    assert_eq!(err.code(), "CompileError::MissingTemplate");
}

#[test]
fn test_force_verify_rejects_undefined_variable() {
    let engine = Engine::new(
        CompilerConfig::default().with_options(Options::AUTO_ESCAPE | Options::FORCE_VERIFY),
        MemorySource::default()
            .with("strict", "{{ missing }}")
            .with("guarded", "{if missing is set}x{else}y{/if}"),
    );
    let err = engine.render("strict", &Context::new()).unwrap_err();
    assert_eq!(err.code(), "RuntimeError::UndefinedVariable");
    assert_eq!(engine.render("guarded", &Context::new()).unwrap(), "y");
}

#[test]
fn test_idempotent_recompilation() {
    let source = "{foreach xs as x}{{ x|upper }}{if !@last}, {/if}{/foreach}";
    let config = CompilerConfig::default();
    let first = brio_lang::compile_source(&config, &MemorySource::default(), "t", source).unwrap();
    let second = brio_lang::compile_source(&config, &MemorySource::default(), "t", source).unwrap();
    assert_eq!(first, second);
}

fn write_template(dir: &Path, name: &str, source: &str, mtime: SystemTime) {
    let path = dir.join(name);
    fs::write(&path, source).unwrap();
    fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(mtime)
        .unwrap();
}

#[test]
fn test_cache_invalidation_on_dependency_change() {
    let templates = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);

    write_template(templates.path(), "base.tpl", "[{block main}base{/block}]", start);
    write_template(templates.path(), "child.tpl", "{extends 'base'}{block main}child{/block}", start);

    let new_engine = || {
        Engine::new(CompilerConfig::default(), FsSource::new(templates.path(), "tpl"))
            .with_store(FsArtifactStore::new(cache.path()))
    };

    let first = new_engine().get_template("child").unwrap();
    assert_eq!(first.persistence(), Persistence::Persisted);
    assert_eq!(first.dependencies().len(), 2);
    assert_eq!(first.render(&Context::new()).unwrap(), "[child]");

    // A second engine reuses the artifact while nothing changed.
    let cached = new_engine().get_template("child").unwrap();
    assert_eq!(cached.render(&Context::new()).unwrap(), "[child]");

    // Touching the parent invalidates the child.
    write_template(
        templates.path(),
        "base.tpl",
        "<{block main}base{/block}>",
        start + Duration::from_secs(60),
    );
    assert!(!cached.verify(&FsSource::new(templates.path(), "tpl")));
    let recompiled = new_engine().get_template("child").unwrap();
    assert_eq!(recompiled.render(&Context::new()).unwrap(), "<child>");
}

#[test]
fn test_options_get_separate_cache_entries() {
    let cache = tempfile::tempdir().unwrap();
    let engine = Engine::new(CompilerConfig::default(), MemorySource::default().with("t", "{{ v }}"))
        .with_store(FsArtifactStore::new(cache.path()));
    let context = Context::new().with("v", "<b>");

    let escaped = engine.get_template_with("t", Options::AUTO_ESCAPE).unwrap();
    let raw = engine.get_template_with("t", Options::NONE).unwrap();
    assert_eq!(escaped.render(&context).unwrap(), "&lt;b&gt;");
    assert_eq!(raw.render(&context).unwrap(), "<b>");
    let artifacts = fs::read_dir(cache.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .count();
    assert_eq!(artifacts, 2);
}

#[test]
fn test_disable_cache_never_writes() {
    let cache = tempfile::tempdir().unwrap();
    let engine = Engine::new(
        CompilerConfig::default().with_options(Options::AUTO_ESCAPE | Options::DISABLE_CACHE),
        MemorySource::default().with("t", "x"),
    )
    .with_store(FsArtifactStore::new(cache.path()));

    assert_eq!(engine.get_template("t").unwrap().persistence(), Persistence::Disabled);
    assert_eq!(fs::read_dir(cache.path()).unwrap().count(), 0);
}

#[test]
fn test_engine_from_config() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("views")).unwrap();
    fs::write(dir.path().join("views/hello.html"), "Hello {{ name }}").unwrap();
    let config = brio_lang::Config::from_toml_str(&format!(
        "templates = {:?}\nextension = \"html\"\ncache_dir = {:?}\n[options]\nauto_reload = true\n",
        dir.path().join("views"),
        dir.path().join("cache"),
    ))
    .unwrap();

    let engine = Engine::from_config(&config).unwrap();
    assert_eq!(
        engine.render("hello", &Context::new().with("name", "<you>")).unwrap(),
        "Hello &lt;you&gt;"
    );
    assert!(dir.path().join("cache").is_dir());
}
