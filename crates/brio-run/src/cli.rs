use std::io::{self, IsTerminal, Read, Write};
use std::path::PathBuf;

use brio_lang::{Config, Context, Engine, Options, Persistence, Template};
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, miette};

#[derive(Parser, Debug, Default)]
#[command(name = "brio")]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(after_help = "# Examples:\n\n\
    ## To render templates/page.tpl with inline data:\n\
    brio page --data '{\"title\": \"Home\"}'\n\n\
    ## To render a template string:\n\
    echo '{{ 1 + 2 }}' | brio -\n\n\
    ## To compile templates without rendering:\n\
    brio check page layout")]
#[command(about = "brio compiles and renders brio templates.", long_about = None)]
pub struct Cli {
    #[clap(flatten)]
    engine: EngineArgs,

    #[clap(flatten)]
    data: DataArgs,

    #[clap(subcommand)]
    commands: Option<Commands>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Template name, or `-` to read the template source from stdin
    #[arg(value_name = "TEMPLATE")]
    template: Option<String>,
}

#[derive(Clone, Debug, clap::Args, Default)]
struct EngineArgs {
    /// Read engine settings from a brio.toml file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the template sources
    #[arg(short, long)]
    templates: Option<PathBuf>,

    /// File extension of template sources
    #[arg(short, long = "ext")]
    extension: Option<String>,

    /// Persist compiled templates in this directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Fail when a compiled template can't be persisted
    #[arg(long, default_value_t = false)]
    strict_cache: bool,

    /// Enable a compile option, e.g. `auto_trim` or `force_include`
    #[arg(short = 'O', long = "option", value_name = "KEY")]
    options: Vec<String>,

    /// Disable HTML escaping of printed values
    #[arg(long, default_value_t = false)]
    no_escape: bool,
}

#[derive(Clone, Debug, clap::Args, Default)]
struct DataArgs {
    /// Template variables as a JSON object
    #[arg(short = 'd', long = "data", value_name = "JSON")]
    data: Option<String>,

    /// Read template variables from a JSON file
    #[arg(short = 'D', long = "data-file", value_name = "FILE", conflicts_with = "data")]
    data_file: Option<PathBuf>,

    /// Sets a string variable
    #[arg(long = "var", value_names = ["NAME", "VALUE"], num_args = 2)]
    vars: Vec<String>,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Compile templates and report their dependencies without rendering
    Check {
        #[arg(required = true)]
        templates: Vec<String>,
    },
    /// Print the tokens of a template file
    Tokens { file: PathBuf },
}

impl Cli {
    pub fn run(&self) -> miette::Result<()> {
        self.init_tracing();

        match &self.commands {
            Some(Commands::Check { templates }) => self.check(templates),
            Some(Commands::Tokens { file }) => {
                let source = std::fs::read_to_string(file).into_diagnostic()?;
                let tokens = brio_lang::tokenize(&source)?;
                let mut stdout = io::stdout().lock();
                for token in tokens {
                    writeln!(stdout, "{}\t{:?}", token.line(), token.kind).into_diagnostic()?;
                }
                Ok(())
            }
            None => {
                let template = self
                    .template
                    .as_deref()
                    .ok_or_else(|| miette!("A template name is required"))?;
                let output = self.render(template)?;
                let mut stdout = io::stdout().lock();
                stdout.write_all(output.as_bytes()).into_diagnostic()?;
                stdout.flush().into_diagnostic()
            }
        }
    }

    fn init_tracing(&self) {
        let level = match self.verbose {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        };
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(io::stderr)
            .with_ansi(io::stderr().is_terminal())
            .try_init();
    }

    fn config(&self) -> miette::Result<Config> {
        let mut config = match &self.engine.config {
            Some(path) => Config::load(path).map_err(brio_lang::Error::from_config)?,
            None => Config::default(),
        };

        if let Some(templates) = &self.engine.templates {
            config.templates = templates.clone();
        }
        if let Some(extension) = &self.engine.extension {
            config.extension = extension.trim_start_matches('.').to_string();
        }
        if self.engine.cache_dir.is_some() {
            config.cache_dir = self.engine.cache_dir.clone();
        }
        config.strict_cache |= self.engine.strict_cache;

        for key in &self.engine.options {
            Options::flag(key).map_err(brio_lang::Error::from_config)?;
            config.options.insert(key.clone(), true);
        }
        if self.engine.no_escape {
            config.options.insert("auto_escape".to_string(), false);
        }

        Ok(config)
    }

    fn context(&self) -> miette::Result<Context> {
        let json = match (&self.data.data, &self.data.data_file) {
            (Some(data), _) => Some(data.clone()),
            (None, Some(path)) => Some(std::fs::read_to_string(path).into_diagnostic()?),
            (None, None) => None,
        };

        let mut context = match json {
            Some(json) => {
                let value = serde_json::from_str::<serde_json::Value>(&json)
                    .map_err(|e| miette!("Invalid JSON data: {}", e))?;
                Context::from_json(value).map_err(brio_lang::Error::from_config)?
            }
            None => Context::new(),
        };

        for pair in self.data.vars.chunks(2) {
            if let [name, value] = pair {
                context.insert(name, value.as_str());
            }
        }

        Ok(context)
    }

    fn render(&self, template: &str) -> miette::Result<String> {
        let context = self.context()?;
        let engine = Engine::from_config(&self.config()?)?;

        if template == "-" {
            let mut source = String::new();
            io::stdin().read_to_string(&mut source).into_diagnostic()?;
            let unit = brio_lang::compile_source(engine.config(), engine.sources(), "stdin", source)?;
            let template = Template::from_unit(unit, &engine.config().extensions)?;
            return Ok(template.render_with(&engine, &context)?);
        }

        Ok(engine.render(template, &context)?)
    }

    fn check(&self, templates: &[String]) -> miette::Result<()> {
        let engine = Engine::from_config(&self.config()?)?;
        let mut stdout = io::stdout().lock();

        for name in templates {
            let template = engine.get_template(name)?;
            let persistence = match template.persistence() {
                Persistence::Persisted => "persisted",
                Persistence::Disabled => "in memory",
                Persistence::Contended => "contended",
                Persistence::Failed => "not persisted",
            };
            writeln!(stdout, "{}: ok ({})", template.name(), persistence).into_diagnostic()?;
            for dependency in template.dependencies().keys() {
                writeln!(stdout, "  {}", dependency).into_diagnostic()?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scopeguard::defer;

    fn templates_dir(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        dir
    }

    fn cli(dir: &tempfile::TempDir) -> Cli {
        Cli {
            engine: EngineArgs {
                templates: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
            ..Cli::default()
        }
    }

    #[test]
    fn test_render_with_data() {
        let dir = templates_dir(&[("page.tpl", "<h1>{{ title }}</h1>")]);
        let cli = Cli {
            data: DataArgs {
                data: Some(r#"{"title": "<Home>"}"#.to_string()),
                ..Default::default()
            },
            ..cli(&dir)
        };
        assert_eq!(cli.render("page").unwrap(), "<h1>&lt;Home&gt;</h1>");
    }

    #[test]
    fn test_render_without_escape() {
        let dir = templates_dir(&[("page.tpl", "{{ title }}")]);
        let mut cli = cli(&dir);
        cli.engine.no_escape = true;
        cli.data.vars = vec!["title".to_string(), "<b>".to_string()];
        assert_eq!(cli.render("page").unwrap(), "<b>");
    }

    #[test]
    fn test_config_overrides_file() {
        let dir = templates_dir(&[("brio.toml", "extension = \"html\"\n[options]\nauto_trim = true\n")]);
        let mut cli = cli(&dir);
        cli.engine.config = Some(dir.path().join("brio.toml"));
        cli.engine.extension = Some(".view".to_string());
        cli.engine.options = vec!["force_include".to_string()];

        let config = cli.config().unwrap();
        assert_eq!(config.extension, "view");
        let options = config.options().unwrap();
        assert!(options.contains(Options::AUTO_TRIM | Options::FORCE_INCLUDE | Options::AUTO_ESCAPE));
    }

    #[test]
    fn test_unknown_option_is_rejected() {
        let dir = templates_dir(&[]);
        let mut cli = cli(&dir);
        cli.engine.options = vec!["fast".to_string()];
        assert!(cli.config().is_err());
    }

    #[test]
    fn test_context_must_be_object() {
        let dir = templates_dir(&[]);
        let mut cli = cli(&dir);
        cli.data.data = Some("[1, 2]".to_string());
        assert!(cli.context().is_err());
    }

    #[test]
    fn test_check_persists_into_cache_dir() {
        let dir = templates_dir(&[("layout.tpl", "{block body}{/block}"), ("page.tpl", "{extends 'layout'}")]);
        let cache = std::env::temp_dir().join(format!("brio-run-check-{}", std::process::id()));
        defer! {
            let _ = std::fs::remove_dir_all(&cache);
        }

        let mut cli = cli(&dir);
        cli.engine.cache_dir = Some(cache.clone());
        assert!(cli.check(&["page".to_string()]).is_ok());
        assert!(std::fs::read_dir(&cache).unwrap().count() > 0);
    }
}
