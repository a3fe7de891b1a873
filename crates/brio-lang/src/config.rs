use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::options::{ConfigError, Options};

/// Engine settings, usually read from a `brio.toml`.
///
/// ```toml
/// templates = "views"
/// extension = "tpl"
/// cache_dir = "cache"
/// strict_cache = false
///
/// [options]
/// auto_escape = true
/// auto_reload = true
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_templates")]
    pub templates: PathBuf,
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Omit to keep compiled templates in memory only.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub strict_cache: bool,
    #[serde(default)]
    pub options: BTreeMap<String, bool>,
}

fn default_templates() -> PathBuf {
    PathBuf::from("templates")
}

fn default_extension() -> String {
    "tpl".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            templates: default_templates(),
            extension: default_extension(),
            cache_dir: None,
            strict_cache: false,
            options: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(s).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.options()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// The option set: `auto_escape` unless switched off, plus the keys set to `true`.
    pub fn options(&self) -> Result<Options, ConfigError> {
        Options::default().apply_map(&self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_from_toml_str() {
        let config = Config::from_toml_str(
            r#"
templates = "views"
cache_dir = "cache"

[options]
auto_reload = true
auto_escape = false
"#,
        )
        .unwrap();
        assert_eq!(config.templates, PathBuf::from("views"));
        assert_eq!(config.extension, "tpl");
        assert_eq!(config.cache_dir, Some(PathBuf::from("cache")));
        let options = config.options().unwrap();
        assert!(options.contains(Options::AUTO_RELOAD));
        assert!(!options.contains(Options::AUTO_ESCAPE));
    }

    #[rstest]
    #[case::unknown_option("[options]\nfast = true", ConfigError::UnknownOption("fast".to_string()))]
    fn test_invalid_config(#[case] source: &str, #[case] expected: ConfigError) {
        assert_eq!(Config::from_toml_str(source), Err(expected));
    }

    #[rstest]
    #[case::unknown_key("template_dir = \"x\"")]
    #[case::wrong_type("strict_cache = \"yes\"")]
    fn test_rejects_malformed_toml(#[case] source: &str) {
        assert!(matches!(Config::from_toml_str(source), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::load(dir.path().join("brio.toml")),
            Err(ConfigError::Io(..))
        ));
    }
}
