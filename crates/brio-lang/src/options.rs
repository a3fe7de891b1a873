use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The compiler option set. Each flag occupies one bit; templates compiled with
/// different sets are cached separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Options(u32);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Unknown option `{0}`")]
    UnknownOption(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Failed to read configuration file `{0}`: {1}")]
    Io(String, String),
}

impl Options {
    pub const NONE: Options = Options(0);
    pub const DENY_ACCESSOR: Options = Options(0x8);
    pub const DENY_METHODS: Options = Options(0x10);
    pub const DENY_NATIVE_FUNCS: Options = Options(0x20);
    pub const FORCE_INCLUDE: Options = Options(0x40);
    pub const AUTO_RELOAD: Options = Options(0x80);
    pub const FORCE_COMPILE: Options = Options(0x100);
    pub const AUTO_ESCAPE: Options = Options(0x200);
    pub const DISABLE_CACHE: Options = Options(0x400);
    pub const FORCE_VERIFY: Options = Options(0x800);
    pub const AUTO_TRIM: Options = Options(0x1000);
    pub const AUTO_STRIP: Options = Options(0x4000);

    /// Configuration keys, in the order they are documented.
    pub const KEYS: [(&'static str, Options); 11] = [
        ("disable_accessor", Options::DENY_ACCESSOR),
        ("disable_methods", Options::DENY_METHODS),
        ("disable_funcs", Options::DENY_NATIVE_FUNCS),
        ("disable_cache", Options::DISABLE_CACHE),
        ("force_compile", Options::FORCE_COMPILE),
        ("auto_reload", Options::AUTO_RELOAD),
        ("force_include", Options::FORCE_INCLUDE),
        ("auto_escape", Options::AUTO_ESCAPE),
        ("force_verify", Options::FORCE_VERIFY),
        ("auto_trim", Options::AUTO_TRIM),
        ("strip", Options::AUTO_STRIP),
    ];

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Options(bits)
    }

    pub const fn contains(&self, other: Options) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn with(self, other: Options) -> Self {
        Options(self.0 | other.0)
    }

    pub fn without(self, other: Options) -> Self {
        Options(self.0 & !other.0)
    }

    pub fn set(&mut self, other: Options, enabled: bool) {
        *self = if enabled { self.with(other) } else { self.without(other) };
    }

    /// Looks up the flag for a configuration key.
    pub fn flag(key: &str) -> Result<Options, ConfigError> {
        Self::KEYS
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, flag)| *flag)
            .ok_or_else(|| ConfigError::UnknownOption(key.to_string()))
    }

    /// Builds an option set with the given keys switched on.
    pub fn from_keys<'a>(keys: impl IntoIterator<Item = &'a str>) -> Result<Options, ConfigError> {
        keys.into_iter()
            .try_fold(Options::NONE, |options, key| Ok(options.with(Self::flag(key)?)))
    }

    /// Applies `key = bool` pairs on top of `self`.
    pub fn apply_map(self, map: &BTreeMap<String, bool>) -> Result<Options, ConfigError> {
        map.iter().try_fold(self, |mut options, (key, enabled)| {
            options.set(Self::flag(key)?, *enabled);
            Ok(options)
        })
    }

    pub fn from_map(map: &BTreeMap<String, bool>) -> Result<Options, ConfigError> {
        Options::NONE.apply_map(map)
    }

    /// Names of the active flags.
    pub fn keys(&self) -> Vec<&'static str> {
        Self::KEYS
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect()
    }
}

impl Default for Options {
    fn default() -> Self {
        Options::AUTO_ESCAPE
    }
}

impl BitOr for Options {
    type Output = Options;

    fn bitor(self, rhs: Options) -> Options {
        self.with(rhs)
    }
}

impl BitOrAssign for Options {
    fn bitor_assign(&mut self, rhs: Options) {
        *self = self.with(rhs);
    }
}

impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.keys().join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::single(vec!["auto_reload"], Ok(Options::AUTO_RELOAD))]
    #[case::combined(vec!["disable_funcs", "strip"], Ok(Options::DENY_NATIVE_FUNCS | Options::AUTO_STRIP))]
    #[case::empty(vec![], Ok(Options::NONE))]
    #[case::unknown(vec!["auto_reload", "turbo"], Err(ConfigError::UnknownOption("turbo".to_string())))]
    fn test_from_keys(#[case] keys: Vec<&str>, #[case] expected: Result<Options, ConfigError>) {
        assert_eq!(Options::from_keys(keys), expected);
    }

    #[test]
    fn test_apply_map_switches_off() {
        let map = BTreeMap::from([("auto_escape".to_string(), false), ("force_verify".to_string(), true)]);
        let options = Options::default().apply_map(&map).unwrap();

        assert!(!options.contains(Options::AUTO_ESCAPE));
        assert!(options.contains(Options::FORCE_VERIFY));
    }

    #[test]
    fn test_bits_are_distinct() {
        let all = Options::KEYS.iter().fold(0u32, |acc, (_, flag)| {
            assert_eq!(acc & flag.bits(), 0);
            acc | flag.bits()
        });
        assert_eq!(Options::KEYS.len(), all.count_ones() as usize);
    }

    #[test]
    fn test_keys_round_trip() {
        let options = Options::DENY_METHODS | Options::AUTO_TRIM;
        assert_eq!(Options::from_keys(options.keys()), Ok(options));
    }
}
