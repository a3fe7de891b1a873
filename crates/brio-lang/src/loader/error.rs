use smol_str::SmolStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("Template '{0}' not found")]
    NotFound(SmolStr),
    #[error("Failed to read template '{name}': {message}")]
    Io { name: SmolStr, message: String },
}

impl SourceError {
    pub fn io(name: &str, error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => SourceError::NotFound(SmolStr::new(name)),
            _ => SourceError::Io {
                name: SmolStr::new(name),
                message: error.to_string(),
            },
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Failed to read cached artifact '{key}': {message}")]
    Read { key: String, message: String },
    #[error("Failed to write cached artifact '{key}': {message}")]
    Write { key: String, message: String },
    #[error("Cached artifact '{key}' is corrupt: {message}")]
    Corrupt { key: String, message: String },
}
