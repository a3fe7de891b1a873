//! Template sources, persisted artifacts and the caching [`Engine`].

mod engine;
pub mod error;
mod source;
mod store;

pub use engine::{Engine, cache_key};
pub use source::{FsSource, MemorySource, SourceProvider, dependencies_fresh};
pub use store::{ArtifactStore, FsArtifactStore, WriteOutcome};
