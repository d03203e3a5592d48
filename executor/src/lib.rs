//! Verified artifact cache and the executor that fills it.

pub mod cache;
pub mod config;
pub mod executor;
pub mod loader;
pub mod metrics_defs;
pub mod single_flight;

pub use cache::{CacheEntry, VersionedCache};
pub use executor::{
    CacheStats, Evaluation, Executor, ExecutorError, HashResolver, PolicyEngine,
};
pub use loader::{FilesystemLoader, GcsLoader, LoadError, LoadedArtifact, PolicyLoader};
