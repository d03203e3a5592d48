//! Policy metadata: the index of known versions, canary routing over it, and
//! the background loop that keeps it in sync with the metadata store.

pub mod config;
pub mod control_plane;
pub mod index;
pub mod metadata_store;
pub mod metrics_defs;
pub mod negative_cache;
pub mod refresh;
pub mod router;
pub mod types;
pub mod version;

pub use metadata_store::{MetadataStore, StoreError};
pub use refresh::{RefreshError, RefreshLoop};
pub use router::{CanaryRouter, RollbackOutcome, RouteDecision, RouterError};
pub use types::{PolicyBundle, PolicyRef};
pub use version::VersionSelector;
