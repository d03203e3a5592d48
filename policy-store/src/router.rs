use crate::index::PolicyIndex;
use crate::metadata_store::{MetadataStore, StoreError};
use crate::metrics_defs::{CANARY_ROUTE, CANARY_UPDATE, INDEX_SIZE};
use crate::negative_cache::NegativeCache;
use crate::types::{InvalidRef, PolicyBundle, PolicyRef};
use crate::version::VersionSelector;
use chrono::Utc;
use parking_lot::RwLock;
use shared::{counter, gauge};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(thiserror::Error, Debug)]
pub enum RouterError {
    #[error("no policy found for {0}")]
    PolicyNotFound(String),
    #[error("no stable version found for {0}")]
    NoStableVersion(String),
    #[error("no canary deployment found for {0}")]
    NoCanary(String),
    #[error("canary percentage must be between 0 and 100, got {0}")]
    InvalidPercentage(i32),
    #[error(transparent)]
    InvalidRef(#[from] InvalidRef),
    #[error("metadata store error: {0}")]
    Store(#[from] StoreError),
}

/// The version picked for one request.
#[derive(Clone, Debug)]
pub struct RouteDecision {
    pub bundle: Arc<PolicyBundle>,
    pub reference: PolicyRef,
    pub is_canary: bool,
}

#[derive(Debug, PartialEq)]
pub struct RollbackOutcome {
    pub canary: PolicyRef,
    pub stable: Option<PolicyRef>,
    /// False when the stable side could not be set to 100.
    pub stable_restored: bool,
}

/// Resolves policy names to concrete versions and applies canary changes.
///
/// The index lock is never held across store I/O: updates write to the
/// store first and only then touch the index.
pub struct CanaryRouter {
    index: RwLock<PolicyIndex>,
    store: Arc<dyn MetadataStore>,
    negative_cache: NegativeCache,
    // Set once the first load attempt has finished, even if it found nothing.
    ready: AtomicBool,
}

impl CanaryRouter {
    pub fn new(store: Arc<dyn MetadataStore>, negative_cache: NegativeCache) -> Self {
        CanaryRouter {
            index: RwLock::new(PolicyIndex::new()),
            store,
            negative_cache,
            ready: AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Picks stable or canary for `name`. Weights below the canary
    /// percentage go to the canary, so a canary at `p` receives exactly `p`
    /// of the 100 possible weights.
    pub fn get_for_request(&self, name: &str, weight: u8) -> Result<RouteDecision, RouterError> {
        let index = self.index.read();
        let selection = index.select(name);

        let Some(canary) = selection.canary else {
            let stable = selection
                .stable
                .ok_or_else(|| RouterError::PolicyNotFound(name.to_string()))?;
            counter!(CANARY_ROUTE, "target" => "stable").increment(1);
            return Ok(decision(stable, false));
        };

        if weight < canary.canary_percentage {
            tracing::debug!(
                policy = %name,
                version = %canary.version,
                weight,
                canary_percentage = canary.canary_percentage,
                "routing to canary version"
            );
            counter!(CANARY_ROUTE, "target" => "canary").increment(1);
            return Ok(decision(canary, true));
        }

        let stable = selection
            .stable
            .or_else(|| {
                canary
                    .stable_version
                    .as_ref()
                    .and_then(|v| index.get(&PolicyRef::new(name, v).to_string()))
            })
            .ok_or_else(|| RouterError::NoStableVersion(name.to_string()))?;

        tracing::debug!(
            policy = %name,
            version = %stable.version,
            weight,
            canary_percentage = canary.canary_percentage,
            "routing to stable version"
        );
        counter!(CANARY_ROUTE, "target" => "stable").increment(1);
        Ok(decision(stable, false))
    }

    /// Looks up an exact version, fetching it from the store on an index
    /// miss. Store misses are remembered briefly.
    pub async fn get(&self, reference: &PolicyRef) -> Result<Arc<PolicyBundle>, RouterError> {
        let key = reference.to_string();
        if let Some(bundle) = self.index.read().get(&key) {
            return Ok(bundle);
        }
        if self.negative_cache.contains(&key) {
            return Err(RouterError::PolicyNotFound(key));
        }

        match self.store.get(reference).await {
            Ok(bundle) => {
                let mut index = self.index.write();
                let inserted = index.insert(bundle);
                gauge!(INDEX_SIZE).set(index.len() as f64);
                inserted.ok_or(RouterError::PolicyNotFound(key))
            }
            Err(StoreError::NotFound(_)) => {
                self.negative_cache.insert(&key);
                Err(RouterError::PolicyNotFound(key))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_versions(&self, name: &str) -> Result<Vec<Arc<PolicyBundle>>, RouterError> {
        let versions = self.index.read().versions_of(name);
        if versions.is_empty() {
            return Err(RouterError::PolicyNotFound(name.to_string()));
        }
        Ok(versions)
    }

    /// Applies the version header: `latest` follows the canary split, an
    /// exact version pins it. Stored versions may carry a leading `v`.
    pub async fn resolve(
        &self,
        name: &str,
        selector: &VersionSelector,
        weight: u8,
    ) -> Result<RouteDecision, RouterError> {
        let version = match selector {
            VersionSelector::Latest => return self.get_for_request(name, weight),
            VersionSelector::Exact(version) => version,
        };

        let resident = {
            let index = self.index.read();
            index
                .get(&PolicyRef::new(name, version).to_string())
                .or_else(|| index.get(&PolicyRef::new(name, &format!("v{version}")).to_string()))
        };
        let bundle = match resident {
            Some(bundle) => bundle,
            None => self.get(&PolicyRef::new(name, version)).await?,
        };
        let is_canary = bundle.is_canary();
        Ok(decision(bundle, is_canary))
    }

    /// Upserts a snapshot into the index. Returns the number of accepted
    /// documents.
    pub fn sync(&self, snapshot: Vec<PolicyBundle>) -> usize {
        let mut index = self.index.write();
        let accepted = index.merge(snapshot);
        gauge!(INDEX_SIZE).set(index.len() as f64);
        accepted
    }

    /// Lists the store and merges the result. The store call happens before
    /// the index lock is taken.
    pub async fn load_from_store(&self) -> Result<usize, StoreError> {
        let snapshot = self.store.list_all().await?;
        Ok(self.sync(snapshot))
    }

    pub async fn update_canary_percentage(
        &self,
        reference: &PolicyRef,
        percentage: i32,
    ) -> Result<(), RouterError> {
        let pct = u8::try_from(percentage)
            .ok()
            .filter(|p| *p <= 100)
            .ok_or(RouterError::InvalidPercentage(percentage))?;

        let updated_at = Utc::now();
        self.store
            .update_canary_percentage(reference, pct, updated_at)
            .await?;

        let key = reference.to_string();
        self.index.write().set_percentage(&key, pct, updated_at);
        self.negative_cache.remove(&key);
        counter!(CANARY_UPDATE).increment(1);

        tracing::info!(policy_ref = %key, percentage = pct, "updated canary percentage");
        Ok(())
    }

    /// Sends the active canary to 0% and, best effort, the stable version to
    /// 100%. When no bundle sits at 100% the canary's `stable_version` is
    /// restored instead. A stable-side failure is logged, not returned.
    pub async fn rollback(&self, name: &str) -> Result<RollbackOutcome, RouterError> {
        let (canary, stable) = {
            let index = self.index.read();
            let selection = index.select(name);
            let canary = selection
                .canary
                .ok_or_else(|| RouterError::NoCanary(name.to_string()))?;
            let stable = selection.stable.map(|s| s.reference()).or_else(|| {
                canary
                    .stable_version
                    .as_ref()
                    .map(|v| PolicyRef::new(name, v))
            });
            (canary.reference(), stable)
        };

        self.update_canary_percentage(&canary, 0).await?;

        let mut stable_restored = false;
        if let Some(stable_ref) = &stable {
            match self.update_canary_percentage(stable_ref, 100).await {
                Ok(()) => stable_restored = true,
                Err(err) => tracing::warn!(
                    stable_ref = %stable_ref,
                    error = %err,
                    "failed to set stable to 100%, but canary rolled back"
                ),
            }
        }

        tracing::info!(
            policy = %name,
            canary_ref = %canary,
            stable_ref = ?stable.as_ref().map(|s| s.to_string()),
            "rollback complete"
        );

        Ok(RollbackOutcome {
            canary,
            stable,
            stable_restored,
        })
    }
}

fn decision(bundle: Arc<PolicyBundle>, is_canary: bool) -> RouteDecision {
    RouteDecision {
        reference: bundle.reference(),
        bundle,
        is_canary,
    }
}
