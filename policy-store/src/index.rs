use crate::metrics_defs::POLICY_REJECTED;
use crate::types::PolicyBundle;
use crate::version::compare_versions;
use chrono::{DateTime, Utc};
use shared::counter;
use std::collections::HashMap;
use std::sync::Arc;

/// In-memory map of `name@version` to bundle. Entries are only ever
/// inserted or replaced; byte-cache eviction never touches the index.
#[derive(Debug, Default)]
pub struct PolicyIndex {
    bundles: HashMap<String, Arc<PolicyBundle>>,
}

/// The canary and stable bundles currently in effect for a policy name.
#[derive(Debug, Default)]
pub struct Selection {
    pub canary: Option<Arc<PolicyBundle>>,
    pub stable: Option<Arc<PolicyBundle>>,
}

impl PolicyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a bundle. Returns `None` if the bundle was rejected.
    pub fn insert(&mut self, bundle: PolicyBundle) -> Option<Arc<PolicyBundle>> {
        if bundle.canary_percentage > 100 {
            tracing::warn!(
                policy = %bundle.key(),
                canary_percentage = bundle.canary_percentage,
                "rejecting policy with canary percentage above 100"
            );
            counter!(POLICY_REJECTED).increment(1);
            return None;
        }
        let bundle = Arc::new(bundle);
        self.bundles.insert(bundle.key(), bundle.clone());
        Some(bundle)
    }

    /// Upserts every bundle of a snapshot. Returns the number accepted.
    ///
    /// A resident bundle with a newer `updated_at` than the incoming one is
    /// kept, so a snapshot listed before a local change cannot undo it.
    pub fn merge(&mut self, snapshot: Vec<PolicyBundle>) -> usize {
        let mut accepted = 0;
        for bundle in snapshot {
            if let Some(resident) = self.bundles.get(&bundle.key())
                && resident.updated_at > bundle.updated_at
            {
                tracing::debug!(
                    policy = %bundle.key(),
                    resident = %resident.updated_at,
                    incoming = %bundle.updated_at,
                    "keeping newer resident bundle"
                );
                accepted += 1;
                continue;
            }
            if self.insert(bundle).is_some() {
                accepted += 1;
            }
        }
        accepted
    }

    pub fn get(&self, reference: &str) -> Option<Arc<PolicyBundle>> {
        self.bundles.get(reference).cloned()
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// All resident versions of `name`, ordered by version.
    pub fn versions_of(&self, name: &str) -> Vec<Arc<PolicyBundle>> {
        let mut versions: Vec<_> = self
            .bundles
            .values()
            .filter(|b| b.name == name)
            .cloned()
            .collect();
        versions.sort_by(|a, b| compare_versions(&a.version, &b.version));
        versions
    }

    /// Replaces the bundle at `reference` with a copy carrying the new
    /// percentage. Readers holding the old `Arc` keep a consistent view.
    pub fn set_percentage(
        &mut self,
        reference: &str,
        percentage: u8,
        updated_at: DateTime<Utc>,
    ) -> bool {
        match self.bundles.get_mut(reference) {
            Some(bundle) => {
                let mut updated = PolicyBundle::clone(bundle);
                updated.canary_percentage = percentage;
                updated.updated_at = updated_at;
                *bundle = Arc::new(updated);
                true
            }
            None => false,
        }
    }

    /// Picks the canary and stable bundles for `name`. If the store holds
    /// more than one candidate for a role, the most recently updated one
    /// wins, then the greatest version.
    pub fn select(&self, name: &str) -> Selection {
        let mut canaries = Vec::new();
        let mut stables = Vec::new();
        for bundle in self.bundles.values().filter(|b| b.name == name) {
            if bundle.is_canary() {
                canaries.push(bundle);
            } else if bundle.is_stable() {
                stables.push(bundle);
            }
        }

        Selection {
            canary: pick(name, "canary", canaries),
            stable: pick(name, "stable", stables),
        }
    }
}

fn pick(
    name: &str,
    role: &'static str,
    candidates: Vec<&Arc<PolicyBundle>>,
) -> Option<Arc<PolicyBundle>> {
    if candidates.len() > 1 {
        tracing::warn!(
            policy = %name,
            role,
            candidates = candidates.len(),
            "multiple bundles claim the same role, using the most recently updated"
        );
    }
    candidates
        .into_iter()
        .max_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| compare_versions(&a.version, &b.version))
        })
        .cloned()
}
