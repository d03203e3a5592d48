//! Metrics definitions for the policy store.

use shared::metrics_defs::{MetricDef, MetricType};

pub const NEGATIVE_CACHE_HIT: MetricDef = MetricDef {
    name: "negative_cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of lookups that hit the negative cache",
};

pub const NEGATIVE_CACHE_MISS: MetricDef = MetricDef {
    name: "negative_cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of lookups that missed the negative cache",
};

pub const POLICY_SYNC_DURATION: MetricDef = MetricDef {
    name: "policy_store.sync.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a metadata store sync in seconds",
};

pub const POLICY_SYNC_ROWS: MetricDef = MetricDef {
    name: "policy_store.sync.rows",
    metric_type: MetricType::Histogram,
    description: "Number of policy documents returned from a metadata store sync",
};

pub const POLICY_SYNC_FAILURE: MetricDef = MetricDef {
    name: "policy_store.sync.failure",
    metric_type: MetricType::Counter,
    description: "Metadata store syncs that failed or timed out",
};

pub const POLICY_REJECTED: MetricDef = MetricDef {
    name: "policy_store.ingest.rejected",
    metric_type: MetricType::Counter,
    description: "Policy documents rejected at ingestion",
};

pub const INDEX_SIZE: MetricDef = MetricDef {
    name: "policy_store.index.size",
    metric_type: MetricType::Gauge,
    description: "Number of policy versions resident in the index",
};

pub const CANARY_ROUTE: MetricDef = MetricDef {
    name: "canary.route",
    metric_type: MetricType::Counter,
    description: "Routing decisions, tagged by target (canary or stable)",
};

pub const CANARY_UPDATE: MetricDef = MetricDef {
    name: "canary.update",
    metric_type: MetricType::Counter,
    description: "Canary percentage updates, including rollbacks",
};

pub const ALL_METRICS: &[MetricDef] = &[
    NEGATIVE_CACHE_HIT,
    NEGATIVE_CACHE_MISS,
    POLICY_SYNC_DURATION,
    POLICY_SYNC_ROWS,
    POLICY_SYNC_FAILURE,
    POLICY_REJECTED,
    INDEX_SIZE,
    CANARY_ROUTE,
    CANARY_UPDATE,
];
