//! Metrics definitions for the executor.

use shared::metrics_defs::{MetricDef, MetricType};

pub const CACHE_HIT: MetricDef = MetricDef {
    name: "policy_cache.hit",
    metric_type: MetricType::Counter,
    description: "Lookups served from the verified artifact cache",
};

pub const CACHE_MISS: MetricDef = MetricDef {
    name: "policy_cache.miss",
    metric_type: MetricType::Counter,
    description: "Lookups that required a load from the object store",
};

pub const CACHE_EVICTED: MetricDef = MetricDef {
    name: "policy_cache.evicted",
    metric_type: MetricType::Counter,
    description: "Entries removed because their age exceeded the TTL",
};

pub const CACHE_SIZE: MetricDef = MetricDef {
    name: "policy_cache.size",
    metric_type: MetricType::Gauge,
    description: "Entries resident in the verified artifact cache",
};

pub const LOADER_CALLS: MetricDef = MetricDef {
    name: "policy_loader.calls",
    metric_type: MetricType::Counter,
    description: "Object store fetches, tagged by outcome",
};

pub const LOADER_DURATION: MetricDef = MetricDef {
    name: "policy_loader.duration",
    metric_type: MetricType::Histogram,
    description: "Time to fetch and verify an artifact in seconds",
};

pub const LOADS_COALESCED: MetricDef = MetricDef {
    name: "policy_loader.coalesced",
    metric_type: MetricType::Counter,
    description: "Callers that waited on a load started by another caller",
};

pub const ALL_METRICS: &[MetricDef] = &[
    CACHE_HIT,
    CACHE_MISS,
    CACHE_EVICTED,
    CACHE_SIZE,
    LOADER_CALLS,
    LOADER_DURATION,
    LOADS_COALESCED,
];
