//! Metrics definitions for artifact signing and verification.

use shared::metrics_defs::{MetricDef, MetricType};

pub const VERIFY_SUCCESS: MetricDef = MetricDef {
    name: "signing.verify.success",
    metric_type: MetricType::Counter,
    description: "Artifacts that passed verification",
};

pub const VERIFY_FAILURE: MetricDef = MetricDef {
    name: "signing.verify.failure",
    metric_type: MetricType::Counter,
    description: "Artifacts rejected by verification, tagged by kind",
};

pub const VERIFY_UNSIGNED: MetricDef = MetricDef {
    name: "signing.verify.unsigned",
    metric_type: MetricType::Counter,
    description: "Artifacts accepted without a signature outside strict mode",
};

pub const SIGNATURES_ISSUED: MetricDef = MetricDef {
    name: "signing.sign.count",
    metric_type: MetricType::Counter,
    description: "Signatures produced by the signer",
};

pub const ALL_METRICS: &[MetricDef] = &[
    VERIFY_SUCCESS,
    VERIFY_FAILURE,
    VERIFY_UNSIGNED,
    SIGNATURES_ISSUED,
];
