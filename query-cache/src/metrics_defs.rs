//! Metrics definitions for the query cache.

use shared::metrics_defs::{MetricDef, MetricType};

pub const L1_HIT: MetricDef = MetricDef {
    name: "query_cache.l1.hit",
    metric_type: MetricType::Counter,
    description: "Lookups answered by the in-process cache",
};

pub const L2_HIT: MetricDef = MetricDef {
    name: "query_cache.l2.hit",
    metric_type: MetricType::Counter,
    description: "Lookups answered by the distributed cache",
};

pub const L2_MISS: MetricDef = MetricDef {
    name: "query_cache.l2.miss",
    metric_type: MetricType::Counter,
    description: "Lookups the distributed cache had no value for",
};

pub const L2_ERROR: MetricDef = MetricDef {
    name: "query_cache.l2.error",
    metric_type: MetricType::Counter,
    description: "Distributed cache operations that failed or were skipped",
};

pub const L3_HIT: MetricDef = MetricDef {
    name: "query_cache.l3.hit",
    metric_type: MetricType::Counter,
    description: "Lookups answered by the durable loader",
};

pub const L3_MISS: MetricDef = MetricDef {
    name: "query_cache.l3.miss",
    metric_type: MetricType::Counter,
    description: "Lookups no tier had a value for",
};

pub const L3_ERROR: MetricDef = MetricDef {
    name: "query_cache.l3.error",
    metric_type: MetricType::Counter,
    description: "Durable loader calls that failed",
};

pub const WRITE_CONFLICT: MetricDef = MetricDef {
    name: "query_cache.write_conflict",
    metric_type: MetricType::Counter,
    description: "Writes dropped because a different value was already cached",
};

pub const HISTORY_PURGED: MetricDef = MetricDef {
    name: "query_cache.history.purged",
    metric_type: MetricType::Counter,
    description: "History records removed after their retention period",
};

pub const ALL_METRICS: &[MetricDef] = &[
    L1_HIT,
    L2_HIT,
    L2_MISS,
    L2_ERROR,
    L3_HIT,
    L3_MISS,
    L3_ERROR,
    WRITE_CONFLICT,
    HISTORY_PURGED,
];
