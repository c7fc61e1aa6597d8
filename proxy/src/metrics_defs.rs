use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "gateway.request.duration",
    metric_type: MetricType::Histogram,
    description: "Proxy request duration in seconds. Tagged with status and route source.",
};

pub const REQUESTS_INFLIGHT: MetricDef = MetricDef {
    name: "gateway.requests.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of requests currently being processed",
};

pub const ROUTING_DECISION: MetricDef = MetricDef {
    name: "gateway.routing.decision",
    metric_type: MetricType::Counter,
    description: "Routed requests. Tagged with source: query_id, cookie or routing_group.",
};

pub const ROUTING_FAILURE: MetricDef = MetricDef {
    name: "gateway.routing.failure",
    metric_type: MetricType::Counter,
    description: "Requests that could not be routed. Tagged with reason.",
};

pub const BACKEND_PROBE: MetricDef = MetricDef {
    name: "gateway.routing.probe",
    metric_type: MetricType::Counter,
    description: "Backend probes for queries missing from the cache. Tagged with result.",
};

pub const UPSTREAM_ERROR: MetricDef = MetricDef {
    name: "gateway.upstream.error",
    metric_type: MetricType::Counter,
    description: "Failed backend requests. Tagged with kind: timeout or connect.",
};

pub const QUERY_RECORDED: MetricDef = MetricDef {
    name: "gateway.query.recorded",
    metric_type: MetricType::Counter,
    description: "New queries whose backend was written back to the cache",
};

pub const QUERY_ID_MISSING: MetricDef = MetricDef {
    name: "gateway.query.id_missing",
    metric_type: MetricType::Counter,
    description: "Statement submissions whose response carried no query id",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    REQUESTS_INFLIGHT,
    ROUTING_DECISION,
    ROUTING_FAILURE,
    BACKEND_PROBE,
    UPSTREAM_ERROR,
    QUERY_RECORDED,
    QUERY_ID_MISSING,
];
