//! Metrics definitions for the evaluation engine.

use shared::metrics_defs::{MetricDef, MetricType};

pub const EVAL_CACHE_REFRESH_SUCCESS: MetricDef = MetricDef {
    name: "eval_cache.refresh.success",
    metric_type: MetricType::Counter,
    description: "Number of evaluation cache refreshes that swapped in a new snapshot",
};

pub const EVAL_CACHE_REFRESH_FAILURE: MetricDef = MetricDef {
    name: "eval_cache.refresh.failure",
    metric_type: MetricType::Counter,
    description: "Number of evaluation cache refreshes that kept the previous snapshot",
};

pub const EVAL_CACHE_REFRESH_DURATION: MetricDef = MetricDef {
    name: "eval_cache.refresh.duration",
    metric_type: MetricType::Histogram,
    description: "Time to fetch and prepare all flags in seconds",
};

pub const EVAL_CACHE_FLAGS: MetricDef = MetricDef {
    name: "eval_cache.flags",
    metric_type: MetricType::Gauge,
    description: "Number of flags in the current snapshot",
};

pub const EVALUATION_COUNT: MetricDef = MetricDef {
    name: "evaluation.count",
    metric_type: MetricType::Counter,
    description: "Number of flag evaluations, by flag and assigned variant",
};

pub const EVALUATION_ERROR: MetricDef = MetricDef {
    name: "evaluation.error",
    metric_type: MetricType::Counter,
    description: "Number of evaluations that returned an error",
};

pub const ENABLED_FLAG_VALIDATION_FAILED: MetricDef = MetricDef {
    name: "enabled_flag_validation.failed",
    metric_type: MetricType::Counter,
    description: "Number of enabled flags violating the validation rules at load time",
};

pub const ALL_METRICS: &[MetricDef] = &[
    EVAL_CACHE_REFRESH_SUCCESS,
    EVAL_CACHE_REFRESH_FAILURE,
    EVAL_CACHE_REFRESH_DURATION,
    EVAL_CACHE_FLAGS,
    EVALUATION_COUNT,
    EVALUATION_ERROR,
    ENABLED_FLAG_VALIDATION_FAILED,
];
