//! Prometheus metrics for the judge

use std::sync::LazyLock;

use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static ACCESS_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new("rte_access_total", "Total number of accesses to the service")
        .expect("Failed to create counter")
});

pub static COMPILE_ERROR_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new(
        "rte_compile_error_total",
        "Total number of test runs that had compile errors",
    )
    .expect("Failed to create counter")
});

pub static TEST_COUNT: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("rte_test_execution_count", "Number of tests executed");
    CounterVec::new(opts, &["test"]).expect("Failed to create counter")
});

pub static TEST_FAIL_COUNT: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("rte_test_fail_count", "Number of failed tests");
    CounterVec::new(opts, &["test"]).expect("Failed to create counter")
});

pub static FRAMEWORK_INCOMPATIBILITY_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "rte_framework_incompatibilities_total",
        "Total number of incompatibilities between tests and uploaded solution",
    );
    CounterVec::new(opts, &["test"]).expect("Failed to create counter")
});

pub static ERROR_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("rte_error_total", "Number of errors");
    CounterVec::new(opts, &["phase"]).expect("Failed to create counter")
});

pub static TEST_EXECUTION_TIME: LazyLock<Histogram> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        "rte_test_execution_time",
        "The execution time of tests in seconds",
    )
    .buckets(vec![0.1, 0.5, 1.0, 2.0, 4.0, 8.0, 16.0]);
    Histogram::with_opts(opts).expect("Failed to create histogram")
});

/// Register all metrics and pre-populate the per-phase error counters
pub fn init_monitoring() {
    REGISTRY
        .register(Box::new(ACCESS_TOTAL.clone()))
        .expect("Failed to register metric");
    REGISTRY
        .register(Box::new(COMPILE_ERROR_TOTAL.clone()))
        .expect("Failed to register metric");
    REGISTRY
        .register(Box::new(TEST_COUNT.clone()))
        .expect("Failed to register metric");
    REGISTRY
        .register(Box::new(TEST_FAIL_COUNT.clone()))
        .expect("Failed to register metric");
    REGISTRY
        .register(Box::new(FRAMEWORK_INCOMPATIBILITY_TOTAL.clone()))
        .expect("Failed to register metric");
    REGISTRY
        .register(Box::new(ERROR_TOTAL.clone()))
        .expect("Failed to register metric");
    REGISTRY
        .register(Box::new(TEST_EXECUTION_TIME.clone()))
        .expect("Failed to register metric");

    for phase in ["startup", "upload", "listing", "compile", "test", "analysis", "metric"] {
        ERROR_TOTAL.with_label_values(&[phase]).inc_by(0.0);
    }
}

/// Count an error against its pipeline phase
pub fn inc_error(phase: &str) {
    ERROR_TOTAL.with_label_values(&[phase]).inc();
}

/// Log an error and count it against its pipeline phase
pub fn report_error(phase: &str, message: impl AsRef<str>) {
    log::error!("{}", message.as_ref());
    inc_error(phase);
}

/// Render the registry in Prometheus text exposition format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        log::error!("Failed to encode metrics: {e}");
    }
    String::from_utf8(buffer).unwrap_or_default()
}
