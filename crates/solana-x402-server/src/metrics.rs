use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::{LazyLock, Once};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Gate outcomes
pub static GATE_DECISIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("x402_gate_decisions_total", "Access decisions by outcome"),
        &["outcome"],
    )
    .unwrap()
});

// Verification
pub static VERIFICATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "x402_verifications_total",
            "Settlement verifications by strategy and result",
        ),
        &["strategy", "result"],
    )
    .unwrap()
});

pub static VERIFICATION_LATENCY: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "x402_verification_latency_seconds",
            "Time spent verifying a payment",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0]),
    )
    .unwrap()
});

pub static GRANTS_ISSUED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("x402_grants_issued_total", "Access grants issued").unwrap()
});

pub static STATUS_CHECKS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("x402_status_checks_total", "Status endpoint answers by status"),
        &["status"],
    )
    .unwrap()
});

static REGISTER: Once = Once::new();

/// Register all metrics with the registry. Safe to call more than once.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        REGISTRY.register(Box::new(GATE_DECISIONS.clone())).unwrap();
        REGISTRY.register(Box::new(VERIFICATIONS.clone())).unwrap();
        REGISTRY
            .register(Box::new(VERIFICATION_LATENCY.clone()))
            .unwrap();
        REGISTRY.register(Box::new(GRANTS_ISSUED.clone())).unwrap();
        REGISTRY.register(Box::new(STATUS_CHECKS.clone())).unwrap();
    });
}

/// Record one verification that ran for `seconds`.
pub fn record_verification(strategy: &str, result: &str, seconds: f64) {
    VERIFICATIONS.with_label_values(&[strategy, result]).inc();
    VERIFICATION_LATENCY.observe(seconds);
}
