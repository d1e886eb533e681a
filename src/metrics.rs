//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Once;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Inbox
    pub static ref INBOX_ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("driftwood_inbox_activities_received_total", "Activities accepted into the inbox queue"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref INBOX_JOBS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("driftwood_inbox_jobs_total", "Inbox jobs processed by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref INBOX_QUEUE_REJECTED: IntCounterVec = IntCounterVec::new(
        Opts::new("driftwood_inbox_queue_rejected_total", "Inbox jobs refused at enqueue"),
        &["reason"]
    ).expect("metric can be created");
    pub static ref INBOX_QUEUE_DEPTH: IntGauge = IntGauge::new(
        "driftwood_inbox_queue_depth",
        "Jobs waiting across all inbox partitions"
    ).expect("metric can be created");
    pub static ref INBOX_JOB_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "driftwood_inbox_job_duration_seconds",
            "Time spent verifying and dispatching one inbox job"
        ).buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["activity_type"]
    ).expect("metric can be created");

    // Signatures
    pub static ref SIGNATURE_VERIFICATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("driftwood_signature_verifications_total", "Inbound signature verification outcomes"),
        &["result"]
    ).expect("metric can be created");

    // Key cache
    pub static ref KEY_CACHE_LOOKUPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("driftwood_key_cache_lookups_total", "Public key cache lookups"),
        &["result"]
    ).expect("metric can be created");

    // Delivery
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("driftwood_deliveries_total", "Outbound activity deliveries"),
        &["activity_type", "status"]
    ).expect("metric can be created");

    // Errors
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("driftwood_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
///
/// Safe to call more than once; only the first call registers.
pub fn init_metrics() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(INBOX_ACTIVITIES_RECEIVED.clone()))
            .expect("INBOX_ACTIVITIES_RECEIVED can be registered");
        REGISTRY
            .register(Box::new(INBOX_JOBS_TOTAL.clone()))
            .expect("INBOX_JOBS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(INBOX_QUEUE_REJECTED.clone()))
            .expect("INBOX_QUEUE_REJECTED can be registered");
        REGISTRY
            .register(Box::new(INBOX_QUEUE_DEPTH.clone()))
            .expect("INBOX_QUEUE_DEPTH can be registered");
        REGISTRY
            .register(Box::new(INBOX_JOB_DURATION_SECONDS.clone()))
            .expect("INBOX_JOB_DURATION_SECONDS can be registered");
        REGISTRY
            .register(Box::new(SIGNATURE_VERIFICATIONS_TOTAL.clone()))
            .expect("SIGNATURE_VERIFICATIONS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(KEY_CACHE_LOOKUPS_TOTAL.clone()))
            .expect("KEY_CACHE_LOOKUPS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(DELIVERIES_TOTAL.clone()))
            .expect("DELIVERIES_TOTAL can be registered");
        REGISTRY
            .register(Box::new(ERRORS_TOTAL.clone()))
            .expect("ERRORS_TOTAL can be registered");

        tracing::info!("Metrics registry initialized");
    });
}
