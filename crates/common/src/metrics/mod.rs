//! Metrics and observability utilities
//!
//! Provides Prometheus metrics with standardized naming conventions.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all ClinForge metrics
pub const METRICS_PREFIX: &str = "clinforge";

/// Histogram buckets for request latency (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.00, 30.00,
];

/// Buckets for document processing and LLM calls (seconds, up to the hard timeout)
pub const PROCESSING_BUCKETS: &[f64] = &[
    1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0,
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Request metrics
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    // Document processing
    describe_counter!(
        format!("{}_documents_processed_total", METRICS_PREFIX),
        Unit::Count,
        "Documents processed, by outcome"
    );

    describe_counter!(
        format!("{}_sections_parsed_total", METRICS_PREFIX),
        Unit::Count,
        "Source sections persisted"
    );

    describe_histogram!(
        format!("{}_processing_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Document processing latency in seconds"
    );

    describe_counter!(
        format!("{}_classifications_total", METRICS_PREFIX),
        Unit::Count,
        "Section classifications, by outcome"
    );

    // Generation
    describe_counter!(
        format!("{}_generations_total", METRICS_PREFIX),
        Unit::Count,
        "Section generations, by outcome"
    );

    describe_counter!(
        format!("{}_extractions_total", METRICS_PREFIX),
        Unit::Count,
        "Study fact extractions, by outcome"
    );

    describe_histogram!(
        format!("{}_llm_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "LLM completion latency in seconds"
    );

    // Embedding metrics
    describe_counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding API requests"
    );

    describe_histogram!(
        format!("{}_embedding_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Embedding generation latency in seconds"
    );

    // Queue metrics
    describe_counter!(
        format!("{}_queue_messages_processed_total", METRICS_PREFIX),
        Unit::Count,
        "Queue messages handled, by outcome"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

/// Helper to record embedding metrics
pub fn record_embedding(duration_secs: f64, model: &str, batch_size: usize, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_embedding_duration_seconds", METRICS_PREFIX),
            "model" => model.to_string(),
            "batch" => if batch_size > 1 { "batch" } else { "single" }
        )
        .record(duration_secs);
    }
}

/// Helper to record document processing metrics
pub fn record_processing(duration_secs: f64, sections: usize, success: bool) {
    let outcome = if success { "indexed" } else { "error" };

    counter!(
        format!("{}_documents_processed_total", METRICS_PREFIX),
        "outcome" => outcome
    )
    .increment(1);

    counter!(format!("{}_sections_parsed_total", METRICS_PREFIX)).increment(sections as u64);

    histogram!(
        format!("{}_processing_duration_seconds", METRICS_PREFIX),
        "outcome" => outcome
    )
    .record(duration_secs);
}

/// Helper to record a classification outcome
pub fn record_classification(matched: bool) {
    counter!(
        format!("{}_classifications_total", METRICS_PREFIX),
        "outcome" => if matched { "matched" } else { "unclassified" }
    )
    .increment(1);
}

/// Helper to record a section generation outcome
/// (`generated`, `placeholder` or `error`)
pub fn record_generation(outcome: &'static str) {
    counter!(
        format!("{}_generations_total", METRICS_PREFIX),
        "outcome" => outcome
    )
    .increment(1);
}

/// Helper to record a fact extraction outcome
/// (`extracted`, `no_sources`, `llm_error` or `unparseable`)
pub fn record_extraction(outcome: &'static str) {
    counter!(
        format!("{}_extractions_total", METRICS_PREFIX),
        "outcome" => outcome
    )
    .increment(1);
}

/// Helper to record LLM latency
pub fn record_llm(duration_secs: f64, model: &str, success: bool) {
    histogram!(
        format!("{}_llm_duration_seconds", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => if success { "success" } else { "error" }
    )
    .record(duration_secs);
}

/// Helper to record queue message outcomes (`done`, `retried`, `released`, `dropped`)
pub fn record_queue_message(outcome: &'static str) {
    counter!(
        format!("{}_queue_messages_processed_total", METRICS_PREFIX),
        "outcome" => outcome
    )
    .increment(1);
}
