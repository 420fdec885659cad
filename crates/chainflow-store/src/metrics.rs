//! Sync store metrics.
//!
//! Every public store operation records its duration, a call count, and any
//! terminal (post-retry) error. Exported via OTLP under the `chainflow.`
//! namespace.

use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};

/// Central metrics handle for the sync store.
#[derive(Clone)]
pub struct StoreMetrics {
    operation_calls: Counter<u64>,
    operation_errors: Counter<u64>,
    operation_duration_ms: Histogram<f64>,
}

impl StoreMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            operation_calls: meter
                .u64_counter("chainflow.store.operation_calls")
                .with_description("Sync store operations started")
                .build(),
            operation_errors: meter
                .u64_counter("chainflow.store.operation_errors")
                .with_description("Sync store operations that failed after retries")
                .build(),
            operation_duration_ms: meter
                .f64_histogram("chainflow.store.operation_duration_ms")
                .with_description("Wall time of a successful sync store operation")
                .build(),
        }
    }

    pub fn record_call(&self, operation: &'static str) {
        self.operation_calls
            .add(1, &[KeyValue::new("operation", operation)]);
    }

    pub fn record_error(&self, operation: &'static str) {
        self.operation_errors
            .add(1, &[KeyValue::new("operation", operation)]);
    }

    pub fn record_duration(&self, operation: &'static str, ms: f64) {
        self.operation_duration_ms
            .record(ms, &[KeyValue::new("operation", operation)]);
    }
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new(&global::meter("chainflow-store"))
    }
}
