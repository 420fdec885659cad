//! Indexing engine metrics.

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Meter},
    KeyValue,
};

/// Central metrics handle for the scheduler.
#[derive(Clone)]
pub struct EngineMetrics {
    events_processed: Counter<u64>,
    events_skipped: Counter<u64>,
    task_retries: Counter<u64>,
    has_error: Gauge<u64>,
    completed_to_timestamp: Gauge<u64>,
}

impl EngineMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            events_processed: meter
                .u64_counter("chainflow.indexing.events_processed")
                .with_description("Events run through user indexing functions")
                .build(),
            events_skipped: meter
                .u64_counter("chainflow.indexing.events_skipped")
                .with_description("Matched events dropped because ABI decoding failed")
                .build(),
            task_retries: meter
                .u64_counter("chainflow.indexing.task_retries")
                .with_description("Task attempts that failed and were retried")
                .build(),
            has_error: meter
                .u64_gauge("chainflow.indexing.has_error")
                .with_description("1 when the scheduler halted on a terminal error")
                .build(),
            completed_to_timestamp: meter
                .u64_gauge("chainflow.indexing.completed_to_timestamp")
                .with_description("Block timestamp every function has processed through")
                .build(),
        }
    }

    pub fn record_processed(&self, function: &str, count: u64) {
        // May over-report after a reorg rewind; acceptable for a counter.
        self.events_processed
            .add(count, &[KeyValue::new("function", function.to_string())]);
    }

    pub fn record_skipped(&self, function: &str) {
        self.events_skipped
            .add(1, &[KeyValue::new("function", function.to_string())]);
    }

    pub fn record_retry(&self, function: &str) {
        self.task_retries
            .add(1, &[KeyValue::new("function", function.to_string())]);
    }

    pub fn set_has_error(&self, value: bool) {
        self.has_error.record(value as u64, &[]);
    }

    pub fn set_completed_to_timestamp(&self, timestamp: u64) {
        self.completed_to_timestamp.record(timestamp, &[]);
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new(&global::meter("chainflow-engine"))
    }
}
