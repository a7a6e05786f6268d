//! OTel-native metrics instruments.
//!
//! Centralized metric definitions using OpenTelemetry meters.
//! All instruments are lazily initialized and feature-gated behind `otel`.
//!
//! Naming follows OTel semantic conventions (dot-separated).
//! The OTel Collector / Prometheus exporter converts dots to underscores.

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("evlog"));

// ============================================================================
// Writer
// ============================================================================

/// Total events appended.
pub static WRITER_APPEND_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("evlog.writer.append.total")
        .with_description("Total events appended to the log")
        .build()
});

/// Total failed appends.
pub static WRITER_APPEND_ERRORS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("evlog.writer.append.errors")
        .with_description("Total failed event appends")
        .build()
});

/// Duration of a single event append (topic check + acknowledged send).
pub static WRITER_APPEND_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("evlog.writer.append.duration")
        .with_description("Event append duration")
        .with_unit("s")
        .build()
});

// ============================================================================
// Consumer
// ============================================================================

/// Messages seen by consumer runners, by outcome.
pub static CONSUMER_MESSAGES_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("evlog.consumer.messages.total")
        .with_description("Total messages seen by consumers")
        .build()
});

/// Duration of handler invocations.
pub static CONSUMER_HANDLER_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("evlog.consumer.handler.duration")
        .with_description("Event handler duration")
        .with_unit("s")
        .build()
});

// ============================================================================
// Reader
// ============================================================================

/// Messages the reader could not turn into events.
pub static READER_DESERIALIZATION_ERRORS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("evlog.reader.deserialization.errors")
        .with_description("Messages skipped during replay")
        .build()
});

// ============================================================================
// Helper
// ============================================================================

/// Create a topic label.
pub fn topic_attr(topic: &str) -> KeyValue {
    KeyValue::new("topic", topic.to_string())
}

/// Create an event_type label.
pub fn event_type_attr(event_type: &str) -> KeyValue {
    KeyValue::new("event_type", event_type.to_string())
}

/// Create an outcome label.
pub fn outcome_attr(outcome: &str) -> KeyValue {
    KeyValue::new("outcome", outcome.to_string())
}

/// Create a consumer group label.
pub fn group_attr(group_id: &str) -> KeyValue {
    KeyValue::new("group_id", group_id.to_string())
}
