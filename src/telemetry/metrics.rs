//! Metric instrument factories for farseer-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"farseer-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for farseer-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("farseer-rs")
}

/// Counter: queue-level operations (create, send, read, archive).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("farseer.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: events published on the bus.
/// Labels: `topic`, `event`.
pub fn bus_published() -> Counter<u64> {
    meter()
        .u64_counter("farseer.bus.published")
        .with_description("Number of events published")
        .build()
}

/// Counter: events consumed from the bus.
/// Labels: `topic`.
pub fn bus_consumed() -> Counter<u64> {
    meter()
        .u64_counter("farseer.bus.consumed")
        .with_description("Number of events consumed")
        .build()
}

/// Counter: payloads that could not be decoded into an event.
/// Labels: `topic`.
pub fn bus_malformed() -> Counter<u64> {
    meter()
        .u64_counter("farseer.bus.malformed")
        .with_description("Number of undecodable payloads")
        .build()
}

/// Counter: capture workers spawned.
/// Labels: `result` ("ok" | "error").
pub fn workers_spawned() -> Counter<u64> {
    meter()
        .u64_counter("farseer.worker.spawned")
        .with_description("Number of capture worker spawn attempts")
        .build()
}

/// Counter: termination signals sent to workers.
/// Labels: `result` ("ok" | "error" | "stale").
pub fn workers_signalled() -> Counter<u64> {
    meter()
        .u64_counter("farseer.worker.signalled")
        .with_description("Number of capture worker termination signals")
        .build()
}

/// Counter: labels appended to the detection cache.
pub fn detections() -> Counter<u64> {
    meter()
        .u64_counter("farseer.detections")
        .with_description("Number of detected labels stored")
        .build()
}

/// Counter: event log writes.
/// Labels: `result` ("ok" | "illegal_transition").
pub fn event_log_writes() -> Counter<u64> {
    meter()
        .u64_counter("farseer.event_log.writes")
        .with_description("Number of events recorded in the durable log")
        .build()
}

/// Counter: projections written to the read store.
/// Labels: `store`.
pub fn projections_written() -> Counter<u64> {
    meter()
        .u64_counter("farseer.projections.written")
        .with_description("Number of read model writes")
        .build()
}

/// Counter: failed service loop iterations.
/// Labels: `service`.
pub fn service_failures() -> Counter<u64> {
    meter()
        .u64_counter("farseer.service.failures")
        .with_description("Number of failed service iterations")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("farseer.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
