//! Metric instrument factories for skillq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"skillq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for skillq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("skillq")
}

/// Counter: source records seen by population.
/// Labels: `result` ("inserted" | "duplicate" | "skipped").
pub fn tickets_populated() -> Counter<u64> {
    meter()
        .u64_counter("skillq.population.records")
        .with_description("Source records handled by population")
        .build()
}

/// Counter: items claimed by workers.
pub fn items_claimed() -> Counter<u64> {
    meter()
        .u64_counter("skillq.queue.claimed")
        .with_description("Queue items claimed")
        .build()
}

/// Counter: items reaching a terminal status.
/// Labels: `status` ("complete" | "failed"), `reason`.
pub fn item_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("skillq.queue.outcomes")
        .with_description("Queue items reaching a terminal status")
        .build()
}

/// Counter: stale claims returned to pending by the sweep.
pub fn stale_claims_recovered() -> Counter<u64> {
    meter()
        .u64_counter("skillq.queue.stale_recovered")
        .with_description("Stale claims returned to pending")
        .build()
}

/// Counter: model replies the parser rejected.
/// Labels: `kind`.
pub fn parse_failures() -> Counter<u64> {
    meter()
        .u64_counter("skillq.parser.failures")
        .with_description("Model replies rejected by the output parser")
        .build()
}

/// Histogram: model call duration in milliseconds.
/// Labels: `model`, `outcome`.
pub fn model_call_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("skillq.model.duration_ms")
        .with_description("Model call duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: LLM token usage.
/// Labels: `model`, `provider`, `direction` ("input" | "output").
pub fn llm_tokens() -> Counter<u64> {
    meter()
        .u64_counter("skillq.llm.tokens")
        .with_description("LLM token usage")
        .build()
}
