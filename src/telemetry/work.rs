//! Ticket processing span helpers.

use tracing::Span;

use crate::model::{ItemId, Status};

/// Start a span covering one queue item inside a worker.
pub fn start_item_span(worker_id: &str, item: ItemId, source_ticket_id: i64) -> Span {
    tracing::info_span!(
        "ticket.process",
        "worker.id" = worker_id,
        "item.id" = item.0,
        "ticket.source_id" = source_ticket_id,
        "item.attempts" = tracing::field::Empty,
    )
}

/// Record a status transition event on the given span.
pub fn record_state_transition(span: &Span, from: Status, to: Status) {
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "state_transition");
    });
}
