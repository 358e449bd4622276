//! Event handling span helpers.
//!
//! Provides span creation and state-transition recording for events
//! flowing through the services.

use tracing::Span;

use crate::model::{Event, LifecycleState};

/// Start a span for handling one event.
///
/// The `event.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_event_span(service: &str, event: &Event) -> Span {
    tracing::info_span!(
        "event.handle",
        "event.service" = service,
        "event.kind" = %event.event,
        request_uuid = %event.request_uuid,
        "event.state" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
///
/// `from` is `None` when no earlier state is known for the request.
pub fn record_state_transition(span: &Span, from: Option<LifecycleState>, to: LifecycleState) {
    span.record("event.state", to.as_str());
    span.in_scope(|| {
        tracing::info!(
            from = from.map(LifecycleState::as_str).unwrap_or("none"),
            to = to.as_str(),
            "state_transition"
        );
    });
}
