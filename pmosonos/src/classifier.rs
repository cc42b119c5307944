//! Classification of raw AVTransport events into client-facing transitions.
//!
//! The feed delivers redundant and unrelated-variable events; only two fields
//! are tracked. An event produces at most two transitions, always in
//! advance-then-state order.

use crate::model::{TransportEvent, Transition};
use crate::tracker::QueuePositionTracker;

/// Per-session classification state.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Last transport state pushed to this client; empty until the first
    /// state-bearing event, so the initial state always emits.
    pub last_transport_state: String,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Maps one raw event to zero, one or two transitions.
///
/// Advance detection: the device's 1-based `current_track` is normalized to
/// the tracker's 0-based numbering; moving past the slot the bridge last
/// explicitly queued emits [`Transition::Advance`] and bumps the tracker so
/// an identical follow-up event stays silent. A missing or unparseable track
/// field means no advance signal; state detection still runs.
pub fn classify(
    event: &TransportEvent,
    session: &mut SessionState,
    tracker: &QueuePositionTracker,
) -> Vec<Transition> {
    let mut transitions = Vec::new();

    if let Some(current_track) = event.current_track {
        let queue_index = current_track.saturating_sub(1);
        if queue_index > tracker.get_last() {
            transitions.push(Transition::Advance);
            tracker.set_last(queue_index);
        }
    }

    if let Some(state) = event.transport_state.as_deref() {
        if state != session.last_transport_state {
            session.last_transport_state = state.to_string();
            transitions.push(Transition::State(state.to_string()));
        }
    }

    transitions
}
