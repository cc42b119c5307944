use serde::Serialize;

/// A playback device found during discovery.
#[derive(Debug, Clone, Serialize)]
pub struct SpeakerInfo {
    pub name: String,
    pub ip_addr: String,
}

/// Raw transport event parsed from an AVTransport GENA notification.
///
/// Either field may be absent: the event feed also carries variables we do
/// not track, and malformed payloads must not kill a session. `current_track`
/// is the device's own 1-based queue position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportEvent {
    pub transport_state: Option<String>,
    pub current_track: Option<u32>,
}

/// Client-facing transition derived from raw transport events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The device progressed past the queue slot the bridge last started.
    Advance,
    /// The transport state changed to the carried value.
    State(String),
}

/// Wire shape of a transition: `{"state": "advance"}` or
/// `{"state": "<TRANSPORT_STATE>"}`.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionPayload {
    pub state: String,
}

impl Transition {
    pub fn payload(&self) -> TransitionPayload {
        let state = match self {
            Transition::Advance => "advance".to_string(),
            Transition::State(s) => s.clone(),
        };
        TransitionPayload { state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_serializes_to_literal_advance() {
        let json = serde_json::to_string(&Transition::Advance.payload()).unwrap();
        assert_eq!(json, r#"{"state":"advance"}"#);
    }

    #[test]
    fn state_serializes_raw_transport_token() {
        let json =
            serde_json::to_string(&Transition::State("PAUSED_PLAYBACK".into()).payload()).unwrap();
        assert_eq!(json, r#"{"state":"PAUSED_PLAYBACK"}"#);
    }
}
