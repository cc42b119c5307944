//! Per-client streaming session.
//!
//! A session pumps transport events from an event source (the GENA
//! subscription), classifies them into transitions and pushes each
//! transition to the connected client. When the client goes away, the
//! event source fails, or a push fails, the session tears down: stop the
//! speaker, release the subscription, close the client channel. Teardown
//! runs at most once no matter which path triggered it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::classifier::{SessionState, classify};
use crate::errors::BridgeError;
use crate::model::{TransitionPayload, TransportEvent};
use crate::tracker::QueuePositionTracker;

const POLL_WAIT: Duration = Duration::from_secs(1);

/// Where a session is in its lifecycle. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Subscribed,
    Streaming,
    Closing,
    Closed,
}

/// Source of transport events for one session.
pub trait EventSource {
    /// Waits up to `wait` for the next event; `Ok(None)` means the window
    /// elapsed quietly.
    fn next_event(&mut self, wait: Duration) -> Result<Option<TransportEvent>, BridgeError>;

    /// Releases the underlying subscription. Must be idempotent.
    fn release(&mut self);
}

/// The client side of a session: transition delivery and liveness.
pub trait ClientChannel {
    fn send_transition(&mut self, payload: &TransitionPayload) -> Result<(), BridgeError>;

    /// True once the client has disconnected; checked every pump iteration.
    fn is_closed(&self) -> bool;

    /// Closes the channel toward the client. Must be idempotent.
    fn close(&mut self);
}

/// Stops playback on the speaker when the session ends.
pub trait TransportHalt {
    fn halt(&mut self) -> Result<(), BridgeError>;
}

impl EventSource for crate::subscription::Subscription {
    fn next_event(&mut self, wait: Duration) -> Result<Option<TransportEvent>, BridgeError> {
        self.poll(wait)
    }

    fn release(&mut self) {
        crate::subscription::Subscription::release(self)
    }
}

impl TransportHalt for crate::speaker::Speaker {
    fn halt(&mut self) -> Result<(), BridgeError> {
        self.stop()
    }
}

pub struct StreamingSession<E, C, H> {
    source: E,
    channel: C,
    halt: H,
    tracker: Arc<QueuePositionTracker>,
    state: SessionState,
    phase: SessionPhase,
}

impl<E, C, H> StreamingSession<E, C, H>
where
    E: EventSource,
    C: ClientChannel,
    H: TransportHalt,
{
    /// Builds a session around an already-established subscription.
    pub fn new(source: E, channel: C, halt: H, tracker: Arc<QueuePositionTracker>) -> Self {
        Self {
            source,
            channel,
            halt,
            tracker,
            state: SessionState::new(),
            phase: SessionPhase::Subscribed,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Runs the pump loop until the session ends, then tears down.
    pub fn run(&mut self) {
        self.phase = SessionPhase::Streaming;

        'pump: loop {
            if self.channel.is_closed() {
                debug!("Client disconnected, ending session");
                break;
            }

            let event = match self.source.next_event(POLL_WAIT) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(err) => {
                    warn!("Event source failed: {}", err);
                    break;
                }
            };

            for transition in classify(&event, &mut self.state, &self.tracker) {
                let payload = transition.payload();
                if let Err(err) = self.channel.send_transition(&payload) {
                    debug!("Client send failed, ending session: {}", err);
                    break 'pump;
                }
            }
        }

        self.close();
    }

    /// Tears the session down. The first call stops the speaker, releases
    /// the subscription and closes the client channel; later calls do
    /// nothing.
    pub fn close(&mut self) {
        if matches!(self.phase, SessionPhase::Closing | SessionPhase::Closed) {
            return;
        }
        self.phase = SessionPhase::Closing;

        if let Err(err) = self.halt.halt() {
            warn!("Failed to stop playback on session close: {}", err);
        }
        self.source.release();
        self.channel.close();

        self.phase = SessionPhase::Closed;
        debug!("Session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedSource {
        script: VecDeque<Result<Option<TransportEvent>, BridgeError>>,
        releases: u32,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Option<TransportEvent>, BridgeError>>) -> Self {
            Self {
                script: script.into(),
                releases: 0,
            }
        }
    }

    impl EventSource for ScriptedSource {
        fn next_event(
            &mut self,
            _wait: Duration,
        ) -> Result<Option<TransportEvent>, BridgeError> {
            self.script
                .pop_front()
                .unwrap_or_else(|| Err(BridgeError::Subscription("script exhausted".into())))
        }

        fn release(&mut self) {
            self.releases += 1;
        }
    }

    struct RecordingChannel {
        sent: Vec<String>,
        closed_after: Option<usize>,
        polls: usize,
        closes: u32,
        fail_sends: bool,
    }

    impl RecordingChannel {
        fn new() -> Self {
            Self {
                sent: Vec::new(),
                closed_after: None,
                polls: 0,
                closes: 0,
                fail_sends: false,
            }
        }

        fn closing_after(mut self, polls: usize) -> Self {
            self.closed_after = Some(polls);
            self
        }
    }

    // is_closed counts liveness polls, so the mock lives in a RefCell.
    impl ClientChannel for std::cell::RefCell<RecordingChannel> {
        fn send_transition(&mut self, payload: &TransitionPayload) -> Result<(), BridgeError> {
            let inner = self.get_mut();
            if inner.fail_sends {
                return Err(BridgeError::Subscription("client gone".into()));
            }
            inner.sent.push(payload.state.clone());
            Ok(())
        }

        fn is_closed(&self) -> bool {
            let mut inner = self.borrow_mut();
            inner.polls += 1;
            match inner.closed_after {
                Some(after) => inner.polls > after,
                None => false,
            }
        }

        fn close(&mut self) {
            self.get_mut().closes += 1;
        }
    }

    struct CountingHalt {
        halts: u32,
        fail: bool,
    }

    impl TransportHalt for CountingHalt {
        fn halt(&mut self) -> Result<(), BridgeError> {
            self.halts += 1;
            if self.fail {
                Err(BridgeError::unreachable("10.0.0.1", "stop refused"))
            } else {
                Ok(())
            }
        }
    }

    fn event(state: &str, track: u32) -> TransportEvent {
        TransportEvent {
            transport_state: Some(state.to_string()),
            current_track: Some(track),
        }
    }

    #[test]
    fn advance_precedes_state_in_delivery() {
        let tracker = Arc::new(QueuePositionTracker::new());
        tracker.set_last(2);
        // Track 4 maps to queue index 3, past the tracker's 2.
        let source = ScriptedSource::new(vec![Ok(Some(event("PLAYING", 4)))]);
        let channel = std::cell::RefCell::new(RecordingChannel::new().closing_after(1));
        let halt = CountingHalt {
            halts: 0,
            fail: false,
        };

        let mut session = StreamingSession::new(source, channel, halt, tracker);
        session.run();

        assert_eq!(session.channel.borrow().sent, vec!["advance", "PLAYING"]);
        assert_eq!(session.phase(), SessionPhase::Closed);
    }

    #[test]
    fn teardown_runs_once_on_client_disconnect() {
        let tracker = Arc::new(QueuePositionTracker::new());
        let source = ScriptedSource::new(vec![Ok(None), Ok(None), Ok(None)]);
        let channel = std::cell::RefCell::new(RecordingChannel::new().closing_after(2));
        let halt = CountingHalt {
            halts: 0,
            fail: false,
        };

        let mut session = StreamingSession::new(source, channel, halt, tracker);
        session.run();
        // A second close must be a no-op.
        session.close();

        assert_eq!(session.halt.halts, 1);
        assert_eq!(session.source.releases, 1);
        assert_eq!(session.channel.borrow().closes, 1);
        assert_eq!(session.phase(), SessionPhase::Closed);
    }

    #[test]
    fn event_source_failure_tears_down() {
        let tracker = Arc::new(QueuePositionTracker::new());
        let source = ScriptedSource::new(vec![Err(BridgeError::Subscription(
            "renewal failed".into(),
        ))]);
        let channel = std::cell::RefCell::new(RecordingChannel::new());
        let halt = CountingHalt {
            halts: 0,
            fail: false,
        };

        let mut session = StreamingSession::new(source, channel, halt, tracker);
        session.run();

        assert_eq!(session.halt.halts, 1);
        assert_eq!(session.source.releases, 1);
        assert_eq!(session.channel.borrow().closes, 1);
    }

    #[test]
    fn send_failure_tears_down() {
        let tracker = Arc::new(QueuePositionTracker::new());
        let source = ScriptedSource::new(vec![Ok(Some(event("PLAYING", 1)))]);
        let mut inner = RecordingChannel::new();
        inner.fail_sends = true;
        let channel = std::cell::RefCell::new(inner);
        let halt = CountingHalt {
            halts: 0,
            fail: false,
        };

        let mut session = StreamingSession::new(source, channel, halt, tracker);
        session.run();

        assert!(session.channel.borrow().sent.is_empty());
        assert_eq!(session.phase(), SessionPhase::Closed);
        assert_eq!(session.source.releases, 1);
    }

    #[test]
    fn uninformative_event_keeps_session_alive() {
        let tracker = Arc::new(QueuePositionTracker::new());
        let source = ScriptedSource::new(vec![
            Ok(Some(TransportEvent::default())),
            Ok(Some(event("PLAYING", 1))),
        ]);
        let channel = std::cell::RefCell::new(RecordingChannel::new().closing_after(2));
        let halt = CountingHalt {
            halts: 0,
            fail: false,
        };

        let mut session = StreamingSession::new(source, channel, halt, tracker);
        session.run();

        assert_eq!(session.channel.borrow().sent, vec!["PLAYING"]);
    }

    #[test]
    fn halt_failure_still_completes_teardown() {
        let tracker = Arc::new(QueuePositionTracker::new());
        let source = ScriptedSource::new(vec![]);
        let channel = std::cell::RefCell::new(RecordingChannel::new().closing_after(0));
        let halt = CountingHalt {
            halts: 0,
            fail: true,
        };

        let mut session = StreamingSession::new(source, channel, halt, tracker);
        session.run();

        assert_eq!(session.source.releases, 1);
        assert_eq!(session.channel.borrow().closes, 1);
        assert_eq!(session.phase(), SessionPhase::Closed);
    }
}
