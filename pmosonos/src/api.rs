//! HTTP and WebSocket surface of the bridge.
//!
//! Request/response command relay plus the per-client event stream. All
//! device I/O is blocking SOAP, so handlers push it through
//! `spawn_blocking` and bound it with a timeout instead of stalling the
//! runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::discovery;
use crate::errors::BridgeError;
use crate::model::{SpeakerInfo, TransitionPayload};
use crate::session::{ClientChannel, StreamingSession};
use crate::speaker::Speaker;
use crate::subscription::Subscription;
use crate::tracker::QueuePositionTracker;

// Timeouts for simple commands (play/pause/stop)
const TRANSPORT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

// Timeouts for volume commands (faster than transport)
const VOLUME_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

// Timeout for queue operations (several SOAP calls in sequence)
const QUEUE_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

// Extra budget on top of the SSDP scan window for description fetches
const DISCOVERY_SLACK: Duration = Duration::from_secs(5);

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub tracker: Arc<QueuePositionTracker>,
    pub scan_timeout: Duration,
    pub soap_timeout: Duration,
    /// Flipped once at process shutdown; every streaming session treats it
    /// as a disconnect and runs its teardown, which lets graceful shutdown
    /// complete instead of waiting on open sockets.
    pub shutdown: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(scan_timeout: Duration, soap_timeout: Duration) -> Self {
        Self {
            tracker: Arc::new(QueuePositionTracker::new()),
            scan_timeout,
            soap_timeout,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SetCurrentRequest {
    pub uri: Option<String>,
    pub next_uri: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SetNextRequest {
    pub uri: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SetVolumeRequest {
    pub volume: Option<u16>,
}

#[derive(Debug, Serialize)]
pub struct PositionResponse {
    pub seconds: u32,
}

#[derive(Debug, Serialize)]
pub struct VolumeResponse {
    pub volume: u16,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/getDevices", post(get_devices))
        .route("/{ip}/stop", post(stop_device))
        .route("/{ip}/setCurrent", post(set_current))
        .route("/{ip}/setNext", post(set_next))
        .route("/{ip}/getPosition", post(get_position))
        .route("/{ip}/play", post(play_device))
        .route("/{ip}/pause", post(pause_device))
        .route("/{ip}/getVolume", post(get_volume))
        .route("/{ip}/setVolume", post(set_volume))
        .route("/{ip}/events", get(device_events))
        .with_state(state)
}

fn error_status(err: &BridgeError) -> StatusCode {
    match err {
        BridgeError::MissingField(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn error_reply(err: BridgeError) -> ApiError {
    (
        error_status(&err),
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

fn require<T>(field: Option<T>, name: &'static str) -> Result<T, BridgeError> {
    field.ok_or(BridgeError::MissingField(name))
}

/// Runs a blocking device operation with a hard deadline.
async fn run_device_task<T, F>(op: &'static str, deadline: Duration, task: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BridgeError> + Send + 'static,
{
    time::timeout(deadline, tokio::task::spawn_blocking(task))
        .await
        .map_err(|_| {
            warn!("{} exceeded {:?}", op, deadline);
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(ErrorResponse {
                    error: format!("{} timed out after {}s", op, deadline.as_secs()),
                }),
            )
        })?
        .map_err(|e| {
            warn!("Task join error during {}: {}", op, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: format!("Internal task error: {}", e),
                }),
            )
        })?
        .map_err(|e| {
            warn!("{} failed: {}", op, e);
            error_reply(e)
        })
}

async fn ping() -> &'static str {
    "PMOSonosBridge"
}

/// POST /getDevices - scan the network for Sonos zone players
async fn get_devices(State(state): State<AppState>) -> Result<Json<Vec<SpeakerInfo>>, ApiError> {
    let scan_timeout = state.scan_timeout;
    let soap_timeout = state.soap_timeout;
    let devices = run_device_task("Device scan", scan_timeout + DISCOVERY_SLACK, move || {
        discovery::scan(scan_timeout, soap_timeout)
    })
    .await?;

    debug!(count = devices.len(), "Device scan completed");
    Ok(Json(devices))
}

/// POST /{ip}/stop - stop playback and drop the device queue
async fn stop_device(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let soap_timeout = state.soap_timeout;
    run_device_task("Stop command", TRANSPORT_COMMAND_TIMEOUT, move || {
        let speaker = Speaker::new(&ip, soap_timeout);
        speaker.stop()?;
        speaker.clear_queue()
    })
    .await?;

    Ok(Json(SuccessResponse {
        message: "Playback stopped and queue cleared".to_string(),
    }))
}

/// POST /{ip}/setCurrent - enqueue a track (and optionally its successor)
/// and start playing it from the device queue
async fn set_current(
    State(state): State<AppState>,
    Path(ip): Path<String>,
    body: Option<Json<SetCurrentRequest>>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let Json(req) = body.unwrap_or_default();
    let uri = require(req.uri, "uri").map_err(error_reply)?;
    let next_uri = req.next_uri;

    let tracker = Arc::clone(&state.tracker);
    let soap_timeout = state.soap_timeout;
    run_device_task("SetCurrent command", QUEUE_COMMAND_TIMEOUT, move || {
        let speaker = Speaker::new(&ip, soap_timeout);
        enqueue_and_play(&speaker, &tracker, &uri, next_uri.as_deref())
    })
    .await?;

    Ok(Json(SuccessResponse {
        message: "Track playing".to_string(),
    }))
}

/// Queue operations needed to start playback of a newly enqueued track.
trait QueueDevice {
    fn set_play_mode(&self, mode: &str) -> Result<(), BridgeError>;
    fn queue_length(&self) -> Result<u32, BridgeError>;
    fn add_uri_to_queue(&self, uri: &str) -> Result<u32, BridgeError>;
    fn play_from_queue(&self, queue_index: u32) -> Result<(), BridgeError>;
}

impl QueueDevice for Speaker {
    fn set_play_mode(&self, mode: &str) -> Result<(), BridgeError> {
        Speaker::set_play_mode(self, mode)
    }

    fn queue_length(&self) -> Result<u32, BridgeError> {
        Speaker::queue_length(self)
    }

    fn add_uri_to_queue(&self, uri: &str) -> Result<u32, BridgeError> {
        Speaker::add_uri_to_queue(self, uri)
    }

    fn play_from_queue(&self, queue_index: u32) -> Result<(), BridgeError> {
        Speaker::play_from_queue(self, queue_index)
    }
}

fn enqueue_and_play(
    device: &impl QueueDevice,
    tracker: &QueuePositionTracker,
    uri: &str,
    next_uri: Option<&str>,
) -> Result<(), BridgeError> {
    device.set_play_mode("NORMAL")?;

    // The new track lands at the end of the queue; remember that slot
    // before enqueueing so the classifier has a baseline.
    let queue_len = device.queue_length()?;
    tracker.set_last(queue_len);

    device.add_uri_to_queue(uri)?;
    if let Some(next_uri) = next_uri.filter(|u| !u.is_empty()) {
        device.add_uri_to_queue(next_uri)?;
    }
    device.play_from_queue(queue_len)
}

/// POST /{ip}/setNext - replace whatever follows the current track
async fn set_next(
    State(state): State<AppState>,
    Path(ip): Path<String>,
    body: Option<Json<SetNextRequest>>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let Json(req) = body.unwrap_or_default();
    let uri = req.uri;

    let soap_timeout = state.soap_timeout;
    run_device_task("SetNext command", QUEUE_COMMAND_TIMEOUT, move || {
        let speaker = Speaker::new(&ip, soap_timeout);
        let position = speaker.position_info()?;
        let current_index = position.track.saturating_sub(1);
        let queue_len = speaker.queue_length()?;

        if current_index + 1 < queue_len {
            speaker.remove_from_queue(current_index + 1)?;
        }
        if let Some(uri) = uri.filter(|u| !u.is_empty()) {
            speaker.add_uri_to_queue(&uri)?;
        }
        Ok(())
    })
    .await?;

    Ok(Json(SuccessResponse {
        message: "Next track updated".to_string(),
    }))
}

/// POST /{ip}/getPosition - playback position within the current track
async fn get_position(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Json<PositionResponse>, ApiError> {
    let soap_timeout = state.soap_timeout;
    let seconds = run_device_task("GetPosition command", TRANSPORT_COMMAND_TIMEOUT, move || {
        let speaker = Speaker::new(&ip, soap_timeout);
        let position = speaker.position_info()?;
        Ok(crate::avtransport_client::parse_position_seconds(
            &position.rel_time,
        ))
    })
    .await?;

    Ok(Json(PositionResponse { seconds }))
}

/// POST /{ip}/play
async fn play_device(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let soap_timeout = state.soap_timeout;
    run_device_task("Play command", TRANSPORT_COMMAND_TIMEOUT, move || {
        Speaker::new(&ip, soap_timeout).play()
    })
    .await?;

    Ok(Json(SuccessResponse {
        message: "Playback started".to_string(),
    }))
}

/// POST /{ip}/pause
async fn pause_device(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let soap_timeout = state.soap_timeout;
    run_device_task("Pause command", TRANSPORT_COMMAND_TIMEOUT, move || {
        Speaker::new(&ip, soap_timeout).pause()
    })
    .await?;

    Ok(Json(SuccessResponse {
        message: "Playback paused".to_string(),
    }))
}

/// POST /{ip}/getVolume
async fn get_volume(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Json<VolumeResponse>, ApiError> {
    let soap_timeout = state.soap_timeout;
    let volume = run_device_task("GetVolume command", VOLUME_COMMAND_TIMEOUT, move || {
        Speaker::new(&ip, soap_timeout).get_volume()
    })
    .await?;

    Ok(Json(VolumeResponse { volume }))
}

/// POST /{ip}/setVolume
async fn set_volume(
    State(state): State<AppState>,
    Path(ip): Path<String>,
    body: Option<Json<SetVolumeRequest>>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let Json(req) = body.unwrap_or_default();
    let volume = require(req.volume, "volume").map_err(error_reply)?;

    let soap_timeout = state.soap_timeout;
    run_device_task("SetVolume command", VOLUME_COMMAND_TIMEOUT, move || {
        Speaker::new(&ip, soap_timeout).set_volume(volume)
    })
    .await?;

    Ok(Json(SuccessResponse {
        message: format!("Volume set to {}", volume),
    }))
}

/// GET /{ip}/events - per-client transport event stream
///
/// The GENA subscription is established before the upgrade is accepted, so
/// a subscription failure answers the HTTP request with an error and never
/// opens a client channel.
async fn device_events(
    State(state): State<AppState>,
    Path(ip): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let soap_timeout = state.soap_timeout;
    let subscribe_ip = ip.clone();
    let subscribed = tokio::task::spawn_blocking(move || {
        let speaker = Speaker::new(&subscribe_ip, soap_timeout);
        Subscription::subscribe(&speaker, soap_timeout).map(|sub| (speaker, sub))
    })
    .await;

    match subscribed {
        Ok(Ok((speaker, subscription))) => {
            let session_id = Uuid::new_v4();
            info!(ip = ip.as_str(), session = %session_id, "Event stream opening");
            let tracker = Arc::clone(&state.tracker);
            let shutdown = Arc::clone(&state.shutdown);
            ws.on_upgrade(move |socket| {
                run_session(socket, session_id, speaker, subscription, tracker, shutdown)
            })
        }
        Ok(Err(err)) => {
            warn!(ip = ip.as_str(), "Event subscription failed: {}", err);
            error_reply(err).into_response()
        }
        Err(err) => {
            warn!("Task join error during subscribe: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: format!("Internal task error: {}", err),
                }),
            )
                .into_response()
        }
    }
}

/// Bridges one WebSocket to a blocking [`StreamingSession`].
///
/// The async half forwards outbound JSON frames and watches client frames
/// only for disconnect; the session itself runs on a blocking task.
async fn run_session(
    socket: WebSocket,
    session_id: Uuid,
    speaker: Speaker,
    subscription: Subscription,
    tracker: Arc<QueuePositionTracker>,
    shutdown: Arc<AtomicBool>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let closed = Arc::new(AtomicBool::new(false));

    let forward = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let drain_closed = Arc::clone(&closed);
    let drain = tokio::spawn(async move {
        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(Message::Close(_)) | Err(_) => break,
                // Inbound frames are only a liveness signal.
                Ok(_) => continue,
            }
        }
        drain_closed.store(true, Ordering::SeqCst);
    });

    let channel = WsChannel {
        out_tx: Some(out_tx),
        closed,
        shutdown,
    };
    let pump = tokio::task::spawn_blocking(move || {
        let mut session = StreamingSession::new(subscription, channel, speaker, tracker);
        session.run();
    });

    if let Err(err) = pump.await {
        warn!(session = %session_id, "Session task failed: {}", err);
    }
    drain.abort();
    let _ = forward.await;
    debug!(session = %session_id, "Event stream closed");
}

struct WsChannel {
    out_tx: Option<tokio::sync::mpsc::UnboundedSender<String>>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl ClientChannel for WsChannel {
    fn send_transition(&mut self, payload: &TransitionPayload) -> Result<(), BridgeError> {
        let frame = serde_json::to_string(payload)
            .map_err(|e| BridgeError::Session(format!("serialize transition: {}", e)))?;
        let tx = self
            .out_tx
            .as_ref()
            .ok_or_else(|| BridgeError::Session("client channel closed".into()))?;
        tx.send(frame)
            .map_err(|_| BridgeError::Session("client gone".into()))
    }

    fn is_closed(&self) -> bool {
        // Process shutdown counts as a disconnect so sessions tear down
        // and graceful shutdown is not held open by streaming clients.
        self.shutdown.load(Ordering::SeqCst)
            || self.closed.load(Ordering::SeqCst)
            || self.out_tx.as_ref().map(|tx| tx.is_closed()).unwrap_or(true)
    }

    fn close(&mut self) {
        // Dropping the sender ends the forward task, which closes the socket.
        self.out_tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct ScriptedQueue {
        queue_len: u32,
        tracker: Arc<QueuePositionTracker>,
        ops: RefCell<Vec<String>>,
    }

    impl ScriptedQueue {
        fn new(queue_len: u32, tracker: Arc<QueuePositionTracker>) -> Self {
            Self {
                queue_len,
                tracker,
                ops: RefCell::new(Vec::new()),
            }
        }
    }

    impl QueueDevice for ScriptedQueue {
        fn set_play_mode(&self, mode: &str) -> Result<(), BridgeError> {
            self.ops.borrow_mut().push(format!("mode:{}", mode));
            Ok(())
        }

        fn queue_length(&self) -> Result<u32, BridgeError> {
            Ok(self.queue_len)
        }

        fn add_uri_to_queue(&self, uri: &str) -> Result<u32, BridgeError> {
            // Record the tracker value visible at enqueue time.
            self.ops
                .borrow_mut()
                .push(format!("add:{}@{}", uri, self.tracker.get_last()));
            Ok(self.queue_len + 1)
        }

        fn play_from_queue(&self, queue_index: u32) -> Result<(), BridgeError> {
            self.ops.borrow_mut().push(format!("play:{}", queue_index));
            Ok(())
        }
    }

    #[test]
    fn tracker_is_set_before_the_track_is_enqueued() {
        let tracker = Arc::new(QueuePositionTracker::new());
        let device = ScriptedQueue::new(7, Arc::clone(&tracker));

        enqueue_and_play(&device, &tracker, "x-file:a.flac", None).unwrap();

        assert_eq!(tracker.get_last(), 7);
        assert_eq!(
            device.ops.into_inner(),
            vec!["mode:NORMAL", "add:x-file:a.flac@7", "play:7"]
        );
    }

    #[test]
    fn successor_is_enqueued_after_the_current_track() {
        let tracker = Arc::new(QueuePositionTracker::new());
        let device = ScriptedQueue::new(2, Arc::clone(&tracker));

        enqueue_and_play(&device, &tracker, "x-file:a.flac", Some("x-file:b.flac")).unwrap();

        assert_eq!(
            device.ops.into_inner(),
            vec![
                "mode:NORMAL",
                "add:x-file:a.flac@2",
                "add:x-file:b.flac@2",
                "play:2"
            ]
        );
    }

    #[test]
    fn empty_successor_uri_is_skipped() {
        let tracker = Arc::new(QueuePositionTracker::new());
        let device = ScriptedQueue::new(0, Arc::clone(&tracker));

        enqueue_and_play(&device, &tracker, "x-file:a.flac", Some("")).unwrap();

        assert_eq!(
            device.ops.into_inner(),
            vec!["mode:NORMAL", "add:x-file:a.flac@0", "play:0"]
        );
    }

    #[test]
    fn process_shutdown_closes_a_live_channel() {
        let (out_tx, _out_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let channel = WsChannel {
            out_tx: Some(out_tx),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::clone(&shutdown),
        };

        assert!(!channel.is_closed());
        shutdown.store(true, Ordering::SeqCst);
        assert!(channel.is_closed());
    }

    #[test]
    fn missing_field_maps_to_bad_request() {
        let err = require(None::<String>, "uri").unwrap_err();
        assert!(matches!(err, BridgeError::MissingField("uri")));
        assert_eq!(error_status(&err), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn device_errors_map_to_bad_gateway() {
        assert_eq!(
            error_status(&BridgeError::unreachable("10.0.0.9", "timeout")),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            error_status(&BridgeError::Subscription("refused".into())),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn request_bodies_tolerate_missing_fields() {
        let req: SetCurrentRequest = serde_json::from_str(r#"{"uri": "x-file:a.flac"}"#).unwrap();
        assert_eq!(req.uri.as_deref(), Some("x-file:a.flac"));
        assert_eq!(req.next_uri, None);

        let req: SetVolumeRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.volume, None);
    }
}
