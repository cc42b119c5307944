pub mod api;
pub mod avtransport_client;
pub mod classifier;
pub mod discovery;
pub mod errors;
pub mod model;
pub mod rendering_control_client;
pub mod session;
pub mod soap;
pub mod soap_client;
pub mod speaker;
pub mod subscription;
pub mod tracker;

pub use api::{AppState, router};
pub use avtransport_client::{AvTransportClient, PositionInfo};
pub use classifier::{SessionState, classify};
pub use errors::BridgeError;
pub use model::{SpeakerInfo, Transition, TransitionPayload, TransportEvent};
pub use rendering_control_client::RenderingControlClient;
pub use session::{ClientChannel, EventSource, SessionPhase, StreamingSession, TransportHalt};
pub use soap_client::invoke_upnp_action;
pub use speaker::Speaker;
pub use subscription::Subscription;
pub use tracker::QueuePositionTracker;
