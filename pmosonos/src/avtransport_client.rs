use std::time::Duration;

use crate::errors::BridgeError;
use crate::soap::extract_child_text;
use crate::soap_client::{expect_action_response, invoke_upnp_action};

pub const AVTRANSPORT_SERVICE_TYPE: &str = "urn:schemas-upnp-org:service:AVTransport:1";

#[derive(Debug, Clone)]
pub struct AvTransportClient {
    pub control_url: String,
    pub service_type: String,
    pub timeout: Duration,
}

/// Subset of GetPositionInfo the bridge cares about.
#[derive(Debug, Clone)]
pub struct PositionInfo {
    /// 1-based position of the current track in the device queue; 0 when
    /// nothing is loaded.
    pub track: u32,
    /// Elapsed time within the track, `HH:MM:SS` on the wire.
    pub rel_time: String,
}

impl AvTransportClient {
    pub fn new(control_url: String, timeout: Duration) -> Self {
        Self {
            control_url,
            service_type: AVTRANSPORT_SERVICE_TYPE.to_string(),
            timeout,
        }
    }

    fn invoke(&self, action: &str, args: &[(&str, &str)]) -> Result<(), BridgeError> {
        let call_result =
            invoke_upnp_action(&self.control_url, &self.service_type, action, args, self.timeout)?;
        expect_action_response(action, &call_result).map(|_| ())
    }

    /// AVTransport:1 — Play at normal speed.
    pub fn play(&self, instance_id: u32) -> Result<(), BridgeError> {
        let instance_id_str = instance_id.to_string();
        self.invoke(
            "Play",
            &[("InstanceID", instance_id_str.as_str()), ("Speed", "1")],
        )
    }

    /// AVTransport:1 — Pause.
    pub fn pause(&self, instance_id: u32) -> Result<(), BridgeError> {
        let instance_id_str = instance_id.to_string();
        self.invoke("Pause", &[("InstanceID", instance_id_str.as_str())])
    }

    /// AVTransport:1 — Stop.
    pub fn stop(&self, instance_id: u32) -> Result<(), BridgeError> {
        let instance_id_str = instance_id.to_string();
        self.invoke("Stop", &[("InstanceID", instance_id_str.as_str())])
    }

    /// AVTransport:1 — SetPlayMode (NORMAL, REPEAT_ALL, SHUFFLE, ...).
    pub fn set_play_mode(&self, instance_id: u32, mode: &str) -> Result<(), BridgeError> {
        let instance_id_str = instance_id.to_string();
        self.invoke(
            "SetPlayMode",
            &[
                ("InstanceID", instance_id_str.as_str()),
                ("NewPlayMode", mode),
            ],
        )
    }

    /// AVTransport:1 — SetAVTransportURI.
    pub fn set_av_transport_uri(
        &self,
        instance_id: u32,
        uri: &str,
        metadata: &str,
    ) -> Result<(), BridgeError> {
        let instance_id_str = instance_id.to_string();
        self.invoke(
            "SetAVTransportURI",
            &[
                ("InstanceID", instance_id_str.as_str()),
                ("CurrentURI", uri),
                ("CurrentURIMetaData", metadata),
            ],
        )
    }

    /// AVTransport:1 — Seek to a queue slot. `target_track` is 1-based.
    pub fn seek_track(&self, instance_id: u32, target_track: u32) -> Result<(), BridgeError> {
        let instance_id_str = instance_id.to_string();
        let target = target_track.to_string();
        self.invoke(
            "Seek",
            &[
                ("InstanceID", instance_id_str.as_str()),
                ("Unit", "TRACK_NR"),
                ("Target", target.as_str()),
            ],
        )
    }

    /// AVTransport:1 — AddURIToQueue, appended at the end.
    ///
    /// Returns the 1-based slot the item landed in
    /// (`FirstTrackNumberEnqueued`).
    pub fn add_uri_to_queue(&self, instance_id: u32, uri: &str) -> Result<u32, BridgeError> {
        let instance_id_str = instance_id.to_string();
        let args = [
            ("InstanceID", instance_id_str.as_str()),
            ("EnqueuedURI", uri),
            ("EnqueuedURIMetaData", ""),
            ("DesiredFirstTrackNumberEnqueued", "0"),
            ("EnqueueAsNext", "0"),
        ];

        let call_result = invoke_upnp_action(
            &self.control_url,
            &self.service_type,
            "AddURIToQueue",
            &args,
            self.timeout,
        )?;
        let response = expect_action_response("AddURIToQueue", &call_result)?;

        let text = extract_child_text(response, "FirstTrackNumberEnqueued")
            .ok_or_else(|| BridgeError::missing_return_value("FirstTrackNumberEnqueued"))?;
        text.parse::<u32>()
            .map_err(|_| BridgeError::bad_return_value("FirstTrackNumberEnqueued", &text))
    }

    /// AVTransport:1 — RemoveTrackFromQueue. `queue_index` is 0-based; the
    /// wire object ID (`Q:0/n`) is 1-based.
    pub fn remove_from_queue(&self, instance_id: u32, queue_index: u32) -> Result<(), BridgeError> {
        let instance_id_str = instance_id.to_string();
        let object_id = format!("Q:0/{}", queue_index + 1);
        self.invoke(
            "RemoveTrackFromQueue",
            &[
                ("InstanceID", instance_id_str.as_str()),
                ("ObjectID", object_id.as_str()),
                ("UpdateID", "0"),
            ],
        )
    }

    /// AVTransport:1 — RemoveAllTracksFromQueue.
    pub fn clear_queue(&self, instance_id: u32) -> Result<(), BridgeError> {
        let instance_id_str = instance_id.to_string();
        self.invoke(
            "RemoveAllTracksFromQueue",
            &[("InstanceID", instance_id_str.as_str())],
        )
    }

    /// AVTransport:1 — GetMediaInfo; `NrTracks` is the queue length.
    pub fn queue_length(&self, instance_id: u32) -> Result<u32, BridgeError> {
        let instance_id_str = instance_id.to_string();
        let args = [("InstanceID", instance_id_str.as_str())];

        let call_result = invoke_upnp_action(
            &self.control_url,
            &self.service_type,
            "GetMediaInfo",
            &args,
            self.timeout,
        )?;
        let response = expect_action_response("GetMediaInfo", &call_result)?;

        let text = extract_child_text(response, "NrTracks")
            .ok_or_else(|| BridgeError::missing_return_value("NrTracks"))?;
        text.parse::<u32>()
            .map_err(|_| BridgeError::bad_return_value("NrTracks", &text))
    }

    /// AVTransport:1 — GetPositionInfo.
    pub fn position_info(&self, instance_id: u32) -> Result<PositionInfo, BridgeError> {
        let instance_id_str = instance_id.to_string();
        let args = [("InstanceID", instance_id_str.as_str())];

        let call_result = invoke_upnp_action(
            &self.control_url,
            &self.service_type,
            "GetPositionInfo",
            &args,
            self.timeout,
        )?;
        let response = expect_action_response("GetPositionInfo", &call_result)?;

        let track_text = extract_child_text(response, "Track")
            .ok_or_else(|| BridgeError::missing_return_value("Track"))?;
        let track = track_text
            .parse::<u32>()
            .map_err(|_| BridgeError::bad_return_value("Track", &track_text))?;

        // A stopped device reports "NOT_IMPLEMENTED" here; the position
        // parser maps anything unparseable to 0 seconds.
        let rel_time = extract_child_text(response, "RelTime").unwrap_or_default();

        Ok(PositionInfo { track, rel_time })
    }
}

/// Parses a `HH:MM:SS` positional string into elapsed seconds.
///
/// `MM:SS` is accepted too; anything else (including the `NOT_IMPLEMENTED`
/// marker some devices report while stopped) maps to 0.
pub fn parse_position_seconds(raw: &str) -> u32 {
    let parts: Vec<&str> = raw.trim().split(':').collect();
    let numbers: Option<Vec<u32>> = parts.iter().map(|p| p.parse::<u32>().ok()).collect();
    match numbers.as_deref() {
        Some([h, m, s]) => h * 3600 + m * 60 + s,
        Some([m, s]) => m * 60 + s,
        _ => 0,
    }
}
