use std::time::Duration;

use crate::errors::BridgeError;
use crate::soap::extract_child_text;
use crate::soap_client::{expect_action_response, invoke_upnp_action};

pub const RENDERING_CONTROL_SERVICE_TYPE: &str =
    "urn:schemas-upnp-org:service:RenderingControl:1";

#[derive(Debug, Clone)]
pub struct RenderingControlClient {
    pub control_url: String,
    pub service_type: String,
    pub timeout: Duration,
}

impl RenderingControlClient {
    pub fn new(control_url: String, timeout: Duration) -> Self {
        Self {
            control_url,
            service_type: RENDERING_CONTROL_SERVICE_TYPE.to_string(),
            timeout,
        }
    }

    /// RenderingControl:1 — GetVolume
    pub fn get_volume(&self, instance_id: u32, channel: &str) -> Result<u16, BridgeError> {
        let instance_id_str = instance_id.to_string();
        let args = [
            ("InstanceID", instance_id_str.as_str()),
            ("Channel", channel),
        ];

        let call_result = invoke_upnp_action(
            &self.control_url,
            &self.service_type,
            "GetVolume",
            &args,
            self.timeout,
        )?;
        let response = expect_action_response("GetVolume", &call_result)?;

        let text = extract_child_text(response, "CurrentVolume")
            .ok_or_else(|| BridgeError::missing_return_value("CurrentVolume"))?;
        text.parse::<u16>()
            .map_err(|_| BridgeError::bad_return_value("CurrentVolume", &text))
    }

    /// RenderingControl:1 — SetVolume
    pub fn set_volume(
        &self,
        instance_id: u32,
        channel: &str,
        volume: u16,
    ) -> Result<(), BridgeError> {
        let instance_id_str = instance_id.to_string();
        let volume_str = volume.to_string();
        let args = [
            ("InstanceID", instance_id_str.as_str()),
            ("Channel", channel),
            ("DesiredVolume", volume_str.as_str()),
        ];

        let call_result = invoke_upnp_action(
            &self.control_url,
            &self.service_type,
            "SetVolume",
            &args,
            self.timeout,
        )?;
        expect_action_response("SetVolume", &call_result).map(|_| ())
    }
}
