//! Per-call handle on one Sonos zone player.
//!
//! A [`Speaker`] is constructed fresh from an IP address for every request
//! or session; control URLs are derived, never cached across calls. Stale
//! connection state therefore cannot survive a device reboot.

use std::io::BufReader;
use std::time::Duration;

use tracing::debug;
use ureq::Agent;
use xmltree::Element;

use crate::avtransport_client::{AvTransportClient, PositionInfo};
use crate::errors::BridgeError;
use crate::rendering_control_client::RenderingControlClient;

/// Every Sonos zone player exposes its UPnP surface on this port.
pub const SONOS_HTTP_PORT: u16 = 1400;

const VOLUME_CHANNEL: &str = "Master";
const INSTANCE_ID: u32 = 0;

pub struct Speaker {
    ip: String,
    avtransport: AvTransportClient,
    rendering: RenderingControlClient,
    timeout: Duration,
}

impl Speaker {
    pub fn new(ip: &str, timeout: Duration) -> Self {
        let avtransport = AvTransportClient::new(
            format!("http://{}:{}/MediaRenderer/AVTransport/Control", ip, SONOS_HTTP_PORT),
            timeout,
        );
        let rendering = RenderingControlClient::new(
            format!(
                "http://{}:{}/MediaRenderer/RenderingControl/Control",
                ip, SONOS_HTTP_PORT
            ),
            timeout,
        );
        Self {
            ip: ip.to_string(),
            avtransport,
            rendering,
            timeout,
        }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    /// GENA subscription URL of the AVTransport service.
    pub fn event_sub_url(&self) -> String {
        format!(
            "http://{}:{}/MediaRenderer/AVTransport/Event",
            self.ip, SONOS_HTTP_PORT
        )
    }

    pub fn play(&self) -> Result<(), BridgeError> {
        self.avtransport.play(INSTANCE_ID)
    }

    pub fn pause(&self) -> Result<(), BridgeError> {
        self.avtransport.pause(INSTANCE_ID)
    }

    pub fn stop(&self) -> Result<(), BridgeError> {
        self.avtransport.stop(INSTANCE_ID)
    }

    pub fn set_play_mode(&self, mode: &str) -> Result<(), BridgeError> {
        self.avtransport.set_play_mode(INSTANCE_ID, mode)
    }

    pub fn clear_queue(&self) -> Result<(), BridgeError> {
        self.avtransport.clear_queue(INSTANCE_ID)
    }

    pub fn queue_length(&self) -> Result<u32, BridgeError> {
        self.avtransport.queue_length(INSTANCE_ID)
    }

    /// Appends a URI at the end of the device queue; returns the 1-based
    /// slot it landed in.
    pub fn add_uri_to_queue(&self, uri: &str) -> Result<u32, BridgeError> {
        self.avtransport.add_uri_to_queue(INSTANCE_ID, uri)
    }

    /// Removes the item at 0-based `queue_index` from the device queue.
    pub fn remove_from_queue(&self, queue_index: u32) -> Result<(), BridgeError> {
        self.avtransport.remove_from_queue(INSTANCE_ID, queue_index)
    }

    pub fn position_info(&self) -> Result<PositionInfo, BridgeError> {
        self.avtransport.position_info(INSTANCE_ID)
    }

    /// Starts playback from the 0-based `queue_index` slot of the device's
    /// own queue.
    ///
    /// The transport must first be pointed at the queue itself
    /// (`x-rincon-queue:<uid>#0`); a device that was last playing a radio
    /// stream would otherwise ignore the seek.
    pub fn play_from_queue(&self, queue_index: u32) -> Result<(), BridgeError> {
        let uid = self.fetch_uid()?;
        let queue_uri = format!("x-rincon-queue:{}#0", uid);
        self.avtransport
            .set_av_transport_uri(INSTANCE_ID, &queue_uri, "")?;
        self.avtransport.seek_track(INSTANCE_ID, queue_index + 1)?;
        self.avtransport.play(INSTANCE_ID)
    }

    pub fn get_volume(&self) -> Result<u16, BridgeError> {
        self.rendering.get_volume(INSTANCE_ID, VOLUME_CHANNEL)
    }

    pub fn set_volume(&self, volume: u16) -> Result<(), BridgeError> {
        self.rendering.set_volume(INSTANCE_ID, VOLUME_CHANNEL, volume)
    }

    /// Fetches the device UDN (`RINCON_...`) from its description document.
    fn fetch_uid(&self) -> Result<String, BridgeError> {
        let location = format!(
            "http://{}:{}/xml/device_description.xml",
            self.ip, SONOS_HTTP_PORT
        );
        let root = fetch_description(&location, self.timeout)?;
        let uid = parse_udn(&root)
            .ok_or_else(|| BridgeError::missing_return_value("UDN"))?;
        debug!(ip = self.ip.as_str(), uid = uid.as_str(), "Resolved device UID");
        Ok(uid)
    }
}

/// Fetches and parses a UPnP description document.
pub fn fetch_description(location: &str, timeout: Duration) -> Result<Element, BridgeError> {
    let config = Agent::config_builder()
        .timeout_global(Some(timeout))
        .build();
    let agent: Agent = config.into();

    let response = agent
        .get(location)
        .call()
        .map_err(|e| BridgeError::DeviceUnreachable(location.to_string(), e.to_string()))?;
    let (_parts, body) = response.into_parts();
    let mut reader = BufReader::new(body.into_reader());
    Element::parse(&mut reader)
        .map_err(|e| BridgeError::SoapAction(format!("parse description at {}: {}", location, e)))
}

/// Extracts the bare device UDN from a description document, stripping the
/// `uuid:` prefix.
pub fn parse_udn(root: &Element) -> Option<String> {
    let device = root.get_child("device")?;
    let udn = device.get_child("UDN")?.get_text()?.trim().to_string();
    Some(udn.strip_prefix("uuid:").unwrap_or(&udn).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_derive_from_ip() {
        let speaker = Speaker::new("192.168.1.42", Duration::from_secs(5));
        assert_eq!(
            speaker.avtransport.control_url,
            "http://192.168.1.42:1400/MediaRenderer/AVTransport/Control"
        );
        assert_eq!(
            speaker.rendering.control_url,
            "http://192.168.1.42:1400/MediaRenderer/RenderingControl/Control"
        );
        assert_eq!(
            speaker.event_sub_url(),
            "http://192.168.1.42:1400/MediaRenderer/AVTransport/Event"
        );
    }

    #[test]
    fn udn_parsed_and_stripped() {
        let xml = r#"<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <friendlyName>192.168.1.42 - Sonos One</friendlyName>
    <UDN>uuid:RINCON_0004FF00AA0001400</UDN>
  </device>
</root>"#;
        let root = Element::parse(xml.as_bytes()).unwrap();
        assert_eq!(parse_udn(&root).unwrap(), "RINCON_0004FF00AA0001400");
    }
}
