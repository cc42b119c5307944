//! SSDP discovery of Sonos zone players.
//!
//! The bridge acts as a control point: it sends an `M-SEARCH` from an
//! ephemeral UDP port and collects unicast `HTTP/1.1 200` replies until the
//! scan deadline. It must NOT bind port 1900 — that port belongs to devices
//! answering searches, and sharing it would make replies land randomly in
//! the wrong socket.
//!
//! Devices are scanned fresh on every call; there is no device cache.

use std::collections::{HashMap, HashSet};
use std::net::UdpSocket;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::errors::BridgeError;
use crate::model::SpeakerInfo;
use crate::soap::extract_child_text;
use crate::speaker::fetch_description;

const SSDP_MULTICAST_ADDR: &str = "239.255.255.250";
const SSDP_PORT: u16 = 1900;
const ZONE_PLAYER_ST: &str = "urn:schemas-upnp-org:device:ZonePlayer:1";
const RECV_SLICE: Duration = Duration::from_millis(250);

/// One parsed `M-SEARCH` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsdpReply {
    pub usn: String,
    pub st: String,
    pub location: String,
}

/// Scans the local network for Sonos devices.
///
/// `scan_timeout` bounds the whole SSDP collection phase; `http_timeout`
/// bounds each description fetch used to resolve the room name.
pub fn scan(
    scan_timeout: Duration,
    http_timeout: Duration,
) -> Result<Vec<SpeakerInfo>, BridgeError> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .map_err(|e| BridgeError::Discovery(format!("bind SSDP socket: {}", e)))?;
    socket
        .set_read_timeout(Some(RECV_SLICE))
        .map_err(|e| BridgeError::Discovery(format!("set SSDP read timeout: {}", e)))?;

    send_msearch(&socket, ZONE_PLAYER_ST, scan_timeout.as_secs().max(1) as u32)?;

    let deadline = Instant::now() + scan_timeout;
    let mut seen_usn: HashSet<String> = HashSet::new();
    let mut found: Vec<(String, String)> = Vec::new(); // (ip, location)
    let mut buf = [0u8; 8192];

    while Instant::now() < deadline {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                let data = String::from_utf8_lossy(&buf[..n]);
                let Some(reply) = parse_search_response(&data) else {
                    trace!("Unparseable SSDP datagram from {}", from);
                    continue;
                };
                if !reply.st.contains("ZonePlayer") {
                    continue;
                }
                if seen_usn.insert(reply.usn.clone()) {
                    debug!(from = %from, location = reply.location.as_str(), "ZonePlayer reply");
                    found.push((from.ip().to_string(), reply.location));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!("SSDP receive error: {}", e);
                break;
            }
        }
    }

    let mut devices = Vec::with_capacity(found.len());
    for (ip, location) in found {
        let name = resolve_room_name(&location, http_timeout).unwrap_or_else(|| ip.clone());
        devices.push(SpeakerInfo { name, ip_addr: ip });
    }
    Ok(devices)
}

fn send_msearch(socket: &UdpSocket, st: &str, mx: u32) -> Result<(), BridgeError> {
    let msg = format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}:{}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {}\r\n\
         ST: {}\r\n\
         USER-AGENT: PMOSonosBridge SSDP Client\r\n\
         \r\n",
        SSDP_MULTICAST_ADDR, SSDP_PORT, mx, st
    );
    let addr = format!("{}:{}", SSDP_MULTICAST_ADDR, SSDP_PORT);
    socket
        .send_to(msg.as_bytes(), addr)
        .map_err(|e| BridgeError::Discovery(format!("send M-SEARCH: {}", e)))?;
    debug!("M-SEARCH sent (ST={}, MX={})", st, mx);
    Ok(())
}

/// Parses a unicast `M-SEARCH` reply. NOTIFY traffic and other control
/// points' searches yield `None`.
pub fn parse_search_response(data: &str) -> Option<SsdpReply> {
    let mut lines = data.lines();
    let first_line = lines.next()?.trim().to_ascii_uppercase();
    if !first_line.starts_with("HTTP/") || !first_line.contains(" 200 ") {
        return None;
    }

    let headers = parse_headers(lines);
    Some(SsdpReply {
        usn: headers.get("USN")?.to_string(),
        st: headers.get("ST")?.to_string(),
        location: headers.get("LOCATION")?.to_string(),
    })
}

fn parse_headers<'a, I>(lines: I) -> HashMap<String, String>
where
    I: Iterator<Item = &'a str>,
{
    let mut headers = HashMap::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        // Split on the first ':' only; values may contain ':'.
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_ascii_uppercase();
            let value = value.trim().to_string();
            if !name.is_empty() && !value.is_empty() {
                headers.insert(name, value);
            }
        } else {
            trace!("Skipping SSDP line without colon: '{}'", line);
        }
    }
    headers
}

/// Sonos keeps the user-visible zone name in `roomName`; fall back to
/// `friendlyName` for anything that omits it.
fn resolve_room_name(location: &str, timeout: Duration) -> Option<String> {
    let root = match fetch_description(location, timeout) {
        Ok(root) => root,
        Err(e) => {
            warn!(location, "Failed to fetch device description: {}", e);
            return None;
        }
    };
    let device = root.get_child("device")?;
    extract_child_text(device, "roomName").or_else(|| extract_child_text(device, "friendlyName"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &str = "HTTP/1.1 200 OK\r\n\
        CACHE-CONTROL: max-age = 1800\r\n\
        EXT:\r\n\
        LOCATION: http://192.168.1.42:1400/xml/device_description.xml\r\n\
        SERVER: Linux UPnP/1.0 Sonos/70.3-35220 (ZPS13)\r\n\
        ST: urn:schemas-upnp-org:device:ZonePlayer:1\r\n\
        USN: uuid:RINCON_0004FF00AA0001400::urn:schemas-upnp-org:device:ZonePlayer:1\r\n\
        \r\n";

    #[test]
    fn search_response_parsed() {
        let reply = parse_search_response(REPLY).unwrap();
        assert_eq!(
            reply.location,
            "http://192.168.1.42:1400/xml/device_description.xml"
        );
        assert!(reply.st.contains("ZonePlayer"));
        assert!(reply.usn.starts_with("uuid:RINCON_"));
    }

    #[test]
    fn notify_traffic_is_ignored() {
        let notify = "NOTIFY * HTTP/1.1\r\nNTS: ssdp:alive\r\n\r\n";
        assert!(parse_search_response(notify).is_none());
    }

    #[test]
    fn reply_missing_location_is_ignored() {
        let broken = "HTTP/1.1 200 OK\r\nST: x\r\nUSN: y\r\n\r\n";
        assert!(parse_search_response(broken).is_none());
    }
}
