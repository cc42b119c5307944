//! GENA subscription to a speaker's AVTransport event service.
//!
//! Each streaming client gets its own [`Subscription`]: a SUBSCRIBE against
//! the speaker's eventSub URL plus a local HTTP listener thread that accepts
//! the speaker's NOTIFY callbacks, parses the `LastChange` payload and hands
//! [`TransportEvent`]s to the consumer over a channel. The subscription is
//! renewed lazily from [`Subscription::poll`] when it nears expiry.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::{debug, info, warn};
use ureq::{Agent, http};
use xmltree::{Element, XMLNode};

use crate::errors::BridgeError;
use crate::model::TransportEvent;
use crate::speaker::{SONOS_HTTP_PORT, Speaker};

const SUBSCRIPTION_TIMEOUT_SECS: u64 = 300;
const RENEWAL_SAFETY_MARGIN_SECS: u64 = 60;
const NOTIFY_READ_TIMEOUT_SECS: u64 = 5;
const CALLBACK_PATH: &str = "/notify";

/// A live AVTransport event subscription for one speaker.
pub struct Subscription {
    event_sub_url: String,
    host_header: String,
    http_timeout: Duration,
    sid: Arc<Mutex<Option<String>>>,
    expires_at: Instant,
    event_rx: Receiver<TransportEvent>,
    listener_addr: SocketAddr,
    stop_flag: Arc<AtomicBool>,
    listener_thread: Option<JoinHandle<()>>,
    released: bool,
}

impl Subscription {
    /// Subscribes to the speaker's AVTransport events.
    ///
    /// Binds the notify listener and sends the SUBSCRIBE before returning,
    /// so a failure here leaves nothing running.
    pub fn subscribe(speaker: &Speaker, http_timeout: Duration) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind("0.0.0.0:0")
            .map_err(|e| BridgeError::Subscription(format!("bind notify listener: {}", e)))?;
        let listener_addr = listener
            .local_addr()
            .map_err(|e| BridgeError::Subscription(format!("read listener address: {}", e)))?;

        let sid = Arc::new(Mutex::new(None::<String>));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx) = unbounded::<TransportEvent>();

        let thread_sid = Arc::clone(&sid);
        let thread_stop = Arc::clone(&stop_flag);
        let listener_thread = thread::Builder::new()
            .name(format!("gena-notify-{}", speaker.ip()))
            .spawn(move || run_notify_listener(listener, event_tx, thread_sid, thread_stop))
            .map_err(|e| BridgeError::Subscription(format!("spawn notify listener: {}", e)))?;

        let local_ip = determine_local_ip(speaker.ip())
            .map_err(|e| BridgeError::Subscription(format!("determine callback IP: {}", e)))?;
        let callback_url = format!(
            "http://{}:{}{}",
            format_ip(&local_ip),
            listener_addr.port(),
            CALLBACK_PATH
        );

        let mut subscription = Self {
            event_sub_url: speaker.event_sub_url(),
            host_header: format!("{}:{}", speaker.ip(), SONOS_HTTP_PORT),
            http_timeout,
            sid,
            expires_at: Instant::now(),
            event_rx,
            listener_addr,
            stop_flag,
            listener_thread: Some(listener_thread),
            released: false,
        };

        if let Err(err) = subscription.send_initial_subscribe(&callback_url) {
            subscription.stop_listener();
            subscription.released = true;
            return Err(err);
        }

        info!(
            speaker = speaker.ip(),
            callback = callback_url.as_str(),
            "Subscribed to AVTransport events"
        );
        Ok(subscription)
    }

    fn send_initial_subscribe(&mut self, callback_url: &str) -> Result<(), BridgeError> {
        let request = http::Request::builder()
            .method("SUBSCRIBE")
            .uri(&self.event_sub_url)
            .header("HOST", &self.host_header)
            .header("CALLBACK", format!("<{}>", callback_url))
            .header("NT", "upnp:event")
            .header("TIMEOUT", format!("Second-{}", SUBSCRIPTION_TIMEOUT_SECS))
            .body(())
            .map_err(|e| BridgeError::Subscription(format!("build SUBSCRIBE request: {}", e)))?;

        let response = build_agent(self.http_timeout)
            .run(request)
            .map_err(|e| BridgeError::Subscription(format!("SUBSCRIBE failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(BridgeError::Subscription(format!(
                "SUBSCRIBE returned HTTP {}",
                response.status()
            )));
        }

        let sid = response
            .headers()
            .get("SID")
            .and_then(|value| value.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| BridgeError::Subscription("SUBSCRIBE response missing SID".into()))?;
        let timeout = parse_timeout(
            response
                .headers()
                .get("TIMEOUT")
                .and_then(|value| value.to_str().ok()),
        )
        .unwrap_or(Duration::from_secs(SUBSCRIPTION_TIMEOUT_SECS));

        *self.sid.lock().unwrap_or_else(|p| p.into_inner()) = Some(sid);
        self.expires_at = Instant::now() + timeout;
        Ok(())
    }

    /// Waits up to `wait` for the next transport event.
    ///
    /// Returns `Ok(None)` when the window elapses without an event; the
    /// caller is expected to poll again. Renews the GENA lease first if it
    /// is within the safety margin of expiring.
    pub fn poll(&mut self, wait: Duration) -> Result<Option<TransportEvent>, BridgeError> {
        if self.released {
            return Err(BridgeError::Subscription(
                "subscription already released".into(),
            ));
        }
        self.renew_if_expiring()?;

        match self.event_rx.recv_timeout(wait) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(BridgeError::Subscription(
                "notify listener stopped".into(),
            )),
        }
    }

    fn renew_if_expiring(&mut self) -> Result<(), BridgeError> {
        let margin = Duration::from_secs(RENEWAL_SAFETY_MARGIN_SECS);
        if self.expires_at > Instant::now() + margin {
            return Ok(());
        }

        let sid = self
            .sid
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| BridgeError::Subscription("SID missing for renewal".into()))?;

        let request = http::Request::builder()
            .method("SUBSCRIBE")
            .uri(&self.event_sub_url)
            .header("HOST", &self.host_header)
            .header("SID", sid)
            .header("TIMEOUT", format!("Second-{}", SUBSCRIPTION_TIMEOUT_SECS))
            .body(())
            .map_err(|e| BridgeError::Subscription(format!("build renewal request: {}", e)))?;

        let response = build_agent(self.http_timeout)
            .run(request)
            .map_err(|e| BridgeError::Subscription(format!("renewal failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(BridgeError::Subscription(format!(
                "renewal returned HTTP {}",
                response.status()
            )));
        }

        let timeout = parse_timeout(
            response
                .headers()
                .get("TIMEOUT")
                .and_then(|value| value.to_str().ok()),
        )
        .unwrap_or(Duration::from_secs(SUBSCRIPTION_TIMEOUT_SECS));
        self.expires_at = Instant::now() + timeout;
        debug!("Renewed AVTransport subscription");
        Ok(())
    }

    /// Tears the subscription down: best-effort UNSUBSCRIBE, then stops the
    /// notify listener. Safe to call more than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let sid = self.sid.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(sid) = sid {
            self.send_unsubscribe(sid);
        }
        self.stop_listener();
    }

    fn send_unsubscribe(&self, sid: String) {
        let request = match http::Request::builder()
            .method("UNSUBSCRIBE")
            .uri(&self.event_sub_url)
            .header("HOST", &self.host_header)
            .header("SID", sid)
            .body(())
        {
            Ok(req) => req,
            Err(err) => {
                warn!("Failed to build UNSUBSCRIBE request: {}", err);
                return;
            }
        };

        match build_agent(self.http_timeout).run(request) {
            Ok(response) if response.status().is_success() => {
                debug!("Unsubscribed from AVTransport events");
            }
            Ok(response) => {
                warn!(status = %response.status(), "UNSUBSCRIBE returned non-success status");
            }
            Err(err) => {
                warn!("UNSUBSCRIBE request failed: {}", err);
            }
        }
    }

    fn stop_listener(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        // The listener blocks in accept(); a throwaway connection wakes it
        // so it can observe the stop flag.
        let wake_addr = SocketAddr::new(
            IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            self.listener_addr.port(),
        );
        let _ = TcpStream::connect_timeout(&wake_addr, Duration::from_secs(1));
        if let Some(handle) = self.listener_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

fn run_notify_listener(
    listener: TcpListener,
    event_tx: Sender<TransportEvent>,
    sid: Arc<Mutex<Option<String>>>,
    stop_flag: Arc<AtomicBool>,
) {
    for stream in listener.incoming() {
        if stop_flag.load(Ordering::SeqCst) {
            break;
        }
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Incoming notify connection failed: {}", err);
                continue;
            }
        };
        if let Err(err) =
            stream.set_read_timeout(Some(Duration::from_secs(NOTIFY_READ_TIMEOUT_SECS)))
        {
            warn!("Failed to set read timeout on notify connection: {}", err);
        }

        match read_http_request(&mut stream) {
            Ok(request) => {
                if request.method != "NOTIFY" {
                    let _ = write_http_response(&mut stream, 405, "Method Not Allowed");
                    continue;
                }
                let expected = sid.lock().unwrap_or_else(|p| p.into_inner()).clone();
                if !sid_matches(request.headers_sid(), expected.as_deref()) {
                    debug!(
                        received_sid = request.headers_sid().unwrap_or("none"),
                        "Ignoring notify with mismatched SID"
                    );
                    let _ = write_http_response(&mut stream, 412, "Precondition Failed");
                    continue;
                }

                if let Some(event) = parse_notify_payload(&request.body) {
                    if event_tx.send(event).is_err() {
                        debug!("Dropping notify because consumer is gone");
                    }
                }
                let _ = write_http_response(&mut stream, 200, "OK");
            }
            Err(err) => {
                warn!("Failed to parse incoming notify request: {}", err);
                let _ = write_http_response(&mut stream, 400, "Bad Request");
            }
        }
    }
    debug!("Notify listener stopped");
}

fn sid_matches(received: Option<&str>, expected: Option<&str>) -> bool {
    match (received, expected) {
        (Some(received), Some(expected)) => expected.eq_ignore_ascii_case(received),
        // The device may deliver the initial-state notify before the
        // SUBSCRIBE response carrying the SID has been processed. Accept it
        // so the first event is not dropped.
        (Some(_), None) => true,
        (None, _) => false,
    }
}

struct HttpRequest {
    method: String,
    headers: std::collections::HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn headers_sid(&self) -> Option<&str> {
        self.headers.get("sid").map(|s| s.as_str())
    }
}

fn read_http_request(stream: &mut TcpStream) -> io::Result<HttpRequest> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "missing request line",
        ));
    }

    let request_line = request_line.trim_end_matches(&['\r', '\n'][..]);
    let method = request_line
        .split_whitespace()
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing method"))?
        .to_ascii_uppercase();

    let mut headers = std::collections::HashMap::new();
    loop {
        let mut line = String::new();
        let len = reader.read_line(&mut line)?;
        if len == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(&['\r', '\n'][..]);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;

    Ok(HttpRequest {
        method,
        headers,
        body,
    })
}

fn write_http_response(stream: &mut TcpStream, status: u16, message: &str) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status, message
    );
    stream.write_all(response.as_bytes())
}

/// Extracts transport state and current track from a NOTIFY body.
///
/// The interesting values live in the `LastChange` property, whose text is
/// itself an escaped XML document. Fields the payload omits stay `None`;
/// a body with no parseable `LastChange` yields no event at all.
pub fn parse_notify_payload(body: &[u8]) -> Option<TransportEvent> {
    let root = match Element::parse(std::io::Cursor::new(body)) {
        Ok(root) => root,
        Err(err) => {
            warn!("Failed to parse notify payload: {}", err);
            return None;
        }
    };

    let last_change = find_last_change_text(&root)?;
    let inner = match Element::parse(std::io::Cursor::new(last_change.as_bytes())) {
        Ok(inner) => inner,
        Err(err) => {
            warn!("Failed to parse LastChange document: {}", err);
            return None;
        }
    };

    let instance = inner.get_child("InstanceID")?;
    let transport_state = val_attribute(instance, "TransportState");
    let current_track = val_attribute(instance, "CurrentTrack").and_then(|v| v.parse::<u32>().ok());

    Some(TransportEvent {
        transport_state,
        current_track,
    })
}

fn find_last_change_text(root: &Element) -> Option<String> {
    for property in xml_children(root) {
        for child in xml_children(property) {
            if child.name == "LastChange" {
                return child.get_text().map(|cow| cow.into_owned());
            }
        }
    }
    None
}

fn val_attribute(instance: &Element, name: &str) -> Option<String> {
    xml_children(instance)
        .find(|child| child.name == name)
        .and_then(|child| child.attributes.get("val").cloned())
}

fn xml_children(element: &Element) -> impl Iterator<Item = &Element> {
    element.children.iter().filter_map(|node| match node {
        XMLNode::Element(elem) => Some(elem),
        _ => None,
    })
}

fn parse_timeout(raw: Option<&str>) -> Option<Duration> {
    let value = raw?;
    let lower = value.trim().to_ascii_lowercase();
    if lower == "second-infinite" {
        return Some(Duration::from_secs(SUBSCRIPTION_TIMEOUT_SECS));
    }
    if let Some(idx) = lower.find("second-") {
        let number = &lower[idx + 7..];
        if let Ok(seconds) = number.parse::<u64>() {
            return Some(Duration::from_secs(seconds));
        }
    }
    None
}

fn determine_local_ip(remote_host: &str) -> io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect((remote_host, SONOS_HTTP_PORT))?;
    Ok(socket.local_addr()?.ip())
}

fn format_ip(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    }
}

fn build_agent(timeout: Duration) -> Agent {
    Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .allow_non_standard_methods(true)
        .build()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notify_body(last_change_inner: &str) -> Vec<u8> {
        let escaped = last_change_inner
            .replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;")
            .replace('"', "&quot;");
        format!(
            r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0">
                 <e:property><LastChange>{}</LastChange></e:property>
               </e:propertyset>"#,
            escaped
        )
        .into_bytes()
    }

    #[test]
    fn last_change_state_and_track_extracted() {
        let body = notify_body(
            r#"<Event xmlns="urn:schemas-upnp-org:metadata-1-0/AVT/">
                 <InstanceID val="0">
                   <TransportState val="PLAYING"/>
                   <CurrentTrack val="3"/>
                 </InstanceID>
               </Event>"#,
        );
        let event = parse_notify_payload(&body).unwrap();
        assert_eq!(event.transport_state.as_deref(), Some("PLAYING"));
        assert_eq!(event.current_track, Some(3));
    }

    #[test]
    fn missing_current_track_stays_none() {
        let body = notify_body(
            r#"<Event><InstanceID val="0"><TransportState val="PAUSED_PLAYBACK"/></InstanceID></Event>"#,
        );
        let event = parse_notify_payload(&body).unwrap();
        assert_eq!(event.transport_state.as_deref(), Some("PAUSED_PLAYBACK"));
        assert_eq!(event.current_track, None);
    }

    #[test]
    fn non_numeric_track_stays_none() {
        let body = notify_body(
            r#"<Event><InstanceID val="0"><CurrentTrack val="NOT_A_NUMBER"/></InstanceID></Event>"#,
        );
        let event = parse_notify_payload(&body).unwrap();
        assert_eq!(event.current_track, None);
    }

    #[test]
    fn garbage_body_yields_no_event() {
        assert!(parse_notify_payload(b"this is not xml").is_none());
        assert!(parse_notify_payload(b"<e:propertyset/>").is_none());
    }

    #[test]
    fn timeout_header_parsing() {
        assert_eq!(
            parse_timeout(Some("Second-300")),
            Some(Duration::from_secs(300))
        );
        assert_eq!(
            parse_timeout(Some("second-infinite")),
            Some(Duration::from_secs(SUBSCRIPTION_TIMEOUT_SECS))
        );
        assert_eq!(parse_timeout(Some("whenever")), None);
        assert_eq!(parse_timeout(None), None);
    }

    #[test]
    fn sid_comparison_is_case_insensitive() {
        assert!(sid_matches(Some("uuid:ABC"), Some("uuid:abc")));
        assert!(!sid_matches(Some("uuid:abc"), Some("uuid:def")));
        assert!(!sid_matches(None, Some("uuid:abc")));
        assert!(!sid_matches(None, None));
    }

    #[test]
    fn notify_racing_the_subscribe_response_is_accepted() {
        // No SID stored yet: the initial-state notify must not be rejected.
        assert!(sid_matches(Some("uuid:abc"), None));
    }
}
