//! SOAP plumbing for UPnP action calls.
//!
//! Only the control-point half of SOAP is needed here: building action
//! requests, parsing response envelopes and extracting UPnP faults.

use std::io::BufReader;

use xmltree::{Element, XMLNode};

/// Parsed SOAP envelope. Sonos devices never send a meaningful header,
/// so only the body is kept.
#[derive(Debug, Clone)]
pub struct SoapEnvelope {
    pub body: Element,
}

/// UPnP error carried in a SOAP fault detail block.
#[derive(Debug, Clone)]
pub struct UpnpFault {
    pub error_code: u32,
    pub error_description: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SoapParseError {
    #[error("XML parse error: {0}")]
    XmlError(#[from] xmltree::ParseError),

    #[error("Missing SOAP Envelope")]
    MissingEnvelope,

    #[error("Missing SOAP Body")]
    MissingBody,
}

/// Builds a SOAP action request.
///
/// * `service_urn` - service URN, e.g. "urn:schemas-upnp-org:service:AVTransport:1"
/// * `action` - action name, e.g. "Play"
/// * `args` - (name, value) pairs, e.g. `&[("InstanceID", "0")]`
pub fn build_soap_request(
    service_urn: &str,
    action: &str,
    args: &[(&str, &str)],
) -> Result<String, xmltree::Error> {
    let request_name = format!("u:{}", action);
    let mut request_elem = Element::new(&request_name);
    request_elem
        .attributes
        .insert("xmlns:u".to_string(), service_urn.to_string());

    for (name, value) in args {
        let mut child = Element::new(name);
        child.children.push(XMLNode::Text((*value).to_string()));
        request_elem.children.push(XMLNode::Element(child));
    }

    let mut body = Element::new("s:Body");
    body.children.push(XMLNode::Element(request_elem));

    let mut envelope = Element::new("s:Envelope");
    envelope.attributes.insert(
        "xmlns:s".to_string(),
        "http://schemas.xmlsoap.org/soap/envelope/".to_string(),
    );
    envelope.attributes.insert(
        "s:encodingStyle".to_string(),
        "http://schemas.xmlsoap.org/soap/encoding/".to_string(),
    );
    envelope.children.push(XMLNode::Element(body));

    let mut buf = Vec::new();
    let config = xmltree::EmitterConfig::new()
        .write_document_declaration(true)
        .perform_indent(false);
    envelope.write_with_config(&mut buf, config)?;

    // The emitter only writes UTF-8.
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Parses a response body into a [`SoapEnvelope`].
pub fn parse_soap_envelope(xml: &[u8]) -> Result<SoapEnvelope, SoapParseError> {
    let reader = BufReader::new(xml);
    let root = Element::parse(reader)?;

    if !root.name.ends_with("Envelope") {
        return Err(SoapParseError::MissingEnvelope);
    }

    let body = root
        .get_child("Body")
        .or_else(|| {
            root.children
                .iter()
                .find_map(|n| n.as_element().filter(|e| e.name.ends_with("Body")))
        })
        .ok_or(SoapParseError::MissingBody)?;

    Ok(SoapEnvelope { body: body.clone() })
}

/// Extracts a UPnP fault from the envelope, if the body carries one.
///
/// Fault layout: `Fault > detail > UPnPError > errorCode / errorDescription`.
pub fn parse_upnp_fault(envelope: &SoapEnvelope) -> Option<UpnpFault> {
    let fault = find_child_with_suffix(&envelope.body, "Fault")?;
    let detail = find_child_with_suffix(fault, "detail")?;
    let upnp_error = find_child_with_suffix(detail, "UPnPError")?;

    let error_code = extract_child_text(upnp_error, "errorCode")?
        .parse::<u32>()
        .ok()?;
    let error_description =
        extract_child_text(upnp_error, "errorDescription").unwrap_or_default();

    Some(UpnpFault {
        error_code,
        error_description,
    })
}

/// Finds the first child element whose name ends with `suffix`, ignoring
/// namespace prefixes (Sonos mixes `u:`, `s:` and unprefixed names).
pub fn find_child_with_suffix<'a>(parent: &'a Element, suffix: &str) -> Option<&'a Element> {
    parent.children.iter().find_map(|node| match node {
        XMLNode::Element(elem) if elem.name.ends_with(suffix) => Some(elem),
        _ => None,
    })
}

/// Extracts the trimmed text of the first child named `suffix`.
pub fn extract_child_text(parent: &Element, suffix: &str) -> Option<String> {
    find_child_with_suffix(parent, suffix)?
        .get_text()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}
