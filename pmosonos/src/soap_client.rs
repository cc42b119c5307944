use std::time::Duration;

use ureq::Agent;
use xmltree::Element;

use crate::errors::BridgeError;
use crate::soap::{
    SoapEnvelope, build_soap_request, find_child_with_suffix, parse_soap_envelope,
    parse_upnp_fault,
};

/// Result of a SOAP call:
/// - HTTP status code
/// - raw XML body (always)
/// - parsed SOAP envelope if parsing succeeded
pub struct SoapCallResult {
    pub status: ureq::http::StatusCode,
    pub raw_body: String,
    pub envelope: Option<SoapEnvelope>,
}

/// Invoke a UPnP SOAP action on a control URL.
///
/// - `control_url`: full HTTP URL of the service control endpoint
/// - `service_type`: service URN, e.g. "urn:schemas-upnp-org:service:AVTransport:1"
/// - `action`: action name, e.g. "Play"
/// - `args`: list of (name, value) pairs, e.g. &[("InstanceID", "0")]
///
/// The agent is configured to NOT treat 4xx/5xx as errors: HTTP 500 SOAP
/// Faults carry a body we still want to read and surface.
pub fn invoke_upnp_action(
    control_url: &str,
    service_type: &str,
    action: &str,
    args: &[(&str, &str)],
    timeout: Duration,
) -> Result<SoapCallResult, BridgeError> {
    let body_xml = build_soap_request(service_type, action, args)
        .map_err(|e| BridgeError::SoapAction(format!("{}: build request: {}", action, e)))?;

    let config = Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .build();
    let agent: Agent = config.into();

    // SOAPAction header: "urn:service#Action"
    let soap_action_header = format!(r#""{}#{}""#, service_type, action);

    let mut response = agent
        .post(control_url)
        .header("Content-Type", r#"text/xml; charset="utf-8""#)
        .header("SOAPAction", &soap_action_header)
        .send(body_xml)
        .map_err(|e| BridgeError::DeviceUnreachable(control_url.to_string(), e.to_string()))?;

    let status = response.status();

    // Read the full body regardless of HTTP status code.
    let raw_body = response
        .body_mut()
        .read_to_string()
        .map_err(|e| BridgeError::SoapAction(format!("{}: read response body: {}", action, e)))?;

    // Envelope stays None when the body is not valid SOAP; the caller still
    // gets status + raw_body.
    let envelope = parse_soap_envelope(raw_body.as_bytes()).ok();

    Ok(SoapCallResult {
        status,
        raw_body,
        envelope,
    })
}

/// Checks a [`SoapCallResult`] and returns the `<action>Response` element.
///
/// Surfaces, in order: UPnP faults carried in the envelope, non-success HTTP
/// statuses, a missing envelope, and a missing response element.
pub fn expect_action_response<'a>(
    action: &str,
    call_result: &'a SoapCallResult,
) -> Result<&'a Element, BridgeError> {
    if let Some(envelope) = call_result.envelope.as_ref() {
        if let Some(fault) = parse_upnp_fault(envelope) {
            return Err(BridgeError::SoapUpnpFault(
                action.to_string(),
                fault.error_code,
                fault.error_description,
                call_result.status.as_u16(),
            ));
        }
    }

    if !call_result.status.is_success() {
        return Err(BridgeError::SoapWrongStatus(
            action.to_string(),
            call_result.status.as_u16(),
        ));
    }

    let envelope = call_result
        .envelope
        .as_ref()
        .ok_or_else(|| BridgeError::SoapNoEnvelope(action.to_string()))?;

    let response_name = format!("{}Response", action);
    find_child_with_suffix(&envelope.body, &response_name)
        .ok_or_else(|| BridgeError::missing_return_value(&response_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soap::parse_soap_envelope;
    use ureq::http::StatusCode;

    fn call_result(status: StatusCode, body: &str) -> SoapCallResult {
        SoapCallResult {
            status,
            raw_body: body.to_string(),
            envelope: parse_soap_envelope(body.as_bytes()).ok(),
        }
    }

    #[test]
    fn expect_action_response_finds_element() {
        let body = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <u:GetVolumeResponse xmlns:u="urn:schemas-upnp-org:service:RenderingControl:1">
      <CurrentVolume>23</CurrentVolume>
    </u:GetVolumeResponse>
  </s:Body>
</s:Envelope>"#;

        let result = call_result(StatusCode::OK, body);
        let response = expect_action_response("GetVolume", &result).unwrap();
        assert!(response.name.ends_with("GetVolumeResponse"));
    }

    #[test]
    fn expect_action_response_surfaces_upnp_fault() {
        let body = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <s:Fault>
      <faultcode>s:Client</faultcode>
      <faultstring>UPnPError</faultstring>
      <detail>
        <UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
          <errorCode>714</errorCode>
          <errorDescription>Illegal seek target</errorDescription>
        </UPnPError>
      </detail>
    </s:Fault>
  </s:Body>
</s:Envelope>"#;

        let result = call_result(StatusCode::INTERNAL_SERVER_ERROR, body);
        let err = expect_action_response("Seek", &result).unwrap_err();
        match err {
            BridgeError::SoapUpnpFault(action, code, desc, status) => {
                assert_eq!(action, "Seek");
                assert_eq!(code, 714);
                assert_eq!(desc, "Illegal seek target");
                assert_eq!(status, 500);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn expect_action_response_rejects_non_soap_body() {
        let result = call_result(StatusCode::OK, "<html>not soap</html>");
        assert!(matches!(
            expect_action_response("Play", &result),
            Err(BridgeError::SoapNoEnvelope(_))
        ));
    }

    #[test]
    fn expect_action_response_rejects_bad_status_without_fault() {
        let result = call_result(StatusCode::BAD_GATEWAY, "");
        assert!(matches!(
            expect_action_response("Play", &result),
            Err(BridgeError::SoapWrongStatus(_, 502))
        ));
    }
}
