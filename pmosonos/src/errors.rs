use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    // Request validation; the device is never contacted for these.
    #[error("missing {0} field")]
    MissingField(&'static str),
    #[error("device {0} is unreachable: {1}")]
    DeviceUnreachable(String, String),
    #[error("AVTransport event subscription failed: {0}")]
    Subscription(String),
    #[error("Soap Error: Upnp action call {0}")]
    SoapAction(String),
    #[error("{0} returned UPnP error {1}: {2} (HTTP status {3})")]
    SoapUpnpFault(String, u32, String, u16),
    #[error("{0} failed with HTTP status {1}")]
    SoapWrongStatus(String, u16),
    #[error("Soap Error: No envelope for action {0}")]
    SoapNoEnvelope(String),
    #[error("Missing {0} element in SOAP body")]
    UpnpMissingReturnValue(String),
    #[error("Invalid {0} value: {1}")]
    UpnpBadReturnValue(String, String),
    #[error("Discovery error: {0}")]
    Discovery(String),
    #[error("streaming session error: {0}")]
    Session(String),
}

impl BridgeError {
    pub fn unreachable(ip: &str, cause: impl std::fmt::Display) -> Self {
        BridgeError::DeviceUnreachable(ip.to_string(), cause.to_string())
    }

    pub fn missing_return_value(value: &str) -> Self {
        BridgeError::UpnpMissingReturnValue(value.to_string())
    }

    pub fn bad_return_value(name: &str, value: &str) -> Self {
        BridgeError::UpnpBadReturnValue(name.to_string(), value.to_string())
    }
}
