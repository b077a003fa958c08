//! Device identity used in license requests

/// Supplies the device binding for license requests.
///
/// Injected into the orchestrator so tests and embedders can pick the
/// identity without any process-wide registration.
pub trait DeviceIdentityProvider: Send + Sync {
    fn device_id(&self) -> String;

    fn client_ip(&self) -> String;
}

/// Placeholder sent when the client address is unknown
pub const UNKNOWN_CLIENT_IP: &str = "0.0.0.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticIdentity {
    device_id: String,
    client_ip: String,
}

impl StaticIdentity {
    pub fn new(device_id: impl Into<String>, client_ip: Option<String>) -> Self {
        Self {
            device_id: device_id.into(),
            client_ip: client_ip
                .filter(|ip| !ip.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN_CLIENT_IP.to_string()),
        }
    }
}

impl DeviceIdentityProvider for StaticIdentity {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    fn client_ip(&self) -> String {
        self.client_ip.clone()
    }
}
