use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of microservice participating in the mesh (e.g. `device-management`).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ServiceKind(pub String);

impl ServiceKind {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn device_management() -> Self {
        Self::new(Self::DEVICE_MANAGEMENT)
    }

    pub fn tenant_management() -> Self {
        Self::new(Self::TENANT_MANAGEMENT)
    }

    pub fn command_delivery() -> Self {
        Self::new(Self::COMMAND_DELIVERY)
    }

    pub fn event_sources() -> Self {
        Self::new(Self::EVENT_SOURCES)
    }

    pub fn inbound_processing() -> Self {
        Self::new(Self::INBOUND_PROCESSING)
    }
}

/// Identifiers of the service kinds the control plane itself depends on.
impl ServiceKind {
    pub const DEVICE_MANAGEMENT: &'static str = "device-management";
    pub const TENANT_MANAGEMENT: &'static str = "tenant-management";
    pub const COMMAND_DELIVERY: &'static str = "command-delivery";
    pub const EVENT_SOURCES: &'static str = "event-sources";
    pub const INBOUND_PROCESSING: &'static str = "inbound-processing";
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ServiceKind {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
