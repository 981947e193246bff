use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::Hostname;

/// Network address of a cluster member (host:port).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct MemberAddress {
    pub host: String,
    pub port: u16,
}

impl MemberAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Member address of a host on the given cluster port.
    pub fn for_host(hostname: &Hostname, port: u16) -> Self {
        Self::new(hostname.as_ref(), port)
    }

    /// Parse a `host:port` string. The port is taken after the last colon.
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = s.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        let port = port.parse().ok()?;
        Some(Self::new(host, port))
    }
}

impl fmt::Display for MemberAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
