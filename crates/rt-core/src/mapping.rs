//! Service Mappings
//!
//! A mapping pairs a local listen address with the remote target the peer
//! should dial for every connection accepted on it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Local bind address used when a mapping leaves `localIp` unset
pub const DEFAULT_LOCAL_IP: &str = "127.0.0.1";

/// One exposed service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    /// Address to bind the local listener on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<String>,

    /// Port to bind the local listener on (unset = ephemeral)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,

    /// Address the remote peer dials
    pub remote_ip: String,

    /// Port the remote peer dials
    pub remote_port: u16,
}

impl Mapping {
    pub fn new(remote_ip: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_ip: None,
            local_port: None,
            remote_ip: remote_ip.into(),
            remote_port,
        }
    }

    /// Builder pattern: set local bind address
    pub fn with_local_ip(mut self, ip: impl Into<String>) -> Self {
        self.local_ip = Some(ip.into());
        self
    }

    /// Builder pattern: set local bind port
    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    /// `host:port` the local listener binds, with defaults applied
    pub fn local_addr(&self) -> String {
        let ip = match self.local_ip.as_deref() {
            Some(ip) if !ip.is_empty() => ip,
            _ => DEFAULT_LOCAL_IP,
        };
        format_host_port(ip, self.local_port.unwrap_or(0))
    }

    /// `host:port` the remote peer dials
    pub fn remote_addr(&self) -> String {
        format_host_port(&self.remote_ip, self.remote_port)
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}", self.local_addr(), self.remote_addr())
    }
}

fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_addr_defaults() {
        let mapping = Mapping::new("10.0.0.5", 22);
        assert_eq!(mapping.local_addr(), "127.0.0.1:0");
        assert_eq!(mapping.remote_addr(), "10.0.0.5:22");
    }

    #[test]
    fn test_ipv6_addresses_are_bracketed() {
        let mapping = Mapping::new("::1", 8080).with_local_ip("::").with_local_port(9000);
        assert_eq!(mapping.local_addr(), "[::]:9000");
        assert_eq!(mapping.remote_addr(), "[::1]:8080");
    }

    #[test]
    fn test_camel_case_json() {
        let json = r#"{"localIp":"127.0.0.1","localPort":9000,"remoteIp":"10.0.0.5","remotePort":22}"#;
        let mapping: Mapping = serde_json::from_str(json).unwrap();
        assert_eq!(mapping.local_port, Some(9000));
        assert_eq!(mapping.remote_ip, "10.0.0.5");
        assert_eq!(serde_json::to_string(&mapping).unwrap(), json);
    }
}
