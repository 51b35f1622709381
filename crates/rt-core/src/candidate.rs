//! ICE Candidates and the Address Blacklist
//!
//! Remote candidates are checked against the configured blacklist before they
//! reach the peer connection. A rejected candidate is dropped without error.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One network path proposed by a peer (`RTCIceCandidateInit` shape)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,

    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,

    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,

    /// Explicit connection address, when the sender included one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Default::default()
        }
    }

    /// Connection address of this candidate.
    ///
    /// Prefers the explicit `address` field and falls back to the fifth token
    /// of the `candidate:` attribute
    /// (`candidate:<foundation> <component> <transport> <priority> <address> ...`).
    pub fn address(&self) -> Option<&str> {
        if let Some(address) = self.address.as_deref().filter(|a| !a.is_empty()) {
            return Some(address);
        }

        let line = self.candidate.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        let line = line.strip_prefix("candidate:")?;
        line.split_whitespace().nth(4)
    }
}

/// Rejects candidates whose address is blacklisted
#[derive(Debug, Clone, Default)]
pub struct IceCandidateFilter {
    blacklist: HashSet<String>,
}

impl IceCandidateFilter {
    pub fn new<I, S>(blacklist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            blacklist: blacklist.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `candidate` may be handed to the peer connection
    pub fn permits(&self, candidate: &IceCandidate) -> bool {
        match candidate.address() {
            Some(address) => !self.blacklist.contains(address),
            None => true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blacklist.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "candidate:842163049 1 udp 1677729535 192.168.1.20 50123 typ host generation 0";

    #[test]
    fn test_address_from_candidate_line() {
        assert_eq!(IceCandidate::new(HOST).address(), Some("192.168.1.20"));
        assert_eq!(
            IceCandidate::new(format!("a={}", HOST)).address(),
            Some("192.168.1.20")
        );
        assert_eq!(IceCandidate::new("").address(), None);
        assert_eq!(IceCandidate::new("candidate:1 1 udp").address(), None);
    }

    #[test]
    fn test_explicit_address_wins() {
        let candidate = IceCandidate {
            address: Some("203.0.113.9".to_string()),
            ..IceCandidate::new(HOST)
        };
        assert_eq!(candidate.address(), Some("203.0.113.9"));
    }

    #[test]
    fn test_filter() {
        let filter = IceCandidateFilter::new(["192.168.1.20", "10.8.0.1"]);
        assert!(!filter.permits(&IceCandidate::new(HOST)));
        assert!(filter.permits(&IceCandidate::new(
            "candidate:1 1 udp 1677729535 198.51.100.4 3478 typ srflx"
        )));
        // Nothing to match against: let the peer connection decide
        assert!(filter.permits(&IceCandidate::new("")));
    }

    #[test]
    fn test_empty_filter_permits_everything() {
        let filter = IceCandidateFilter::default();
        assert!(filter.is_empty());
        assert!(filter.permits(&IceCandidate::new(HOST)));
    }

    #[test]
    fn test_wire_names() {
        let json = r#"{"candidate":"c","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"uf"}"#;
        let candidate: IceCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(serde_json::to_string(&candidate).unwrap(), json);
    }
}
