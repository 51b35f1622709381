//! RTunnel Protocol Definition
//!
//! Defines the wire formats shared by both peers:
//! - data channel labels and the in-band mapping control message
//! - the `tunnel` signaling envelope exchanged through the relay
//! - session descriptions and ICE server descriptors

use serde::{Deserialize, Deserializer, Serialize};

use crate::candidate::IceCandidate;
use crate::error::{Result, TunnelError};
use crate::mapping::Mapping;

/// Label of the liveness data channel
pub const HEARTBEAT_LABEL: &str = "heart";

/// Prefix of every stream data channel label
pub const STREAM_LABEL_PREFIX: &str = "tcpDataChannel_";

/// Signaling event carrying the shared secret
pub const SECRET_KEY_EVENT: &str = "secretKey";

/// Signaling event carrying [`TunnelMessage`]s
pub const TUNNEL_EVENT: &str = "tunnel";

/// Signaling request returning the ICE server list
pub const ICE_SERVER_EVENT: &str = "iceServer";

/// Label for the stream data channel occupying `slot`
pub fn stream_label(slot: u32) -> String {
    format!("{}{}", STREAM_LABEL_PREFIX, slot)
}

/// Parse the slot number out of a stream label (`tcpDataChannel_<digits>`)
pub fn parse_stream_label(label: &str) -> Option<u32> {
    let digits = label.strip_prefix(STREAM_LABEL_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// What an inbound data channel is for, judged by its label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Heartbeat,
    Stream(u32),
    Unknown,
}

impl ChannelKind {
    pub fn from_label(label: &str) -> Self {
        if label == HEARTBEAT_LABEL {
            ChannelKind::Heartbeat
        } else if let Some(slot) = parse_stream_label(label) {
            ChannelKind::Stream(slot)
        } else {
            ChannelKind::Unknown
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-band Control Message
// ─────────────────────────────────────────────────────────────────────────────

/// First message on every stream data channel, sent by the listening side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ControlMessage {
    Mapping(Mapping),
}

impl ControlMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| TunnelError::InvalidControlMessage(e.to_string()))
    }

    pub fn into_mapping(self) -> Mapping {
        match self {
            ControlMessage::Mapping(mapping) => mapping,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session Descriptions and ICE Servers
// ─────────────────────────────────────────────────────────────────────────────

/// SDP message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as exchanged over signaling (`{ type, sdp }`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// STUN/TURN server descriptor handed out by the relay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Signaling Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Payload of `tunnel` events (`{ type, data }`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TunnelMessage {
    #[serde(rename = "offer")]
    Offer(OfferPayload),

    #[serde(rename = "answer")]
    Answer(AnswerPayload),

    /// Candidate gathered by a listening session, for the sending peer
    #[serde(rename = "tcpListen_icecandidate")]
    ListenCandidate(CandidatePayload),

    /// Candidate gathered by a sending session, for the listening peer
    #[serde(rename = "tcpSend_icecandidate")]
    SendCandidate(CandidatePayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub id: String,
    pub offer: SessionDescription,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub id: String,
    pub answer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub id: String,
    pub candidate: IceCandidate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_labels() {
        assert_eq!(stream_label(7), "tcpDataChannel_7");
        assert_eq!(parse_stream_label("tcpDataChannel_42"), Some(42));
        assert_eq!(parse_stream_label("tcpDataChannel_"), None);
        assert_eq!(parse_stream_label("tcpDataChannel_4x"), None);
        assert_eq!(parse_stream_label("tcpDataChannel_+4"), None);
        assert_eq!(parse_stream_label("other_4"), None);
    }

    #[test]
    fn test_channel_kind() {
        assert_eq!(ChannelKind::from_label("heart"), ChannelKind::Heartbeat);
        assert_eq!(ChannelKind::from_label("tcpDataChannel_3"), ChannelKind::Stream(3));
        assert_eq!(ChannelKind::from_label("chat"), ChannelKind::Unknown);
    }

    #[test]
    fn test_control_message_format() {
        let msg = ControlMessage::Mapping(Mapping::new("10.0.0.5", 22).with_local_port(9000));
        let encoded = msg.encode().unwrap();
        assert_eq!(
            encoded,
            r#"{"type":"mapping","data":{"localPort":9000,"remoteIp":"10.0.0.5","remotePort":22}}"#
        );
        assert_eq!(ControlMessage::decode(encoded.as_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_control_message_rejects_garbage() {
        assert!(ControlMessage::decode(b"\x00\x01binary").is_err());
        assert!(ControlMessage::decode(br#"{"type":"other","data":{}}"#).is_err());
    }

    #[test]
    fn test_offer_envelope() {
        let json = r#"{
            "type": "offer",
            "data": {
                "id": "abc",
                "offer": { "type": "offer", "sdp": "v=0" },
                "iceServers": [
                    { "urls": "stun:stun.example.org:3478" },
                    { "urls": ["turn:turn.example.org"], "username": "u", "credential": "p" }
                ]
            }
        }"#;

        match serde_json::from_str::<TunnelMessage>(json).unwrap() {
            TunnelMessage::Offer(offer) => {
                assert_eq!(offer.id, "abc");
                assert_eq!(offer.offer.kind, SdpType::Offer);
                assert_eq!(offer.ice_servers.len(), 2);
                assert_eq!(offer.ice_servers[0].urls, vec!["stun:stun.example.org:3478"]);
                assert_eq!(offer.ice_servers[1].username.as_deref(), Some("u"));
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_candidate_envelope_type_names() {
        let payload = CandidatePayload {
            id: "abc".to_string(),
            candidate: IceCandidate::new("candidate:1 1 udp 1 192.0.2.1 5000 typ host"),
        };
        let listen = serde_json::to_value(TunnelMessage::ListenCandidate(payload.clone())).unwrap();
        let send = serde_json::to_value(TunnelMessage::SendCandidate(payload)).unwrap();
        assert_eq!(listen["type"], "tcpListen_icecandidate");
        assert_eq!(send["type"], "tcpSend_icecandidate");
        assert_eq!(send["data"]["id"], "abc");
    }
}
