//! Error types for RTunnel
//!
//! Provides a unified error handling strategy using thiserror.

use thiserror::Error;

/// Result type alias for RTunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Unified error type for all RTunnel operations
#[derive(Error, Debug)]
pub enum TunnelError {
    // ─────────────────────────────────────────────────────────────
    // Signaling Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Signaling connection failed: {0}")]
    SignalingConnection(String),

    #[error("Signaling request '{event}' failed: {reason}")]
    SignalingRequest { event: String, reason: String },

    #[error("Malformed signaling packet: {0}")]
    SignalingPacket(String),

    // ─────────────────────────────────────────────────────────────
    // Negotiation Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to create peer connection: {0}")]
    PeerConnection(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Failed to add ICE candidate: {0}")]
    Candidate(String),

    #[error("Session {0} is closed")]
    SessionClosed(String),

    // ─────────────────────────────────────────────────────────────
    // Channel/Relay Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to open data channel '{label}': {reason}")]
    ChannelOpen { label: String, reason: String },

    #[error("Data channel '{0}' is closed")]
    ChannelClosed(String),

    #[error("Data channel send failed: {0}")]
    ChannelSend(String),

    #[error("Invalid control message: {0}")]
    InvalidControlMessage(String),

    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Configuration file not found")]
    ConfigNotFound,

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<webrtc::Error> for TunnelError {
    fn from(err: webrtc::Error) -> Self {
        TunnelError::Negotiation(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TunnelError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TunnelError::SignalingConnection(err.to_string())
    }
}

impl From<serde_json::Error> for TunnelError {
    fn from(err: serde_json::Error) -> Self {
        TunnelError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for TunnelError {
    fn from(err: toml::de::Error) -> Self {
        TunnelError::ConfigError(err.to_string())
    }
}
