//! Peer Connection Capability
//!
//! The tunnel engine drives the peer-to-peer transport only through the
//! traits in this module:
//! - [`PeerConnection`]: offer/answer, remote candidates, labeled data channels
//! - [`DataChannel`]: send/close plus an event receiver per channel
//! - [`PeerFactory`]: creates peer connections for a session
//!
//! [`rtc`] implements them on top of the `webrtc` crate; [`memory`] links
//! peers inside one process for tests.

pub mod memory;
pub mod rtc;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::candidate::IceCandidate;
use crate::error::Result;
use crate::protocol::{IceServer, SessionDescription};

pub use memory::{MemoryChannel, MemoryNetwork, MemoryPeer};
pub use rtc::RtcPeerFactory;

/// Events delivered for one data channel, in the order they happened
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Channel is ready to send
    Open,
    /// A text or binary message from the remote side
    Message(Bytes),
    /// Transport reported an error on the channel
    Error(String),
    /// Channel closed (locally or remotely); no more events follow
    Close,
}

/// Receiver half of a channel's event stream
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// One labeled, ordered and reliable sub-channel of a peer connection
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    /// Send a binary message
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Send a text message
    async fn send_text(&self, text: &str) -> Result<()>;

    /// Close the channel. Calling it again is a no-op.
    async fn close(&self);

    /// Take the event receiver. Only the first call returns `Some`.
    fn take_events(&self) -> Option<ChannelEvents>;
}

/// Coarse connection state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// Whether the connection can no longer carry data
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Failed | PeerState::Closed)
    }
}

/// Events delivered for one peer connection
pub enum PeerEvent {
    /// A local candidate to forward to the remote peer
    IceCandidate(IceCandidate),
    /// A data channel opened by the remote peer
    DataChannel(Arc<dyn DataChannel>),
    StateChanged(PeerState),
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            PeerEvent::DataChannel(dc) => f.debug_tuple("DataChannel").field(&dc.label()).finish(),
            PeerEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
        }
    }
}

/// Receiver half of a peer connection's event stream
pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

/// One end-to-end encrypted peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an offer and apply it as the local description
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer and apply it as the local description
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Open an ordered, reliable data channel
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;

    /// Close the connection and every channel on it. Calling it again is a no-op.
    async fn close(&self);

    /// Take the event receiver. Only the first call returns `Some`.
    fn take_events(&self) -> Option<PeerEvents>;
}

/// Parameters for a new peer connection
#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    /// STUN/TURN servers used for candidate gathering
    pub ice_servers: Vec<IceServer>,

    /// Gather relayed candidates only
    pub relay_only: bool,
}

impl PeerConfig {
    pub fn new(ice_servers: Vec<IceServer>) -> Self {
        Self {
            ice_servers,
            relay_only: false,
        }
    }

    /// Builder pattern: restrict gathering to relayed paths
    pub fn with_relay_only(mut self, relay_only: bool) -> Self {
        self.relay_only = relay_only;
        self
    }
}

/// Creates peer connections
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, config: PeerConfig) -> Result<Arc<dyn PeerConnection>>;
}
