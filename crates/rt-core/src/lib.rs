//! RTunnel Core Library
//!
//! This crate provides the tunneling engine of RTunnel: TCP services exposed
//! by one peer are reached through WebRTC data channels by another, with a
//! Socket.IO relay used only to exchange offers, answers and candidates.
//! It includes:
//! - listening and sending session endpoints
//! - per-connection stream relays and the liveness heartbeat
//! - the peer connection capability (`webrtc` and in-memory)
//! - the signaling client (Socket.IO and in-memory)

pub mod brand;
pub mod candidate;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod listen;
pub mod mapping;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod send;
pub mod session;
pub mod signaling;
pub mod slots;

mod sync;

pub use candidate::{IceCandidate, IceCandidateFilter};
pub use config::TunnelConfig;
pub use error::{Result, TunnelError};
pub use heartbeat::{HeartbeatConfig, HeartbeatExit, HeartbeatMonitor};
pub use listen::ListenEndpoint;
pub use mapping::Mapping;
pub use peer::{PeerFactory, RtcPeerFactory};
pub use protocol::{AnswerPayload, CandidatePayload, IceServer, OfferPayload, TunnelMessage};
pub use relay::{RelayHandle, RelayState, StreamRelay};
pub use send::SendEndpoint;
pub use session::{SessionEvent, SessionEventReceiver, SessionEventSender, SessionRole, SessionSettings};
pub use signaling::{SignalingClient, SignalingEvent, SocketIoClient, SocketIoConfig};
pub use slots::SlotAllocator;
