//! WebRTC Peer Connections
//!
//! Implements the peer capability with the `webrtc` crate. Callback-style
//! handlers are turned into the event receivers of [`PeerEvent`] and
//! [`ChannelEvent`].

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{
    ChannelEvent, ChannelEvents, DataChannel, PeerConfig, PeerConnection, PeerEvent, PeerEvents,
    PeerFactory, PeerState,
};
use crate::candidate::IceCandidate;
use crate::error::{Result, TunnelError};
use crate::protocol::{IceServer, SdpType, SessionDescription};
use crate::sync::lock;

/// Builds `webrtc` peer connections
pub struct RtcPeerFactory {
    api: API,
}

impl RtcPeerFactory {
    pub fn new() -> Self {
        Self {
            api: APIBuilder::new().build(),
        }
    }
}

impl Default for RtcPeerFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(&self, config: PeerConfig) -> Result<Arc<dyn PeerConnection>> {
        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.iter().map(to_rtc_ice_server).collect(),
            ice_transport_policy: if config.relay_only {
                RTCIceTransportPolicy::Relay
            } else {
                RTCIceTransportPolicy::All
            },
            ..Default::default()
        };

        let pc = self
            .api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| TunnelError::PeerConnection(e.to_string()))?;

        Ok(Arc::new(RtcPeerConnection::new(Arc::new(pc))))
    }
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let result = match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => {
            return Err(TunnelError::Negotiation(
                "rollback descriptions are not supported".to_string(),
            ));
        }
    };
    result.map_err(TunnelError::from)
}

fn from_rtc_candidate(candidate: &RTCIceCandidate) -> Option<IceCandidate> {
    let init = candidate.to_json().ok()?;
    Some(IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
        address: Some(candidate.address.clone()).filter(|a| !a.is_empty()),
    })
}

fn from_rtc_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Peer Connection
// ─────────────────────────────────────────────────────────────────────────────

/// [`PeerConnection`] backed by an `RTCPeerConnection`
pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    events: Mutex<Option<PeerEvents>>,
    closed: AtomicBool,
}

impl RtcPeerConnection {
    pub fn new(pc: Arc<RTCPeerConnection>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let tx = event_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                // `None` marks the end of gathering
                if let Some(candidate) = candidate.as_ref().and_then(from_rtc_candidate) {
                    let _ = tx.send(PeerEvent::IceCandidate(candidate));
                }
            })
        }));

        let tx = event_tx.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!("Remote opened data channel '{}'", dc.label());
                let channel: Arc<dyn DataChannel> = Arc::new(RtcDataChannel::new(dc));
                let _ = tx.send(PeerEvent::DataChannel(channel));
            })
        }));

        let tx = event_tx;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!("Peer connection state: {}", state);
                let _ = tx.send(PeerEvent::StateChanged(from_rtc_state(state)));
            })
        }));

        Self {
            pc,
            events: Mutex::new(Some(event_rx)),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        self.pc.set_remote_description(description).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TunnelError::Candidate(e.to_string()))
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| TunnelError::ChannelOpen {
                label: label.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Arc::new(RtcDataChannel::new(dc)))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            warn!("Error closing peer connection: {}", e);
        }
    }

    fn take_events(&self) -> Option<PeerEvents> {
        lock(&self.events).take()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Data Channel
// ─────────────────────────────────────────────────────────────────────────────

/// [`DataChannel`] backed by an `RTCDataChannel`
pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    events: Mutex<Option<ChannelEvents>>,
    closed: AtomicBool,
}

impl RtcDataChannel {
    pub fn new(dc: Arc<RTCDataChannel>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let opened = Arc::new(AtomicBool::new(false));

        // Remotely created channels are usually open already
        if dc.ready_state() == RTCDataChannelState::Open && !opened.swap(true, Ordering::SeqCst) {
            let _ = event_tx.send(ChannelEvent::Open);
        }

        let tx = event_tx.clone();
        let open_flag = Arc::clone(&opened);
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                if !open_flag.swap(true, Ordering::SeqCst) {
                    let _ = tx.send(ChannelEvent::Open);
                }
            })
        }));

        let tx = event_tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Message(msg.data));
            })
        }));

        let tx = event_tx.clone();
        dc.on_error(Box::new(move |err: webrtc::Error| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Error(err.to_string()));
            })
        }));

        let tx = event_tx;
        dc.on_close(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Close);
            })
        }));

        Self {
            label: dc.label().to_string(),
            dc,
            events: Mutex::new(Some(event_rx)),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| TunnelError::ChannelSend(e.to_string()))
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.dc
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|e| TunnelError::ChannelSend(e.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.dc.close().await {
            debug!("Error closing data channel '{}': {}", self.label, e);
        }
    }

    fn take_events(&self) -> Option<ChannelEvents> {
        lock(&self.events).take()
    }
}
