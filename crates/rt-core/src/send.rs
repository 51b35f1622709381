//! Sending Endpoint
//!
//! The answering side of a session. It never listens on anything: every
//! stream channel the remote peer opens names its target in its first message
//! and is dialed from here.

use std::sync::Arc;
use tracing::{debug, info};

use crate::candidate::IceCandidate;
use crate::error::Result;
use crate::heartbeat::HeartbeatConfig;
use crate::peer::{DataChannel, PeerConfig, PeerFactory};
use crate::protocol::{AnswerPayload, ChannelKind, IceServer, SessionDescription};
use crate::relay::StreamRelay;
use crate::session::{SessionCore, SessionEventSender, SessionRole, SessionSettings};

/// Answering side of one peer session
pub struct SendEndpoint {
    core: Arc<SessionCore>,
}

impl SendEndpoint {
    /// Create a relay-only peer connection for the offer `id`
    pub async fn create(
        id: impl Into<String>,
        ice_servers: Vec<IceServer>,
        factory: &dyn PeerFactory,
        settings: SessionSettings,
        events: SessionEventSender,
    ) -> Result<Arc<Self>> {
        let config = PeerConfig::new(ice_servers).with_relay_only(true);
        let peer = factory.create(config).await?;
        let core = SessionCore::new(id.into(), SessionRole::Send, peer, settings.filter, events);

        let weak = Arc::downgrade(&core);
        let heartbeat = settings.heartbeat;
        core.spawn_peer_events(move |channel| {
            if let Some(core) = weak.upgrade() {
                dispatch_channel(&core, channel, heartbeat);
            }
        });

        Ok(Arc::new(Self { core }))
    }

    pub fn id(&self) -> &str {
        self.core.id()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Apply the remote offer and answer it; failure aborts the session
    pub async fn set_offer(&self, offer: SessionDescription) -> Result<AnswerPayload> {
        let peer = self.core.peer();
        if let Err(e) = peer.set_remote_description(offer).await {
            self.close(&format!("offer rejected: {}", e)).await;
            return Err(e);
        }
        self.core.remote_description_applied().await;

        match peer.create_answer().await {
            Ok(answer) => Ok(AnswerPayload {
                id: self.id().to_string(),
                answer,
            }),
            Err(e) => {
                self.close(&format!("answer failed: {}", e)).await;
                Err(e)
            }
        }
    }

    pub async fn set_candidate(&self, candidate: IceCandidate) {
        self.core.add_candidate(candidate).await;
    }

    /// Stream numbers with a live relay, ascending
    pub fn active_streams(&self) -> Vec<u32> {
        self.core.relay_slots()
    }

    pub fn relay_count(&self) -> usize {
        self.core.relay_count()
    }

    /// Stop relays, heartbeat and peer connection
    pub async fn close(&self, reason: &str) {
        self.core.close(reason).await;
    }
}

/// Route a channel opened by the listening peer by its label
fn dispatch_channel(core: &Arc<SessionCore>, channel: Arc<dyn DataChannel>, heartbeat: HeartbeatConfig) {
    match ChannelKind::from_label(channel.label()) {
        ChannelKind::Heartbeat => {
            info!("Send session {} liveness channel opened", core.id());
            core.spawn_heartbeat(channel, heartbeat);
        }
        ChannelKind::Stream(slot) => {
            let relay = StreamRelay::receiver(channel);
            let relay_id = relay.id();
            let session = Arc::downgrade(core);
            let relay = relay.on_close(move || {
                if let Some(session) = session.upgrade() {
                    session.remove_relay(slot, relay_id);
                }
            });

            let handle = relay.handle();
            if core.insert_relay(slot, handle.clone()) {
                relay.spawn();
            } else {
                tokio::spawn(async move { handle.close().await });
            }
        }
        ChannelKind::Unknown => {
            debug!(
                "Send session {} closing unknown channel '{}'",
                core.id(),
                channel.label()
            );
            tokio::spawn(async move { channel.close().await });
        }
    }
}
