//! Listening Endpoint
//!
//! The offering side of a session. Once its liveness channel opens it binds a
//! TCP listener per [`Mapping`]; every accepted connection gets a numbered
//! stream slot and a data channel named after it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::candidate::IceCandidate;
use crate::error::Result;
use crate::mapping::Mapping;
use crate::peer::{PeerConfig, PeerFactory};
use crate::protocol::{stream_label, IceServer, OfferPayload, SessionDescription, HEARTBEAT_LABEL};
use crate::relay::StreamRelay;
use crate::session::{SessionCore, SessionEventSender, SessionRole, SessionSettings};
use crate::slots::SlotAllocator;
use crate::sync::lock;

/// Text written to connections refused for lack of a free slot
pub fn capacity_notice(limit: usize) -> String {
    format!("current tunnel count >= limit {}", limit)
}

/// Offering side of one peer session
pub struct ListenEndpoint {
    core: Arc<SessionCore>,
    ice_servers: Vec<IceServer>,
    slots: Arc<Mutex<SlotAllocator>>,
    started: AtomicBool,
}

impl ListenEndpoint {
    /// Create the peer connection and its liveness channel
    pub async fn create(
        id: impl Into<String>,
        ice_servers: Vec<IceServer>,
        factory: &dyn PeerFactory,
        settings: SessionSettings,
        events: SessionEventSender,
    ) -> Result<Arc<Self>> {
        let id = id.into();
        let peer = factory.create(PeerConfig::new(ice_servers.clone())).await?;
        let heart = match peer.create_data_channel(HEARTBEAT_LABEL).await {
            Ok(heart) => heart,
            Err(e) => {
                peer.close().await;
                return Err(e);
            }
        };

        let core = SessionCore::new(id, SessionRole::Listen, peer, settings.filter, events);
        core.spawn_heartbeat(heart, settings.heartbeat);

        let session_id = core.id().to_string();
        core.spawn_peer_events(move |channel| {
            debug!(
                "Listen session {} ignoring remote channel '{}'",
                session_id,
                channel.label()
            );
            tokio::spawn(async move { channel.close().await });
        });

        Ok(Arc::new(Self {
            core,
            ice_servers,
            slots: Arc::new(Mutex::new(SlotAllocator::new(settings.tunnel_limit))),
            started: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> &str {
        self.core.id()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Create and apply the local offer
    pub async fn create_offer(&self) -> Result<OfferPayload> {
        match self.core.peer().create_offer().await {
            Ok(offer) => Ok(OfferPayload {
                id: self.id().to_string(),
                offer,
                ice_servers: self.ice_servers.clone(),
            }),
            Err(e) => {
                self.close(&format!("offer failed: {}", e)).await;
                Err(e)
            }
        }
    }

    /// Start reporting local candidates, beginning with those gathered so far.
    ///
    /// Call once the offer has been delivered so no candidate overtakes it.
    pub fn release_candidates(&self) {
        self.core.release_candidates();
    }

    /// Apply the remote answer; failure aborts the session
    pub async fn set_answer(&self, answer: SessionDescription) -> Result<()> {
        if let Err(e) = self.core.peer().set_remote_description(answer).await {
            self.close(&format!("answer rejected: {}", e)).await;
            return Err(e);
        }
        self.core.remote_description_applied().await;
        Ok(())
    }

    pub async fn set_candidate(&self, candidate: IceCandidate) {
        self.core.add_candidate(candidate).await;
    }

    /// Bind one listener per mapping; a second call does nothing.
    ///
    /// Mappings that fail to bind are skipped.
    pub async fn start_listening(&self, mappings: &[Mapping]) -> Vec<(SocketAddr, Mapping)> {
        if self.is_closed() || self.started.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }

        let mut bound = Vec::new();
        for mapping in mappings {
            let local = mapping.local_addr();
            let listener = match TcpListener::bind(&local).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!("Failed to bind {} for {}: {}", local, mapping, e);
                    continue;
                }
            };
            let address = match listener.local_addr() {
                Ok(address) => address,
                Err(e) => {
                    warn!("Failed to read bound address for {}: {}", mapping, e);
                    continue;
                }
            };

            info!("listen {} => {}", address, mapping.remote_addr());

            let task = tokio::spawn(accept_loop(
                listener,
                mapping.clone(),
                Arc::downgrade(&self.core),
                Arc::clone(&self.slots),
            ));
            self.core.own_task(task.abort_handle());
            bound.push((address, mapping.clone()));
        }
        bound
    }

    /// Slots held by live relays, ascending
    pub fn active_slots(&self) -> Vec<u32> {
        lock(&self.slots).in_use()
    }

    pub fn relay_count(&self) -> usize {
        self.core.relay_count()
    }

    pub fn tunnel_limit(&self) -> usize {
        lock(&self.slots).capacity()
    }

    /// Stop listeners, relays, heartbeat and peer connection
    pub async fn close(&self, reason: &str) {
        self.core.close(reason).await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    mapping: Mapping,
    core: Weak<SessionCore>,
    slots: Arc<Mutex<SlotAllocator>>,
) {
    let Some(cancel) = core.upgrade().map(|core| core.cancel_token().clone()) else {
        return;
    };

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (socket, from) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept error on {}: {}", mapping, e);
                continue;
            }
        };
        let Some(session) = core.upgrade() else {
            break;
        };

        let slot = lock(&slots).acquire();
        match slot {
            Some(slot) => {
                debug!("Accepted {} as stream {}", from, slot);
                tokio::spawn(open_stream(session, Arc::clone(&slots), slot, socket, mapping.clone()));
            }
            None => {
                let limit = lock(&slots).capacity();
                debug!("Rejecting {}: {} streams in use", from, limit);
                tokio::spawn(reject(socket, limit));
            }
        }
    }
}

async fn reject(mut socket: TcpStream, limit: usize) {
    let _ = socket.write_all(capacity_notice(limit).as_bytes()).await;
    let _ = socket.shutdown().await;
}

async fn open_stream(
    core: Arc<SessionCore>,
    slots: Arc<Mutex<SlotAllocator>>,
    slot: u32,
    socket: TcpStream,
    mapping: Mapping,
) {
    let label = stream_label(slot);
    let channel = match core.peer().create_data_channel(&label).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!("Failed to open channel '{}': {}", label, e);
            lock(&slots).release(slot);
            return;
        }
    };

    let relay = StreamRelay::listener(channel, socket, mapping);
    let relay_id = relay.id();
    let session = Arc::downgrade(&core);
    let relay = relay.on_close(move || {
        // Forget the relay before the slot can be handed out again
        if let Some(session) = session.upgrade() {
            session.remove_relay(slot, relay_id);
        }
        lock(&slots).release(slot);
    });

    let handle = relay.handle();
    if !core.insert_relay(slot, handle.clone()) {
        handle.close().await;
        return;
    }
    relay.spawn();
}
