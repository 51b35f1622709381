//! In-Process Peer Network
//!
//! Links [`MemoryPeer`]s created by one [`MemoryNetwork`] without any real
//! transport. Offers and answers are tokens naming the peer that produced
//! them; applying the answer on the offering side connects the pair and opens
//! every data channel created so far. Used by the integration tests and handy
//! for exercising endpoints without network access.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    ChannelEvent, ChannelEvents, DataChannel, PeerConfig, PeerConnection, PeerEvent, PeerEvents,
    PeerFactory, PeerState,
};
use crate::candidate::IceCandidate;
use crate::error::{Result, TunnelError};
use crate::protocol::{SdpType, SessionDescription};
use crate::sync::lock;

const SDP_PREFIX: &str = "memory:";

/// Address advertised in locally gathered candidates by default
pub const DEFAULT_CANDIDATE_ADDRESS: &str = "127.0.0.1";

// ─────────────────────────────────────────────────────────────────────────────
// Network
// ─────────────────────────────────────────────────────────────────────────────

/// Factory and rendezvous point for in-process peers
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

struct NetworkInner {
    registry: Mutex<HashMap<String, Weak<PeerShared>>>,
    peers: Mutex<Vec<Arc<MemoryPeer>>>,
    candidate_address: String,
    next_port: AtomicU16,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_candidate_address(DEFAULT_CANDIDATE_ADDRESS)
    }

    /// Network whose peers advertise `address` in their candidates
    pub fn with_candidate_address(address: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                registry: Mutex::new(HashMap::new()),
                peers: Mutex::new(Vec::new()),
                candidate_address: address.into(),
                next_port: AtomicU16::new(50000),
            }),
        }
    }

    /// Every peer created so far, in creation order
    pub fn peers(&self) -> Vec<Arc<MemoryPeer>> {
        lock(&self.inner.peers).clone()
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerFactory for MemoryNetwork {
    async fn create(&self, config: PeerConfig) -> Result<Arc<dyn PeerConnection>> {
        let peer = Arc::new(MemoryPeer::new(config, Arc::clone(&self.inner)));
        lock(&self.inner.registry).insert(peer.shared.id.clone(), Arc::downgrade(&peer.shared));
        lock(&self.inner.peers).push(Arc::clone(&peer));
        Ok(peer)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Peer
// ─────────────────────────────────────────────────────────────────────────────

/// In-process [`PeerConnection`]
pub struct MemoryPeer {
    shared: Arc<PeerShared>,
    network: Arc<NetworkInner>,
}

struct PeerShared {
    id: String,
    config: PeerConfig,
    event_tx: mpsc::UnboundedSender<PeerEvent>,
    events: Mutex<Option<PeerEvents>>,
    link: Mutex<LinkState>,
    added_candidates: Mutex<Vec<IceCandidate>>,
    closed: AtomicBool,
    reject_remote_description: AtomicBool,
}

#[derive(Default)]
struct LinkState {
    remote: Option<Weak<PeerShared>>,
    remote_description: Option<SessionDescription>,
    connected: bool,
    /// Local channels created before the connection was established
    pending: Vec<Arc<MemoryChannel>>,
    /// Every channel half this peer owns
    channels: Vec<Weak<MemoryChannel>>,
}

impl MemoryPeer {
    fn new(config: PeerConfig, network: Arc<NetworkInner>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(PeerShared {
                id: uuid::Uuid::new_v4().to_string(),
                config,
                event_tx,
                events: Mutex::new(Some(event_rx)),
                link: Mutex::new(LinkState::default()),
                added_candidates: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                reject_remote_description: AtomicBool::new(false),
            }),
            network,
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn config(&self) -> &PeerConfig {
        &self.shared.config
    }

    /// Remote candidates applied through [`PeerConnection::add_ice_candidate`]
    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.shared.added_candidates).clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared.link).connected
    }

    /// The live channel half labelled `label` on this peer
    pub fn channel(&self, label: &str) -> Option<Arc<MemoryChannel>> {
        lock(&self.shared.link)
            .channels
            .iter()
            .filter_map(Weak::upgrade)
            .find(|channel| channel.label == label)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Make the next remote descriptions fail to apply
    pub fn reject_remote_description(&self, reject: bool) {
        self.shared
            .reject_remote_description
            .store(reject, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed(self.shared.id.clone()));
        }
        Ok(())
    }

    fn local_description(&self, kind: SdpType) -> SessionDescription {
        SessionDescription {
            kind,
            sdp: format!("{}{}", SDP_PREFIX, self.shared.id),
        }
    }

    fn gather_candidate(&self) {
        let port = self.network.next_port.fetch_add(1, Ordering::Relaxed);
        let typ = if self.shared.config.relay_only { "relay" } else { "host" };
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:1 1 udp 2122260223 {} {} typ {}",
                self.network.candidate_address, port, typ
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
            address: None,
        };
        let _ = self.shared.event_tx.send(PeerEvent::IceCandidate(candidate));
    }

    fn lookup(&self, description: &SessionDescription) -> Result<Arc<PeerShared>> {
        let id = description
            .sdp
            .strip_prefix(SDP_PREFIX)
            .ok_or_else(|| TunnelError::Negotiation("not a memory session description".to_string()))?;
        lock(&self.network.registry)
            .get(id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TunnelError::Negotiation(format!("unknown memory peer {}", id)))
    }
}

/// Connect both peers and open every pending channel on either side
fn establish(initiator: &Arc<PeerShared>, responder: &Arc<PeerShared>) {
    let pending_initiator = {
        let mut link = lock(&initiator.link);
        link.connected = true;
        std::mem::take(&mut link.pending)
    };
    let pending_responder = {
        let mut link = lock(&responder.link);
        link.connected = true;
        std::mem::take(&mut link.pending)
    };

    for local in pending_initiator {
        open_pair(&local, responder);
    }
    for local in pending_responder {
        open_pair(&local, initiator);
    }

    let _ = initiator.event_tx.send(PeerEvent::StateChanged(PeerState::Connected));
    let _ = responder.event_tx.send(PeerEvent::StateChanged(PeerState::Connected));
}

/// Create the remote half for `local`, open both and announce it to `remote_peer`
fn open_pair(local: &Arc<MemoryChannel>, remote_peer: &Arc<PeerShared>) {
    let remote = Arc::new(MemoryChannel::new(local.label()));
    local.attach(&remote);
    remote.attach(local);
    lock(&remote_peer.link).channels.push(Arc::downgrade(&remote));

    local.deliver(ChannelEvent::Open);
    remote.deliver(ChannelEvent::Open);
    let _ = remote_peer.event_tx.send(PeerEvent::DataChannel(remote));
}

#[async_trait]
impl PeerConnection for MemoryPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        self.gather_candidate();
        Ok(self.local_description(SdpType::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        let has_offer = matches!(
            lock(&self.shared.link).remote_description,
            Some(SessionDescription { kind: SdpType::Offer, .. })
        );
        if !has_offer {
            return Err(TunnelError::Negotiation(
                "cannot answer without a remote offer".to_string(),
            ));
        }
        self.gather_candidate();
        Ok(self.local_description(SdpType::Answer))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        if self.shared.reject_remote_description.load(Ordering::SeqCst) {
            return Err(TunnelError::Negotiation(
                "remote description rejected".to_string(),
            ));
        }

        let remote = self.lookup(&description)?;
        let kind = description.kind;
        {
            let mut link = lock(&self.shared.link);
            link.remote = Some(Arc::downgrade(&remote));
            link.remote_description = Some(description);
        }

        if kind == SdpType::Answer {
            lock(&remote.link).remote = Some(Arc::downgrade(&self.shared));
            establish(&self.shared, &remote);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        if lock(&self.shared.link).remote_description.is_none() {
            return Err(TunnelError::Candidate(
                "remote description not set".to_string(),
            ));
        }
        lock(&self.shared.added_candidates).push(candidate);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        self.ensure_open()?;
        let local = Arc::new(MemoryChannel::new(label));

        let remote_peer = {
            let mut link = lock(&self.shared.link);
            link.channels.push(Arc::downgrade(&local));
            if link.connected {
                link.remote.as_ref().and_then(Weak::upgrade)
            } else {
                link.pending.push(Arc::clone(&local));
                None
            }
        };

        if let Some(remote_peer) = remote_peer {
            open_pair(&local, &remote_peer);
        }
        Ok(local)
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing memory peer {}", self.shared.id);

        let (channels, remote) = {
            let mut link = lock(&self.shared.link);
            link.pending.clear();
            link.connected = false;
            (std::mem::take(&mut link.channels), link.remote.take())
        };
        for channel in channels.iter().filter_map(Weak::upgrade) {
            channel.close().await;
        }

        let _ = self.shared.event_tx.send(PeerEvent::StateChanged(PeerState::Closed));
        if let Some(remote) = remote.and_then(|r| r.upgrade()) {
            let _ = remote
                .event_tx
                .send(PeerEvent::StateChanged(PeerState::Disconnected));
        }
    }

    fn take_events(&self) -> Option<PeerEvents> {
        lock(&self.shared.events).take()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Channel
// ─────────────────────────────────────────────────────────────────────────────

/// One half of an in-process data channel
pub struct MemoryChannel {
    label: String,
    event_tx: mpsc::UnboundedSender<ChannelEvent>,
    events: Mutex<Option<ChannelEvents>>,
    peer: Mutex<Option<Weak<MemoryChannel>>>,
    closed: AtomicBool,
    failing_sends: AtomicUsize,
}

impl MemoryChannel {
    fn new(label: &str) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            label: label.to_string(),
            event_tx,
            events: Mutex::new(Some(event_rx)),
            peer: Mutex::new(None),
            closed: AtomicBool::new(false),
            failing_sends: AtomicUsize::new(0),
        }
    }

    /// Two connected, already open halves of a channel
    pub fn pair(label: &str) -> (Arc<MemoryChannel>, Arc<MemoryChannel>) {
        let a = Arc::new(MemoryChannel::new(label));
        let b = Arc::new(MemoryChannel::new(label));
        a.attach(&b);
        b.attach(&a);
        a.deliver(ChannelEvent::Open);
        b.deliver(ChannelEvent::Open);
        (a, b)
    }

    /// Make the next `count` sends fail (`usize::MAX` for all of them)
    pub fn fail_next_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    /// Inject a transport error event into this half
    pub fn inject_error(&self, message: &str) {
        self.deliver(ChannelEvent::Error(message.to_string()));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn attach(&self, peer: &Arc<MemoryChannel>) {
        *lock(&self.peer) = Some(Arc::downgrade(peer));
    }

    fn deliver(&self, event: ChannelEvent) {
        let _ = self.event_tx.send(event);
    }

    /// The other half closed
    fn remote_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.deliver(ChannelEvent::Close);
        }
    }

    fn take_failure(&self) -> bool {
        self.failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }

    fn transmit(&self, data: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(TunnelError::ChannelClosed(self.label.clone()));
        }
        if self.take_failure() {
            return Err(TunnelError::ChannelSend("injected failure".to_string()));
        }
        let peer = lock(&self.peer).as_ref().and_then(Weak::upgrade);
        match peer {
            Some(peer) if !peer.is_closed() => {
                peer.deliver(ChannelEvent::Message(data));
                Ok(())
            }
            Some(_) => Err(TunnelError::ChannelClosed(self.label.clone())),
            None => Err(TunnelError::ChannelSend(format!(
                "channel '{}' is not open",
                self.label
            ))),
        }
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        self.transmit(data)
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.transmit(Bytes::copy_from_slice(text.as_bytes()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.deliver(ChannelEvent::Close);
        let peer = lock(&self.peer).as_ref().and_then(Weak::upgrade);
        if let Some(peer) = peer {
            peer.remote_closed();
        }
    }

    fn take_events(&self) -> Option<ChannelEvents> {
        lock(&self.events).take()
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            let peer = lock(&self.peer).as_ref().and_then(Weak::upgrade);
            if let Some(peer) = peer {
                peer.remote_closed();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_pair_delivers_in_order() {
        let (a, b) = MemoryChannel::pair("test");
        let mut b_events = b.take_events().unwrap();
        assert!(b.take_events().is_none());

        a.send(Bytes::from_static(b"one")).await.unwrap();
        a.send_text("two").await.unwrap();

        assert_eq!(b_events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(b_events.recv().await, Some(ChannelEvent::Message(Bytes::from_static(b"one"))));
        assert_eq!(b_events.recv().await, Some(ChannelEvent::Message(Bytes::from_static(b"two"))));
    }

    #[tokio::test]
    async fn test_close_reaches_both_halves_once() {
        let (a, b) = MemoryChannel::pair("test");
        let mut a_events = a.take_events().unwrap();
        let mut b_events = b.take_events().unwrap();

        a.close().await;
        a.close().await;
        b.close().await;

        assert_eq!(a_events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(a_events.recv().await, Some(ChannelEvent::Close));
        assert!(a_events.try_recv().is_err());
        assert_eq!(b_events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(b_events.recv().await, Some(ChannelEvent::Close));
        assert!(b_events.try_recv().is_err());
        assert!(b.send(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_send_failures() {
        let (a, _b) = MemoryChannel::pair("test");
        a.fail_next_sends(2);
        assert!(a.send_text("1").await.is_err());
        assert!(a.send_text("2").await.is_err());
        assert!(a.send_text("3").await.is_ok());
    }

    #[tokio::test]
    async fn test_offer_answer_opens_pending_channels() {
        let network = MemoryNetwork::new();
        let initiator = network.create(PeerConfig::default()).await.unwrap();
        let responder = network
            .create(PeerConfig::default().with_relay_only(true))
            .await
            .unwrap();
        let mut responder_events = responder.take_events().unwrap();

        let heart = initiator.create_data_channel("heart").await.unwrap();
        let mut heart_events = heart.take_events().unwrap();

        let offer = initiator.create_offer().await.unwrap();
        responder.set_remote_description(offer).await.unwrap();
        let answer = responder.create_answer().await.unwrap();
        initiator.set_remote_description(answer).await.unwrap();

        assert_eq!(heart_events.recv().await, Some(ChannelEvent::Open));

        let mut remote_label = None;
        while let Some(event) = responder_events.recv().await {
            if let PeerEvent::DataChannel(dc) = event {
                remote_label = Some(dc.label().to_string());
                break;
            }
        }
        assert_eq!(remote_label.as_deref(), Some("heart"));

        let peers = network.peers();
        assert_eq!(peers.len(), 2);
        assert!(peers[0].is_connected());
        assert!(peers[1].config().relay_only);
    }

    #[tokio::test]
    async fn test_candidates_need_remote_description() {
        let network = MemoryNetwork::new();
        let peer = network.create(PeerConfig::default()).await.unwrap();
        let result = peer
            .add_ice_candidate(IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 1 typ host"))
            .await;
        assert!(result.is_err());
    }
}
