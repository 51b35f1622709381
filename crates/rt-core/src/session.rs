//! Peer Session State
//!
//! State shared by both endpoint roles: the peer connection, the candidate
//! filter and queue, the relay table, the heartbeat and the one-shot close.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::candidate::{IceCandidate, IceCandidateFilter};
use crate::heartbeat::{HeartbeatConfig, HeartbeatExit, HeartbeatMonitor};
use crate::peer::{DataChannel, PeerConnection, PeerEvent};
use crate::relay::RelayHandle;
use crate::slots::DEFAULT_TUNNEL_LIMIT;
use crate::sync::lock;

/// Which side of the tunnel a session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// Exposes local listeners and makes the offer
    Listen,
    /// Answers offers and dials mapped addresses
    Send,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRole::Listen => write!(f, "listen"),
            SessionRole::Send => write!(f, "send"),
        }
    }
}

/// Notifications from a session to its owner
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A local candidate to forward through signaling
    Candidate {
        id: String,
        role: SessionRole,
        candidate: IceCandidate,
    },
    /// The liveness channel opened
    Usable { id: String, role: SessionRole },
    /// The session closed; sent exactly once
    Closed {
        id: String,
        role: SessionRole,
        reason: String,
    },
}

pub type SessionEventSender = mpsc::UnboundedSender<SessionEvent>;
pub type SessionEventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Tunables applied to every session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Maximum concurrent streams per listening session
    pub tunnel_limit: usize,

    pub heartbeat: HeartbeatConfig,

    /// Remote candidates with these addresses are dropped
    pub filter: IceCandidateFilter,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            tunnel_limit: DEFAULT_TUNNEL_LIMIT,
            heartbeat: HeartbeatConfig::default(),
            filter: IceCandidateFilter::default(),
        }
    }
}

impl SessionSettings {
    pub fn with_tunnel_limit(mut self, limit: usize) -> Self {
        self.tunnel_limit = limit;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_filter(mut self, filter: IceCandidateFilter) -> Self {
        self.filter = filter;
        self
    }
}

pub(crate) struct SessionCore {
    id: String,
    role: SessionRole,
    peer: Arc<dyn PeerConnection>,
    filter: IceCandidateFilter,
    events: SessionEventSender,
    relays: Mutex<HashMap<u32, RelayHandle>>,
    /// Tasks aborted when the session closes
    tasks: Mutex<Vec<AbortHandle>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    /// `Some` until the remote description has been applied
    pending_candidates: Mutex<Option<Vec<IceCandidate>>>,
    /// Local candidates held back while `Some`
    held_candidates: Mutex<Option<Vec<IceCandidate>>>,
}

impl SessionCore {
    pub(crate) fn new(
        id: String,
        role: SessionRole,
        peer: Arc<dyn PeerConnection>,
        filter: IceCandidateFilter,
        events: SessionEventSender,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            role,
            peer,
            filter,
            events,
            relays: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            pending_candidates: Mutex::new(Some(Vec::new())),
            // The offering side reports nothing before its offer is out
            held_candidates: Mutex::new((role == SessionRole::Listen).then(Vec::new)),
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn peer(&self) -> &Arc<dyn PeerConnection> {
        &self.peer
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Candidates
    // ─────────────────────────────────────────────────────────────────────────

    /// Filter a remote candidate, then queue or apply it
    pub(crate) async fn add_candidate(&self, candidate: IceCandidate) {
        if self.is_closed() {
            return;
        }
        if !self.filter.permits(&candidate) {
            debug!(
                "Session {} dropped blacklisted candidate {}",
                self.id,
                candidate.address().unwrap_or_default()
            );
            return;
        }

        {
            let mut pending = lock(&self.pending_candidates);
            if let Some(queue) = pending.as_mut() {
                queue.push(candidate);
                return;
            }
        }
        self.apply_candidate(candidate).await;
    }

    /// Apply every queued candidate; later ones go straight to the peer
    pub(crate) async fn remote_description_applied(&self) {
        let queued = lock(&self.pending_candidates).take().unwrap_or_default();
        for candidate in queued {
            self.apply_candidate(candidate).await;
        }
    }

    /// Report a locally gathered candidate, or hold it until released
    fn report_candidate(&self, candidate: IceCandidate) {
        let mut held = lock(&self.held_candidates);
        match held.as_mut() {
            Some(queue) => queue.push(candidate),
            None => self.send_candidate(candidate),
        }
    }

    /// Report every held local candidate; later ones are reported directly
    pub(crate) fn release_candidates(&self) {
        let mut held = lock(&self.held_candidates);
        for candidate in held.take().unwrap_or_default() {
            self.send_candidate(candidate);
        }
    }

    fn send_candidate(&self, candidate: IceCandidate) {
        let _ = self.events.send(SessionEvent::Candidate {
            id: self.id.clone(),
            role: self.role,
            candidate,
        });
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.peer.add_ice_candidate(candidate).await {
            warn!("Session {} failed to add candidate: {}", self.id, e);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Relays
    // ─────────────────────────────────────────────────────────────────────────

    /// Track a relay under `slot`; returns false once the session is closed
    pub(crate) fn insert_relay(&self, slot: u32, relay: RelayHandle) -> bool {
        let mut relays = lock(&self.relays);
        if self.is_closed() {
            return false;
        }
        relays.insert(slot, relay);
        true
    }

    /// Forget the relay under `slot` if it is still the one with `relay_id`
    pub(crate) fn remove_relay(&self, slot: u32, relay_id: u64) -> bool {
        let mut relays = lock(&self.relays);
        match relays.get(&slot) {
            Some(relay) if relay.id() == relay_id => {
                relays.remove(&slot);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn relay_count(&self) -> usize {
        lock(&self.relays).len()
    }

    pub(crate) fn relay_slots(&self) -> Vec<u32> {
        let mut slots: Vec<u32> = lock(&self.relays).keys().copied().collect();
        slots.sort_unstable();
        slots
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Background tasks
    // ─────────────────────────────────────────────────────────────────────────

    /// Tie a task to the session; it is aborted at once if already closed
    pub(crate) fn own_task(&self, task: AbortHandle) {
        let mut tasks = lock(&self.tasks);
        if self.is_closed() {
            task.abort();
            return;
        }
        tasks.push(task);
    }

    /// Drive the liveness channel; its failure closes the session
    pub(crate) fn spawn_heartbeat(self: &Arc<Self>, channel: Arc<dyn DataChannel>, config: HeartbeatConfig) {
        let monitor = HeartbeatMonitor::new(channel, config, self.cancel.child_token());
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let events = core.events.clone();
            let (id, role) = (core.id.clone(), core.role);
            let exit = monitor
                .run(move || {
                    let _ = events.send(SessionEvent::Usable { id, role });
                })
                .await;
            if exit != HeartbeatExit::Cancelled {
                core.close(&exit.to_string()).await;
            }
        });
    }

    /// Forward peer events until the session closes.
    ///
    /// Data channels opened by the remote peer are handed to `on_channel`.
    pub(crate) fn spawn_peer_events<F>(self: &Arc<Self>, mut on_channel: F)
    where
        F: FnMut(Arc<dyn DataChannel>) + Send + 'static,
    {
        let Some(mut events) = self.peer.take_events() else {
            warn!("Session {} has no peer events", self.id);
            return;
        };
        let core = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = core.cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Some(PeerEvent::IceCandidate(candidate)) => core.report_candidate(candidate),
                    Some(PeerEvent::DataChannel(channel)) => on_channel(channel),
                    Some(PeerEvent::StateChanged(state)) => {
                        debug!("Session {} peer state {:?}", core.id, state);
                        if state.is_terminal() {
                            core.close(&format!("peer connection {:?}", state)).await;
                            break;
                        }
                    }
                    None => break,
                }
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Close
    // ─────────────────────────────────────────────────────────────────────────

    /// Tear everything down. Safe to call repeatedly; notifies only once.
    pub(crate) async fn close(&self, reason: &str) {
        let first = {
            let mut tasks = lock(&self.tasks);
            let first = !self.closed.swap(true, Ordering::SeqCst);
            for task in tasks.drain(..) {
                task.abort();
            }
            first
        };
        self.cancel.cancel();

        let relays: Vec<RelayHandle> = lock(&self.relays).drain().map(|(_, relay)| relay).collect();
        for relay in relays {
            relay.close().await;
        }
        self.peer.close().await;

        if first {
            info!("{} session {} closed: {}", self.role, self.id, reason);
            let _ = self.events.send(SessionEvent::Closed {
                id: self.id.clone(),
                role: self.role,
                reason: reason.to_string(),
            });
        }
    }
}
