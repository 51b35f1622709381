//! Tunnel Orchestrator
//!
//! Main loop that ties the signaling connection to the session endpoints.
//! In listen mode every (re)connection to the signaling server starts a new
//! listening session; in send mode every offer received starts a sending
//! session. Signaling messages are routed to sessions by id.

use rt_core::protocol::CandidatePayload;
use rt_core::signaling::{parse_tunnel_message, request_ice_servers, send_secret_key, send_tunnel_message};
use rt_core::{
    ListenEndpoint, Mapping, OfferPayload, PeerFactory, Result, SendEndpoint, SessionEvent,
    SessionEventReceiver, SessionEventSender, SessionRole, SessionSettings, SignalingClient,
    SignalingEvent, TunnelConfig, TunnelError, TunnelMessage,
};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::registry::SessionRegistry;

/// Which role this process plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    /// Expose the configured mappings and make offers
    Listen,
    /// Answer offers and dial mapped addresses
    Send,
}

/// Events from the orchestrator to the UI
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Connected (or reconnected) to the signaling server
    Connected,

    /// A session was created
    SessionOpened { id: String, role: SessionRole },

    /// A session's liveness channel opened
    SessionUsable { id: String, role: SessionRole },

    /// A listening session bound a local listener
    Listening {
        id: String,
        address: SocketAddr,
        mapping: Mapping,
    },

    /// A session closed and was removed
    SessionClosed {
        id: String,
        role: SessionRole,
        reason: String,
    },

    /// Error occurred
    Error { message: String },

    /// Shutdown
    Shutdown,
}

/// Commands to the orchestrator
#[derive(Debug)]
pub enum OrchestratorCommand {
    /// Close one session
    CloseSession { id: String },

    /// Close every session and stop
    Shutdown,
}

/// Everything a spawned task needs to start a listening session
#[derive(Clone)]
struct ListenContext {
    signaling: Arc<dyn SignalingClient>,
    peers: Arc<dyn PeerFactory>,
    settings: SessionSettings,
    registry: SessionRegistry,
    session_tx: SessionEventSender,
    event_tx: mpsc::Sender<OrchestratorEvent>,
}

/// Main orchestrator
pub struct TunnelOrchestrator {
    /// Configuration
    config: TunnelConfig,

    mode: TunnelMode,

    /// Signaling connection
    signaling: Arc<dyn SignalingClient>,

    /// Creates peer connections for new sessions
    peers: Arc<dyn PeerFactory>,

    /// Tunables for new sessions
    settings: SessionSettings,

    /// Live sessions
    registry: SessionRegistry,

    /// Session event sender, handed to every endpoint
    session_tx: SessionEventSender,

    /// Session event receiver
    session_rx: Option<SessionEventReceiver>,

    /// Event sender
    event_tx: mpsc::Sender<OrchestratorEvent>,

    /// Event receiver, until taken
    event_rx: Option<mpsc::Receiver<OrchestratorEvent>>,

    /// Command sender
    command_tx: mpsc::Sender<OrchestratorCommand>,

    /// Command receiver
    command_rx: mpsc::Receiver<OrchestratorCommand>,

    /// Running flag
    running: bool,
}

impl TunnelOrchestrator {
    /// Create a new orchestrator
    pub fn new(
        config: TunnelConfig,
        mode: TunnelMode,
        signaling: Arc<dyn SignalingClient>,
        peers: Arc<dyn PeerFactory>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(64);
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let settings = config.session_settings();

        Self {
            config,
            mode,
            signaling,
            peers,
            settings,
            registry: SessionRegistry::new(),
            session_tx,
            session_rx: Some(session_rx),
            event_tx,
            event_rx: Some(event_rx),
            command_tx,
            command_rx,
            running: false,
        }
    }

    /// Get the command sender
    pub fn command_sender(&self) -> mpsc::Sender<OrchestratorCommand> {
        self.command_tx.clone()
    }

    /// Take the event receiver; `None` once taken
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<OrchestratorEvent>> {
        self.event_rx.take()
    }

    pub fn mode(&self) -> TunnelMode {
        self.mode
    }

    /// Shared handle on the live session tables
    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }

    pub async fn listen_session_ids(&self) -> Vec<String> {
        self.registry.listen_ids().await
    }

    pub async fn send_session_ids(&self) -> Vec<String> {
        self.registry.send_ids().await
    }

    /// Run the orchestrator main loop until shutdown
    pub async fn run(&mut self) -> Result<()> {
        let mut signaling_rx = self.signaling.take_events().ok_or_else(|| {
            TunnelError::SignalingConnection("signaling events already taken".to_string())
        })?;
        let mut session_rx = self.session_rx.take().ok_or_else(|| {
            TunnelError::SignalingConnection("orchestrator already ran".to_string())
        })?;

        info!("Starting tunnel orchestrator in {:?} mode", self.mode);
        self.running = true;

        while self.running {
            tokio::select! {
                // Handle commands
                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command).await;
                }

                // Handle signaling
                event = signaling_rx.recv() => match event {
                    Some(event) => self.handle_signaling(event).await,
                    None => {
                        warn!("Signaling connection gone");
                        self.running = false;
                    }
                },

                // Handle session events
                Some(event) = session_rx.recv() => {
                    self.handle_session_event(event).await;
                }
            }
        }

        info!("Shutting down: closing {} sessions", self.registry.len().await);
        self.registry.close_all("shutdown").await;
        self.signaling.close().await;
        emit(&self.event_tx, OrchestratorEvent::Shutdown);
        Ok(())
    }

    async fn handle_command(&mut self, command: OrchestratorCommand) {
        match command {
            OrchestratorCommand::CloseSession { id } => {
                info!("Close command received for session {}", id);
                if !self.registry.close(&id, "closed by command").await {
                    warn!("No session {}", id);
                }
            }
            OrchestratorCommand::Shutdown => {
                info!("Shutdown command received");
                self.running = false;
            }
        }
    }

    async fn handle_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => {
                info!("Signaling connected");
                if let Err(e) = send_secret_key(self.signaling.as_ref(), &self.config.secret_key).await {
                    error!("Failed to register secret key: {}", e);
                    report_error(&self.event_tx, format!("Failed to register secret key: {}", e));
                    return;
                }
                emit(&self.event_tx, OrchestratorEvent::Connected);

                if self.mode == TunnelMode::Listen {
                    tokio::spawn(start_listen_session(self.listen_context()));
                }
            }
            SignalingEvent::Disconnected { reason } => {
                warn!("Signaling disconnected: {}", reason);
            }
            SignalingEvent::Event { name, payload } => {
                if name == rt_core::protocol::TUNNEL_EVENT {
                    self.handle_tunnel_message(&payload).await;
                } else {
                    debug!("Ignoring signaling event '{}'", name);
                }
            }
        }
    }

    async fn handle_tunnel_message(&mut self, payload: &Value) {
        let Some(message) = parse_tunnel_message(payload) else {
            debug!("Ignoring unknown tunnel message");
            return;
        };

        match (self.mode, message) {
            (TunnelMode::Send, TunnelMessage::Offer(offer)) => self.answer_offer(offer).await,
            (TunnelMode::Listen, TunnelMessage::Answer(answer)) => {
                match self.registry.listen(&answer.id).await {
                    Some(endpoint) => {
                        if let Err(e) = endpoint.set_answer(answer.answer).await {
                            error!("Session {} rejected answer: {}", answer.id, e);
                        }
                    }
                    None => debug!("Answer for unknown session {}", answer.id),
                }
            }
            (TunnelMode::Listen, TunnelMessage::SendCandidate(payload)) => {
                if let Some(endpoint) = self.registry.listen(&payload.id).await {
                    endpoint.set_candidate(payload.candidate).await;
                }
            }
            (TunnelMode::Send, TunnelMessage::ListenCandidate(payload)) => {
                if let Some(endpoint) = self.registry.send(&payload.id).await {
                    endpoint.set_candidate(payload.candidate).await;
                }
            }
            (mode, message) => {
                debug!("Ignoring {} in {:?} mode", message_kind(&message), mode);
            }
        }
    }

    async fn answer_offer(&mut self, offer: OfferPayload) {
        info!("Offer received for session {}", offer.id);
        let endpoint = match SendEndpoint::create(
            offer.id.clone(),
            offer.ice_servers.clone(),
            self.peers.as_ref(),
            self.settings.clone(),
            self.session_tx.clone(),
        )
        .await
        {
            Ok(endpoint) => endpoint,
            Err(e) => {
                error!("Failed to create session {}: {}", offer.id, e);
                report_error(&self.event_tx, format!("Failed to create session: {}", e));
                return;
            }
        };

        if let Some(replaced) = self.registry.insert_send(Arc::clone(&endpoint)).await {
            warn!("Offer for session {} replaces the existing one", offer.id);
            replaced.close("replaced by a new offer").await;
        }
        emit(
            &self.event_tx,
            OrchestratorEvent::SessionOpened {
                id: offer.id.clone(),
                role: SessionRole::Send,
            },
        );

        match endpoint.set_offer(offer.offer).await {
            Ok(answer) => {
                if let Err(e) = send_tunnel_message(self.signaling.as_ref(), &TunnelMessage::Answer(answer)).await {
                    warn!("Failed to send answer for {}: {}", offer.id, e);
                    endpoint.close("answer not delivered").await;
                }
            }
            Err(e) => {
                error!("Session {} failed to answer: {}", offer.id, e);
                report_error(&self.event_tx, format!("Failed to answer offer: {}", e));
            }
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Candidate { id, role, candidate } => {
                let payload = CandidatePayload { id, candidate };
                let message = match role {
                    SessionRole::Listen => TunnelMessage::ListenCandidate(payload),
                    SessionRole::Send => TunnelMessage::SendCandidate(payload),
                };
                if let Err(e) = send_tunnel_message(self.signaling.as_ref(), &message).await {
                    debug!("Failed to forward candidate: {}", e);
                }
            }
            SessionEvent::Usable { id, role } => {
                info!("{} session {} is usable", role, id);
                emit(&self.event_tx, OrchestratorEvent::SessionUsable { id: id.clone(), role });

                if role == SessionRole::Listen {
                    if let Some(endpoint) = self.registry.listen(&id).await {
                        let mappings = self.config.mapping.clone();
                        let event_tx = self.event_tx.clone();
                        tokio::spawn(async move {
                            for (address, mapping) in endpoint.start_listening(&mappings).await {
                                emit(
                                    &event_tx,
                                    OrchestratorEvent::Listening {
                                        id: id.clone(),
                                        address,
                                        mapping,
                                    },
                                );
                            }
                        });
                    }
                }
            }
            SessionEvent::Closed { id, role, reason } => {
                self.registry.remove_closed(role, &id).await;
                emit(&self.event_tx, OrchestratorEvent::SessionClosed { id, role, reason });
            }
        }
    }

    fn listen_context(&self) -> ListenContext {
        ListenContext {
            signaling: Arc::clone(&self.signaling),
            peers: Arc::clone(&self.peers),
            settings: self.settings.clone(),
            registry: self.registry.clone(),
            session_tx: self.session_tx.clone(),
            event_tx: self.event_tx.clone(),
        }
    }
}

/// Create a listening session and send its offer
async fn start_listen_session(ctx: ListenContext) {
    let ice_servers = match request_ice_servers(ctx.signaling.as_ref()).await {
        Ok(servers) => servers,
        Err(e) => {
            error!("Failed to get ICE servers: {}", e);
            report_error(&ctx.event_tx, format!("Failed to get ICE servers: {}", e));
            return;
        }
    };

    let id = uuid::Uuid::new_v4().to_string();
    let endpoint = match ListenEndpoint::create(
        id.clone(),
        ice_servers,
        ctx.peers.as_ref(),
        ctx.settings.clone(),
        ctx.session_tx.clone(),
    )
    .await
    {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!("Failed to create listen session: {}", e);
            report_error(&ctx.event_tx, format!("Failed to create session: {}", e));
            return;
        }
    };

    ctx.registry.insert_listen(Arc::clone(&endpoint)).await;
    emit(
        &ctx.event_tx,
        OrchestratorEvent::SessionOpened {
            id: id.clone(),
            role: SessionRole::Listen,
        },
    );

    let offer = match endpoint.create_offer().await {
        Ok(offer) => offer,
        Err(e) => {
            error!("Session {} failed to create offer: {}", id, e);
            return;
        }
    };

    info!("Sending offer for session {}", id);
    match send_tunnel_message(ctx.signaling.as_ref(), &TunnelMessage::Offer(offer)).await {
        Ok(()) => endpoint.release_candidates(),
        Err(e) => {
            warn!("Failed to send offer for {}: {}", id, e);
            endpoint.close("offer not delivered").await;
        }
    }
}

fn message_kind(message: &TunnelMessage) -> &'static str {
    match message {
        TunnelMessage::Offer(_) => "offer",
        TunnelMessage::Answer(_) => "answer",
        TunnelMessage::ListenCandidate(_) => "listen candidate",
        TunnelMessage::SendCandidate(_) => "send candidate",
    }
}

/// Deliver an event without ever stalling the caller
fn emit(event_tx: &mpsc::Sender<OrchestratorEvent>, event: OrchestratorEvent) {
    if let Err(e) = event_tx.try_send(event) {
        debug!("Dropping orchestrator event: {}", e);
    }
}

fn report_error(event_tx: &mpsc::Sender<OrchestratorEvent>, message: String) {
    emit(event_tx, OrchestratorEvent::Error { message });
}
