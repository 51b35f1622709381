//! Two orchestrators, one per role, paired through the in-memory signaling
//! relay and peer network

use rt_core::peer::MemoryNetwork;
use rt_core::protocol::{IceServer, SECRET_KEY_EVENT, TUNNEL_EVENT};
use rt_core::signaling::{MemoryRelay, MemorySignaling};
use rt_core::{ListenEndpoint, Mapping, SessionRole, SessionSettings, SignalingClient, TunnelConfig, TunnelMessage};
use rt_daemon::{OrchestratorCommand, OrchestratorEvent, TunnelMode, TunnelOrchestrator};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const SECRET: &str = "shared-secret";

struct Running {
    signaling: Arc<MemorySignaling>,
    commands: mpsc::Sender<OrchestratorCommand>,
    events: mpsc::Receiver<OrchestratorEvent>,
    registry: rt_daemon::SessionRegistry,
}

fn start(mode: TunnelMode, config: TunnelConfig, relay: &MemoryRelay, network: &MemoryNetwork) -> Running {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let signaling = Arc::new(relay.client());
    let mut orchestrator = TunnelOrchestrator::new(
        config,
        mode,
        signaling.clone(),
        Arc::new(network.clone()),
    );
    let commands = orchestrator.command_sender();
    let events = orchestrator.take_event_receiver().unwrap();
    assert!(orchestrator.take_event_receiver().is_none());
    let registry = orchestrator.registry();
    tokio::spawn(async move { orchestrator.run().await });

    Running {
        signaling,
        commands,
        events,
        registry,
    }
}

async fn next_matching<F>(events: &mut mpsc::Receiver<OrchestratorEvent>, mut predicate: F) -> OrchestratorEvent
where
    F: FnMut(&OrchestratorEvent) -> bool,
{
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for orchestrator event")
            .expect("orchestrator stopped");
        if predicate(&event) {
            return event;
        }
    }
}

async fn echo_target() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    port
}

fn config(target_port: u16) -> TunnelConfig {
    TunnelConfig::new()
        .with_server("http://relay.invalid", "/socket.io")
        .with_secret_key(SECRET)
        .with_mapping(Mapping::new("127.0.0.1", target_port))
}

/// Start the sending side first so it is registered before any offer
async fn start_pair(target_port: u16, relay: &MemoryRelay, network: &MemoryNetwork) -> (Running, Running) {
    let mut send = start(TunnelMode::Send, config(target_port), relay, network);
    next_matching(&mut send.events, |e| matches!(e, OrchestratorEvent::Connected)).await;
    let listen = start(TunnelMode::Listen, config(target_port), relay, network);
    (listen, send)
}

async fn wait_listening(listen: &mut Running) -> (String, SocketAddr) {
    match next_matching(&mut listen.events, |e| matches!(e, OrchestratorEvent::Listening { .. })).await {
        OrchestratorEvent::Listening { id, address, .. } => (id, address),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_tunnel_end_to_end() {
    let relay = MemoryRelay::new().with_ice_servers(vec![IceServer::new("turn:turn.example.com")]);
    let network = MemoryNetwork::new();
    let target_port = echo_target().await;
    let (mut listen, mut send) = start_pair(target_port, &relay, &network).await;

    let (id, address) = wait_listening(&mut listen).await;
    assert_eq!(listen.registry.listen_ids().await, vec![id.clone()]);
    assert_eq!(send.registry.send_ids().await, vec![id.clone()]);

    let mut client = TcpStream::connect(address).await.unwrap();
    client.write_all(b"hello through the tunnel").await.unwrap();
    let mut received = [0u8; 24];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&received, b"hello through the tunnel");

    // Both sides registered the shared secret, the listener sent an offer
    let emitted = listen.signaling.emitted();
    assert_eq!(emitted[0], (SECRET_KEY_EVENT.to_string(), json!(SECRET)));
    let offer = emitted
        .iter()
        .find(|(name, payload)| name == TUNNEL_EVENT && payload["type"] == "offer")
        .expect("no offer sent");
    assert_eq!(offer.1["data"]["id"], json!(id));
    assert_eq!(offer.1["data"]["iceServers"][0]["urls"][0], json!("turn:turn.example.com"));

    // Listen-side candidates are only forwarded after the offer
    let listen_signaling = listen.signaling.clone();
    let candidate_type = "tcpListen_icecandidate";
    for _ in 0..300 {
        if listen_signaling.emitted().iter().any(|(_, payload)| payload["type"] == candidate_type) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let emitted = listen.signaling.emitted();
    let offer_at = emitted
        .iter()
        .position(|(_, payload)| payload["type"] == "offer")
        .unwrap();
    let first_candidate_at = emitted
        .iter()
        .position(|(_, payload)| payload["type"] == candidate_type)
        .expect("no listen candidate forwarded");
    assert!(offer_at < first_candidate_at);

    assert!(send
        .signaling
        .emitted()
        .iter()
        .any(|(name, payload)| name == TUNNEL_EVENT && payload["type"] == "answer"));

    // Shutting down the listener closes the sender's session as well
    listen.commands.send(OrchestratorCommand::Shutdown).await.unwrap();
    next_matching(&mut listen.events, |e| matches!(e, OrchestratorEvent::Shutdown)).await;
    let closed = next_matching(&mut send.events, |e| matches!(e, OrchestratorEvent::SessionClosed { .. })).await;
    match closed {
        OrchestratorEvent::SessionClosed { id: closed_id, role, .. } => {
            assert_eq!(closed_id, id);
            assert_eq!(role, SessionRole::Send);
        }
        _ => unreachable!(),
    }
    assert!(send.registry.is_empty().await);
}

#[tokio::test]
async fn test_reconnect_starts_new_listen_session() {
    let relay = MemoryRelay::new();
    let network = MemoryNetwork::new();
    let target_port = echo_target().await;
    let (mut listen, _send) = start_pair(target_port, &relay, &network).await;

    let (first_id, _) = wait_listening(&mut listen).await;

    listen.signaling.disconnect("network blip");
    listen.signaling.reconnect();

    let (second_id, _) = wait_listening(&mut listen).await;
    assert_ne!(first_id, second_id);
    assert_eq!(listen.registry.listen_ids().await.len(), 2);
}

#[tokio::test]
async fn test_close_session_command() {
    let relay = MemoryRelay::new();
    let network = MemoryNetwork::new();
    let target_port = echo_target().await;
    let (mut listen, _send) = start_pair(target_port, &relay, &network).await;

    let (id, address) = wait_listening(&mut listen).await;
    listen
        .commands
        .send(OrchestratorCommand::CloseSession { id: id.clone() })
        .await
        .unwrap();

    let closed = next_matching(&mut listen.events, |e| matches!(e, OrchestratorEvent::SessionClosed { .. })).await;
    match closed {
        OrchestratorEvent::SessionClosed { id: closed_id, role, .. } => {
            assert_eq!(closed_id, id);
            assert_eq!(role, SessionRole::Listen);
        }
        _ => unreachable!(),
    }
    assert!(listen.registry.listen_ids().await.is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(address).await.is_err());
}

#[tokio::test]
async fn test_unknown_tunnel_messages_are_ignored() {
    let relay = MemoryRelay::new();
    let network = MemoryNetwork::new();
    let mut send = start(TunnelMode::Send, config(9), &relay, &network);
    next_matching(&mut send.events, |e| matches!(e, OrchestratorEvent::Connected)).await;

    let stranger = relay.client();
    stranger.emit(SECRET_KEY_EVENT, json!(SECRET)).await.unwrap();
    stranger
        .emit(TUNNEL_EVENT, json!({"type": "bogus", "data": {}}))
        .await
        .unwrap();
    stranger
        .emit(TUNNEL_EVENT, json!({"type": "answer", "data": {"id": "nope", "answer": {"type": "answer", "sdp": ""}}}))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(send.registry.is_empty().await);
    send.commands.send(OrchestratorCommand::Shutdown).await.unwrap();
    next_matching(&mut send.events, |e| matches!(e, OrchestratorEvent::Shutdown)).await;
}

#[tokio::test]
async fn test_repeated_offer_replaces_session() {
    let relay = MemoryRelay::new();
    let network = MemoryNetwork::new();
    let mut send = start(TunnelMode::Send, config(9), &relay, &network);
    next_matching(&mut send.events, |e| matches!(e, OrchestratorEvent::Connected)).await;

    let stranger = relay.client();
    stranger.emit(SECRET_KEY_EVENT, json!(SECRET)).await.unwrap();
    let (listen_tx, _listen_events) = mpsc::unbounded_channel();
    let endpoint = ListenEndpoint::create("dup", Vec::new(), &network, SessionSettings::default(), listen_tx)
        .await
        .unwrap();
    let offer = serde_json::to_value(TunnelMessage::Offer(endpoint.create_offer().await.unwrap())).unwrap();

    stranger.emit(TUNNEL_EVENT, offer.clone()).await.unwrap();
    next_matching(&mut send.events, |e| matches!(e, OrchestratorEvent::SessionOpened { .. })).await;
    let first = send.registry.send("dup").await.unwrap();

    stranger.emit(TUNNEL_EVENT, offer).await.unwrap();
    let closed = next_matching(&mut send.events, |e| matches!(e, OrchestratorEvent::SessionClosed { .. })).await;
    match closed {
        OrchestratorEvent::SessionClosed { id, reason, .. } => {
            assert_eq!(id, "dup");
            assert_eq!(reason, "replaced by a new offer");
        }
        _ => unreachable!(),
    }
    assert!(first.is_closed());

    // The replacement stays registered after the old session's close event
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(send.registry.send_ids().await, vec!["dup".to_string()]);
    let current = send.registry.send("dup").await.unwrap();
    assert!(!current.is_closed());
    assert!(!Arc::ptr_eq(&first, &current));
}
