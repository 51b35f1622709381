//! TCP Stream Relay
//!
//! Pairs one TCP socket with one data channel and copies bytes both ways.
//!
//! On the listening side the mapping is known up front: once the channel opens
//! the relay announces it with a [`ControlMessage`] and starts copying. On the
//! sending side the relay waits for that announcement, dials the mapping's
//! remote address and only then starts copying. Everything after the first
//! message is opaque payload.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, TunnelError};
use crate::mapping::Mapping;
use crate::peer::{ChannelEvent, ChannelEvents, DataChannel};
use crate::protocol::ControlMessage;
use crate::sync::lock;

/// Largest chunk read from a socket and sent as one message
pub const RELAY_CHUNK_SIZE: usize = 16 * 1024;

static NEXT_RELAY_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Waiting for the channel to open (listening side)
    Created,
    /// Waiting for the control message (sending side)
    AwaitingMapping,
    /// Dialing the mapped remote address (sending side)
    Connecting,
    Relaying,
    Closed,
}

type CloseCallback = Box<dyn FnOnce() + Send>;

struct RelayShared {
    id: u64,
    label: String,
    channel: Arc<dyn DataChannel>,
    cancel: CancellationToken,
    closed: AtomicBool,
    state: Mutex<RelayState>,
    on_close: Mutex<Option<CloseCallback>>,
}

impl RelayShared {
    fn set_state(&self, state: RelayState) {
        let mut current = lock(&self.state);
        if *current != RelayState::Closed {
            *current = state;
        }
    }

    async fn finish(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *lock(&self.state) = RelayState::Closed;
        self.cancel.cancel();
        self.channel.close().await;

        let callback = lock(&self.on_close).take();
        if let Some(callback) = callback {
            callback();
        }
        debug!("Relay '{}' closed", self.label);
    }
}

/// Shared handle to a running relay
#[derive(Clone)]
pub struct RelayHandle {
    shared: Arc<RelayShared>,
}

impl RelayHandle {
    /// Process-unique relay id
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn state(&self) -> RelayState {
        *lock(&self.shared.state)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Stop relaying, close the channel and drop the socket.
    ///
    /// The close callback fires on the first call only.
    pub async fn close(&self) {
        self.shared.finish().await;
    }
}

impl std::fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHandle")
            .field("id", &self.shared.id)
            .field("label", &self.shared.label)
            .field("state", &self.state())
            .finish()
    }
}

enum RelayMode {
    Listen { socket: TcpStream, mapping: Mapping },
    Receive,
}

/// A relay that has been built but not started
pub struct StreamRelay {
    shared: Arc<RelayShared>,
    mode: RelayMode,
}

impl StreamRelay {
    fn build(channel: Arc<dyn DataChannel>, mode: RelayMode, state: RelayState) -> Self {
        Self {
            shared: Arc::new(RelayShared {
                id: NEXT_RELAY_ID.fetch_add(1, Ordering::Relaxed),
                label: channel.label().to_string(),
                channel,
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
                state: Mutex::new(state),
                on_close: Mutex::new(None),
            }),
            mode,
        }
    }

    /// Relay for a locally accepted socket; announces `mapping` first
    pub fn listener(channel: Arc<dyn DataChannel>, socket: TcpStream, mapping: Mapping) -> Self {
        Self::build(channel, RelayMode::Listen { socket, mapping }, RelayState::Created)
    }

    /// Relay for an inbound channel; dials whatever the first message names
    pub fn receiver(channel: Arc<dyn DataChannel>) -> Self {
        Self::build(channel, RelayMode::Receive, RelayState::AwaitingMapping)
    }

    /// Builder pattern: run `callback` exactly once when the relay closes
    pub fn on_close<F>(self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        *lock(&self.shared.on_close) = Some(Box::new(callback));
        self
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Relay until either side ends, then close
    pub async fn run(self) {
        let shared = self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }

        let Some(events) = shared.channel.take_events() else {
            warn!("Relay '{}' has no channel events", shared.label);
            shared.finish().await;
            return;
        };

        let cancel = shared.cancel.clone();
        let work = async {
            match self.mode {
                RelayMode::Listen { socket, mapping } => {
                    run_listener(&shared, events, socket, mapping).await
                }
                RelayMode::Receive => run_receiver(&shared, events).await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {}
            result = work => {
                if let Err(e) = result {
                    debug!("Relay '{}' ended: {}", shared.label, e);
                }
            }
        }

        shared.finish().await;
    }
}

async fn run_listener(
    shared: &RelayShared,
    mut events: ChannelEvents,
    socket: TcpStream,
    mapping: Mapping,
) -> Result<()> {
    loop {
        match events.recv().await {
            Some(ChannelEvent::Open) => break,
            Some(ChannelEvent::Message(_)) => {}
            Some(ChannelEvent::Error(e)) => return Err(TunnelError::ChannelOpen {
                label: shared.label.clone(),
                reason: e,
            }),
            Some(ChannelEvent::Close) | None => {
                return Err(TunnelError::ChannelClosed(shared.label.clone()));
            }
        }
    }

    let announcement = ControlMessage::Mapping(mapping).encode()?;
    shared.channel.send_text(&announcement).await?;
    shared.set_state(RelayState::Relaying);

    pump(shared, socket, events, Vec::new()).await
}

async fn run_receiver(shared: &RelayShared, mut events: ChannelEvents) -> Result<()> {
    let first = loop {
        match events.recv().await {
            Some(ChannelEvent::Open) => {}
            Some(ChannelEvent::Message(data)) => break data,
            Some(ChannelEvent::Error(e)) => return Err(TunnelError::ChannelSend(e)),
            Some(ChannelEvent::Close) | None => {
                return Err(TunnelError::ChannelClosed(shared.label.clone()));
            }
        }
    };

    let mapping = ControlMessage::decode(&first)?.into_mapping();
    shared.set_state(RelayState::Connecting);

    let addr = mapping.remote_addr();
    debug!("Relay '{}' connecting to {}", shared.label, addr);

    // Payload that arrives while dialing is written once connected
    let mut backlog = Vec::new();
    let connect = TcpStream::connect(addr.clone());
    tokio::pin!(connect);
    let socket = loop {
        tokio::select! {
            result = &mut connect => {
                break result.map_err(|e| TunnelError::ConnectFailed {
                    addr: addr.clone(),
                    reason: e.to_string(),
                })?;
            }
            event = events.recv() => match event {
                Some(ChannelEvent::Message(data)) => backlog.push(data),
                Some(ChannelEvent::Open) => {}
                Some(ChannelEvent::Error(e)) => return Err(TunnelError::ChannelSend(e)),
                Some(ChannelEvent::Close) | None => {
                    return Err(TunnelError::ChannelClosed(shared.label.clone()));
                }
            }
        }
    };

    shared.set_state(RelayState::Relaying);
    pump(shared, socket, events, backlog).await
}

/// Copy in both directions until one of them ends
async fn pump(
    shared: &RelayShared,
    socket: TcpStream,
    events: ChannelEvents,
    backlog: Vec<Bytes>,
) -> Result<()> {
    let (reader, mut writer) = socket.into_split();
    for data in backlog {
        writer.write_all(&data).await?;
    }

    tokio::select! {
        result = socket_to_channel(reader, shared.channel.as_ref()) => result,
        result = channel_to_socket(events, writer) => result,
    }
}

async fn socket_to_channel(mut reader: OwnedReadHalf, channel: &dyn DataChannel) -> Result<()> {
    let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        channel.send(Bytes::copy_from_slice(&buf[..n])).await?;
    }
}

async fn channel_to_socket(mut events: ChannelEvents, mut writer: OwnedWriteHalf) -> Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Message(data) => writer.write_all(&data).await?,
            ChannelEvent::Open => {}
            ChannelEvent::Error(e) => return Err(TunnelError::ChannelSend(e)),
            ChannelEvent::Close => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::MemoryChannel;

    #[tokio::test]
    async fn test_close_is_idempotent_and_notifies_once() {
        let (local, remote) = MemoryChannel::pair("tcpDataChannel_1");
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();

        let relay = StreamRelay::receiver(local).on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let handle = relay.handle();
        assert_eq!(handle.state(), RelayState::AwaitingMapping);

        handle.close().await;
        handle.close().await;
        relay.run().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), RelayState::Closed);
        assert!(remote.is_closed());
    }

    #[tokio::test]
    async fn test_malformed_control_message_closes_relay() {
        let (local, remote) = MemoryChannel::pair("tcpDataChannel_1");
        let relay = StreamRelay::receiver(local);
        let handle = relay.handle();
        let task = relay.spawn();

        remote.send_text("not json").await.unwrap();
        task.await.unwrap();

        assert!(handle.is_closed());
        assert!(remote.is_closed());
    }

    #[tokio::test]
    async fn test_connect_failure_closes_relay() {
        let (local, remote) = MemoryChannel::pair("tcpDataChannel_2");
        let relay = StreamRelay::receiver(local);
        let handle = relay.handle();
        let task = relay.spawn();

        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let announcement = ControlMessage::Mapping(Mapping::new("127.0.0.1", port))
            .encode()
            .unwrap();
        remote.send_text(&announcement).await.unwrap();
        task.await.unwrap();

        assert_eq!(handle.state(), RelayState::Closed);
    }
}
